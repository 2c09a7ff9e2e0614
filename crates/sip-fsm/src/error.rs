use std::fmt;

use thiserror::Error;

use crate::transaction::{TransactionId, TransactionState, TransactionType};

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Which transaction timer expired without the expected message arriving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Timer B: no response to an INVITE.
    Invite,
    /// Timer F: no final response to a non-INVITE request.
    NonInvite,
    /// Timer H: no ACK for a final response to an INVITE.
    AckWait,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Invite => write!(f, "Timer B"),
            TimeoutKind::NonInvite => write!(f, "Timer F"),
            TimeoutKind::AckWait => write!(f, "Timer H"),
        }
    }
}

/// Errors that can occur in SIP transaction handling
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The transaction has already reached TERMINATED.
    #[error("Transaction {0} is terminated")]
    TransactionTerminated(TransactionId),

    /// A state machine attempted a transition its RFC 3261 diagram does not allow.
    #[error("Invalid {kind} state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        kind: TransactionType,
        from: TransactionState,
        to: TransactionState,
    },

    /// A transaction timer expired (Timer B, F or H).
    #[error("{kind} expired for transaction {id}")]
    TransactionTimeout { kind: TimeoutKind, id: TransactionId },

    /// The message cannot be handled by the transaction layer.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The message lacks the CSeq/Via/Call-ID data needed to build a transaction id.
    #[error("Unable to determine transaction identifier")]
    MissingTransactionId,

    /// No transport is bound or none could be created.
    #[error("Transport not ready: {0}")]
    TransportNotReady(String),

    /// Error reported by the transport layer.
    #[error("SIP transport error: {0}")]
    TransportError(String),

    /// A forked child could not reach its parent transaction.
    #[error("Forked child transaction {0} has no resolvable parent")]
    OrphanedChild(TransactionId),

    /// Configuration could not be loaded or failed validation.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Other miscellaneous errors.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Returns true for the Timer B/F/H expiry signals.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TransactionTimeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::TransportError(e.to_string())
    }
}
