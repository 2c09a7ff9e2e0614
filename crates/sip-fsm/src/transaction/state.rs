use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::transaction::TransactionType;

/// State of a SIP transaction, covering the four RFC 3261 Section 17 machines.
///
/// Variants are ordered along the lifecycle so `state < Completed` style checks
/// read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransactionState {
    /// Created by a pool, no message processed yet.
    Idle = 0,
    /// Non-INVITE server only: request held back by the throttle handler.
    Queued = 1,
    /// Client: request sent, nothing heard yet. NIST: request handed to the application.
    Trying = 2,
    /// Provisional response sent or received.
    Proceeding = 3,
    /// Final response sent or received; absorbing retransmissions.
    Completed = 4,
    /// INVITE server only: ACK received, absorbing ACK retransmissions (Timer I).
    Confirmed = 5,
    /// Terminal. Never left once entered.
    Terminated = 6,
}

impl TransactionState {
    pub fn is_terminated(self) -> bool {
        self == TransactionState::Terminated
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Idle,
            1 => TransactionState::Queued,
            2 => TransactionState::Trying,
            3 => TransactionState::Proceeding,
            4 => TransactionState::Completed,
            5 => TransactionState::Confirmed,
            _ => TransactionState::Terminated,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Idle => "IDLE",
            TransactionState::Queued => "QUEUED",
            TransactionState::Trying => "TRYING",
            TransactionState::Proceeding => "PROCEEDING",
            TransactionState::Completed => "COMPLETED",
            TransactionState::Confirmed => "CONFIRMED",
            TransactionState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Lock-free holder for a [`TransactionState`].
///
/// Written only from the owning transaction's event loop, except for forced
/// termination; read from anywhere.
#[derive(Debug)]
pub struct AtomicTransactionState {
    value: AtomicU8,
}

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        Self {
            value: AtomicU8::new(state as u8),
        }
    }

    pub fn get(&self) -> TransactionState {
        TransactionState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Stores `new_state` unless the current state is already TERMINATED.
    /// Returns the previous state.
    pub fn set(&self, new_state: TransactionState) -> TransactionState {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == TransactionState::Terminated as u8 {
                return TransactionState::Terminated;
            }
            match self.value.compare_exchange_weak(
                current,
                new_state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return TransactionState::from_u8(prev),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Checks a transition against the diagram of the given transaction type.
///
/// Same-state transitions and transitions into TERMINATED are always allowed,
/// leaving TERMINATED never is.
pub fn validate_transition(
    kind: TransactionType,
    from: TransactionState,
    to: TransactionState,
) -> Result<()> {
    use TransactionState::*;

    if from == Terminated && to != Terminated {
        return Err(Error::InvalidStateTransition { kind, from, to });
    }
    if from == to || to == Terminated {
        return Ok(());
    }

    let allowed = match kind {
        TransactionType::InviteClient | TransactionType::NonInviteClient => matches!(
            (from, to),
            (Idle, Trying) | (Trying, Proceeding) | (Trying, Completed) | (Proceeding, Completed)
        ),
        TransactionType::InviteServer => matches!(
            (from, to),
            (Idle, Proceeding) | (Proceeding, Completed) | (Completed, Confirmed)
        ),
        TransactionType::NonInviteServer => matches!(
            (from, to),
            (Idle, Trying)
                | (Idle, Queued)
                | (Queued, Trying)
                | (Trying, Proceeding)
                | (Trying, Completed)
                | (Proceeding, Completed)
        ),
    };

    if allowed {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition { kind, from, to })
    }
}
