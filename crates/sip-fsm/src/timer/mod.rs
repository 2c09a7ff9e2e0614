//! # Transaction Timers
//!
//! RFC 3261 Section 17 drives every transaction with a small set of named
//! timers. This module provides the durations ([`TimerProfile`]), the closed set
//! of timer names ([`TimerName`]) and the per-transaction scheduler that arms
//! and cancels them on the transaction's event loop.
//!
//! | Timer | Default | Role |
//! |-------|---------|------|
//! | A | T1 | INVITE retransmission (unreliable only), doubles up to T2 |
//! | B | 64·T1 | INVITE transaction timeout |
//! | C | 181 s | proxy INVITE timeout (reserved, never armed) |
//! | D | 33 s | wait for response retransmissions after a non-2xx |
//! | E | T1 | non-INVITE retransmission (unreliable only), doubles up to T2 |
//! | F | 64·T1 | non-INVITE transaction timeout |
//! | G | T1 | INVITE final response retransmission (unreliable only) |
//! | H | 64·T1 | wait for ACK |
//! | I | T4 | absorb ACK retransmissions |
//! | J | 64·T1 | absorb non-INVITE request retransmissions |
//! | K | T4 | absorb non-INVITE response retransmissions |
//!
//! Two non-RFC timers complete the set: `MaxLifetime` (5 minutes) caps the life
//! of any transaction, `RequestThrottle` delays dispatch of a throttled
//! non-INVITE request.

mod profile;
pub(crate) mod scheduler;

use std::fmt;

pub use profile::TimerProfile;
pub(crate) use scheduler::TimerScheduler;

/// Named transaction timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerName {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    MaxLifetime,
    RequestThrottle,
}

impl TimerName {
    /// Timers that only exist to cope with packet loss and are never armed
    /// over a reliable transport.
    pub fn is_unreliable_only(self) -> bool {
        matches!(
            self,
            TimerName::A
                | TimerName::D
                | TimerName::E
                | TimerName::G
                | TimerName::I
                | TimerName::J
                | TimerName::K
        )
    }
}

impl fmt::Display for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerName::MaxLifetime => f.write_str("MaxLifetime"),
            TimerName::RequestThrottle => f.write_str("RequestThrottle"),
            letter => write!(f, "Timer {:?}", letter),
        }
    }
}
