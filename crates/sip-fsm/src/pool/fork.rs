//! Forking strategies for client transaction pools.
//!
//! A proxy downstream may fork an INVITE so that several UAS instances answer
//! it, each establishing its own dialog (distinguished by the To-tag). The pool
//! asks its [`ForkResolver`] which transaction should see a response: the parent
//! found by transaction id, or a child following another dialog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::message::{Message, SipMessageExt};
use crate::transaction::{Transaction, TransactionId, TransactionType};

/// Strategy deciding whether a response belongs to a forked child.
pub trait ForkResolver: Send + Sync {
    /// Returns the child that must handle `message`, or `None` to use `parent`.
    fn resolve_forked_child(
        &self,
        message: &Message,
        parent: &Arc<Transaction>,
    ) -> Option<Arc<Transaction>>;

    /// A transaction left the pool.
    fn on_removed(&self, _transaction: &Arc<Transaction>) {}

    /// A parent no longer in the pool that can still spawn children.
    fn retired_parent(&self, _id: &TransactionId) -> Option<Arc<Transaction>> {
        None
    }

    /// Housekeeping. Returns the number of entries still retained.
    fn sweep(&self) -> usize {
        0
    }

    fn clear(&self) {}
}

/// Every response goes to the transaction matching its id.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoForking;

impl ForkResolver for NoForking {
    fn resolve_forked_child(&self, _: &Message, _: &Arc<Transaction>) -> Option<Arc<Transaction>> {
        None
    }
}

struct Retired {
    parent: Arc<Transaction>,
    window_ends: Instant,
    hard_limit: Instant,
}

impl Retired {
    fn is_live(&self, now: Instant) -> bool {
        if now < self.window_ends {
            return true;
        }
        now < self.hard_limit
            && self
                .parent
                .children()
                .iter()
                .any(|child| !child.state().is_terminated())
    }
}

/// Forking for INVITE client transactions, switched on and off at runtime.
///
/// The first tagged response claims the parent's dialog. Responses carrying a
/// different To-tag are routed to a child created for that tag. A parent that
/// has terminated stays resolvable for Timer B (or while any of its children is
/// alive, up to the maximum lifetime) so a late 2xx from another branch still
/// gets its own child instead of being treated as stray.
pub struct InviteForking {
    enabled: Arc<AtomicBool>,
    retired: Mutex<HashMap<TransactionId, Retired>>,
}

impl InviteForking {
    pub fn new(enabled: Arc<AtomicBool>) -> Self {
        Self {
            enabled,
            retired: Mutex::new(HashMap::new()),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl ForkResolver for InviteForking {
    fn resolve_forked_child(
        &self,
        message: &Message,
        parent: &Arc<Transaction>,
    ) -> Option<Arc<Transaction>> {
        if !self.is_enabled() || parent.is_child() || !message.is_response() {
            return None;
        }
        let tag = message.to_tag()?;
        if parent.claim_fork_tag(tag) {
            return None;
        }
        match parent.find_or_spawn_child(tag) {
            Ok(child) => {
                debug!(parent = %parent.id(), child = %child.id(), "Routing forked response to child");
                Some(child)
            }
            Err(e) => {
                error!(parent = %parent.id(), error = %e, "Unable to create forked child transaction");
                None
            }
        }
    }

    fn on_removed(&self, transaction: &Arc<Transaction>) {
        if !self.is_enabled()
            || transaction.is_child()
            || transaction.kind() != TransactionType::InviteClient
        {
            return;
        }
        let profile = transaction.timer_profile();
        let now = Instant::now();
        self.retired.lock().insert(
            transaction.id().clone(),
            Retired {
                parent: transaction.clone(),
                window_ends: now + profile.timer_b,
                hard_limit: now + profile.max_lifetime,
            },
        );
    }

    fn retired_parent(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        if !self.is_enabled() {
            return None;
        }
        let mut retired = self.retired.lock();
        let now = Instant::now();
        let live = retired.get(id).map(|entry| entry.is_live(now))?;
        if live {
            return retired.get(id).map(|entry| entry.parent.clone());
        }
        retired.remove(id);
        None
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut retired = self.retired.lock();
        retired.retain(|_, entry| entry.is_live(now));
        retired.len()
    }

    fn clear(&self) {
        self.retired.lock().clear();
    }
}
