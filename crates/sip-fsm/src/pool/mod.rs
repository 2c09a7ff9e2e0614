//! # Transaction Pools
//!
//! One pool per transaction type maps [`TransactionId`] to live transactions.
//! Pools create transactions on demand (server side on the first request, client
//! side when the application sends), hand out shared references, and drop a
//! transaction when its event loop finishes the TERMINATED cleanup.
//!
//! The map lock is only held for the map operation itself. Transaction
//! callbacks and forced terminations always run after it is released.

mod ackable;
mod blocklist;
mod fork;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

pub use ackable::AckablePool;
pub use blocklist::{ExpiringSet, IstBlocklist};
pub use fork::{ForkResolver, InviteForking, NoForking};

use crate::dispatch::DispatchContext;
use crate::fsm;
use crate::message::Message;
use crate::timer::TimerProfile;
use crate::transaction::{Transaction, TransactionId, TransactionType};

/// Snapshot returned by the housekeeping tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub kind: TransactionType,
    pub live: usize,
    pub retired_forks: usize,
}

pub(crate) struct PoolShared {
    kind: TransactionType,
    transactions: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
    profile: RwLock<TimerProfile>,
    context: Arc<DispatchContext>,
    forking: Box<dyn ForkResolver>,
}

impl PoolShared {
    /// Drops `transaction` from the map if the entry is still this very
    /// transaction (a fresh one may have taken the id).
    pub(crate) fn remove_transaction(&self, transaction: &Arc<Transaction>) {
        let removed = {
            let mut transactions = self.transactions.lock();
            let owned = transactions
                .get(transaction.id())
                .is_some_and(|current| Arc::ptr_eq(current, transaction));
            if owned {
                transactions.remove(transaction.id());
            }
            owned
        };
        if removed {
            self.forking.on_removed(transaction);
        }
    }

    pub(crate) fn housekeeping(&self) -> PoolStats {
        let live = self.transactions.lock().len();
        let retired_forks = self.forking.sweep();
        PoolStats {
            kind: self.kind,
            live,
            retired_forks,
        }
    }
}

/// Transactions of one type, keyed by id.
pub struct TransactionPool {
    shared: Arc<PoolShared>,
}

impl TransactionPool {
    pub(crate) fn new(
        kind: TransactionType,
        profile: TimerProfile,
        context: Arc<DispatchContext>,
        forking: Box<dyn ForkResolver>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                kind,
                transactions: Mutex::new(HashMap::new()),
                profile: RwLock::new(profile),
                context,
                forking,
            }),
        }
    }

    pub fn kind(&self) -> TransactionType {
        self.shared.kind
    }

    /// Timer profile copied into transactions created from now on.
    pub fn timer_profile(&self) -> TimerProfile {
        *self.shared.profile.read()
    }

    pub fn set_timer_profile(&self, profile: TimerProfile) {
        *self.shared.profile.write() = profile;
    }

    /// Non-creating lookup. Never returns a terminated transaction.
    pub fn find(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.shared
            .transactions
            .lock()
            .get(id)
            .filter(|t| !t.state().is_terminated())
            .cloned()
    }

    /// Returns the live transaction for `id`, creating it when absent. The flag
    /// is true when the transaction was created by this call.
    ///
    /// A terminated client transaction still in the map is replaced. A terminated
    /// server transaction is returned as is until its cleanup removed it, so a
    /// retransmission cannot open a second one.
    ///
    /// Must be called from within a tokio runtime: creation spawns the
    /// transaction's event loop.
    pub fn find_or_create(&self, id: &TransactionId) -> (Arc<Transaction>, bool) {
        let mut transactions = self.shared.transactions.lock();
        if let Some(existing) = transactions.get(id) {
            if self.shared.kind.is_server() || !existing.state().is_terminated() {
                return (existing.clone(), false);
            }
        }
        let transaction = Transaction::spawn(
            id.clone(),
            self.shared.kind,
            *self.shared.profile.read(),
            self.shared.context.clone(),
            Arc::downgrade(&self.shared),
            None,
            fsm::new_machine(self.shared.kind),
        );
        transactions.insert(id.clone(), transaction.clone());
        debug!(id = %id, pool = %self.shared.kind, "Transaction added to pool");
        (transaction, true)
    }

    /// Response lookup: finds the transaction by id (or a retired fork parent)
    /// and lets the fork resolver pick a child.
    pub fn find_for_response(
        &self,
        message: &Message,
        id: &TransactionId,
    ) -> Option<Arc<Transaction>> {
        let parent = self
            .find(id)
            .or_else(|| self.shared.forking.retired_parent(id))?;
        match self.shared.forking.resolve_forked_child(message, &parent) {
            Some(child) => Some(child),
            None => Some(parent),
        }
    }

    /// Removes the entry without terminating the transaction.
    pub fn remove(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.shared.transactions.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.shared.transactions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.transactions.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<TransactionId> {
        self.shared.transactions.lock().keys().cloned().collect()
    }

    /// Forces every transaction, forked children included, to TERMINATED,
    /// cancels their timers and empties the pool.
    pub fn stop_all(&self) {
        let drained: Vec<Arc<Transaction>> = self
            .shared
            .transactions
            .lock()
            .drain()
            .map(|(_, transaction)| transaction)
            .collect();
        self.shared.forking.clear();
        for transaction in &drained {
            transaction.force_terminate_tree();
        }
        info!(pool = %self.shared.kind, stopped = drained.len(), "Transaction pool stopped");
    }

    /// One housekeeping pass. Never touches live transactions.
    pub fn housekeeping(&self) -> PoolStats {
        self.shared.housekeeping()
    }

    pub(crate) fn downgrade(&self) -> Weak<PoolShared> {
        Arc::downgrade(&self.shared)
    }
}
