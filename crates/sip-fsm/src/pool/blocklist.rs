use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::transaction::TransactionId;

/// A set whose entries expire after a fixed time-to-live.
///
/// Expired entries are dropped lazily on lookup and in bulk by [`sweep`](Self::sweep).
#[derive(Debug)]
pub struct ExpiringSet<K> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Instant>>,
}

/// Ids of recently terminated INVITE server transactions. A late INVITE
/// retransmission matching one of them is dropped instead of creating a new
/// transaction.
pub type IstBlocklist = ExpiringSet<TransactionId>;

impl<K: Eq + Hash + Clone> ExpiringSet<K> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Adds (or refreshes) `key`.
    pub fn insert(&self, key: K) {
        self.entries.lock().insert(key, Instant::now() + self.ttl);
    }

    pub fn contains(&self, key: &K) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key).copied() {
            Some(expires) if expires > Instant::now() => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Drops expired entries, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, expires| *expires > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
