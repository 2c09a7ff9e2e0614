use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::transaction::{DialogId, Transaction};

/// INVITE server transactions that sent a 2xx, keyed by dialog.
///
/// The ACK for a 2xx carries a new Via branch and so never matches the
/// transaction id of its INVITE. This index lets the dispatcher still deliver
/// it to the transaction that is retransmitting the 2xx.
#[derive(Default)]
pub struct AckablePool {
    entries: Mutex<HashMap<DialogId, Weak<Transaction>>>,
}

impl AckablePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dialog: DialogId, transaction: &Arc<Transaction>) {
        self.entries.lock().insert(dialog, Arc::downgrade(transaction));
    }

    /// Live (non-terminated) transaction registered for the dialog.
    pub fn find(&self, dialog: &DialogId) -> Option<Arc<Transaction>> {
        let mut entries = self.entries.lock();
        let found = entries.get(dialog).and_then(Weak::upgrade);
        match found {
            Some(transaction) if !transaction.state().is_terminated() => Some(transaction),
            _ => {
                entries.remove(dialog);
                None
            }
        }
    }

    /// Removes the entry if it still points at `transaction`.
    pub fn remove(&self, dialog: &DialogId, transaction: &Arc<Transaction>) {
        let mut entries = self.entries.lock();
        let owned = entries
            .get(dialog)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(transaction)));
        if owned {
            entries.remove(dialog);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
