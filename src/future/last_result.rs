//! Slot remembering the future of the most recently issued call of one
//! operation kind
//!
//! Subsystems keep one slot per operation (sign-in, set-value, upload, ...)
//! and expose it through a `<operation>_last_result()` accessor, so callers
//! can poll an operation's outcome without retaining the future themselves.

use std::sync::{PoisonError, RwLock};

use crate::future::future::Future;

/// Holder of the last issued future of one operation kind
///
/// Starts out holding an invalid future. The slot keeps its own reference to
/// the record, so a completed operation stays observable until the next call
/// of the same kind replaces it.
pub struct LastResult<T> {
    slot: RwLock<Future<T>>,
}

impl<T> LastResult<T> {
    /// Create a slot holding an invalid future
    pub fn new() -> Self {
        LastResult {
            slot: RwLock::new(Future::default()),
        }
    }

    /// Future of the most recently issued call, or an invalid future if none
    /// was issued yet
    pub fn get(&self) -> Future<T> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record `future` as the most recently issued call, releasing the
    /// previous occupant
    pub fn set(&self, future: &Future<T>) {
        let previous = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, future.clone())
        };
        // The displaced future releases its reference outside the slot lock.
        drop(previous);
    }
}

impl<T> Default for LastResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for LastResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastResult").field("future", &self.get()).finish()
    }
}
