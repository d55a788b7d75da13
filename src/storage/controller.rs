//! Transfer controller
//!
//! Every upload and download hands back a [`Controller`] alongside its
//! future. The controller reports progress and can cancel the transfer;
//! cancellation resolves the operation's future with the cancelled error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Handle on one running transfer
///
/// Cheap to clone; all clones observe the same transfer. Dropping every
/// clone does not stop the transfer, only [`cancel`](Controller::cancel)
/// does.
#[derive(Clone)]
pub struct Controller {
    state: Arc<TransferState>,
}

struct TransferState {
    transferred: AtomicU64,
    total: AtomicU64,
    cancelled: AtomicBool,
}

impl Controller {
    pub(crate) fn new(total: u64) -> Self {
        Controller {
            state: Arc::new(TransferState {
                transferred: AtomicU64::new(0),
                total: AtomicU64::new(total),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Bytes moved so far
    pub fn bytes_transferred(&self) -> u64 {
        self.state.transferred.load(Ordering::SeqCst)
    }

    /// Total size of the transfer in bytes
    ///
    /// For downloads this is `0` until the worker has resolved the object.
    pub fn total_byte_count(&self) -> u64 {
        self.state.total.load(Ordering::SeqCst)
    }

    /// Request cancellation
    ///
    /// The worker stops at the next chunk boundary and the transfer's future
    /// resolves with the cancelled error. Cancelling a finished transfer has
    /// no effect.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn advance(&self, bytes: u64) {
        self.state.transferred.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.state.total.store(total, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("bytes_transferred", &self.bytes_transferred())
            .field("total_byte_count", &self.total_byte_count())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
