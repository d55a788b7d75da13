//! Transfer progress listener

use crate::storage::controller::Controller;

/// Progress observer for uploads and downloads
///
/// Passed to [`put_bytes_with`] and [`get_bytes_with`]; called from the
/// transfer's worker task, so a listener runs on a different task than the
/// caller and must synchronize any state it touches. The controller handed
/// to the callback is the same one the operation returned, so a listener may
/// cancel its own transfer.
///
/// [`put_bytes_with`]: crate::storage::StorageReference::put_bytes_with
/// [`get_bytes_with`]: crate::storage::StorageReference::get_bytes_with
pub trait StorageListener: Send + Sync {
    /// Called once before the first chunk moves and again after every chunk
    fn on_progress(&self, controller: &Controller);
}
