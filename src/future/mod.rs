//! Asynchronous result plumbing shared by every SDK module
//!
//! All long-running SDK calls return a [`Future`] immediately. Behind it sits
//! a per-subsystem [`FutureRegistry`] of reference-counted operation records:
//! the subsystem completes the record from its worker tasks, and the caller
//! observes the outcome by polling, by completion callback, or by `.await`.
//! [`LastResult`] slots back the `<operation>_last_result()` accessors.

pub mod future;
pub mod last_result;
pub mod registry;

pub use future::{Future, FutureError};
pub use last_result::LastResult;
pub use registry::{FutureHandle, FutureRegistry, FutureStatus};
