//! Nimbus Cloud Storage
//!
//! Object storage addressed by slash-separated paths inside a bucket.
//! [`StorageReference`] values navigate paths and move data; uploads and
//! downloads run chunk by chunk on background tasks, reporting progress to a
//! [`StorageListener`] and honoring cancellation through their
//! [`Controller`]. Objects and their [`Metadata`] live in an in-process,
//! per-instance store.

// Individual type modules
pub mod controller;
pub mod listener;
pub mod metadata;
pub mod reference;

// Core module
#[allow(clippy::module_inception)]
pub mod storage;

// Re-export the storage entry point
pub use storage::Storage;

// Re-export from reference module
pub use reference::StorageReference;

// Re-export from metadata module
pub use metadata::{Metadata, MetadataUpdate};

// Re-export from controller and listener modules
pub use controller::Controller;
pub use listener::StorageListener;

pub(crate) use storage::purge_instance;
