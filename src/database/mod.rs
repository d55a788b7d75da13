//! Nimbus Realtime Database
//!
//! A JSON tree addressed by slash-separated paths. [`DatabaseReference`]
//! values navigate the tree and issue reads, writes and transactions; every
//! operation returns a [`Future`](crate::future::Future) immediately and
//! resolves on a background task. [`ValueListener`]s observe a location
//! push-style.
//!
//! Transactions follow optimistic concurrency: the callback runs against a
//! fresh snapshot of the location, the commit is conditional on that snapshot
//! still being current, and a conflict reruns the callback against the state
//! that beat it. See [`DatabaseReference::run_transaction`].

// Individual type modules
pub mod data_snapshot;
pub mod listener;
pub mod mutable_data;
pub mod reference;

// Core modules
pub mod backend;
#[allow(clippy::module_inception)]
pub mod database;
pub mod transaction;

// Export-format tree manipulation shared by the module
pub(crate) mod value;

// Re-export the database entry point
pub use database::Database;

// Re-export from reference module
pub use reference::DatabaseReference;

// Re-export from data_snapshot and mutable_data modules
pub use data_snapshot::DataSnapshot;
pub use mutable_data::MutableData;

// Re-export from transaction module
pub use transaction::{TransactionOptions, TransactionResult};

// Re-export from listener module
pub use listener::{ListenerRegistration, ValueListener};

// Re-export the backend seam for embedders and tests
pub use backend::{CasOutcome, ChangeEvent, DatabaseBackend, MemoryBackend, VersionedNode};

pub(crate) use database::purge_instance;
