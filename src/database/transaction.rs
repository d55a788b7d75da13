//! Transaction runner: optimistic concurrency with bounded retries
//!
//! A transaction repeatedly runs a caller-supplied closure against the
//! freshest known state of one location and tries to commit the closure's
//! edits conditionally. A conflicting concurrent write is absorbed by
//! retrying with the state the conflict revealed; the closure voting
//! [`TransactionResult::Abort`], an exhausted attempt budget, or a backend
//! error end the transaction with the matching error on its future.
//!
//! The runner executes on a spawned task. The caller observes the outcome
//! only through the returned future; nothing here blocks the caller and the
//! caller cannot block the runner.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::database::backend::{CasOutcome, DatabaseBackend, VersionedNode};
use crate::database::data_snapshot::DataSnapshot;
use crate::database::mutable_data::MutableData;
use crate::database::value;
use crate::error::DatabaseError;
use crate::future::{Future, FutureRegistry};

/// Verdict returned by a transaction closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionResult {
    /// Commit the edited snapshot
    Success,
    /// Stop immediately; nothing is committed and no further attempt runs
    Abort,
}

/// Tuning knobs for one transaction
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Upper bound on closure invocations for one transaction; values below
    /// 1 behave as 1
    pub max_attempts: usize,
    /// Upper bound of the random delay inserted before a conflict retry;
    /// zero disables the delay
    pub retry_jitter: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            max_attempts: 25,
            retry_jitter: Duration::from_millis(20),
        }
    }
}

/// Start a transaction at `path`, resolving the returned future with the
/// committed snapshot
pub(crate) fn spawn<F>(
    backend: Arc<dyn DatabaseBackend>,
    registry: Arc<FutureRegistry>,
    path: String,
    callback: F,
    options: TransactionOptions,
) -> Future<DataSnapshot>
where
    F: FnMut(&mut MutableData<'_>) -> TransactionResult + Send + 'static,
{
    let future = registry.alloc::<DataSnapshot>();
    let handle = future.handle();
    tokio::spawn(run(backend, registry, path, callback, options, handle));
    future
}

async fn run<F>(
    backend: Arc<dyn DatabaseBackend>,
    registry: Arc<FutureRegistry>,
    path: String,
    mut callback: F,
    options: TransactionOptions,
    handle: crate::future::FutureHandle,
) where
    F: FnMut(&mut MutableData<'_>) -> TransactionResult + Send + 'static,
{
    let budget = options.max_attempts.max(1);
    let key = path
        .trim_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string);

    let mut attempts = 0usize;
    // The state the next attempt starts from; a conflict response refreshes
    // it without another fetch round trip.
    let mut latest: Option<VersionedNode> = None;

    loop {
        attempts += 1;
        let fetched = match latest.take() {
            Some(node) => node,
            None => match backend.fetch(&path).await {
                Ok(node) => node,
                Err(err) => {
                    registry.fail(handle, err.code(), err.to_string());
                    return;
                }
            },
        };

        // Each attempt works on its own copy of the fetched state; edits
        // from a failed attempt never carry over.
        let mut working = fetched.node;
        let verdict = {
            let mut data = MutableData::new(&mut working, key.clone());
            callback(&mut data)
        };

        if verdict == TransactionResult::Abort {
            let err = DatabaseError::TransactionAbortedByUser;
            registry.fail(handle, err.code(), err.to_string());
            return;
        }

        match backend
            .compare_and_set(&path, fetched.version, working.clone())
            .await
        {
            Ok(CasOutcome::Committed(version)) => {
                debug!(path = %path, version, attempts, "transaction committed");
                registry.complete(handle, DataSnapshot::new(key, value::normalize(working)));
                return;
            }
            Ok(CasOutcome::Conflict(current)) => {
                if attempts >= budget {
                    let err = DatabaseError::TransactionRetriesExhausted;
                    registry.fail(handle, err.code(), err.to_string());
                    return;
                }
                debug!(path = %path, attempt = attempts, "transaction conflict; retrying");
                latest = Some(current);

                let jitter_ms = options.retry_jitter.as_millis() as u64;
                if jitter_ms > 0 {
                    let wait = {
                        use rand::Rng;
                        rand::thread_rng().gen_range(0..=jitter_ms)
                    };
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
            }
            Err(err) => {
                registry.fail(handle, err.code(), err.to_string());
                return;
            }
        }
    }
}
