//! Deduplication context (spec §4.6): at-most-one concrete execution per
//! key. Concurrent callers with the same key attach to the first
//! executor and receive the same result or the same error.
//!
//! spec §9 suggests a hand-rolled `IndexID -> {state, waiters}` map with
//! a coarse mutex. `tokio::sync::OnceCell` behind a `dashmap` entry gives
//! the identical guarantee — exactly one execution, every concurrent
//! caller awaits that one execution's result — without hand-rolling the
//! waiter list; the entry is evicted once the execution completes so a
//! later, non-concurrent call re-executes rather than reusing a stale
//! result.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use vault_common::{Identifier, Result};

/// Keyed single-flight coordinator. `T` is the shared result type: `()`
/// for the upload context, `Vec<u8>` for the download context (spec
/// §4.6).
pub struct DedupContext<T: Clone + Send + Sync + 'static> {
    inflight: DashMap<Identifier, Arc<OnceCell<Result<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for DedupContext<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> DedupContext<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Runs `work` for `key` if no execution is already in flight;
    /// otherwise awaits the in-flight execution's result. Either way,
    /// every caller for the same `key` observes the identical `Result`.
    pub async fn run<F, Fut>(&self, key: Identifier, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cell = Arc::clone(
            self.inflight
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );

        let result = cell.get_or_init(work).await.clone();

        // Only the caller whose Arc is still the one in the map retires
        // it, so a concurrent re-entry that raced ahead and already
        // replaced the slot with a fresh execution is left untouched.
        self.inflight.remove_if(&key, |_, v| Arc::ptr_eq(v, &cell));

        result
    }

    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}
