use std::fmt;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use crate::clock::Clock;
use crate::download::Origin;
use crate::utils::futures::{CallOnDrop, m, measure};

use super::{ArtifactStore, CacheContents, CacheEntry, CacheEntryView, CacheError, FreshnessPolicy};

/// The outcome of one refill, shared by everyone waiting on it.
type RefillFuture = Shared<BoxFuture<'static, CacheContents<Arc<CacheEntry>>>>;

/// Serves the cached artifact, refilling it from the origin once it went stale.
///
/// At most one refill is in flight at any time. Callers arriving while a refill is running
/// wait for that refill and receive its outcome, so concurrent requests for a stale artifact
/// result in a single origin fetch.
///
/// The refill itself runs as a spawned task. Dropping any of the waiting callers, including
/// the one that triggered the refill, does not cancel it.
#[derive(Clone)]
pub struct FetchCoordinator {
    policy: FreshnessPolicy,
    origin: Arc<dyn Origin>,
    store: Arc<ArtifactStore>,
    clock: Arc<dyn Clock>,
    serve_stale_on_error: bool,

    /// The refill in flight, if any.
    ///
    /// The freshness check and the decision to start a refill both happen while holding this
    /// lock. The refill task clears it only after the store published the new entry.
    refill: Arc<Mutex<Option<RefillFuture>>>,
}

impl fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("policy", &self.policy)
            .field("origin", &self.origin)
            .field("store", &self.store)
            .field("clock", &self.clock)
            .field("serve_stale_on_error", &self.serve_stale_on_error)
            .field(
                "refilling",
                &self.refill.try_lock().map(|refill| refill.is_some()).ok(),
            )
            .finish()
    }
}

impl FetchCoordinator {
    pub fn new(
        policy: FreshnessPolicy,
        origin: Arc<dyn Origin>,
        store: Arc<ArtifactStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            origin,
            store,
            clock,
            serve_stale_on_error: false,
            refill: Arc::default(),
        }
    }

    /// Serve the previous entry instead of an error if a refill fails.
    pub fn serve_stale_on_error(mut self, enabled: bool) -> Self {
        self.serve_stale_on_error = enabled;
        self
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Returns the metadata of a fresh artifact, refilling the cache if necessary.
    ///
    /// A fresh entry is returned right away. Otherwise this waits for the refill in flight,
    /// starting one if there is none.
    ///
    /// # Errors
    ///
    /// Returns the error of the refill this call waited for. The previously published entry
    /// stays in place, and the next call starts a new refill.
    pub async fn get_current(&self) -> CacheContents<CacheEntryView> {
        metric!(counter("caches.access") += 1);

        let mut spawn = None;
        let (previous, refill) = {
            let mut refill = self.refill.lock().unwrap();

            let current = self.store.read();
            if let Some(ref entry) = current {
                if self.policy.is_fresh(Some(entry), self.clock.now()) {
                    metric!(counter("caches.hit") += 1);
                    return Ok(entry.view());
                }
            }

            let future = match *refill {
                Some(ref future) => {
                    metric!(counter("caches.refill.joined") += 1);
                    future.clone()
                }
                None => {
                    let (future, task) = self.prepare_refill();
                    *refill = Some(future.clone());
                    spawn = Some(task);
                    future
                }
            };

            (current, future)
        };

        if let Some(task) = spawn {
            tracing::debug!("Spawning refill of the cached artifact");
            tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
        }

        match refill.await {
            Ok(entry) => Ok(entry.view()),
            Err(err) => match previous {
                Some(previous) if self.serve_stale_on_error => {
                    tracing::warn!(
                        error = %err,
                        cached_at = %previous.cached_at(),
                        "Refill failed, serving stale artifact"
                    );
                    metric!(counter("caches.stale_served") += 1);
                    Ok(previous.view())
                }
                _ => Err(err),
            },
        }
    }

    /// Creates a refill task along with a handle to its outcome.
    ///
    /// The handle is stored while holding the `refill` lock, the task is spawned only after the
    /// lock is released.
    fn prepare_refill(&self) -> (RefillFuture, BoxFuture<'static, ()>) {
        metric!(counter("caches.refill") += 1);

        let (sender, receiver) = oneshot::channel();

        let done_token = {
            let refill = Arc::clone(&self.refill);
            CallOnDrop::new(move || {
                refill.lock().unwrap().take();
            })
        };

        let this = self.clone();
        let task = async move {
            let result = measure("caches.refill", m::result, this.fetch_and_store()).await;
            // Release the flag first, so that callers woken up by a failure start a new refill.
            drop(done_token);
            sender.send(result).ok();
        };

        let future = receiver
            .map(|result| {
                result.unwrap_or_else(|_| {
                    Err(CacheError::FetchFailed("refill was cancelled".into()))
                })
            })
            .boxed()
            .shared();

        (future, task.boxed())
    }

    /// Fetches the artifact from the origin and publishes it.
    async fn fetch_and_store(&self) -> CacheContents<Arc<CacheEntry>> {
        let bytes = self.origin.fetch().await.inspect_err(|err| {
            metric!(counter("caches.refill.error") += 1, "reason" => err.metrics_tag());
        })?;

        let now = self.clock.now();
        let store = Arc::clone(&self.store);
        let entry = tokio::task::spawn_blocking(move || store.write(&bytes, now))
            .await
            .unwrap_or_else(|_| {
                Err(CacheError::StoreFailed(
                    "storing the artifact panicked".into(),
                ))
            })
            .inspect_err(|err| {
                metric!(counter("caches.refill.error") += 1, "reason" => err.metrics_tag());
            })?;

        tracing::info!(
            file_name = entry.file_name(),
            size = entry.size(),
            cached_at = %entry.cached_at(),
            "Refilled cached artifact"
        );

        Ok(entry)
    }
}
