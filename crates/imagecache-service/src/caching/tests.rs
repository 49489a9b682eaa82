use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{BoxFuture, join_all};
use imagecache_test::TempDir;
use tokio::sync::Semaphore;

use crate::clock::ManualClock;
use crate::download::Origin;

use super::*;

/// An origin serving `image <n>`, `n` counting the fetches so far.
#[derive(Debug, Default)]
struct TestOrigin {
    calls: AtomicUsize,
    failing: AtomicBool,
    empty: AtomicBool,
    /// When set, every fetch waits for a permit before responding.
    gate: Option<Semaphore>,
}

impl TestOrigin {
    fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Lets one pending or future fetch of a gated origin respond.
    fn release(&self) {
        if let Some(ref gate) = self.gate {
            gate.add_permits(1);
        }
    }
}

impl Origin for TestOrigin {
    fn fetch(&self) -> BoxFuture<'_, CacheContents<Bytes>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(ref gate) = self.gate {
                gate.acquire().await.unwrap().forget();
            }

            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::FetchFailed("origin unavailable".into()));
            }
            if self.empty.load(Ordering::SeqCst) {
                return Ok(Bytes::new());
            }
            Ok(Bytes::from(format!("image {n}")))
        })
    }
}

struct Fixture {
    _image_dir: TempDir,
    origin: Arc<TestOrigin>,
    clock: ManualClock,
    coordinator: FetchCoordinator,
}

impl Fixture {
    fn new(origin: TestOrigin) -> Self {
        imagecache_test::setup();

        let image_dir = imagecache_test::tempdir();
        let store = ArtifactStore::open(image_dir.path(), "current_image.jpg").unwrap();
        let origin = Arc::new(origin);
        let clock = ManualClock::new(t0());

        let coordinator = FetchCoordinator::new(
            FreshnessPolicy::new(Duration::from_secs(10 * 60)),
            origin.clone(),
            Arc::new(store),
            Arc::new(clock.clone()),
        );

        Self {
            _image_dir: image_dir,
            origin,
            clock,
            coordinator,
        }
    }

    fn current_bytes(&self) -> Vec<u8> {
        let store = self.coordinator.store();
        store.load(&store.read().unwrap()).unwrap()
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(20_000)
}

fn minutes(m: i64) -> DateTime<Utc> {
    t0() + TimeDelta::minutes(m)
}

/// Yields to the runtime until the origin has been called `n` times.
async fn wait_for_calls(origin: &TestOrigin, n: usize) {
    for _ in 0..10_000 {
        if origin.calls() >= n {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("origin was called {} times, expected {n}", origin.calls());
}

#[tokio::test]
async fn test_empty_cache_is_filled() {
    let f = Fixture::new(TestOrigin::default());

    let view = f.coordinator.get_current().await.unwrap();

    assert_eq!(view.cached_at, t0());
    assert!(view.path.starts_with("/files/current_image-"));
    assert_eq!(f.origin.calls(), 1);
    assert_eq!(f.current_bytes(), b"image 1");
}

#[tokio::test]
async fn test_fresh_entry_is_served_without_fetching() {
    let f = Fixture::new(TestOrigin::default());
    let first = f.coordinator.get_current().await.unwrap();

    f.clock.set(minutes(5));
    let second = f.coordinator.get_current().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(f.origin.calls(), 1);
}

#[tokio::test]
async fn test_stale_entry_is_refilled() {
    let f = Fixture::new(TestOrigin::default());
    let first = f.coordinator.get_current().await.unwrap();

    f.clock.set(minutes(11));
    let second = f.coordinator.get_current().await.unwrap();

    assert_ne!(first.path, second.path);
    assert_eq!(second.cached_at, minutes(11));
    assert_eq!(f.origin.calls(), 2);
    assert_eq!(f.current_bytes(), b"image 2");
}

#[tokio::test]
async fn test_ttl_boundary_is_stale() {
    let f = Fixture::new(TestOrigin::default());
    f.coordinator.get_current().await.unwrap();

    f.clock.set(minutes(10));
    let view = f.coordinator.get_current().await.unwrap();

    assert_eq!(view.cached_at, minutes(10));
    assert_eq!(f.origin.calls(), 2);
}

#[tokio::test]
async fn test_failed_refill_keeps_previous_entry() {
    let f = Fixture::new(TestOrigin::default());
    let first = f.coordinator.get_current().await.unwrap();

    f.clock.set(minutes(11));
    f.origin.set_failing(true);
    let result = f.coordinator.get_current().await;

    assert_eq!(
        result,
        Err(CacheError::FetchFailed("origin unavailable".into()))
    );
    let published = f.coordinator.store().read().unwrap();
    assert_eq!(published.view(), first);
    assert_eq!(f.current_bytes(), b"image 1");

    // the next call retries right away
    let result = f.coordinator.get_current().await;
    assert!(result.is_err());
    assert_eq!(f.origin.calls(), 3);

    f.origin.set_failing(false);
    let view = f.coordinator.get_current().await.unwrap();
    assert_eq!(view.cached_at, minutes(11));
    assert_eq!(f.current_bytes(), b"image 4");
}

#[tokio::test]
async fn test_failed_fill_of_empty_cache() {
    let f = Fixture::new(TestOrigin::default());
    f.origin.set_failing(true);

    let result = f.coordinator.get_current().await;

    assert!(matches!(result, Err(CacheError::FetchFailed(_))));
    assert!(f.coordinator.store().read().is_none());
}

#[tokio::test]
async fn test_empty_artifact_fails_to_store() {
    let f = Fixture::new(TestOrigin::default());
    f.origin.empty.store(true, Ordering::SeqCst);

    let result = f.coordinator.get_current().await;

    assert!(matches!(result, Err(CacheError::StoreFailed(_))));
    assert!(f.coordinator.store().read().is_none());
}

#[tokio::test]
async fn test_failed_store_keeps_previous_entry() {
    let f = Fixture::new(TestOrigin::default());
    let first = f.coordinator.get_current().await.unwrap();

    let dir = f.coordinator.store().dir().to_owned();
    fs::remove_dir_all(&dir).unwrap();

    f.clock.set(minutes(11));
    let result = f.coordinator.get_current().await;

    assert!(matches!(result, Err(CacheError::StoreFailed(_))));
    let published = f.coordinator.store().read().unwrap();
    assert_eq!(published.view(), first);
    assert_eq!(f.origin.calls(), 2);

    // once the directory is back, the next call refills
    fs::create_dir_all(&dir).unwrap();
    let view = f.coordinator.get_current().await.unwrap();
    assert_eq!(view.cached_at, minutes(11));
    assert_eq!(f.origin.calls(), 3);
    assert_eq!(f.current_bytes(), b"image 3");
}

#[tokio::test]
async fn test_serve_stale_on_error() {
    let mut f = Fixture::new(TestOrigin::default());
    f.coordinator = f.coordinator.clone().serve_stale_on_error(true);
    let first = f.coordinator.get_current().await.unwrap();

    f.clock.set(minutes(11));
    f.origin.set_failing(true);
    let view = f.coordinator.get_current().await.unwrap();

    assert_eq!(view, first);
    assert_eq!(f.origin.calls(), 2);
}

#[tokio::test]
async fn test_serve_stale_on_error_without_entry() {
    let mut f = Fixture::new(TestOrigin::default());
    f.coordinator = f.coordinator.clone().serve_stale_on_error(true);
    f.origin.set_failing(true);

    let result = f.coordinator.get_current().await;

    assert!(matches!(result, Err(CacheError::FetchFailed(_))));
}

#[tokio::test]
async fn test_concurrent_requests_share_one_refill() {
    let f = Fixture::new(TestOrigin::gated());

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let coordinator = f.coordinator.clone();
            tokio::spawn(async move { coordinator.get_current().await })
        })
        .collect();

    wait_for_calls(&f.origin, 1).await;
    // give the remaining requests a chance to join the refill in flight
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
    f.origin.release();

    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    let expected = results[0].clone().unwrap();
    assert_eq!(expected.cached_at, t0());
    for result in results {
        assert_eq!(result, Ok(expected.clone()));
    }
    assert_eq!(f.origin.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_failure() {
    let f = Fixture::new(TestOrigin::gated());
    f.origin.set_failing(true);

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let coordinator = f.coordinator.clone();
            tokio::spawn(async move { coordinator.get_current().await })
        })
        .collect();

    wait_for_calls(&f.origin, 1).await;
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
    f.origin.release();

    for result in join_all(tasks).await {
        assert_eq!(
            result.unwrap(),
            Err(CacheError::FetchFailed("origin unavailable".into()))
        );
    }
    assert_eq!(f.origin.calls(), 1);

    // once the failure is delivered, a new request starts a new refill
    f.origin.set_failing(false);
    f.origin.release();
    let view = f.coordinator.get_current().await.unwrap();
    assert_eq!(view.cached_at, t0());
    assert_eq!(f.origin.calls(), 2);
}

#[tokio::test]
async fn test_dropped_request_does_not_cancel_refill() {
    let f = Fixture::new(TestOrigin::gated());

    let first = {
        let coordinator = f.coordinator.clone();
        tokio::spawn(async move { coordinator.get_current().await })
    };
    wait_for_calls(&f.origin, 1).await;

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    f.origin.release();
    let view = f.coordinator.get_current().await.unwrap();

    assert_eq!(view.cached_at, t0());
    assert_eq!(f.origin.calls(), 1);
    assert_eq!(f.current_bytes(), b"image 1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_mixed_entries() {
    let f = Fixture::new(TestOrigin::default());
    f.coordinator.get_current().await.unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let coordinator = f.coordinator.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    seen.push(coordinator.get_current().await.unwrap());
                    tokio::task::yield_now().await;
                }
                seen
            })
        })
        .collect();

    for refill in 1..=5 {
        f.clock.set(minutes(11 * refill));
        f.coordinator.get_current().await.unwrap();
        tokio::task::yield_now().await;
    }

    let mut cached_at_by_path = HashMap::new();
    for reader in join_all(readers).await {
        for view in reader.unwrap() {
            let cached_at = *cached_at_by_path
                .entry(view.path.clone())
                .or_insert(view.cached_at);
            assert_eq!(cached_at, view.cached_at);
        }
    }
    // one refill per clock change at most, no matter how many readers
    assert!(f.origin.calls() <= 6);
}
