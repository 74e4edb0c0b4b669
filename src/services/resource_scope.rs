//! Guaranteed resource disposal.
//!
//! Every resource the engine acquires is wrapped in a `ResourceScope` so
//! that exactly one disposal completes before the owning scope returns,
//! regardless of success, error, or cancellation. The `disposed` flag is
//! flipped atomically before the underlying dispose runs, which makes
//! double-dispose a safe no-op and eliminates re-entry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};

/// Options for one disposal.
#[derive(Debug, Clone)]
pub struct DisposeOptions {
    /// Dispose even if the resource believes it is busy.
    pub force: bool,
    /// Deadline for the underlying dispose.
    pub timeout_ms: u64,
    /// Swallow disposal errors after logging them.
    pub suppress_errors: bool,
}

impl Default for DisposeOptions {
    fn default() -> Self {
        Self {
            force: false,
            timeout_ms: 5_000,
            suppress_errors: true,
        }
    }
}

/// A resource that can be disposed exactly once.
#[async_trait]
pub trait Disposable: Send + Sync {
    async fn dispose(&self, opts: &DisposeOptions) -> CoreResult<()>;
}

/// Census counters shared by every scope created from it. Used for leak
/// detection and shutdown.
#[derive(Debug, Default)]
struct CensusInner {
    live: Mutex<HashMap<Uuid, LiveEntry>>,
    total_disposed: AtomicU64,
    failed: AtomicU64,
    total_latency_ms: AtomicU64,
}

#[derive(Debug, Clone)]
struct LiveEntry {
    name: String,
    created_at: Instant,
}

/// Global view of live and disposed resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceCensus {
    inner: Arc<CensusInner>,
}

/// Census snapshot for metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CensusSnapshot {
    pub live: usize,
    pub total_disposed: u64,
    pub failed: u64,
    pub avg_dispose_latency_ms: f64,
}

impl ResourceCensus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, id: Uuid, name: &str) {
        self.inner.live.lock().await.insert(
            id,
            LiveEntry {
                name: name.to_string(),
                created_at: Instant::now(),
            },
        );
    }

    async fn unregister(&self, id: Uuid, latency: Duration, failed: bool) {
        self.inner.live.lock().await.remove(&id);
        self.inner.total_disposed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
        }
        #[allow(clippy::cast_possible_truncation)]
        self.inner
            .total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> CensusSnapshot {
        let live = self.inner.live.lock().await.len();
        let total = self.inner.total_disposed.load(Ordering::Relaxed);
        let total_latency = self.inner.total_latency_ms.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let avg = if total == 0 {
            0.0
        } else {
            total_latency as f64 / total as f64
        };
        CensusSnapshot {
            live,
            total_disposed: total,
            failed: self.inner.failed.load(Ordering::Relaxed),
            avg_dispose_latency_ms: avg,
        }
    }

    /// Names of resources still live, oldest first.
    pub async fn live_resources(&self) -> Vec<String> {
        let live = self.inner.live.lock().await;
        let mut entries: Vec<_> = live.values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries.into_iter().map(|e| e.name).collect()
    }
}

/// RAII-style wrapper around one `Disposable`.
pub struct ResourceScope<R: Disposable + 'static> {
    id: Uuid,
    name: String,
    resource: Arc<R>,
    disposed: Arc<AtomicBool>,
    census: ResourceCensus,
}

impl<R: Disposable + 'static> ResourceScope<R> {
    pub async fn new(resource: Arc<R>, name: impl Into<String>, census: ResourceCensus) -> Self {
        let id = Uuid::new_v4();
        let name = name.into();
        census.register(id, &name).await;
        Self {
            id,
            name,
            resource,
            disposed: Arc::new(AtomicBool::new(false)),
            census,
        }
    }

    /// Access the wrapped resource. Fails once disposed.
    pub fn get_resource(&self) -> CoreResult<Arc<R>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CoreError::Internal(format!(
                "use after dispose: {}",
                self.name
            )));
        }
        Ok(Arc::clone(&self.resource))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Run `f` with the resource, then dispose in a guaranteed-exit path.
    /// The disposal happens whether `f` succeeds or fails.
    pub async fn use_with<T, F, Fut>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(Arc<R>) -> Fut,
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        let resource = self.get_resource()?;
        let result = f(resource).await;
        self.dispose(&DisposeOptions::default()).await?;
        result
    }

    /// Dispose the resource. Idempotent: the flag flips before the
    /// underlying dispose runs, so a second call returns `Ok` immediately.
    pub async fn dispose(&self, opts: &DisposeOptions) -> CoreResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let start = Instant::now();
        let deadline = Duration::from_millis(opts.timeout_ms);
        let outcome = tokio::time::timeout(deadline, self.resource.dispose(opts)).await;

        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CoreError::Internal(format!(
                "dispose of {} timed out after {}ms",
                self.name, opts.timeout_ms
            ))),
        };

        let failed = result.is_err();
        self.census.unregister(self.id, start.elapsed(), failed).await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if opts.suppress_errors => {
                warn!(resource = %self.name, error = %err, "dispose failed (suppressed)");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Dispose a set of scopes in parallel. Used on task teardown and
/// shutdown.
pub async fn dispose_all<R: Disposable + 'static>(
    scopes: &[Arc<ResourceScope<R>>],
    opts: &DisposeOptions,
) {
    let futures: Vec<_> = scopes.iter().map(|s| s.dispose(opts)).collect();
    for result in futures::future::join_all(futures).await {
        if let Err(err) = result {
            warn!(error = %err, "dispose_all: scope failed");
        }
    }
}
