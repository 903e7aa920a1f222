// Dispatcher - fire-and-forget fan-out of one delivery task per post.
//
// `on_post_event` never waits: it spawns a task that fetches the avatar,
// builds the report and POSTs it. Tasks share nothing except the HTTP
// clients inside the fetcher/sink and a few atomic counters. A failed
// delivery is logged and dropped; it never reaches the stream driver.
//
// Concurrency is unbounded unless a permit limit is configured. Permits are
// acquired inside the spawned task, so a full pool delays deliveries but
// still never blocks the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::extract::parse_created_at;
use super::image::AvatarFetcher;
use super::report::{build_report, NormalizedReport};
use super::sink::ReportSink;
use crate::twitter::models::InboundPost;

/// Counters for the lifetime of one dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub failed: u64,
    pub in_flight: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Holds one `in_flight` slot; released on drop so panicking or abandoned
/// tasks don't leave the counter raised.
struct InFlight<'a>(&'a DispatchStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a DispatchStats) -> Self {
        stats.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Inner {
    fetcher: Arc<dyn AvatarFetcher>,
    sink: Arc<dyn ReportSink>,
    permits: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    stats: DispatchStats,
}

/// Cheap to clone; all clones feed the same task set.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// `max_in_flight` of `None` (or `Some(0)`) means unbounded.
    pub fn new(
        fetcher: Arc<dyn AvatarFetcher>,
        sink: Arc<dyn ReportSink>,
        max_in_flight: Option<usize>,
    ) -> Self {
        let permits = max_in_flight
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));

        Self {
            inner: Arc::new(Inner {
                fetcher,
                sink,
                permits,
                tracker: TaskTracker::new(),
                stats: DispatchStats::default(),
            }),
        }
    }

    /// Schedule one delivery unit for `post` and return immediately.
    ///
    /// Posts arriving after [`shutdown`](Self::shutdown) are dropped. Must be
    /// called from within a tokio runtime.
    pub fn on_post_event(&self, post: InboundPost) {
        if self.inner.tracker.is_closed() {
            warn!(id = %post.id_str, "Dispatcher is shut down, dropping post");
            return;
        }
        self.inner.stats.received.fetch_add(1, Ordering::Relaxed);

        if let Some(created) = parse_created_at(&post) {
            let lag_ms = chrono::Utc::now()
                .signed_duration_since(created)
                .num_milliseconds();
            debug!(id = %post.id_str, lag_ms, "Post received");
        }

        let this = self.clone();
        self.inner.tracker.spawn(async move {
            // The pool is never closed, so acquiring only waits.
            let _permit = match &this.inner.permits {
                Some(permits) => permits.clone().acquire_owned().await.ok(),
                None => None,
            };

            let _in_flight = InFlight::enter(&this.inner.stats);
            let report = build_report(&post, this.inner.fetcher.as_ref()).await;
            this.deliver(&report).await;
        });
    }

    /// Send one report through the sink, logging the outcome.
    /// Returns whether the sink accepted it.
    pub async fn deliver(&self, report: &NormalizedReport) -> bool {
        match self.inner.sink.send(report).await {
            Ok(()) => {
                self.inner.stats.delivered.fetch_add(1, Ordering::Relaxed);
                info!(
                    author = %report.author,
                    urls = report.urls.len(),
                    has_image = !report.image.is_empty(),
                    "Report sent"
                );
                true
            }
            Err(e) => {
                self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(author = %report.author, error = %e, "Report delivery failed, dropping");
                false
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Delivery tasks spawned and not yet finished.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Stop accepting posts and wait up to `grace` for in-flight deliveries.
    ///
    /// Returns `true` if everything finished. With a zero grace period the
    /// tasks are abandoned to the runtime's shutdown.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.tracker.close();
        if self.inner.tracker.is_empty() {
            return true;
        }
        if grace.is_zero() {
            warn!(
                pending = self.inner.tracker.len(),
                "Abandoning in-flight deliveries"
            );
            return false;
        }

        match tokio::time::timeout(grace, self.inner.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    pending = self.inner.tracker.len(),
                    grace_secs = grace.as_secs_f64(),
                    "Shutdown grace period elapsed with deliveries in flight"
                );
                false
            }
        }
    }
}
