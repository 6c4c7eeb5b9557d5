//! Per-aggregation worker pool.
//!
//! One pool per active aggregation, sized to the aggregation's `limit`. The
//! workers cooperate on the aggregation's pending-download queue: each pops
//! a job id, loads the record, and runs it through the downloader, so at
//! most `limit` downloads are in flight for the aggregation at any instant.
//!
//! Pools never share HTTP clients across aggregations: proxy and timeout
//! identity matter, so the processor hands each pool a client built from
//! its aggregation's config.
//!
//! A pool terminates on its own once no worker has observed work for the
//! idle window; the processor reaps it and will spawn a fresh one (with
//! freshly loaded aggregation config) when new work shows up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::downloader::{self, DownloadPolicy, Outcome};
use crate::job::Aggregation;
use crate::observability::Metrics;
use crate::shutdown::SharedShutdown;
use crate::store::Store;

/// Timing knobs shared by all pools.
#[derive(Debug, Clone)]
pub struct PoolTiming {
    /// Sleep between empty queue pops.
    pub poll_backoff: Duration,
    /// A pool exits after this long without observing work.
    pub idle_window: Duration,
}

/// A bounded set of cooperating workers draining one aggregation's queue.
pub struct AggregationPool {
    aggregation: Aggregation,
    client: reqwest::Client,
    store: Store,
    policy: Arc<DownloadPolicy>,
    timing: PoolTiming,
    metrics: Arc<Metrics>,
    shutdown: SharedShutdown,
}

impl AggregationPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregation: Aggregation,
        client: reqwest::Client,
        store: Store,
        policy: Arc<DownloadPolicy>,
        timing: PoolTiming,
        metrics: Arc<Metrics>,
        shutdown: SharedShutdown,
    ) -> Self {
        Self {
            aggregation,
            client,
            store,
            policy,
            timing,
            metrics,
            shutdown,
        }
    }

    /// Run the pool until its queue stays empty for the idle window or
    /// shutdown is requested.
    pub async fn run(self) {
        let workers = self.aggregation.limit.max(1) as usize;
        info!(
            aggr_id = %self.aggregation.id,
            workers,
            proxy = %self.aggregation.proxy,
            timeout_secs = self.aggregation.timeout_secs,
            "Starting aggregation pool"
        );

        let started = Instant::now();
        // Milliseconds since `started` at which a worker last popped a job.
        let last_activity = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let worker = Worker {
                worker_id,
                aggr_id: self.aggregation.id.clone(),
                client: self.client.clone(),
                store: self.store.clone(),
                policy: self.policy.clone(),
                timing: self.timing.clone(),
                metrics: self.metrics.clone(),
                shutdown: self.shutdown.clone(),
                started,
                last_activity: last_activity.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!(aggr_id = %self.aggregation.id, "Aggregation pool terminated");
    }
}

struct Worker {
    worker_id: usize,
    aggr_id: String,
    client: reqwest::Client,
    store: Store,
    policy: Arc<DownloadPolicy>,
    timing: PoolTiming,
    metrics: Arc<Metrics>,
    shutdown: SharedShutdown,
    started: Instant,
    last_activity: Arc<AtomicU64>,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.shutdown.is_shutdown_requested() {
                break;
            }

            match self.store.pop_pending(&self.aggr_id) {
                Ok(Some(job_id)) => {
                    self.touch();
                    self.process(&job_id).await;
                }
                Ok(None) => {
                    if self.idle_for() >= self.timing.idle_window {
                        break;
                    }
                    if !self.idle_sleep().await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(
                        aggr_id = %self.aggr_id,
                        worker_id = self.worker_id,
                        %err,
                        "Queue pop failed, backing off"
                    );
                    if !self.idle_sleep().await {
                        break;
                    }
                }
            }
        }
    }

    async fn process(&self, job_id: &str) {
        let mut job = match self.store.get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Popped an id whose record is gone; nothing to do.
                warn!(aggr_id = %self.aggr_id, job_id, "Popped job without a record");
                return;
            }
            Err(err) => {
                warn!(aggr_id = %self.aggr_id, job_id, %err, "Could not load job");
                return;
            }
        };

        match downloader::perform(
            &mut job,
            &self.store,
            &self.client,
            &self.policy,
            &self.shutdown,
        )
        .await
        {
            Ok(Outcome::Success) => self.metrics.download_succeeded(),
            Ok(Outcome::Retried) => self.metrics.download_retried(),
            Ok(Outcome::Failed) => self.metrics.download_failed(),
            Ok(Outcome::Cancelled) => {}
            Err(err) => {
                warn!(aggr_id = %self.aggr_id, job_id, %err, "State transition failed");
            }
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Sleep the poll backoff; false means shutdown interrupted it.
    async fn idle_sleep(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.wait_for_shutdown() => false,
            _ = sleep(self.timing.poll_backoff) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, State};
    use crate::shutdown::ShutdownCoordinator;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_policy(save_dir: &Path) -> Arc<DownloadPolicy> {
        Arc::new(DownloadPolicy {
            save_dir: save_dir.to_path_buf(),
            user_agent: "fetchd-test/0".to_string(),
            max_retries: 3,
        })
    }

    fn test_timing() -> PoolTiming {
        PoolTiming {
            poll_backoff: Duration::from_millis(20),
            idle_window: Duration::from_millis(200),
        }
    }

    fn queue_job(store: &Store, id: &str, aggr_id: &str, url: &str) {
        let mut job = Job {
            id: id.to_string(),
            url: url.to_string(),
            aggr_id: aggr_id.to_string(),
            download_state: State::Pending,
            retry_count: 0,
            meta: String::new(),
            callback_url: "http://callback.invalid/hook".to_string(),
            callback_count: 0,
            callback_state: State::Pending,
            extra: String::new(),
            user_agent: String::new(),
        };
        job.queue_pending_download(store).unwrap();
    }

    async fn start_origin() -> String {
        use axum::{routing::get, Router};

        let app = Router::new().route("/file", get(|| async { "BODY" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn pool_with_empty_queue_exits_after_idle_window() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store")).unwrap();

        let pool = AggregationPool::new(
            Aggregation::new("idle", 2, "", None).unwrap(),
            reqwest::Client::new(),
            store,
            test_policy(temp.path()),
            test_timing(),
            Arc::new(Metrics::new()),
            ShutdownCoordinator::shared(),
        );

        timeout(Duration::from_secs(5), pool.run())
            .await
            .expect("pool should terminate on its own");
    }

    #[tokio::test]
    async fn pool_exits_promptly_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store")).unwrap();
        let shutdown = ShutdownCoordinator::shared();

        let pool = AggregationPool::new(
            Aggregation::new("stop", 2, "", None).unwrap(),
            reqwest::Client::new(),
            store,
            test_policy(temp.path()),
            PoolTiming {
                poll_backoff: Duration::from_secs(30),
                idle_window: Duration::from_secs(60),
            },
            Arc::new(Metrics::new()),
            shutdown.clone(),
        );

        let handle = tokio::spawn(pool.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.request_shutdown();

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("pool should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn pool_drains_queue_and_writes_artifacts() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store")).unwrap();
        let save_dir = temp.path().join("files");
        std::fs::create_dir_all(&save_dir).unwrap();

        let origin = start_origin().await;
        for i in 0..3 {
            queue_job(&store, &format!("job_{i}"), "drain", &format!("{origin}/file"));
        }

        let pool = AggregationPool::new(
            Aggregation::new("drain", 1, "", None).unwrap(),
            reqwest::Client::new(),
            store.clone(),
            test_policy(&save_dir),
            test_timing(),
            Arc::new(Metrics::new()),
            ShutdownCoordinator::shared(),
        );

        timeout(Duration::from_secs(10), pool.run()).await.unwrap();

        for i in 0..3 {
            let id = format!("job_{i}");
            let job = store.get_job(&id).unwrap().unwrap();
            assert_eq!(job.download_state, State::Success);
            assert_eq!(job.callback_state, State::Pending);
            let body = std::fs::read_to_string(save_dir.join(&id)).unwrap();
            assert_eq!(body, "BODY");
        }

        // All three ended up on the callback queue, in completion order.
        assert_eq!(store.pop_callback().unwrap(), Some("job_0".into()));
        assert_eq!(store.pop_callback().unwrap(), Some("job_1".into()));
        assert_eq!(store.pop_callback().unwrap(), Some("job_2".into()));
        assert_eq!(store.pop_callback().unwrap(), None);
    }
}
