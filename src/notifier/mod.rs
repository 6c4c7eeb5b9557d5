//! Callback delivery pool.
//!
//! A single global pool drains the pending-callback queue and POSTs each
//! job's result envelope to its callback URL. Delivery is at-least-once up
//! to the retry cap: 2xx is terminal Success, 4xx is terminal Failed (the
//! callback URL rejected us permanently), and 5xx or transport errors
//! re-enqueue until `callback_count` reaches the cap, at which point the
//! job is marked failed-callback with the last error in `meta`.
//!
//! The notifier is independent of the aggregation pools: its concurrency,
//! retry policy, and shutdown are separately governed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::CallbacksConfig;
use crate::downloader::error_chain;
use crate::job::{Job, State};
use crate::observability::Metrics;
use crate::shutdown::SharedShutdown;
use crate::store::{Store, StoreError};

/// The JSON document POSTed to a job's callback URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackEnvelope {
    /// True iff the download reached Success.
    pub success: bool,
    /// The job's `meta`; carries the last download error on failure.
    pub error: String,
    /// The submission's `extra`, echoed back verbatim.
    pub extra: String,
    /// Where the downloaded artifact can be retrieved.
    pub download_url: String,
}

impl CallbackEnvelope {
    pub fn for_job(job: &Job, download_url: String) -> Self {
        Self {
            success: job.download_state == State::Success,
            error: job.meta.clone(),
            extra: job.extra.clone(),
            download_url,
        }
    }
}

/// Builds the `download_url` the envelope advertises. Injected so the URL
/// scheme (CDN, signed URLs, …) stays out of the delivery loop.
pub type DownloadUrlFn = Arc<dyn Fn(&Job) -> String + Send + Sync>;

/// Global pool delivering callback envelopes.
pub struct Notifier {
    store: Store,
    client: reqwest::Client,
    config: CallbacksConfig,
    download_url: DownloadUrlFn,
    metrics: Arc<Metrics>,
    shutdown: SharedShutdown,
}

impl Notifier {
    pub fn new(
        store: Store,
        config: CallbacksConfig,
        download_url: DownloadUrlFn,
        metrics: Arc<Metrics>,
        shutdown: SharedShutdown,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            store,
            client,
            config,
            download_url,
            metrics,
            shutdown,
        })
    }

    /// The standard URL scheme: `{public_url}/files/{job_id}`.
    pub fn public_url_builder(public_url: &str) -> DownloadUrlFn {
        let base = public_url.trim_end_matches('/').to_string();
        Arc::new(move |job: &Job| format!("{base}/files/{}", job.id))
    }

    /// Run the pool until shutdown.
    pub async fn run(self) {
        let workers = self.config.concurrency.max(1);
        info!(workers, "Starting notifier");

        let shared = Arc::new(self);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let notifier = shared.clone();
            handles.push(tokio::spawn(notifier.worker_loop(worker_id)));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("Notifier stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            if self.shutdown.is_shutdown_requested() {
                break;
            }

            match self.store.pop_callback() {
                Ok(Some(job_id)) => {
                    if let Err(err) = self.process(&job_id).await {
                        warn!(worker_id, %job_id, %err, "Callback state transition failed");
                    }
                }
                Ok(None) => {
                    if !self.idle_sleep().await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(worker_id, %err, "Callback queue pop failed, backing off");
                    if !self.idle_sleep().await {
                        break;
                    }
                }
            }
        }
    }

    async fn process(&self, job_id: &str) -> Result<(), StoreError> {
        let mut job = match self.store.get_job(job_id)? {
            Some(job) => job,
            None => {
                warn!(job_id, "Popped callback for a job without a record");
                return Ok(());
            }
        };

        job.callback_count += 1;
        job.set_callback_state(&self.store, State::InProgress, None)?;

        let envelope = CallbackEnvelope::for_job(&job, (self.download_url)(&job));
        debug!(job_id, attempt = job.callback_count, url = %job.callback_url, "Delivering callback");

        let response = tokio::select! {
            _ = self.shutdown.wait_for_shutdown() => return Ok(()),
            response = self.client.post(&job.callback_url).json(&envelope).send() => response,
        };

        match response {
            Ok(response) if response.status().is_success() => {
                job.set_callback_state(&self.store, State::Success, None)?;
                self.metrics.callback_delivered();
                info!(job_id, "Callback delivered");
            }
            Ok(response) if response.status().is_client_error() => {
                // The receiver rejected the envelope; retrying won't help.
                let status = response.status();
                job.set_callback_state(
                    &self.store,
                    State::Failed,
                    Some(&format!("Received status code {status}")),
                )?;
                self.metrics.callback_failed();
                warn!(job_id, %status, "Callback rejected permanently");
            }
            Ok(response) => {
                let status = response.status();
                self.retry_or_fail(&mut job, &format!("Received status code {status}"))?;
            }
            Err(err) => {
                self.retry_or_fail(&mut job, &error_chain(&err))?;
            }
        }

        Ok(())
    }

    fn retry_or_fail(&self, job: &mut Job, last_error: &str) -> Result<(), StoreError> {
        if job.callback_count < self.config.max_retries {
            debug!(job_id = %job.id, attempt = job.callback_count, last_error, "Callback requeued");
            job.queue_pending_callback(&self.store)
        } else {
            warn!(job_id = %job.id, last_error, "Callback retries exhausted");
            job.set_callback_state(&self.store, State::Failed, Some(last_error))?;
            self.metrics.callback_failed();
            Ok(())
        }
    }

    /// Sleep the poll backoff; false means shutdown interrupted it.
    async fn idle_sleep(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.wait_for_shutdown() => false,
            _ = sleep(self.config.poll_backoff()) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;
    use axum::extract::State as AxumState;
    use axum::http::StatusCode;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct Receiver {
        /// Envelopes the mock callback endpoint accepted.
        received: Arc<Mutex<Vec<CallbackEnvelope>>>,
        hits: Arc<AtomicU32>,
        /// Status codes to serve before accepting with 200.
        fail_first: Arc<Vec<StatusCode>>,
    }

    async fn hook(
        AxumState(receiver): AxumState<Receiver>,
        Json(envelope): Json<CallbackEnvelope>,
    ) -> StatusCode {
        let hit = receiver.hits.fetch_add(1, Ordering::SeqCst) as usize;
        if let Some(status) = receiver.fail_first.get(hit) {
            return *status;
        }
        receiver.received.lock().unwrap().push(envelope);
        StatusCode::OK
    }

    async fn start_receiver(fail_first: Vec<StatusCode>) -> (String, Receiver) {
        let receiver = Receiver {
            fail_first: Arc::new(fail_first),
            ..Default::default()
        };
        let app = Router::new()
            .route("/hook", post(hook))
            .with_state(receiver.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), receiver)
    }

    fn terminal_job(id: &str, state: State, callback_url: &str) -> Job {
        Job {
            id: id.to_string(),
            url: "http://origin.invalid/file".to_string(),
            aggr_id: "a".to_string(),
            download_state: state,
            retry_count: 0,
            meta: if state == State::Failed {
                "Received status code 404 Not Found".to_string()
            } else {
                String::new()
            },
            callback_url: callback_url.to_string(),
            callback_count: 0,
            callback_state: State::Pending,
            extra: "order=7".to_string(),
            user_agent: String::new(),
        }
    }

    fn test_callbacks_config() -> CallbacksConfig {
        CallbacksConfig {
            concurrency: 2,
            timeout_secs: 2,
            max_retries: 3,
            poll_backoff_ms: 20,
        }
    }

    async fn run_until_callback_terminal(store: &Store, job_id: &str, shutdown: &SharedShutdown) -> Job {
        let job = timeout(Duration::from_secs(10), async {
            loop {
                if let Some(job) = store.get_job(job_id).unwrap() {
                    if job.callback_state.is_terminal() {
                        return job;
                    }
                }
                sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("callback should reach a terminal state");
        shutdown.request_shutdown();
        job
    }

    fn spawn_notifier(
        store: &Store,
        public_url: &str,
        shutdown: &SharedShutdown,
    ) -> tokio::task::JoinHandle<()> {
        let notifier = Notifier::new(
            store.clone(),
            test_callbacks_config(),
            Notifier::public_url_builder(public_url),
            Arc::new(Metrics::new()),
            shutdown.clone(),
        )
        .unwrap();
        tokio::spawn(notifier.run())
    }

    #[tokio::test]
    async fn delivers_success_envelope() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store")).unwrap();
        let shutdown = ShutdownCoordinator::shared();
        let (hook_url, receiver) = start_receiver(vec![]).await;

        let mut job = terminal_job("job_ok", State::Success, &hook_url);
        store.save_job(&job).unwrap();
        job.queue_pending_callback(&store).unwrap();

        let handle = spawn_notifier(&store, "http://dl.example", &shutdown);
        let job = run_until_callback_terminal(&store, "job_ok", &shutdown).await;
        handle.await.unwrap();

        assert_eq!(job.callback_state, State::Success);
        assert_eq!(job.callback_count, 1);

        let received = receiver.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0],
            CallbackEnvelope {
                success: true,
                error: String::new(),
                extra: "order=7".to_string(),
                download_url: "http://dl.example/files/job_ok".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn failed_download_reports_error() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store")).unwrap();
        let shutdown = ShutdownCoordinator::shared();
        let (hook_url, receiver) = start_receiver(vec![]).await;

        let mut job = terminal_job("job_bad", State::Failed, &hook_url);
        store.save_job(&job).unwrap();
        job.queue_pending_callback(&store).unwrap();

        let handle = spawn_notifier(&store, "http://dl.example", &shutdown);
        let job = run_until_callback_terminal(&store, "job_bad", &shutdown).await;
        handle.await.unwrap();

        assert_eq!(job.callback_state, State::Success);
        let received = receiver.received.lock().unwrap();
        assert!(!received[0].success);
        assert!(received[0].error.contains("404"));
    }

    #[tokio::test]
    async fn transient_receiver_error_is_retried() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store")).unwrap();
        let shutdown = ShutdownCoordinator::shared();
        let (hook_url, receiver) =
            start_receiver(vec![StatusCode::INTERNAL_SERVER_ERROR]).await;

        let mut job = terminal_job("job_retry", State::Success, &hook_url);
        store.save_job(&job).unwrap();
        job.queue_pending_callback(&store).unwrap();

        let handle = spawn_notifier(&store, "http://dl.example", &shutdown);
        let job = run_until_callback_terminal(&store, "job_retry", &shutdown).await;
        handle.await.unwrap();

        assert_eq!(job.callback_state, State::Success);
        assert_eq!(job.callback_count, 2);
        assert_eq!(receiver.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn receiver_4xx_is_permanent() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store")).unwrap();
        let shutdown = ShutdownCoordinator::shared();
        let (hook_url, receiver) = start_receiver(vec![StatusCode::GONE]).await;

        let mut job = terminal_job("job_gone", State::Success, &hook_url);
        store.save_job(&job).unwrap();
        job.queue_pending_callback(&store).unwrap();

        let handle = spawn_notifier(&store, "http://dl.example", &shutdown);
        let job = run_until_callback_terminal(&store, "job_gone", &shutdown).await;
        handle.await.unwrap();

        assert_eq!(job.callback_state, State::Failed);
        assert_eq!(job.callback_count, 1);
        assert!(job.meta.contains("410"));
        assert!(receiver.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_mark_callback_failed() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store")).unwrap();
        let shutdown = ShutdownCoordinator::shared();
        let (hook_url, receiver) = start_receiver(vec![
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR,
        ])
        .await;

        let mut job = terminal_job("job_exhausted", State::Success, &hook_url);
        store.save_job(&job).unwrap();
        job.queue_pending_callback(&store).unwrap();

        let handle = spawn_notifier(&store, "http://dl.example", &shutdown);
        let job = run_until_callback_terminal(&store, "job_exhausted", &shutdown).await;
        handle.await.unwrap();

        assert_eq!(job.callback_state, State::Failed);
        assert_eq!(job.callback_count, 3);
        assert!(job.meta.contains("500"));
        assert!(receiver.received.lock().unwrap().is_empty());
    }

    #[test]
    fn public_url_builder_joins_cleanly() {
        let job = terminal_job("abc", State::Success, "http://cb.invalid");
        let builder = Notifier::public_url_builder("http://dl.example/");
        assert_eq!(builder(&job), "http://dl.example/files/abc");
    }
}
