//! Scheduler: discovers active aggregations and supervises their pools.
//!
//! The processor never pops queues itself; it only owns lifetimes. It finds
//! aggregations with pending work (startup scan, periodic rescan, and a kick
//! channel fed by the ingestion endpoint), builds each one's HTTP client
//! (proxy + timeout identity), spawns its worker pool, reaps pools that
//! idle out, and on shutdown waits for in-flight work under a deadline
//! before aborting stragglers.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::downloader::DownloadPolicy;
use crate::job::Aggregation;
use crate::observability::Metrics;
use crate::pool::{AggregationPool, PoolTiming};
use crate::shutdown::SharedShutdown;
use crate::store::Store;

/// Sender half of the processor's kick channel. The ingestion endpoint
/// pushes an aggregation id here after enqueuing a job so the pool spawns
/// without waiting for the next rescan.
pub type ProcessorKick = mpsc::Sender<String>;

pub struct Processor {
    store: Store,
    config: Arc<Config>,
    policy: Arc<DownloadPolicy>,
    metrics: Arc<Metrics>,
    shutdown: SharedShutdown,
    kick_rx: mpsc::Receiver<String>,
    pools: HashMap<String, JoinHandle<()>>,
}

impl Processor {
    /// Create a processor and the kick sender the ingestion side uses.
    pub fn new(
        store: Store,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
        shutdown: SharedShutdown,
    ) -> (Self, ProcessorKick) {
        let (kick_tx, kick_rx) = mpsc::channel(64);
        let policy = Arc::new(DownloadPolicy {
            save_dir: config.server.save_dir.clone(),
            user_agent: config.downloads.user_agent.clone(),
            max_retries: config.downloads.max_retries,
        });

        let processor = Self {
            store,
            config,
            policy,
            metrics,
            shutdown,
            kick_rx,
            pools: HashMap::new(),
        };
        (processor, kick_tx)
    }

    /// Run until shutdown: scan, spawn, reap.
    pub async fn run(mut self) {
        info!("Processor starting");

        let mut rescan = tokio::time::interval(self.config.downloads.rescan_interval());
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait_for_shutdown() => break,
                _ = rescan.tick() => {
                    self.reap_finished();
                    match self.store.pending_aggregations() {
                        Ok(ids) => {
                            for aggr_id in ids {
                                self.ensure_pool(&aggr_id);
                            }
                        }
                        Err(err) => warn!(%err, "Aggregation discovery scan failed"),
                    }
                }
                Some(aggr_id) = self.kick_rx.recv() => {
                    self.reap_finished();
                    self.ensure_pool(&aggr_id);
                }
            }
        }

        self.drain().await;
    }

    /// Spawn a pool for the aggregation unless a live one already exists.
    ///
    /// The aggregation record is loaded fresh on every spawn, so a pool
    /// restart picks up a reconfigured limit, proxy, or timeout.
    fn ensure_pool(&mut self, aggr_id: &str) {
        if self.shutdown.is_shutdown_requested() {
            return;
        }
        if let Some(handle) = self.pools.get(aggr_id) {
            if !handle.is_finished() {
                return;
            }
        }

        let aggregation = match self.store.get_aggregation(aggr_id) {
            Ok(Some(aggregation)) => aggregation,
            Ok(None) => {
                // Queued work outlives its aggregation record; drain it
                // conservatively until a submission reconfigures it.
                warn!(aggr_id, "Pending queue without aggregation record, using defaults");
                Aggregation {
                    id: aggr_id.to_string(),
                    limit: 1,
                    proxy: String::new(),
                    timeout_secs: self.config.downloads.default_timeout_secs,
                }
            }
            Err(err) => {
                warn!(aggr_id, %err, "Could not load aggregation");
                return;
            }
        };

        let client = match self.http_client(&aggregation) {
            Ok(client) => client,
            Err(err) => {
                warn!(aggr_id, %err, "Could not build HTTP client for aggregation");
                return;
            }
        };

        let pool = AggregationPool::new(
            aggregation,
            client,
            self.store.clone(),
            self.policy.clone(),
            PoolTiming {
                poll_backoff: self.config.downloads.poll_backoff(),
                idle_window: self.config.downloads.idle_window(),
            },
            self.metrics.clone(),
            self.shutdown.clone(),
        );

        debug!(aggr_id, "Spawning aggregation pool");
        self.pools
            .insert(aggr_id.to_string(), tokio::spawn(pool.run()));
    }

    /// Build the aggregation-scoped HTTP client (proxy + timeout).
    fn http_client(&self, aggregation: &Aggregation) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(aggregation.timeout())
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy_url) = aggregation.proxy_url() {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        builder.build()
    }

    fn reap_finished(&mut self) {
        self.pools.retain(|aggr_id, handle| {
            if handle.is_finished() {
                debug!(%aggr_id, "Reaped idle pool");
                false
            } else {
                true
            }
        });
    }

    /// Wait for live pools to reach a safe checkpoint, bounded by the
    /// shutdown deadline; abort whatever is still running after it.
    async fn drain(&mut self) {
        let deadline = self.config.downloads.shutdown_deadline();
        info!(?deadline, pools = self.pools.len(), "Processor shutting down");

        let handles: Vec<_> = self.pools.drain().map(|(_, handle)| handle).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(deadline, join_all(handles))
            .await
            .is_err()
        {
            warn!("Shutdown deadline exceeded, aborting remaining pools");
            for abort in aborts {
                abort.abort();
            }
        }

        if let Err(err) = self.store.persist() {
            warn!(%err, "Could not fsync store on shutdown");
        }
        info!("Processor stopped");
    }
}
