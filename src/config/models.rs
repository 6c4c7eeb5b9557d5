use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub downloads: DownloadsConfig,
    #[serde(default)]
    pub callbacks: CallbacksConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Path of the fjall keyspace holding jobs, aggregations and queues.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Directory downloaded artifacts are written to, one file per job id.
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Externally visible base URL, used to build callback `download_url`s.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            store_path: default_store_path(),
            save_dir: default_save_dir(),
            public_url: default_public_url(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/store")
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("data/files")
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

/// Download side: worker pools and the per-attempt policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadsConfig {
    /// User-Agent sent when a job does not carry its own.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Client timeout for aggregations that do not specify one, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Retry budget per job for transient download failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sleep between empty queue pops.
    #[serde(default = "default_poll_backoff_ms")]
    pub poll_backoff_ms: u64,
    /// A pool terminates after this long without observing work.
    #[serde(default = "default_idle_window_ms")]
    pub idle_window_ms: u64,
    /// How often the processor rescans the store for new aggregations.
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
    /// How long shutdown waits for in-flight work before aborting.
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            default_timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            poll_backoff_ms: default_poll_backoff_ms(),
            idle_window_ms: default_idle_window_ms(),
            rescan_interval_ms: default_rescan_interval_ms(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
        }
    }
}

impl DownloadsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

fn default_user_agent() -> String {
    concat!("fetchd/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_backoff_ms() -> u64 {
    250
}

fn default_idle_window_ms() -> u64 {
    3000
}

fn default_rescan_interval_ms() -> u64 {
    1000
}

fn default_shutdown_deadline_secs() -> u64 {
    5
}

/// Callback side: the notifier pool and its retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbacksConfig {
    /// Number of notifier workers draining the callback queue.
    #[serde(default = "default_callback_concurrency")]
    pub concurrency: usize,
    /// Timeout for a single callback POST, in seconds.
    #[serde(default = "default_callback_timeout_secs")]
    pub timeout_secs: u64,
    /// Delivery attempts before a callback is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sleep between empty queue pops.
    #[serde(default = "default_poll_backoff_ms")]
    pub poll_backoff_ms: u64,
}

impl Default for CallbacksConfig {
    fn default() -> Self {
        Self {
            concurrency: default_callback_concurrency(),
            timeout_secs: default_callback_timeout_secs(),
            max_retries: default_max_retries(),
            poll_backoff_ms: default_poll_backoff_ms(),
        }
    }
}

impl CallbacksConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }
}

fn default_callback_concurrency() -> usize {
    4
}

fn default_callback_timeout_secs() -> u64 {
    5
}
