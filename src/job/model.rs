use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::submission::ValidationError;
use crate::store::{Store, StoreError};

/// Client timeout applied to aggregations that do not specify one, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Download and callback state. Both state machines share the same values:
/// Pending -> InProgress -> {Success, Failed}, where a retry re-enters
/// Pending. Success and Failed are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    #[default]
    Pending,
    InProgress,
    Success,
    Failed,
}

impl State {
    /// Whether this state never transitions away.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Success | State::Failed)
    }
}

/// A user request for downloading a resource.
///
/// The core entity of the service; holds all info and state of the download
/// and of the result callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Auto-generated, also the artifact's filename under the save directory.
    pub id: String,

    /// The URL pointing to the resource to be downloaded.
    pub url: String,

    /// ID of the aggregation the job belongs to.
    pub aggr_id: String,

    #[serde(default)]
    pub download_state: State,

    /// How many times the download was retried.
    #[serde(default)]
    pub retry_count: u32,

    /// Auxiliary ad-hoc information. Typically carries the last error back
    /// to the user through the callback envelope.
    #[serde(default)]
    pub meta: String,

    /// Where the result envelope is POSTed once the download is terminal.
    pub callback_url: String,

    /// How many delivery attempts the callback has consumed.
    #[serde(default)]
    pub callback_count: u32,

    #[serde(default)]
    pub callback_state: State,

    /// Opaque payload echoed back verbatim in the callback envelope.
    #[serde(default)]
    pub extra: String,

    /// Per-job User-Agent; empty means the service-wide default.
    #[serde(default)]
    pub user_agent: String,
}

impl Job {
    /// Update the download state (and optionally `meta`) and save.
    pub fn set_download_state(
        &mut self,
        store: &Store,
        state: State,
        meta: Option<&str>,
    ) -> Result<(), StoreError> {
        self.download_state = state;
        if let Some(meta) = meta {
            self.meta = meta.to_string();
        }
        store.save_job(self)
    }

    /// Update the callback state (and optionally `meta`) and save.
    pub fn set_callback_state(
        &mut self,
        store: &Store,
        state: State,
        meta: Option<&str>,
    ) -> Result<(), StoreError> {
        self.callback_state = state;
        if let Some(meta) = meta {
            self.meta = meta.to_string();
        }
        store.save_job(self)
    }

    /// Set the download state to Pending, save, and append the job to its
    /// aggregation's pending-download queue.
    pub fn queue_pending_download(&mut self, store: &Store) -> Result<(), StoreError> {
        self.download_state = State::Pending;
        store.save_job(self)?;
        store.enqueue_pending(&self.aggr_id, &self.id)
    }

    /// Set the callback state to Pending, save, and append the job to the
    /// global callback queue. The download state must already be terminal
    /// and persisted when this is called; the enqueue happens strictly
    /// after that write.
    pub fn queue_pending_callback(&mut self, store: &Store) -> Result<(), StoreError> {
        self.callback_state = State::Pending;
        store.save_job(self)?;
        store.enqueue_callback(&self.id)
    }

    /// Retry the download if the retry budget allows, otherwise mark it
    /// Failed with `meta` and hand the job over to the callback queue.
    ///
    /// A retried job loses its queue position and re-enters at the tail.
    pub fn retry_or_fail(
        &mut self,
        store: &Store,
        meta: &str,
        max_retries: u32,
    ) -> Result<RetryOutcome, StoreError> {
        if self.retry_count < max_retries {
            self.retry_count += 1;
            self.queue_pending_download(store)?;
            Ok(RetryOutcome::Requeued)
        } else {
            self.set_download_state(store, State::Failed, Some(meta))?;
            self.queue_pending_callback(store)?;
            Ok(RetryOutcome::Failed)
        }
    }
}

/// What [`Job::retry_or_fail`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Requeued,
    Failed,
}

/// The concept through which the rate limit rules are defined and enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub id: String,

    /// Maximum number of concurrent download requests.
    pub limit: u32,

    /// Proxy URL for the aggregation's HTTP client; empty means none.
    #[serde(default)]
    pub proxy: String,

    /// Client timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Aggregation {
    /// Create an aggregation, validating the invariants: non-empty id,
    /// strictly positive limit and timeout, proxy absent or an absolute URL.
    pub fn new(
        id: impl Into<String>,
        limit: u32,
        proxy: impl Into<String>,
        timeout_secs: Option<u64>,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        let proxy = proxy.into();

        if id.is_empty() {
            return Err(ValidationError::EmptyAggrId);
        }
        if limit == 0 {
            return Err(ValidationError::NonPositiveLimit);
        }
        if !proxy.is_empty() && url::Url::parse(&proxy).is_err() {
            return Err(ValidationError::InvalidProxy);
        }
        let timeout_secs = timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ValidationError::NonPositiveTimeout);
        }

        Ok(Self {
            id,
            limit,
            proxy,
            timeout_secs,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Proxy URL, if one is configured.
    pub fn proxy_url(&self) -> Option<&str> {
        if self.proxy.is_empty() {
            None
        } else {
            Some(self.proxy.as_str())
        }
    }
}
