//! Process-local metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics handle for recording counters.
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_accepted: AtomicU64,
    downloads_succeeded: AtomicU64,
    downloads_failed: AtomicU64,
    downloads_retried: AtomicU64,
    callbacks_delivered: AtomicU64,
    callbacks_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_accepted(&self) {
        self.jobs_accepted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_accepted", "Metric incremented");
    }

    pub fn download_succeeded(&self) {
        self.downloads_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "downloads_succeeded", "Metric incremented");
    }

    pub fn download_failed(&self) {
        self.downloads_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "downloads_failed", "Metric incremented");
    }

    pub fn download_retried(&self) {
        self.downloads_retried.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "downloads_retried", "Metric incremented");
    }

    pub fn callback_delivered(&self) {
        self.callbacks_delivered.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "callbacks_delivered", "Metric incremented");
    }

    pub fn callback_failed(&self) {
        self.callbacks_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "callbacks_failed", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_accepted: self.jobs_accepted.load(Ordering::Relaxed),
            downloads_succeeded: self.downloads_succeeded.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            downloads_retried: self.downloads_retried.load(Ordering::Relaxed),
            callbacks_delivered: self.callbacks_delivered.load(Ordering::Relaxed),
            callbacks_failed: self.callbacks_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_accepted: u64,
    pub downloads_succeeded: u64,
    pub downloads_failed: u64,
    pub downloads_retried: u64,
    pub callbacks_delivered: u64,
    pub callbacks_failed: u64,
}
