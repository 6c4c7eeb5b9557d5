//! Single download attempt execution.
//!
//! [`perform`] runs exactly one attempt for a job through its aggregation's
//! HTTP client and drives the job's download state machine. Retry is not a
//! loop here: a transient failure requeues the job at the tail of its
//! aggregation's queue via [`Job::retry_or_fail`], and some later worker
//! iteration picks it up again.
//!
//! Outcome classification:
//! - TLS/certificate transport errors: permanent, no retry
//! - other transport errors (DNS, refused, timeout): retriable
//! - HTTP 5xx: retriable
//! - HTTP 4xx: permanent, no retry
//! - 2xx/3xx as delivered by the client: body streamed to
//!   `<save_dir>/<job.id>`; stream errors are retriable
//!
//! A terminal state (Success or Failed) always hands the job over to the
//! callback queue, strictly after the state write is persisted. Shutdown
//! mid-attempt returns without a state transition, leaving the job
//! InProgress for maintenance tooling to adjudicate.

use std::path::PathBuf;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::job::{Job, State};
use crate::shutdown::ShutdownCoordinator;
use crate::store::{Store, StoreError};

/// Per-attempt policy, shared by every pool.
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    /// Directory artifacts are written to, one file per job id.
    pub save_dir: PathBuf,
    /// User-Agent for jobs that do not carry their own.
    pub user_agent: String,
    /// Retry budget for transient failures.
    pub max_retries: u32,
}

/// What a single attempt did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal Success; callback queued.
    Success,
    /// Transient failure; job requeued for another attempt.
    Retried,
    /// Terminal Failed; callback queued.
    Failed,
    /// Shutdown interrupted the attempt; no state transition was made.
    Cancelled,
}

/// Perform one download attempt for `job`.
///
/// Store transport errors are the only hard errors; every download-side
/// failure is absorbed into the job's state machine.
pub async fn perform(
    job: &mut Job,
    store: &Store,
    client: &reqwest::Client,
    policy: &DownloadPolicy,
    shutdown: &ShutdownCoordinator,
) -> Result<Outcome, StoreError> {
    job.set_download_state(store, State::InProgress, None)?;

    let path = policy.save_dir.join(&job.id);
    let mut out = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(job_id = %job.id, %err, "Could not create output file");
            return retry_or_fail(job, store, policy, &format!("Could not create file, {err}"));
        }
    };

    let user_agent = if job.user_agent.is_empty() {
        policy.user_agent.as_str()
    } else {
        job.user_agent.as_str()
    };

    let request = client
        .get(&job.url)
        .header(reqwest::header::USER_AGENT, user_agent);

    debug!(job_id = %job.id, url = %job.url, "Starting download");

    let response = tokio::select! {
        _ = shutdown.wait_for_shutdown() => return Ok(Outcome::Cancelled),
        result = request.send() => result,
    };

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            let message = error_chain(&err);
            if looks_like_tls_failure(&message) {
                // Certificate problems won't heal on retry.
                job.set_download_state(
                    store,
                    State::Failed,
                    Some(&format!("TLS error occurred, {message}")),
                )?;
                job.queue_pending_callback(store)?;
                warn!(job_id = %job.id, %message, "Download failed on TLS error");
                return Ok(Outcome::Failed);
            }
            return retry_or_fail(job, store, policy, &message);
        }
    };

    let status = response.status();
    if status.is_server_error() {
        return retry_or_fail(
            job,
            store,
            policy,
            &format!("Received status code {status}"),
        );
    }
    if status.is_client_error() {
        job.set_download_state(
            store,
            State::Failed,
            Some(&format!("Received status code {status}")),
        )?;
        job.queue_pending_callback(store)?;
        info!(job_id = %job.id, %status, "Download failed permanently");
        return Ok(Outcome::Failed);
    }

    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = shutdown.wait_for_shutdown() => return Ok(Outcome::Cancelled),
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                if let Err(err) = out.write_all(&bytes).await {
                    return retry_or_fail(
                        job,
                        store,
                        policy,
                        &format!("Could not download file, {err}"),
                    );
                }
            }
            Some(Err(err)) => {
                return retry_or_fail(
                    job,
                    store,
                    policy,
                    &format!("Could not download file, {}", error_chain(&err)),
                );
            }
            None => break,
        }
    }

    if let Err(err) = out.flush().await {
        return retry_or_fail(job, store, policy, &format!("Could not download file, {err}"));
    }

    job.set_download_state(store, State::Success, None)?;
    job.queue_pending_callback(store)?;
    info!(job_id = %job.id, "Download succeeded");
    Ok(Outcome::Success)
}

fn retry_or_fail(
    job: &mut Job,
    store: &Store,
    policy: &DownloadPolicy,
    meta: &str,
) -> Result<Outcome, StoreError> {
    use crate::job::RetryOutcome;

    match job.retry_or_fail(store, meta, policy.max_retries)? {
        RetryOutcome::Requeued => {
            debug!(job_id = %job.id, retry = job.retry_count, meta, "Download requeued");
            Ok(Outcome::Retried)
        }
        RetryOutcome::Failed => {
            warn!(job_id = %job.id, meta, "Download retries exhausted");
            Ok(Outcome::Failed)
        }
    }
}

/// Format an error with its full source chain, so transport causes buried
/// by reqwest (DNS, TLS, io) stay visible in `Meta`.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// The transport does not expose a typed certificate error across TLS
/// backends, so classification matches the error chain text, the same
/// markers operators grep for.
fn looks_like_tls_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["tls", "ssl", "x509", "certificate"]
        .iter()
        .any(|marker| lower.contains(marker))
}
