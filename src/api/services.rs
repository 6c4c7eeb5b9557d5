use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use http_body_util::BodyExt;
use uuid::Uuid;

use super::{models::JobAcceptedResponse, state::AppState};
use crate::api::ApiError;
use crate::job::Submission;

/// Submissions are a handful of URLs and strings; anything bigger is noise.
const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Job ingestion endpoint (POST /jobs)
///
/// ## Flow:
/// 1. Validate Content-Type (application/json, charset parameter allowed)
/// 2. Read the body, enforce the size limit
/// 3. Validate the submission field by field (types, URLs, bounds); any
///    violation is a 400 and nothing is persisted
/// 4. Create or update the aggregation record named by `aggr_id`
/// 5. Create the job (UUIDv7 id) and push it onto the aggregation's
///    pending-download queue
/// 6. Kick the processor so the pool spawns without waiting for a rescan
/// 7. Return 201 Created with the job id
///
/// Resubmitting an `aggr_id` with a different limit, proxy, or timeout
/// reconfigures the aggregation; already queued jobs are preserved and pick
/// up the new settings when their pool next starts.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    super::utils::require_json_content_type(&headers)?;

    let body_bytes = read_body(body).await?;
    let value: serde_json::Value = serde_json::from_slice(&body_bytes)?;
    let submission = Submission::parse(&value)?;

    // The aggregation record is upserted on every submission; this is how
    // limits, proxies and timeouts are (re)configured.
    state
        .store
        .save_aggregation(&submission.aggregation)
        .map_err(|e| ApiError::Internal(format!("Failed to save aggregation: {e}")))?;

    let job_id = Uuid::now_v7().to_string();
    let mut job = submission.job(job_id.clone());
    job.queue_pending_download(&state.store)
        .map_err(|e| ApiError::Internal(format!("Failed to enqueue job: {e}")))?;

    // Losing the kick is harmless: the rescan interval picks the queue up.
    let _ = state.kick.try_send(submission.aggregation.id.clone());

    state.metrics.job_accepted();
    tracing::info!(%job_id, aggr_id = %submission.aggregation.id, "Job accepted");

    Ok((
        axum::http::StatusCode::CREATED,
        Json(JobAcceptedResponse { id: job_id }),
    ))
}

/// Job status endpoint (GET /jobs/{job_id})
///
/// Returns the stored job record: both state machines, the retry counters,
/// and `meta` (the last error, if any).
pub async fn get_job(
    State(state): State<AppState>,
    axum::extract::Path(job_id): axum::extract::Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .store
        .get_job(&job_id)
        .map_err(|e| ApiError::Internal(format!("Failed to get job: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    Ok((axum::http::StatusCode::OK, Json(job)))
}

/// Health check endpoint (GET /health)
///
/// Returns 503 Service Unavailable if the store is unreachable, 200 OK
/// otherwise.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    use std::collections::HashMap;

    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());

    let store_status = match state.store.health_check() {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };
    components.insert("store".to_string(), store_status.to_string());

    // The processor is woken through the kick channel; a closed channel
    // means it is gone.
    let processor_status = if state.kick.is_closed() {
        "unhealthy"
    } else {
        "healthy"
    };
    components.insert("processor".to_string(), processor_status.to_string());

    let all_healthy = components.values().all(|status| status == "healthy");
    let status_code = if all_healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    let response = super::models::HealthResponse {
        status: if all_healthy { "healthy" } else { "unhealthy" }.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}

/// Reads request body and validates size
///
/// Decompression is handled transparently by RequestDecompressionLayer
/// middleware, so this receives already-decompressed data.
async fn read_body(body: axum::body::Body) -> Result<Vec<u8>, ApiError> {
    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .to_bytes()
        .to_vec();

    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(ApiError::PayloadTooLarge(data.len()));
    }

    Ok(data)
}
