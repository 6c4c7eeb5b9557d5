//! Request/response models for the ingestion and status endpoints.
//!
//! A submission is one job plus the configuration of the aggregation it
//! belongs to, as JSON:
//!
//! ```json
//! {
//!   "aggr_id": "shop",
//!   "aggr_limit": 8,
//!   "aggr_proxy": "http://proxy.internal:3128",
//!   "aggr_timeout": 20,
//!   "url": "https://origin.example/asset.bin",
//!   "callback_url": "https://shop.example/hooks/downloads",
//!   "extra": "order=1234",
//!   "user_agent": "shop-agent/2.0"
//! }
//! ```
//!
//! `aggr_id`, `aggr_limit`, `url` and `callback_url` are required; the rest
//! are optional. Submissions are validated field by field before anything
//! is persisted — see [`crate::job::Submission`] for the exact rules.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobAcceptedResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
}
