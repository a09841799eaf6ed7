//! Transport-free read API.
//!
//! Each handler returns an [`ApiResponse`] envelope; the host maps them to
//! its own routes:
//! - `get_chain`: `GET chain/{chainId}`
//! - `get_statistics`: `GET statistics`
//! - `get_pending`: `GET pending`
//! - `restart_chain`: `POST chain/{chainId}/restart`
//! - `list_chains`: `GET chains`

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::chain::{
    ChainListResponse, ChainQueryParams, ChainStatistics, ChainView, PendingStageView,
};
use crate::tracker::ChainTracker;

/// Response wrapper for API calls.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Body of a restart request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    pub stage_name: String,
}

pub fn get_chain(tracker: &ChainTracker, chain_id: &str) -> ApiResponse<ChainView> {
    match tracker.read_model().get_chain(chain_id) {
        Ok(view) => ApiResponse::ok(view),
        Err(e) => ApiResponse::err(format!("Failed to load chain: {}", e)),
    }
}

pub fn get_statistics(tracker: &ChainTracker) -> ApiResponse<ChainStatistics> {
    match tracker.read_model().get_statistics() {
        Ok(stats) => ApiResponse::ok(stats),
        Err(e) => ApiResponse::err(format!("Failed to compute statistics: {}", e)),
    }
}

pub fn get_pending(
    tracker: &ChainTracker,
) -> ApiResponse<BTreeMap<String, Vec<PendingStageView>>> {
    match tracker.read_model().pending_grouped() {
        Ok(groups) => ApiResponse::ok(groups),
        Err(e) => ApiResponse::err(format!("Failed to inspect pending stages: {}", e)),
    }
}

pub fn restart_chain(
    tracker: &ChainTracker,
    chain_id: &str,
    request: &RestartRequest,
) -> ApiResponse<ChainView> {
    match tracker
        .read_model()
        .restart_stage(chain_id, &request.stage_name, Utc::now())
    {
        Ok(view) => ApiResponse::ok(view),
        Err(e) => {
            log::warn!("Restart of chain {} rejected: {}", chain_id, e);
            ApiResponse::err(format!("Failed to restart stage: {}", e))
        }
    }
}

pub fn list_chains(
    tracker: &ChainTracker,
    params: &ChainQueryParams,
) -> ApiResponse<ChainListResponse> {
    match tracker.read_model().list_chains(params) {
        Ok(list) => ApiResponse::ok(list),
        Err(e) => ApiResponse::err(format!("Failed to list chains: {}", e)),
    }
}
