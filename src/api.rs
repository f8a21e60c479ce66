use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::setup_core::{DetectOptions, Setup};
use crate::types::AppState;

/// Response for setups list
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupsResponse {
    pub setups: Vec<Setup>,
    pub count: usize,
    pub generated_at: DateTime<Utc>,
}

/// Query params for setup endpoints
#[derive(Debug, Default, Deserialize)]
pub struct SetupsQueryParams {
    /// Skip the result cache and refetch every collaborator
    pub force: Option<bool>,
}

impl SetupsQueryParams {
    fn options(&self) -> DetectOptions {
        DetectOptions { force_refresh: self.force.unwrap_or(false), ..Default::default() }
    }
}

/// GET /api/setups - Current setups in display order
pub async fn get_setups(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SetupsQueryParams>,
) -> impl IntoResponse {
    match state.engine.detect_active_setups(params.options()).await {
        Ok(setups) => (
            StatusCode::OK,
            Json(serde_json::json!(SetupsResponse {
                count: setups.len(),
                setups,
                generated_at: Utc::now(),
            })),
        ),
        Err(e) => {
            warn!("Setup detection failed: {:#}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": format!("{:#}", e)})),
            )
        }
    }
}

/// GET /api/setups/{id} - One setup by stable id
pub async fn get_setup_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<SetupsQueryParams>,
) -> impl IntoResponse {
    match state.engine.setup_by_id(&id, params.options()).await {
        Ok(Some(setup)) => (StatusCode::OK, Json(serde_json::json!(setup))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("Setup {} not found", id)})),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": format!("{:#}", e)})),
        ),
    }
}
