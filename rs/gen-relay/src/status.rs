//! `GET /api/status` (unauthenticated summary) and `GET /api/metrics`
//! (detailed, secret-gated) handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.metrics.snapshot();
    Json(serde_json::json!({
        "product_name": state.product_name,
        "maintenance_mode": state.maintenance_mode,
        "endpoints_active": state.api.endpoints.active_count(),
        "endpoints_total": state.api.endpoints.len(),
        "metrics": snapshot,
    }))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    key: Option<String>,
}

pub async fn metrics(State(state): State<Arc<AppState>>, Query(query): Query<MetricsQuery>, headers: HeaderMap) -> impl IntoResponse {
    let Some(secret) = state.secret_token.as_deref() else {
        return (StatusCode::FORBIDDEN, Json(serde_json::json!({ "error": "metrics endpoint is not configured" }))).into_response();
    };

    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or(query.key);

    let authorized = match provided {
        Some(provided) => bool::from(provided.as_bytes().ct_eq(secret.as_bytes())),
        None => false,
    };

    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "invalid or missing key" }))).into_response();
    }

    let detail = state.metrics.detailed_snapshot();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "product_name": state.product_name,
            "maintenance_mode": state.maintenance_mode,
            "endpoints": state.api.endpoints.status().into_iter().map(|e| serde_json::json!({
                "id": e.id,
                "url": e.url,
                "busy": e.busy,
                "error_count": e.error_count,
                "seconds_until_free": e.seconds_until_free,
            })).collect::<Vec<_>>(),
            "metrics": detail,
        })),
    )
        .into_response()
}
