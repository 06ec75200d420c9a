//! Root and health handlers.

use axum::{Json, extract::State};
use log::warn;
use serde_json::json;

use super::super::state::AppState;
use crate::session::HealthInfo;

/// GET /
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": "claude-broker",
        "version": crate::VERSION,
        "health": "/health",
    }))
}

/// GET /health — always 200; a failing store degrades the payload instead
/// of failing the probe.
pub async fn health(State(state): State<AppState>) -> Json<HealthInfo> {
    let manager = &state.sessions;

    let (status, active_sessions) = match manager.store().count_active().await {
        Ok(count) => ("ok", count),
        Err(err) => {
            warn!("health: storage unreachable: {err}");
            ("degraded", 0)
        }
    };

    Json(HealthInfo {
        status: status.to_string(),
        version: crate::VERSION.to_string(),
        active_sessions,
        live_clients: manager.live_count().await as u64,
        storage_type: manager.store().backend_name().to_string(),
        uptime_seconds: manager.uptime_seconds(),
        rss_mb: manager.fleet_rss_bytes().await / (1024 * 1024),
    })
}
