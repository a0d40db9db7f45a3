//! Operator control plane
//!
//! Local HTTP endpoints used to show pairing details, list connected devices,
//! rotate the pairing token and revoke devices.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{ConnectedDevice, PairingToken};

/// Create the control router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/connection-info", get(connection_info))
        .route("/devices", get(list_devices))
        .route("/devices/:device_id", delete(revoke_device))
        .route("/status", get(status))
        .route("/token/rotate", post(rotate_token))
}

/// Everything a joining device needs, plus the same fields packed into one
/// string for rendering as a QR code
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub address: String,
    pub port: u16,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub pairing_code: String,
}

impl ConnectionInfo {
    fn new(state: &AppState, token: PairingToken) -> Self {
        let address = state.advertised_host().to_string();
        let port = state.config().sync.port;
        let pairing_code = json!({
            "address": address,
            "port": port,
            "token": token.value,
            "expiresAt": token.expires_at,
        })
        .to_string();

        Self {
            address,
            port,
            token: token.value,
            expires_at: token.expires_at,
            pairing_code,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub running: bool,
    pub sync_port: u16,
    pub connected_devices: usize,
    pub paired_devices: i64,
    pub token_valid: bool,
    pub token_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}

/// Current pairing details. An expired token is rotated before it is shown.
async fn connection_info(State(state): State<AppState>) -> Json<ConnectionInfo> {
    let token = state.tokens().current_snapshot();
    Json(ConnectionInfo::new(&state, token))
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<ConnectedDevice>>> {
    let devices = state.registry().list().await?;
    Ok(Json(devices))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>> {
    let token = state.tokens().peek();
    let paired_devices = state.registry().paired_count().await?;

    Ok(Json(StatusResponse {
        running: true,
        sync_port: state.config().sync.port,
        connected_devices: state.registry().live_count(),
        paired_devices,
        token_valid: token.is_valid_at(Utc::now()),
        token_expires_at: token.expires_at,
    }))
}

/// Invalidate the current pairing token immediately
async fn rotate_token(State(state): State<AppState>) -> Json<ConnectionInfo> {
    let token = state.tokens().rotate();
    Json(ConnectionInfo::new(&state, token))
}

async fn revoke_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<(StatusCode, Json<RevokeResponse>)> {
    if state.registry().revoke(&device_id).await? {
        Ok((StatusCode::OK, Json(RevokeResponse { revoked: true })))
    } else {
        Err(AppError::NotFound("Device not paired".to_string()))
    }
}
