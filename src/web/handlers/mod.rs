pub mod config;

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::config::{ConnectionStrategy, WifiInfo};
use crate::orchestrator::StatusSnapshot;
use crate::otg::GadgetState;
use crate::proxy::ProxyStatsSnapshot;
use crate::state::AppState;

// ============================================================================
// Health & Status
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Gateway status response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub version: &'static str,
    pub build_date: &'static str,
    /// Strategy the running orchestrator uses
    pub connection_strategy: ConnectionStrategy,
    /// Strategy in the stored config, applied on restart
    pub configured_strategy: ConnectionStrategy,
    pub gadget_state: GadgetState,
    pub udc: Option<String>,
    pub bluetooth_powered: bool,
    pub wifi_ssid: String,
    pub wifi_ip_address: String,
    pub proxy_port: u16,
    pub orchestrator: StatusSnapshot,
    pub proxy: ProxyStatsSnapshot,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let WifiInfo {
        ssid,
        ip_address,
        port,
        ..
    } = state.config.wifi_info();

    Json(StatusResponse {
        success: true,
        version: env!("CARGO_PKG_VERSION"),
        build_date: env!("BUILD_DATE"),
        connection_strategy: state.status.strategy(),
        configured_strategy: state.config.connection_strategy(),
        gadget_state: state.gadgets.state(),
        udc: state.gadgets.udc().map(str::to_string),
        bluetooth_powered: state.bluetooth.is_powered(),
        wifi_ssid: ssid,
        wifi_ip_address: ip_address,
        proxy_port: port,
        orchestrator: state.status.snapshot(),
        proxy: state.stats.snapshot(),
    })
}
