//! Configuration handlers
//!
//! - GET  /api/config - editable settings, secrets omitted
//! - POST /api/config - partial update of the same settings

use axum::{body::Bytes, extract::State, Json};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::config::{AppConfig, ConnectionStrategy};
use crate::error::{AppError, Result};
use crate::state::AppState;

/// Settings exposed to the configuration page
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub success: bool,
    pub wifi_ssid: String,
    pub bluetooth_discoverable: bool,
    pub connection_strategy: ConnectionStrategy,
}

impl From<&AppConfig> for ConfigResponse {
    fn from(config: &AppConfig) -> Self {
        Self {
            success: true,
            wifi_ssid: config.wifi.ssid.clone(),
            bluetooth_discoverable: config.bluetooth.discoverable,
            connection_strategy: config.connection_strategy,
        }
    }
}

/// Result of a configuration update
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    pub success: bool,
    pub message: String,
    /// The running orchestrator keeps its strategy until restart
    pub restart_required: bool,
}

/// Partial update; absent fields are left unchanged
#[derive(Debug, Default, PartialEq)]
pub struct ConfigUpdate {
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub bluetooth_discoverable: Option<bool>,
    pub connection_strategy: Option<ConnectionStrategy>,
}

fn string_field(body: &Value, name: &str) -> Result<Option<String>> {
    match body.get(name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(AppError::BadRequest(format!("Invalid type for {}", name))),
    }
}

impl ConfigUpdate {
    /// Parse a request body, checking the type of each known field
    pub fn from_json(body: &Value) -> Result<Self> {
        if !body.is_object() {
            return Err(AppError::BadRequest("Expected a JSON object".into()));
        }

        let bluetooth_discoverable = match body.get("bluetoothDiscoverable") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => {
                return Err(AppError::BadRequest(
                    "Invalid type for bluetoothDiscoverable".into(),
                ))
            }
        };

        let connection_strategy = string_field(body, "connectionStrategy")?
            .map(|s| s.parse::<ConnectionStrategy>().map_err(AppError::BadRequest))
            .transpose()?;

        Ok(Self {
            wifi_ssid: string_field(body, "wifiSsid")?,
            wifi_password: string_field(body, "wifiPassword")?,
            bluetooth_discoverable,
            connection_strategy,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ssid) = &self.wifi_ssid {
            if ssid.is_empty() || ssid.len() > 32 {
                return Err(AppError::BadRequest(
                    "Invalid wifiSsid: must be 1-32 bytes".into(),
                ));
            }
        }
        if let Some(password) = &self.wifi_password {
            if !(8..=63).contains(&password.len()) {
                return Err(AppError::BadRequest(
                    "Invalid wifiPassword: must be 8-63 characters".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(ssid) = &self.wifi_ssid {
            config.wifi.ssid = ssid.clone();
        }
        if let Some(password) = &self.wifi_password {
            config.wifi.password = password.clone();
        }
        if let Some(discoverable) = self.bluetooth_discoverable {
            config.bluetooth.discoverable = discoverable;
        }
        if let Some(strategy) = self.connection_strategy {
            config.connection_strategy = strategy;
        }
    }
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    Json(ConfigResponse::from(state.config.get().as_ref()))
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<UpdateResponse>> {
    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;
    let update = ConfigUpdate::from_json(&body)?;
    update.validate()?;

    state.config.update(|config| update.apply_to(config)).await?;
    tracing::info!("Configuration updated from web interface");

    let restart_required = state.config.connection_strategy() != state.status.strategy();
    Ok(Json(UpdateResponse {
        success: true,
        message: "Configuration saved".to_string(),
        restart_required,
    }))
}
