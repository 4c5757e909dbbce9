//! Bluetooth side of the connection handshake
//!
//! The phone learns about the access point and the proxy port over
//! Bluetooth. The orchestrator only needs a handful of adapter operations,
//! so they sit behind [`BluetoothService`] with a BlueZ implementation that
//! talks D-Bus and a no-op one for setups without Bluetooth.

pub mod bluez;
mod dbus;
pub mod retry;

pub use bluez::{BluezBus, BluezService};
pub use retry::{ConnectRetry, StopSignal};

use crate::config::BluetoothConfig;
use crate::error::Result;
use std::sync::Arc;

/// Adapter operations used by the orchestrator
pub trait BluetoothService: Send + Sync {
    fn power_on(&self) -> Result<()>;

    fn power_off(&self) -> Result<()>;

    /// Announce the wireless service over LE
    fn start_advertising(&self) -> Result<()>;

    fn stop_advertising(&self) -> Result<()>;

    /// Try to connect to a paired phone
    ///
    /// Returns `Ok(false)` when no phone accepted the connection.
    fn connect(&self) -> Result<bool>;

    /// Last power state set through this service
    fn is_powered(&self) -> bool;
}

/// Used when Bluetooth is disabled in configuration
#[derive(Debug, Default)]
pub struct DisabledBluetooth;

impl BluetoothService for DisabledBluetooth {
    fn power_on(&self) -> Result<()> {
        Ok(())
    }

    fn power_off(&self) -> Result<()> {
        Ok(())
    }

    fn start_advertising(&self) -> Result<()> {
        Ok(())
    }

    fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }

    fn connect(&self) -> Result<bool> {
        Ok(false)
    }

    fn is_powered(&self) -> bool {
        false
    }
}

/// Create the Bluetooth backend selected by configuration
pub fn create_service(config: &BluetoothConfig) -> Arc<dyn BluetoothService> {
    if !config.enabled {
        tracing::info!("Bluetooth disabled by configuration");
        return Arc::new(DisabledBluetooth);
    }

    match BluezService::new(config) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            tracing::warn!("Bluetooth unavailable, continuing without it: {}", e);
            Arc::new(DisabledBluetooth)
        }
    }
}
