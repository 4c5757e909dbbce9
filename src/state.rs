use std::sync::Arc;

use crate::auth::DigestAuth;
use crate::bluetooth::BluetoothService;
use crate::config::ConfigStore;
use crate::orchestrator::RuntimeStatus;
use crate::otg::GadgetController;
use crate::proxy::ProxyStats;

/// Application-wide state shared across handlers
///
/// The orchestrator thread owns the session lifecycle; handlers only read
/// its progress through `status` and `stats` and edit the persisted config.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// USB gadget controller
    pub gadgets: Arc<GadgetController>,
    /// Bluetooth backend
    pub bluetooth: Arc<dyn BluetoothService>,
    /// Orchestrator progress
    pub status: Arc<RuntimeStatus>,
    /// Relay counters
    pub stats: Arc<ProxyStats>,
    /// Web credentials, `None` when authentication is off
    pub auth: Option<Arc<DigestAuth>>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ConfigStore,
        gadgets: Arc<GadgetController>,
        bluetooth: Arc<dyn BluetoothService>,
        status: Arc<RuntimeStatus>,
        stats: Arc<ProxyStats>,
        auth: Option<Arc<DigestAuth>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            gadgets,
            bluetooth,
            status,
            stats,
            auth,
        })
    }
}
