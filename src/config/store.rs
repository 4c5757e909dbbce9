use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{AppConfig, ConnectionStrategy, WifiInfo};
use crate::error::{AppError, Result};
use crate::utils::interface_mac_address;

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads, so the orchestrator thread can read
/// the current configuration without touching the async runtime.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the store, writing defaults when the file does not exist yet
    pub async fn new(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let config = Self::load_config(path).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache,
            change_tx,
        })
    }

    /// Build a store around an in-memory configuration that is persisted to `path` on change
    pub fn with_config(path: &Path, config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    async fn load_config(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No configuration at {}, writing defaults", path.display());
                let config = AppConfig::default();
                Self::save_config(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temporary file so a crash never leaves a torn config
    async fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the cached configuration without persisting it
    ///
    /// Used for environment and command line overrides.
    pub fn override_with<F>(&self, f: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        self.cache.store(Arc::new(config));
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; the last concurrent writer wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        // Persist first, then swap the cache
        Self::save_config(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    /// Wi-Fi credentials and proxy endpoint for the phone
    pub fn wifi_info(&self) -> WifiInfo {
        let config = self.get();
        let bssid = if config.wifi.bssid.is_empty() {
            interface_mac_address(&config.wifi.interface).unwrap_or_else(|| {
                tracing::warn!(
                    "Could not read MAC address of {}, advertising an empty BSSID",
                    config.wifi.interface
                );
                "00:00:00:00:00:00".to_string()
            })
        } else {
            config.wifi.bssid.clone()
        };

        WifiInfo {
            ssid: config.wifi.ssid.clone(),
            key: config.wifi.password.clone(),
            bssid,
            security_mode: config.wifi.security_mode,
            access_point_type: config.wifi.access_point_type,
            ip_address: config.wifi.ip_address.clone(),
            port: config.proxy.port,
        }
    }

    /// Connection strategy currently configured
    pub fn connection_strategy(&self) -> ConnectionStrategy {
        self.get().connection_strategy
    }
}

/// Apply `AAWG_*` environment overrides on top of a loaded configuration
pub fn apply_env_overrides(config: &mut AppConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(ssid) = lookup("AAWG_WIFI_SSID") {
        config.wifi.ssid = ssid;
    }
    if let Some(password) = lookup("AAWG_WIFI_PASSWORD") {
        config.wifi.password = password;
    }
    if let Some(bssid) = lookup("AAWG_WIFI_BSSID") {
        config.wifi.bssid = bssid;
    }
    if let Some(ip) = lookup("AAWG_PROXY_IP_ADDRESS") {
        config.wifi.ip_address = ip;
    }
    if let Some(port) = lookup("AAWG_PROXY_PORT") {
        match port.trim().parse() {
            Ok(port) => config.proxy.port = port,
            Err(_) => tracing::warn!("Ignoring invalid AAWG_PROXY_PORT: {}", port),
        }
    }
    if let Some(strategy) = lookup("AAWG_CONNECTION_STRATEGY") {
        match strategy.parse() {
            Ok(strategy) => config.connection_strategy = strategy,
            Err(e) => tracing::warn!("Ignoring AAWG_CONNECTION_STRATEGY: {}", e),
        }
    }
}
