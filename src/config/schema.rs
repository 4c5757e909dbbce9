use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::otg::configfs::{CONFIGFS_PATH, UDC_CLASS_PATH};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Wi-Fi access point settings handed to the phone
    pub wifi: WifiConfig,
    /// TCP proxy settings
    pub proxy: ProxyConfig,
    /// USB gadget settings
    pub usb: UsbConfig,
    /// Bluetooth settings
    pub bluetooth: BluetoothConfig,
    /// Which transport is awaited first each cycle
    pub connection_strategy: ConnectionStrategy,
    /// Web configuration server settings
    pub web: WebConfig,
}

/// Connection strategy used by every orchestrator cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStrategy {
    /// Bluetooth stays powered and advertising across cycles
    DongleMode,
    /// Bluetooth is powered per cycle and retries connecting to the phone
    #[default]
    PhoneFirst,
    /// The head unit's USB accessory negotiation gates the cycle
    UsbFirst,
}

impl ConnectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DongleMode => "DONGLE_MODE",
            Self::PhoneFirst => "PHONE_FIRST",
            Self::UsbFirst => "USB_FIRST",
        }
    }
}

impl fmt::Display for ConnectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DONGLE_MODE" | "DONGLE" => Ok(Self::DongleMode),
            "PHONE_FIRST" | "PHONE" => Ok(Self::PhoneFirst),
            "USB_FIRST" | "USB" => Ok(Self::UsbFirst),
            other => Err(format!("Unknown connection strategy: {}", other)),
        }
    }
}

/// Wi-Fi security mode advertised to the phone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityMode {
    Unknown,
    Open,
    Wep64,
    Wep128,
    WpaPersonal,
    #[default]
    Wpa2Personal,
    Wpa3Personal,
}

/// Wi-Fi access point type advertised to the phone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessPointType {
    Static,
    #[default]
    Dynamic,
}

/// Wi-Fi configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WifiConfig {
    /// Network name
    pub ssid: String,
    /// Pre-shared key
    pub password: String,
    /// Access point BSSID; empty means read it from `interface`
    pub bssid: String,
    /// Wireless interface used to look up the BSSID
    pub interface: String,
    pub security_mode: SecurityMode,
    pub access_point_type: AccessPointType,
    /// Address the phone connects to for the proxy
    pub ip_address: String,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: "AAWirelessDongle".to_string(),
            password: "ConnectAAWirelessDongle".to_string(),
            bssid: String::new(),
            interface: "wlan0".to_string(),
            security_mode: SecurityMode::default(),
            access_point_type: AccessPointType::default(),
            ip_address: "10.0.0.1".to_string(),
        }
    }
}

/// TCP proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address (IPv4)
    pub bind_address: String,
    /// Listen port
    pub port: u16,
    /// Answer the head unit's version request before relaying
    pub version_exchange: bool,
    /// Protocol version reported to the head unit
    pub version_major: u16,
    pub version_minor: u16,
    /// Pause between cycles in milliseconds
    pub reconnect_delay_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5288,
            version_exchange: true,
            version_major: 1,
            version_minor: 7,
            reconnect_delay_ms: 2000,
        }
    }
}

/// USB gadget configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UsbConfig {
    /// ConfigFS gadget root
    pub configfs_path: String,
    /// Sysfs UDC class directory
    pub udc_class_path: String,
    /// Accessory data node
    pub accessory_device: String,
    /// Gadget presented until the head unit asks for accessory mode
    pub default_gadget: String,
    /// Android accessory gadget
    pub accessory_gadget: String,
    /// Delay between unbinding `default` and binding `accessory`
    pub settle_delay_ms: u64,
    /// Accessory wait before the listener starts (USB_FIRST); 0 waits forever
    pub usb_first_wait_secs: u64,
    /// Accessory wait after a phone connects (other strategies); 0 waits forever
    pub accessory_wait_secs: u64,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            configfs_path: CONFIGFS_PATH.to_string(),
            udc_class_path: UDC_CLASS_PATH.to_string(),
            accessory_device: "/dev/usb_accessory".to_string(),
            default_gadget: "default".to_string(),
            accessory_gadget: "accessory".to_string(),
            settle_delay_ms: 100,
            usb_first_wait_secs: 30,
            accessory_wait_secs: 0,
        }
    }
}

/// Bluetooth configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Drive the Bluetooth adapter at all
    pub enabled: bool,
    /// Adapter alias shown to phones
    pub alias: String,
    /// Interval between connection attempts
    pub connect_retry_secs: u64,
    /// Keep the adapter discoverable and pairable while powered
    pub discoverable: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alias: "AA Wireless Dongle".to_string(),
            connect_retry_secs: 20,
            discoverable: true,
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    /// Static files served for paths outside `/api`
    pub document_root: String,
    /// Require Digest authentication
    pub auth_enabled: bool,
    /// htdigest-style credentials file, created with the default account if missing
    pub auth_file: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: 80,
            document_root: "/usr/share/aawg/www".to_string(),
            auth_enabled: true,
            auth_file: "/tmp/aawg.htdigest".to_string(),
        }
    }
}

/// Wi-Fi credentials and proxy endpoint handed to the phone over Bluetooth
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiInfo {
    pub ssid: String,
    pub key: String,
    pub bssid: String,
    pub security_mode: SecurityMode,
    pub access_point_type: AccessPointType,
    pub ip_address: String,
    pub port: u16,
}
