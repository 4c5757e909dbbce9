//! BlueZ-backed [`BluetoothService`]
//!
//! The service itself only sequences adapter operations; the bus calls go
//! through [`BluezBus`] so the D-Bus connection can be swapped out.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::BluetoothService;
use crate::config::BluetoothConfig;
use crate::error::{AppError, Result};

/// Android Auto wireless RFCOMM service
pub const AAWG_PROFILE_UUID: &str = "4de17a00-52cb-11e6-bdf4-0800200c9a66";
/// Headset profile, handset role (exported)
pub const HSP_HS_UUID: &str = "00001108-0000-1000-8000-00805f9b34fb";
/// Headset profile, gateway role (connected on the phone)
pub const HSP_AG_UUID: &str = "00001112-0000-1000-8000-00805f9b34fb";

/// Boolean adapter properties written by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterProperty {
    Powered,
    Discoverable,
    Pairable,
}

impl AdapterProperty {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Powered => "Powered",
            Self::Discoverable => "Discoverable",
            Self::Pairable => "Pairable",
        }
    }
}

/// Profile exported through `ProfileManager1.RegisterProfile`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSpec {
    pub path: &'static str,
    pub uuid: &'static str,
    pub name: &'static str,
    pub role: Option<&'static str>,
    pub channel: Option<u16>,
}

pub const AAWG_PROFILE: ProfileSpec = ProfileSpec {
    path: "/com/aawgd/bluetooth/aawg",
    uuid: AAWG_PROFILE_UUID,
    name: "AA Wireless",
    role: Some("server"),
    channel: Some(8),
};

pub const HSP_HS_PROFILE: ProfileSpec = ProfileSpec {
    path: "/com/aawgd/bluetooth/hsp",
    uuid: HSP_HS_UUID,
    name: "HSP HS",
    role: None,
    channel: None,
};

/// LE advertisement announcing the wireless service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementSpec {
    pub service_uuids: Vec<String>,
    pub local_name: String,
}

/// BlueZ calls needed by [`BluezService`]
pub trait BluezBus: Send + Sync {
    /// Object paths implementing `org.bluez.Adapter1`, sorted
    fn adapter_paths(&self) -> Result<Vec<String>>;

    /// Object paths implementing `org.bluez.Device1`, sorted
    fn device_paths(&self) -> Result<Vec<String>>;

    fn set_alias(&self, adapter: &str, alias: &str) -> Result<()>;

    fn set_adapter_property(&self, adapter: &str, property: AdapterProperty, value: bool)
        -> Result<()>;

    /// Serve a profile object and register it with the profile manager
    fn register_profile(&self, profile: &ProfileSpec) -> Result<()>;

    /// Serve the advertisement object and register it on `adapter`
    ///
    /// BlueZ keeps advertising for as long as the registering connection lives.
    fn register_advertisement(&self, adapter: &str, advertisement: &AdvertisementSpec)
        -> Result<()>;

    fn unregister_advertisement(&self, adapter: &str) -> Result<()>;

    fn connect_profile(&self, device: &str, uuid: &str) -> Result<()>;
}

/// Bluetooth service on top of a BlueZ bus connection
pub struct BluezService {
    bus: Box<dyn BluezBus>,
    /// First adapter found at startup
    adapter: Option<String>,
    alias: String,
    discoverable: bool,
    powered: AtomicBool,
    advertising: Mutex<bool>,
}

impl BluezService {
    /// Connect to the system bus and export the profiles
    pub fn new(config: &BluetoothConfig) -> Result<Self> {
        let bus = super::dbus::ZbusBus::system()?;
        Ok(Self::with_bus(Box::new(bus), config))
    }

    /// Build the service on a given bus; profiles are exported here
    pub fn with_bus(bus: Box<dyn BluezBus>, config: &BluetoothConfig) -> Self {
        let adapter = match bus.adapter_paths() {
            Ok(paths) => paths.into_iter().next(),
            Err(e) => {
                warn!("Failed to list bluetooth adapters: {}", e);
                None
            }
        };
        match &adapter {
            Some(path) => info!("Using bluetooth adapter at path: {}", path),
            None => warn!("Did not find any bluetooth adapters"),
        }

        let service = Self {
            bus,
            adapter,
            alias: config.alias.clone(),
            discoverable: config.discoverable,
            powered: AtomicBool::new(false),
            advertising: Mutex::new(false),
        };
        service.export_profiles();
        service
    }

    pub fn adapter(&self) -> Option<&str> {
        self.adapter.as_deref()
    }

    fn export_profiles(&self) {
        for profile in [&AAWG_PROFILE, &HSP_HS_PROFILE] {
            match self.bus.register_profile(profile) {
                Ok(()) => info!("Bluetooth {} profile active", profile.name),
                Err(e) => warn!("Failed to register {} profile: {}", profile.name, e),
            }
        }
    }

    fn require_adapter(&self) -> Result<&str> {
        self.adapter
            .as_deref()
            .ok_or_else(|| AppError::Bluetooth("No bluetooth adapter".to_string()))
    }

    fn set_visible(&self, adapter: &str, visible: bool) -> Result<()> {
        self.bus
            .set_adapter_property(adapter, AdapterProperty::Discoverable, visible)?;
        self.bus
            .set_adapter_property(adapter, AdapterProperty::Pairable, visible)?;
        debug!("Bluetooth adapter discoverable and pairable: {}", visible);
        Ok(())
    }
}

impl BluetoothService for BluezService {
    fn power_on(&self) -> Result<()> {
        let adapter = self.require_adapter()?;
        self.bus.set_alias(adapter, &self.alias)?;
        self.bus
            .set_adapter_property(adapter, AdapterProperty::Powered, true)?;
        self.powered.store(true, Ordering::Relaxed);
        info!("Bluetooth adapter was powered on");

        if self.discoverable {
            self.set_visible(adapter, true)?;
        }
        Ok(())
    }

    fn power_off(&self) -> Result<()> {
        let adapter = self.require_adapter()?;
        self.bus
            .set_adapter_property(adapter, AdapterProperty::Powered, false)?;
        self.powered.store(false, Ordering::Relaxed);
        info!("Bluetooth adapter was powered off");
        Ok(())
    }

    fn start_advertising(&self) -> Result<()> {
        let adapter = self.require_adapter()?;
        let mut advertising = self.advertising.lock();
        if *advertising {
            return Ok(());
        }

        let advertisement = AdvertisementSpec {
            service_uuids: vec![AAWG_PROFILE_UUID.to_string()],
            local_name: self.alias.clone(),
        };
        self.bus.register_advertisement(adapter, &advertisement)?;
        *advertising = true;
        info!("Bluetooth LE advertising started");
        Ok(())
    }

    fn stop_advertising(&self) -> Result<()> {
        let mut advertising = self.advertising.lock();
        if !*advertising {
            return Ok(());
        }
        let adapter = self.require_adapter()?;

        *advertising = false;
        self.bus.unregister_advertisement(adapter)?;
        info!("Bluetooth LE advertising stopped");
        Ok(())
    }

    fn connect(&self) -> Result<bool> {
        let devices = self.bus.device_paths()?;
        if devices.is_empty() {
            info!("Did not find any known bluetooth device");
            return Ok(false);
        }
        info!("Found {} bluetooth devices", devices.len());

        for device in &devices {
            match self.bus.connect_profile(device, HSP_AG_UUID) {
                Ok(()) => {
                    info!("Bluetooth connected to the device at {}", device);
                    return Ok(true);
                }
                Err(e) => debug!("Bluetooth device {} did not connect: {}", device, e),
            }
        }
        Ok(false)
    }

    fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingBus {
        adapters: Vec<String>,
        devices: Vec<String>,
        /// Devices whose ConnectProfile succeeds
        reachable: Vec<String>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingBus {
        fn with_adapter() -> Self {
            Self {
                adapters: vec!["/org/bluez/hci0".to_string(), "/org/bluez/hci1".to_string()],
                ..Default::default()
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl BluezBus for RecordingBus {
        fn adapter_paths(&self) -> Result<Vec<String>> {
            Ok(self.adapters.clone())
        }

        fn device_paths(&self) -> Result<Vec<String>> {
            Ok(self.devices.clone())
        }

        fn set_alias(&self, adapter: &str, alias: &str) -> Result<()> {
            self.record(format!("{} Alias={}", adapter, alias));
            Ok(())
        }

        fn set_adapter_property(
            &self,
            adapter: &str,
            property: AdapterProperty,
            value: bool,
        ) -> Result<()> {
            self.record(format!("{} {}={}", adapter, property.name(), value));
            Ok(())
        }

        fn register_profile(&self, profile: &ProfileSpec) -> Result<()> {
            self.record(format!("RegisterProfile {} {}", profile.path, profile.uuid));
            Ok(())
        }

        fn register_advertisement(
            &self,
            adapter: &str,
            advertisement: &AdvertisementSpec,
        ) -> Result<()> {
            self.record(format!(
                "{} RegisterAdvertisement {} {:?}",
                adapter, advertisement.local_name, advertisement.service_uuids
            ));
            Ok(())
        }

        fn unregister_advertisement(&self, adapter: &str) -> Result<()> {
            self.record(format!("{} UnregisterAdvertisement", adapter));
            Ok(())
        }

        fn connect_profile(&self, device: &str, uuid: &str) -> Result<()> {
            self.record(format!("{} ConnectProfile {}", device, uuid));
            if self.reachable.iter().any(|d| d == device) {
                Ok(())
            } else {
                Err(AppError::Bluetooth("org.bluez.Error.Failed".to_string()))
            }
        }
    }

    fn config() -> BluetoothConfig {
        BluetoothConfig {
            alias: "Test Dongle".to_string(),
            ..BluetoothConfig::default()
        }
    }

    #[test]
    fn test_profiles_exported_at_startup() {
        let bus = RecordingBus::with_adapter();
        let service = BluezService::with_bus(Box::new(bus.clone()), &config());

        assert_eq!(service.adapter(), Some("/org/bluez/hci0"));
        assert_eq!(
            bus.calls(),
            vec![
                format!("RegisterProfile /com/aawgd/bluetooth/aawg {}", AAWG_PROFILE_UUID),
                format!("RegisterProfile /com/aawgd/bluetooth/hsp {}", HSP_HS_UUID),
            ]
        );
        assert_eq!(AAWG_PROFILE.role, Some("server"));
        assert_eq!(AAWG_PROFILE.channel, Some(8));
    }

    #[test]
    fn test_power_on_sequence() {
        let bus = RecordingBus::with_adapter();
        let service = BluezService::with_bus(Box::new(bus.clone()), &config());
        bus.calls.lock().clear();

        service.power_on().unwrap();
        assert!(service.is_powered());
        assert_eq!(
            bus.calls(),
            vec![
                "/org/bluez/hci0 Alias=Test Dongle",
                "/org/bluez/hci0 Powered=true",
                "/org/bluez/hci0 Discoverable=true",
                "/org/bluez/hci0 Pairable=true",
            ]
        );

        service.power_off().unwrap();
        assert!(!service.is_powered());
    }

    #[test]
    fn test_hidden_adapter_is_not_made_discoverable() {
        let bus = RecordingBus::with_adapter();
        let config = BluetoothConfig {
            discoverable: false,
            ..config()
        };
        let service = BluezService::with_bus(Box::new(bus.clone()), &config);
        bus.calls.lock().clear();

        service.power_on().unwrap();
        assert_eq!(bus.calls().len(), 2);
    }

    #[test]
    fn test_advertisement_registered_once() {
        let bus = RecordingBus::with_adapter();
        let service = BluezService::with_bus(Box::new(bus.clone()), &config());
        bus.calls.lock().clear();

        service.start_advertising().unwrap();
        service.start_advertising().unwrap();
        service.stop_advertising().unwrap();
        service.stop_advertising().unwrap();

        assert_eq!(
            bus.calls(),
            vec![
                format!(
                    "/org/bluez/hci0 RegisterAdvertisement Test Dongle [\"{}\"]",
                    AAWG_PROFILE_UUID
                ),
                "/org/bluez/hci0 UnregisterAdvertisement".to_string(),
            ]
        );
    }

    #[test]
    fn test_connect_tries_devices_in_order() {
        let bus = RecordingBus {
            devices: vec![
                "/org/bluez/hci0/dev_11_22_33_44_55_66".to_string(),
                "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF".to_string(),
            ],
            reachable: vec!["/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF".to_string()],
            ..RecordingBus::with_adapter()
        };
        let service = BluezService::with_bus(Box::new(bus.clone()), &config());
        bus.calls.lock().clear();

        assert!(service.connect().unwrap());
        assert_eq!(
            bus.calls(),
            vec![
                format!("/org/bluez/hci0/dev_11_22_33_44_55_66 ConnectProfile {}", HSP_AG_UUID),
                format!("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF ConnectProfile {}", HSP_AG_UUID),
            ]
        );
    }

    #[test]
    fn test_connect_without_devices() {
        let service = BluezService::with_bus(Box::new(RecordingBus::with_adapter()), &config());
        assert!(!service.connect().unwrap());
    }

    #[test]
    fn test_missing_adapter() {
        let service = BluezService::with_bus(Box::new(RecordingBus::default()), &config());

        assert!(service.adapter().is_none());
        assert!(matches!(service.power_on(), Err(AppError::Bluetooth(_))));
        assert!(service.start_advertising().is_err());
        // Nothing was registered, so there is nothing to stop
        assert!(service.stop_advertising().is_ok());
        assert!(!service.is_powered());
    }
}
