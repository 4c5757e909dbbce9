//! zbus implementation of [`BluezBus`]
//!
//! One system bus connection lives as long as the service. The profile and
//! advertisement objects BlueZ calls back into are served on it, so dropping
//! the connection also withdraws the registrations.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};
use zbus::blocking::fdo::ObjectManagerProxy;
use zbus::blocking::Connection;
use zbus::zvariant::{ObjectPath, OwnedFd, OwnedObjectPath, OwnedValue, Value};

use super::bluez::{AdapterProperty, AdvertisementSpec, BluezBus, ProfileSpec};
use crate::error::{AppError, Result};

const BLUEZ_SERVICE: &str = "org.bluez";
const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
const DEVICE_INTERFACE: &str = "org.bluez.Device1";
const ADVERTISEMENT_PATH: &str = "/com/aawgd/bluetooth/advertisement";

#[zbus::proxy(interface = "org.bluez.Adapter1", default_service = "org.bluez")]
trait Adapter1 {
    #[zbus(property)]
    fn set_alias(&self, value: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_powered(&self, value: bool) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_discoverable(&self, value: bool) -> zbus::Result<()>;

    #[zbus(property)]
    fn set_pairable(&self, value: bool) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.bluez.ProfileManager1",
    default_service = "org.bluez",
    default_path = "/org/bluez"
)]
trait ProfileManager1 {
    fn register_profile(
        &self,
        profile: &ObjectPath<'_>,
        uuid: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.bluez.LEAdvertisingManager1",
    default_service = "org.bluez"
)]
trait LEAdvertisingManager1 {
    fn register_advertisement(
        &self,
        advertisement: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;

    fn unregister_advertisement(&self, advertisement: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[zbus::proxy(interface = "org.bluez.Device1", default_service = "org.bluez")]
trait Device1 {
    fn connect_profile(&self, uuid: &str) -> zbus::Result<()>;
}

/// `org.bluez.Profile1` object handed to the profile manager
///
/// BlueZ passes the RFCOMM socket of each new connection; it is held until
/// BlueZ asks for the disconnection.
struct ProfileObject {
    name: &'static str,
    connections: Mutex<HashMap<String, OwnedFd>>,
}

#[zbus::interface(name = "org.bluez.Profile1")]
impl ProfileObject {
    fn release(&self) {
        debug!("{} profile released", self.name);
        self.connections.lock().clear();
    }

    fn new_connection(
        &self,
        device: OwnedObjectPath,
        fd: OwnedFd,
        _properties: HashMap<String, OwnedValue>,
    ) {
        info!("{} profile connection from {}", self.name, device.as_str());
        self.connections
            .lock()
            .insert(device.as_str().to_string(), fd);
    }

    fn request_disconnection(&self, device: OwnedObjectPath) {
        info!("{} profile disconnection from {}", self.name, device.as_str());
        self.connections.lock().remove(device.as_str());
    }
}

/// `org.bluez.LEAdvertisement1` object
struct AdvertisementObject {
    service_uuids: Vec<String>,
    local_name: String,
}

#[zbus::interface(name = "org.bluez.LEAdvertisement1")]
impl AdvertisementObject {
    fn release(&self) {
        debug!("Bluetooth advertisement released");
    }

    #[zbus(property, name = "Type")]
    fn kind(&self) -> String {
        "peripheral".to_string()
    }

    #[zbus(property, name = "ServiceUUIDs")]
    fn service_uuids(&self) -> Vec<String> {
        self.service_uuids.clone()
    }

    #[zbus(property, name = "LocalName")]
    fn local_name(&self) -> String {
        self.local_name.clone()
    }
}

fn bus_error(e: impl std::fmt::Display) -> AppError {
    AppError::Bluetooth(e.to_string())
}

/// BlueZ over the system D-Bus
pub struct ZbusBus {
    connection: Connection,
}

impl ZbusBus {
    pub fn system() -> Result<Self> {
        let connection = Connection::system().map_err(bus_error)?;
        debug!("Connected to the system bus");
        Ok(Self { connection })
    }

    /// Managed object paths exposing `interface`
    fn object_paths(&self, interface: &str) -> Result<Vec<String>> {
        let objects = ObjectManagerProxy::builder(&self.connection)
            .destination(BLUEZ_SERVICE)
            .map_err(bus_error)?
            .path("/")
            .map_err(bus_error)?
            .build()
            .map_err(bus_error)?
            .get_managed_objects()
            .map_err(bus_error)?;

        let mut paths: Vec<String> = objects
            .into_iter()
            .filter(|(_, interfaces)| interfaces.keys().any(|name| name.as_str() == interface))
            .map(|(path, _)| path.as_str().to_string())
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn adapter(&self, path: &str) -> Result<Adapter1ProxyBlocking<'_>> {
        Adapter1ProxyBlocking::builder(&self.connection)
            .path(path.to_string())
            .map_err(bus_error)?
            .build()
            .map_err(bus_error)
    }

    fn advertising_manager(&self, path: &str) -> Result<LEAdvertisingManager1ProxyBlocking<'_>> {
        LEAdvertisingManager1ProxyBlocking::builder(&self.connection)
            .path(path.to_string())
            .map_err(bus_error)?
            .build()
            .map_err(bus_error)
    }
}

impl BluezBus for ZbusBus {
    fn adapter_paths(&self) -> Result<Vec<String>> {
        self.object_paths(ADAPTER_INTERFACE)
    }

    fn device_paths(&self) -> Result<Vec<String>> {
        self.object_paths(DEVICE_INTERFACE)
    }

    fn set_alias(&self, adapter: &str, alias: &str) -> Result<()> {
        self.adapter(adapter)?.set_alias(alias).map_err(bus_error)
    }

    fn set_adapter_property(
        &self,
        adapter: &str,
        property: AdapterProperty,
        value: bool,
    ) -> Result<()> {
        let proxy = self.adapter(adapter)?;
        let result = match property {
            AdapterProperty::Powered => proxy.set_powered(value),
            AdapterProperty::Discoverable => proxy.set_discoverable(value),
            AdapterProperty::Pairable => proxy.set_pairable(value),
        };
        result.map_err(|e| bus_error(format!("{}: {}", property.name(), e)))
    }

    fn register_profile(&self, profile: &ProfileSpec) -> Result<()> {
        let object = ProfileObject {
            name: profile.name,
            connections: Mutex::new(HashMap::new()),
        };
        self.connection
            .object_server()
            .at(profile.path, object)
            .map_err(bus_error)?;

        let mut options: HashMap<&str, Value<'_>> = HashMap::new();
        options.insert("Name", Value::from(profile.name));
        if let Some(role) = profile.role {
            options.insert("Role", Value::from(role));
        }
        if let Some(channel) = profile.channel {
            options.insert("Channel", Value::from(channel));
        }

        let path = ObjectPath::try_from(profile.path).map_err(bus_error)?;
        ProfileManager1ProxyBlocking::new(&self.connection)
            .map_err(bus_error)?
            .register_profile(&path, profile.uuid, options)
            .map_err(bus_error)
    }

    fn register_advertisement(
        &self,
        adapter: &str,
        advertisement: &AdvertisementSpec,
    ) -> Result<()> {
        let object = AdvertisementObject {
            service_uuids: advertisement.service_uuids.clone(),
            local_name: advertisement.local_name.clone(),
        };
        // Replace a previous advertisement so a changed alias is picked up
        let server = self.connection.object_server();
        let _ = server.remove::<AdvertisementObject, _>(ADVERTISEMENT_PATH);
        server.at(ADVERTISEMENT_PATH, object).map_err(bus_error)?;

        let path = ObjectPath::try_from(ADVERTISEMENT_PATH).map_err(bus_error)?;
        self.advertising_manager(adapter)?
            .register_advertisement(&path, HashMap::new())
            .map_err(bus_error)
    }

    fn unregister_advertisement(&self, adapter: &str) -> Result<()> {
        let path = ObjectPath::try_from(ADVERTISEMENT_PATH).map_err(bus_error)?;
        self.advertising_manager(adapter)?
            .unregister_advertisement(&path)
            .map_err(bus_error)
    }

    fn connect_profile(&self, device: &str, uuid: &str) -> Result<()> {
        Device1ProxyBlocking::builder(&self.connection)
            .path(device.to_string())
            .map_err(bus_error)?
            .build()
            .map_err(bus_error)?
            .connect_profile(uuid)
            .map_err(bus_error)
    }
}
