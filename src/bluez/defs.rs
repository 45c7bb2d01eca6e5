//! Names of the D-Bus services, interfaces, and properties this backend
//! talks to.

use std::time::Duration;

pub(crate) const BLUEZ_SERVICE: &str = "org.bluez";
pub(crate) const BLUEZ_ROOT: &str = "/org/bluez";

pub(crate) const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub(crate) const SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub(crate) const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub(crate) const DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";
pub(crate) const BATTERY_INTERFACE: &str = "org.bluez.Battery1";
pub(crate) const AGENT_INTERFACE: &str = "org.bluez.Agent1";
pub(crate) const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";
pub(crate) const ADVERTISEMENT_MONITOR_INTERFACE: &str = "org.bluez.AdvertisementMonitor1";
pub(crate) const ADVERTISEMENT_MONITOR_MANAGER_INTERFACE: &str =
    "org.bluez.AdvertisementMonitorManager1";

pub(crate) const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";
pub(crate) const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// `org.bluez.Device1` property names that originate in advertising data. A
/// `PropertiesChanged` touching none of these (an RSSI refresh, say) is not
/// a new advertisement.
pub(crate) const ADVERTISING_DATA_PROPERTIES: &[&str] = &[
    "AdvertisingData",
    "AdvertisingFlags",
    "ManufacturerData",
    "Name",
    "ServiceData",
    "UUIDs",
];

pub(crate) const DBUS_METHOD_CALL_TIMEOUT: Duration = Duration::from_secs(30);
