//! The process-wide BlueZ object manager.
//!
//! On first use this connects to the system bus, subscribes to
//! `InterfacesAdded`, `InterfacesRemoved`, and `PropertiesChanged`, primes a
//! local cache with `GetManagedObjects`, and keeps the cache current from
//! the signal stream. Everything the backend knows about adapters, devices,
//! and the GATT tree is read from this cache; by the time BlueZ answers a
//! method call, the signal carrying the result has already been folded in.
//!
//! The raw D-Bus property maps are converted to typed, owned structs inside
//! the signal task, so no `dbus` argument types escape this module.

use crate::api::bleuuid::parse_uuid;
use crate::api::CharPropFlags;
use crate::bluez::defs::*;
use crate::{Error, Result};
use dashmap::DashMap;
use dbus::arg::{cast, prop_cast, PropMap, RefArg, Variant};
use dbus::channel::MatchingReceiver;
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::ObjectManager;
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::Message;
use dbus_crossroads::Crossroads;
use futures::stream::{select_all, Stream, StreamExt};
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Typed mirror of `org.bluez.Adapter1`.
#[derive(Debug, Clone, Default)]
pub(crate) struct AdapterProps {
    pub address: Option<String>,
    pub powered: bool,
}

/// Typed mirror of the `org.bluez.Device1` properties the backend uses.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceProps {
    pub address: Option<String>,
    pub name: Option<String>,
    pub alias: Option<String>,
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
    pub uuids: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub connected: bool,
    pub services_resolved: bool,
    pub paired: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ServiceProps {
    pub uuid: Option<Uuid>,
    pub primary: bool,
    pub device: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CharacteristicProps {
    pub uuid: Option<Uuid>,
    pub service: Option<String>,
    pub flags: CharPropFlags,
    pub notifying: bool,
    pub mtu: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DescriptorProps {
    pub uuid: Option<Uuid>,
    pub characteristic: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct BatteryProps {
    pub percentage: Option<u8>,
}

/// One D-Bus object path with whichever BlueZ interfaces it carries.
#[derive(Debug, Clone, Default)]
pub(crate) struct CachedObject {
    pub adapter: Option<AdapterProps>,
    pub device: Option<DeviceProps>,
    pub service: Option<ServiceProps>,
    pub characteristic: Option<CharacteristicProps>,
    pub descriptor: Option<DescriptorProps>,
    pub battery: Option<BatteryProps>,
}

impl CachedObject {
    fn is_empty(&self) -> bool {
        self.adapter.is_none()
            && self.device.is_none()
            && self.service.is_none()
            && self.characteristic.is_none()
            && self.descriptor.is_none()
            && self.battery.is_none()
    }
}

/// A cache delta, broadcast to scanner and client backends.
#[derive(Debug, Clone)]
pub(crate) enum BluezEvent {
    ObjectAdded {
        path: String,
    },
    ObjectRemoved {
        path: String,
    },
    /// A `Device1` property change; `changed` lists the property names.
    DeviceChanged {
        path: String,
        changed: Vec<String>,
    },
    /// A `GattCharacteristic1` `Value` change: a notification, indication,
    /// or read completion.
    CharacteristicValue {
        path: String,
        value: Vec<u8>,
    },
}

/// Wrapper for a stream of D-Bus messages which removes the match from the
/// connection when dropped.
struct MessageStream {
    msg_match: Option<MsgMatch>,
    events: futures::channel::mpsc::UnboundedReceiver<Message>,
    connection: Arc<SyncConnection>,
}

impl MessageStream {
    fn new(msg_match: MsgMatch, connection: Arc<SyncConnection>) -> Self {
        let (msg_match, events) = msg_match.msg_stream();
        Self {
            msg_match: Some(msg_match),
            events,
            connection,
        }
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        let connection = self.connection.clone();
        if let Some(msg_match) = self.msg_match.take() {
            tokio::spawn(async move {
                let _ = connection.remove_match(msg_match.token()).await;
            });
        }
    }
}

pub(crate) struct BluezObjectManager {
    connection: Arc<SyncConnection>,
    objects: Arc<DashMap<String, CachedObject>>,
    events: broadcast::Sender<BluezEvent>,
    exports: Arc<Mutex<Crossroads>>,
}

/// Returns the process-wide object manager, connecting on first use.
pub(crate) async fn global_manager() -> Result<Arc<BluezObjectManager>> {
    static MANAGER: tokio::sync::OnceCell<Arc<BluezObjectManager>> =
        tokio::sync::OnceCell::const_new();
    MANAGER
        .get_or_try_init(|| async {
            BluezObjectManager::connect().await.map(Arc::new)
        })
        .await
        .cloned()
}

impl BluezObjectManager {
    async fn connect() -> Result<Self> {
        let (resource, connection) = dbus_tokio::connection::new_system_sync().map_err(|err| {
            warn!("connecting to the system bus failed: {err}");
            Error::BluetoothNotAvailable {
                reason: crate::NotAvailableReason::NoBluetooth,
            }
        })?;
        tokio::spawn(async move {
            let err = resource.await;
            error!("D-Bus connection to BlueZ lost: {err}");
        });

        // Subscribe before priming the cache so no transition can be missed.
        let mut streams = Vec::new();
        for (interface, member) in [
            (OBJECT_MANAGER_INTERFACE, "InterfacesAdded"),
            (OBJECT_MANAGER_INTERFACE, "InterfacesRemoved"),
            (PROPERTIES_INTERFACE, "PropertiesChanged"),
        ] {
            let mut rule = MatchRule::new_signal(interface, member);
            rule.sender = Some(BLUEZ_SERVICE.into());
            let msg_match = connection.add_match(rule).await?;
            streams.push(MessageStream::new(msg_match, connection.clone()));
        }

        let objects: Arc<DashMap<String, CachedObject>> = Arc::new(DashMap::new());
        let (events, _) = broadcast::channel(256);

        {
            let objects = objects.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let mut merged = select_all(streams);
                while let Some(message) = merged.next().await {
                    handle_signal(&objects, &events, message);
                }
            });
        }

        let proxy = Proxy::new(
            BLUEZ_SERVICE,
            "/",
            DBUS_METHOD_CALL_TIMEOUT,
            connection.clone(),
        );
        let tree = proxy.get_managed_objects().await?;
        for (path, interfaces) in &tree {
            let mut entry = objects.entry(path.to_string()).or_default();
            for (interface, props) in interfaces {
                apply_interface(&mut entry, interface, props);
            }
        }
        debug!("primed BlueZ object cache with {} paths", objects.len());

        // Host for objects this backend itself exports (pairing agents and
        // advertisement monitors).
        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((
            connection.clone(),
            Box::new(|future| {
                tokio::spawn(future);
            }),
        )));
        let exports = Arc::new(Mutex::new(crossroads));
        {
            let exports = exports.clone();
            connection.start_receive(
                MatchRule::new_method_call(),
                Box::new(move |message, connection| {
                    let result = exports.lock().unwrap().handle_message(message, connection);
                    if result.is_err() {
                        trace!("unhandled D-Bus method call");
                    }
                    true
                }),
            );
        }

        Ok(BluezObjectManager {
            connection,
            objects,
            events,
            exports,
        })
    }

    pub(crate) fn proxy(
        &self,
        path: impl Into<dbus::Path<'static>>,
    ) -> Proxy<'static, Arc<SyncConnection>> {
        Proxy::new(
            BLUEZ_SERVICE,
            path,
            DBUS_METHOD_CALL_TIMEOUT,
            self.connection.clone(),
        )
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BluezEvent> {
        self.events.subscribe()
    }

    /// The objects this backend exports on the bus.
    pub(crate) fn exports(&self) -> Arc<Mutex<Crossroads>> {
        self.exports.clone()
    }

    pub(crate) fn get(&self, path: &str) -> Option<CachedObject> {
        self.objects.get(path).map(|entry| entry.value().clone())
    }

    pub(crate) fn device(&self, path: &str) -> Option<DeviceProps> {
        self.objects.get(path).and_then(|entry| entry.device.clone())
    }

    /// Object paths of all known adapters, in path order.
    pub(crate) fn adapters(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.adapter.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        paths
    }

    /// Snapshot of the paths below `prefix`, with their cached state.
    pub(crate) fn objects_under(&self, prefix: &str) -> Vec<(String, CachedObject)> {
        let mut objects: Vec<(String, CachedObject)> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        objects
    }
}

fn handle_signal(
    objects: &DashMap<String, CachedObject>,
    events: &broadcast::Sender<BluezEvent>,
    message: Message,
) {
    let member = match message.member() {
        Some(member) => member.to_string(),
        None => return,
    };
    match member.as_str() {
        "InterfacesAdded" => {
            let Ok((path, interfaces)) =
                message.read2::<dbus::Path, HashMap<String, PropMap>>()
            else {
                return;
            };
            let path = path.to_string();
            if !path.starts_with(BLUEZ_ROOT) {
                return;
            }
            {
                let mut entry = objects.entry(path.clone()).or_default();
                for (interface, props) in &interfaces {
                    apply_interface(&mut entry, interface, props);
                }
            }
            trace!("interfaces added at {path}");
            let _ = events.send(BluezEvent::ObjectAdded { path: path.clone() });
            // A device showing up is also its first advertisement.
            if interfaces.contains_key(DEVICE_INTERFACE) {
                let _ = events.send(BluezEvent::DeviceChanged {
                    path,
                    changed: ADVERTISING_DATA_PROPERTIES
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                });
            }
        }
        "InterfacesRemoved" => {
            let Ok((path, interfaces)) = message.read2::<dbus::Path, Vec<String>>() else {
                return;
            };
            let path = path.to_string();
            if !path.starts_with(BLUEZ_ROOT) {
                return;
            }
            let remove_entry = {
                let mut entry = match objects.get_mut(&path) {
                    Some(entry) => entry,
                    None => return,
                };
                for interface in &interfaces {
                    match interface.as_str() {
                        ADAPTER_INTERFACE => entry.adapter = None,
                        DEVICE_INTERFACE => entry.device = None,
                        SERVICE_INTERFACE => entry.service = None,
                        CHARACTERISTIC_INTERFACE => entry.characteristic = None,
                        DESCRIPTOR_INTERFACE => entry.descriptor = None,
                        BATTERY_INTERFACE => entry.battery = None,
                        _ => {}
                    }
                }
                entry.is_empty()
            };
            if remove_entry {
                objects.remove(&path);
            }
            trace!("interfaces removed at {path}");
            let _ = events.send(BluezEvent::ObjectRemoved { path });
        }
        "PropertiesChanged" => {
            let path = match message.path() {
                Some(path) => path.to_string(),
                None => return,
            };
            if !path.starts_with(BLUEZ_ROOT) {
                return;
            }
            let Ok((interface, changed)) = message.read2::<String, PropMap>() else {
                return;
            };
            {
                let mut entry = objects.entry(path.clone()).or_default();
                apply_interface(&mut entry, &interface, &changed);
            }
            match interface.as_str() {
                DEVICE_INTERFACE => {
                    let _ = events.send(BluezEvent::DeviceChanged {
                        path,
                        changed: changed.keys().cloned().collect(),
                    });
                }
                CHARACTERISTIC_INTERFACE => {
                    if let Some(value) = prop_cast::<Vec<u8>>(&changed, "Value") {
                        let _ = events.send(BluezEvent::CharacteristicValue {
                            path,
                            value: value.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        _ => {}
    }
}

fn apply_interface(entry: &mut CachedObject, interface: &str, props: &PropMap) {
    match interface {
        ADAPTER_INTERFACE => {
            let adapter = entry.adapter.get_or_insert_with(Default::default);
            if let Some(address) = prop_str(props, "Address") {
                adapter.address = Some(address);
            }
            if let Some(powered) = prop_bool(props, "Powered") {
                adapter.powered = powered;
            }
        }
        DEVICE_INTERFACE => {
            let device = entry.device.get_or_insert_with(Default::default);
            if let Some(address) = prop_str(props, "Address") {
                device.address = Some(address);
            }
            if let Some(name) = prop_str(props, "Name") {
                device.name = Some(name);
            }
            if let Some(alias) = prop_str(props, "Alias") {
                device.alias = Some(alias);
            }
            if let Some(rssi) = prop_i16(props, "RSSI") {
                device.rssi = Some(rssi);
            }
            if let Some(tx_power) = prop_i16(props, "TxPower") {
                device.tx_power = Some(tx_power);
            }
            if let Some(uuids) = prop_cast::<Vec<String>>(props, "UUIDs") {
                device.uuids = uuids
                    .iter()
                    .filter_map(|uuid| parse_uuid(uuid).ok())
                    .collect();
            }
            if let Some(data) =
                prop_cast::<HashMap<u16, Variant<Box<dyn RefArg>>>>(props, "ManufacturerData")
            {
                device.manufacturer_data = data
                    .iter()
                    .filter_map(|(&id, value)| {
                        cast::<Vec<u8>>(&value.0).map(|bytes| (id, bytes.clone()))
                    })
                    .collect();
            }
            if let Some(data) = prop_cast::<PropMap>(props, "ServiceData") {
                device.service_data = data
                    .iter()
                    .filter_map(|(uuid, value)| {
                        let uuid = parse_uuid(uuid).ok()?;
                        let bytes = cast::<Vec<u8>>(&value.0)?;
                        Some((uuid, bytes.clone()))
                    })
                    .collect();
            }
            if let Some(connected) = prop_bool(props, "Connected") {
                device.connected = connected;
            }
            if let Some(resolved) = prop_bool(props, "ServicesResolved") {
                device.services_resolved = resolved;
            }
            if let Some(paired) = prop_bool(props, "Paired") {
                device.paired = paired;
            }
        }
        SERVICE_INTERFACE => {
            let service = entry.service.get_or_insert_with(Default::default);
            if let Some(uuid) = prop_str(props, "UUID").and_then(|s| parse_uuid(&s).ok()) {
                service.uuid = Some(uuid);
            }
            if let Some(primary) = prop_bool(props, "Primary") {
                service.primary = primary;
            }
            if let Some(device) = prop_path(props, "Device") {
                service.device = Some(device);
            }
        }
        CHARACTERISTIC_INTERFACE => {
            let characteristic = entry.characteristic.get_or_insert_with(Default::default);
            if let Some(uuid) = prop_str(props, "UUID").and_then(|s| parse_uuid(&s).ok()) {
                characteristic.uuid = Some(uuid);
            }
            if let Some(service) = prop_path(props, "Service") {
                characteristic.service = Some(service);
            }
            if let Some(flags) = prop_cast::<Vec<String>>(props, "Flags") {
                characteristic.flags = flags
                    .iter()
                    .filter_map(|name| CharPropFlags::from_property_name(name))
                    .collect();
            }
            if let Some(notifying) = prop_bool(props, "Notifying") {
                characteristic.notifying = notifying;
            }
            if let Some(mtu) = prop_u16(props, "MTU") {
                characteristic.mtu = Some(mtu);
            }
        }
        DESCRIPTOR_INTERFACE => {
            let descriptor = entry.descriptor.get_or_insert_with(Default::default);
            if let Some(uuid) = prop_str(props, "UUID").and_then(|s| parse_uuid(&s).ok()) {
                descriptor.uuid = Some(uuid);
            }
            if let Some(characteristic) = prop_path(props, "Characteristic") {
                descriptor.characteristic = Some(characteristic);
            }
        }
        BATTERY_INTERFACE => {
            let battery = entry.battery.get_or_insert_with(Default::default);
            if let Some(percentage) = prop_u8(props, "Percentage") {
                battery.percentage = Some(percentage);
            }
        }
        _ => {}
    }
}

fn prop_str(props: &PropMap, key: &str) -> Option<String> {
    props.get(key).and_then(|v| v.0.as_str()).map(str::to_owned)
}

fn prop_path(props: &PropMap, key: &str) -> Option<String> {
    // Object paths also answer as_str.
    prop_str(props, key)
}

fn prop_bool(props: &PropMap, key: &str) -> Option<bool> {
    props.get(key).and_then(|v| v.0.as_i64()).map(|v| v != 0)
}

fn prop_i16(props: &PropMap, key: &str) -> Option<i16> {
    props
        .get(key)
        .and_then(|v| v.0.as_i64())
        .and_then(|v| i16::try_from(v).ok())
}

fn prop_u16(props: &PropMap, key: &str) -> Option<u16> {
    props
        .get(key)
        .and_then(|v| v.0.as_u64())
        .and_then(|v| u16::try_from(v).ok())
}

fn prop_u8(props: &PropMap, key: &str) -> Option<u8> {
    props
        .get(key)
        .and_then(|v| v.0.as_u64())
        .and_then(|v| u8::try_from(v).ok())
}

/// Extracts the attribute handle BlueZ encodes as the last four hex digits
/// of GATT object paths (`.../service000c/char000d/desc000f`).
pub(crate) fn handle_from_path(path: &str) -> Result<u16> {
    let digits = path
        .rsplit('/')
        .next()
        .and_then(|segment| segment.get(segment.len().saturating_sub(4)..))
        .ok_or_else(|| Error::os(format!("malformed GATT object path {path:?}")))?;
    u16::from_str_radix(digits, 16)
        .map_err(|_| Error::os(format!("malformed GATT object path {path:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_from_gatt_paths() {
        assert_eq!(
            handle_from_path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c").unwrap(),
            0x000c
        );
        assert_eq!(
            handle_from_path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char000d")
                .unwrap(),
            0x000d
        );
        assert_eq!(
            handle_from_path(
                "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char000d/desc0010"
            )
            .unwrap(),
            0x0010
        );
        assert!(handle_from_path("/org/bluez/hci0").is_err());
    }

    #[test]
    fn apply_device_properties() {
        let mut entry = CachedObject::default();
        let mut props: PropMap = HashMap::new();
        props.insert(
            "Address".into(),
            Variant(Box::new("AA:BB:CC:DD:EE:FF".to_string())),
        );
        props.insert("RSSI".into(), Variant(Box::new(-66i16)));
        props.insert(
            "UUIDs".into(),
            Variant(Box::new(vec![
                "0000180f-0000-1000-8000-00805f9b34fb".to_string()
            ])),
        );
        props.insert("Connected".into(), Variant(Box::new(true)));
        apply_interface(&mut entry, DEVICE_INTERFACE, &props);

        let device = entry.device.unwrap();
        assert_eq!(device.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(device.rssi, Some(-66));
        assert_eq!(device.uuids.len(), 1);
        assert!(device.connected);
    }

    #[test]
    fn apply_characteristic_flags() {
        let mut entry = CachedObject::default();
        let mut props: PropMap = HashMap::new();
        props.insert(
            "Flags".into(),
            Variant(Box::new(vec![
                "read".to_string(),
                "notify".to_string(),
                "encrypt-read".to_string(),
            ])),
        );
        apply_interface(&mut entry, CHARACTERISTIC_INTERFACE, &props);
        let characteristic = entry.characteristic.unwrap();
        assert_eq!(
            characteristic.flags,
            CharPropFlags::READ | CharPropFlags::NOTIFY
        );
    }
}
