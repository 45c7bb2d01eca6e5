//! The `api` module contains the portable types which make up the public
//! surface of this crate: the device and advertisement records produced by
//! scanning, the GATT object model, characteristic property flags, and the
//! pairing-agent contract. The platform backends in [`crate::platform`]
//! produce and consume these types but never extend them.

pub mod bleuuid;
pub mod gatt;

use crate::{Error, Result};
use async_trait::async_trait;
use bitflags::bitflags;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

use self::gatt::Characteristic;

bitflags! {
    /// A set of properties that indicate what operations are supported by a
    /// characteristic. The bit values follow the GATT characteristic
    /// properties field, extended-properties bits included.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CharPropFlags: u16 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITE = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

// NOTE: these must match the BlueZ flag strings.
const CHAR_PROP_NAMES: &[(CharPropFlags, &str)] = &[
    (CharPropFlags::BROADCAST, "broadcast"),
    (CharPropFlags::READ, "read"),
    (
        CharPropFlags::WRITE_WITHOUT_RESPONSE,
        "write-without-response",
    ),
    (CharPropFlags::WRITE, "write"),
    (CharPropFlags::NOTIFY, "notify"),
    (CharPropFlags::INDICATE, "indicate"),
    (
        CharPropFlags::AUTHENTICATED_SIGNED_WRITES,
        "authenticated-signed-writes",
    ),
    (CharPropFlags::EXTENDED_PROPERTIES, "extended-properties"),
    (CharPropFlags::RELIABLE_WRITE, "reliable-write"),
    (CharPropFlags::WRITABLE_AUXILIARIES, "writable-auxiliaries"),
];

impl CharPropFlags {
    /// The canonical names of the set flags, in bit order.
    pub fn names(&self) -> Vec<&'static str> {
        CHAR_PROP_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parses a single canonical property name. Unknown names (BlueZ also
    /// reports server-side and permission flags) return `None`.
    pub fn from_property_name(name: &str) -> Option<CharPropFlags> {
        CHAR_PROP_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }
}

/// A discovered BLE peripheral, as produced by a [`Scanner`](crate::Scanner)
/// and consumed by a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleDevice {
    /// The OS address of the device. Colon-separated hex on Linux and
    /// Windows; on macOS this is a host-local random UUID because the real
    /// address is not exposed. Treat it as an opaque string: equality and
    /// hashing are string-based, callers must not parse it.
    pub address: String,
    /// The OS-resolved display name, if any. May differ from the advertised
    /// local name.
    pub name: Option<String>,
    /// The backend handle for this device: a D-Bus object path on Linux, a
    /// peripheral identifier on macOS, a hex address on Windows. This is
    /// also the key the scanner deduplicates sightings by.
    pub details: String,
}

impl BleDevice {
    /// The backend-specific key this device is registered under.
    pub fn key(&self) -> &str {
        &self.details
    }
}

impl Display for BleDevice {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", self.address, name),
            None => write!(f, "{}: (unknown)", self.address),
        }
    }
}

/// One observation of a device's advertising data.
///
/// A single advertising event may be split by the OS into a legacy
/// advertisement and a scan response; backends that receive the two halves
/// separately fold the newer into the older with [`AdvertisementData::merge`]
/// before the scanner reports the observation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// The advertised local name, which may be shortened.
    pub local_name: Option<String>,
    /// Manufacturer-specific data, keyed by the 16-bit company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Per-service advertised data, keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// The advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Advertised transmission power level, dBm.
    pub tx_power: Option<i16>,
    /// Received signal strength for this observation, dBm.
    pub rssi: Option<i16>,
    /// Backend-specific debug representation of the raw event. Opaque;
    /// callers must not parse it.
    pub platform_data: Option<String>,
}

impl AdvertisementData {
    /// Folds `newer` into `self` field-wise: a field present in `newer`
    /// replaces the old value, a field absent in `newer` leaves the old
    /// value alone. Merging an empty advertisement is the identity.
    pub fn merge(&mut self, newer: &AdvertisementData) {
        if newer.local_name.is_some() {
            self.local_name = newer.local_name.clone();
        }
        if !newer.manufacturer_data.is_empty() {
            self.manufacturer_data = newer.manufacturer_data.clone();
        }
        if !newer.service_data.is_empty() {
            self.service_data = newer.service_data.clone();
        }
        if !newer.service_uuids.is_empty() {
            self.service_uuids = newer.service_uuids.clone();
        }
        if newer.tx_power.is_some() {
            self.tx_power = newer.tx_power;
        }
        if newer.rssi.is_some() {
            self.rssi = newer.rssi;
        }
        if newer.platform_data.is_some() {
            self.platform_data = newer.platform_data.clone();
        }
    }

    /// Whether this advertisement passes a service-UUID filter. An empty
    /// filter passes everything; a non-empty filter requires at least one
    /// advertised UUID to be in it, so an advertisement with no service
    /// UUIDs never passes a non-empty filter.
    pub fn matches_service_filter(&self, filter: &[Uuid]) -> bool {
        if filter.is_empty() {
            return true;
        }
        self.service_uuids.iter().any(|uuid| filter.contains(uuid))
    }
}

/// Whether the scanner sends scan requests (and therefore receives scan
/// responses) or only listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    #[default]
    Active,
    Passive,
}

/// One advertisement-monitor pattern for passive scanning: the OS matches
/// `content` against the bytes of the `data_type` AD structure starting at
/// `start_position`. A set of patterns matches if any single pattern does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrPattern {
    pub start_position: u8,
    pub data_type: u8,
    pub content: Vec<u8>,
}

impl OrPattern {
    pub fn new(start_position: u8, data_type: u8, content: impl Into<Vec<u8>>) -> Self {
        OrPattern {
            start_position,
            data_type,
            content: content.into(),
        }
    }
}

/// Generic Access Profile advertisement data types usable in
/// [`OrPattern::data_type`].
pub mod ad_types {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_LIST_SERVICE_UUID16: u8 = 0x02;
    pub const COMPLETE_LIST_SERVICE_UUID16: u8 = 0x03;
    pub const INCOMPLETE_LIST_SERVICE_UUID128: u8 = 0x06;
    pub const COMPLETE_LIST_SERVICE_UUID128: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0a;
    pub const SERVICE_DATA_UUID16: u8 = 0x16;
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xff;
}

/// Construction options for a [`Scanner`](crate::Scanner).
#[derive(Debug, Clone, Default)]
pub struct ScannerOptions {
    /// If non-empty, only advertisements carrying at least one of these
    /// service UUIDs are reported.
    pub service_uuids: Vec<Uuid>,
    /// Active (default) or passive scanning.
    pub mode: ScanMode,
    /// Patterns for passive scanning. Required when `mode` is passive on
    /// backends that match patterns in the controller (BlueZ).
    pub or_patterns: Vec<OrPattern>,
    /// Name of the adapter to scan on where the OS has several (`hci0`).
    /// `None` selects the first powered adapter.
    pub adapter: Option<String>,
}

/// Construction options for a [`Client`](crate::Client).
pub struct ClientOptions {
    /// Bound on the whole connect sequence, device lookup included.
    pub timeout: std::time::Duration,
    /// Invoked exactly once for every transition out of the connected state,
    /// whether requested or unsolicited.
    pub disconnected_callback: Option<DisconnectedCallback>,
    /// If non-empty, service discovery is restricted to these service UUIDs.
    pub services: Vec<Uuid>,
    /// Agent consulted during pairing flows. When `None`, the OS dialogs
    /// (where any exist) run unassisted.
    pub pairing_agent: Option<std::sync::Arc<dyn PairingAgent>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            timeout: std::time::Duration::from_secs(10),
            disconnected_callback: None,
            services: Vec::new(),
            pairing_agent: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("timeout", &self.timeout)
            .field("services", &self.services)
            .field(
                "disconnected_callback",
                &self.disconnected_callback.is_some(),
            )
            .field("pairing_agent", &self.pairing_agent.is_some())
            .finish()
    }
}

/// Options for [`Client::start_notify`](crate::Client::start_notify).
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyOptions {
    /// Subscribe via indications even when the characteristic also supports
    /// notifications.
    pub force_indicate: bool,
    /// On BlueZ, take the `AcquireNotify` file-descriptor fast path instead
    /// of the property-signal path. The property path is the default because
    /// a peripheral may emit a notification before the CCCD write completes,
    /// which the acquired descriptor misses.
    pub use_acquire: bool,
}

/// How to address a characteristic or descriptor in the client I/O methods:
/// by OS-reported handle or by UUID. UUID addressing fails when the UUID is
/// not unique within the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrSpec {
    Handle(u16),
    Uuid(Uuid),
}

impl Display for AttrSpec {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            AttrSpec::Handle(handle) => write!(f, "handle {handle:#06x}"),
            AttrSpec::Uuid(uuid) => f.write_str(&bleuuid::to_short_string(uuid)),
        }
    }
}

impl From<u16> for AttrSpec {
    fn from(handle: u16) -> Self {
        AttrSpec::Handle(handle)
    }
}

impl From<Uuid> for AttrSpec {
    fn from(uuid: Uuid) -> Self {
        AttrSpec::Uuid(uuid)
    }
}

impl From<&Characteristic> for AttrSpec {
    fn from(characteristic: &Characteristic) -> Self {
        AttrSpec::Handle(characteristic.handle)
    }
}

impl TryFrom<&str> for AttrSpec {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Ok(AttrSpec::Uuid(bleuuid::parse_uuid(s)?))
    }
}

impl From<Infallible> for Error {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

/// Synchronous detection callback: `(device, advertisement)` for every
/// reported observation. Must not block the executor.
pub type DetectionCallback = Box<dyn Fn(&BleDevice, &AdvertisementData) + Send + Sync>;

/// Asynchronous detection callback; the scanner spawns the returned future
/// as a task and lets it run to completion.
pub type AsyncDetectionCallback =
    Box<dyn Fn(BleDevice, AdvertisementData) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-characteristic notification callback, invoked once per notification
/// with the raw value, in OS delivery order.
pub type NotificationCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Callback for transitions out of the connected state.
pub type DisconnectedCallback = Box<dyn Fn() + Send + Sync>;

/// The four canonical I/O-capability callbacks a pairing flow may need.
///
/// The default implementations accept numeric comparison and decline PIN
/// entry, which matches what the OS dialogs do when nobody is watching.
#[async_trait]
pub trait PairingAgent: Send + Sync {
    /// Yes/no confirmation ("just works" or numeric comparison without a
    /// display).
    async fn confirm(&self, device: &BleDevice) -> Result<bool> {
        let _ = device;
        Ok(true)
    }

    /// Numeric comparison: both sides display `pin`, the user confirms they
    /// match.
    async fn confirm_pin(&self, device: &BleDevice, pin: &str) -> Result<bool> {
        let _ = (device, pin);
        Ok(true)
    }

    /// Display `pin` for entry on the remote device. Returns once shown; the
    /// backend cancels the display when pairing completes or fails.
    async fn display_pin(&self, device: &BleDevice, pin: &str) -> Result<()> {
        let _ = (device, pin);
        Ok(())
    }

    /// Ask the user to type the PIN shown by the remote device. `None`
    /// cancels the pairing.
    async fn request_pin(&self, device: &BleDevice) -> Result<Option<String>> {
        let _ = device;
        Ok(None)
    }
}

/// The agent used when a client is constructed without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInputNoOutputAgent;

#[async_trait]
impl PairingAgent for NoInputNoOutputAgent {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;

    fn populated() -> AdvertisementData {
        AdvertisementData {
            local_name: Some("thermometer".into()),
            manufacturer_data: HashMap::from([(0x004c, vec![1, 2, 3])]),
            service_data: HashMap::from([(uuid_from_u16(0x180f), vec![0x64])]),
            service_uuids: vec![uuid_from_u16(0x180f)],
            tx_power: Some(4),
            rssi: Some(-60),
            platform_data: None,
        }
    }

    #[test]
    fn merge_empty_is_identity() {
        let mut adv = populated();
        let before = adv.clone();
        adv.merge(&AdvertisementData::default());
        assert_eq!(adv, before);
    }

    #[test]
    fn merge_newer_fields_win() {
        let mut adv = populated();
        let scan_response = AdvertisementData {
            local_name: Some("thermometer pro".into()),
            rssi: Some(-58),
            ..Default::default()
        };
        adv.merge(&scan_response);
        assert_eq!(adv.local_name.as_deref(), Some("thermometer pro"));
        assert_eq!(adv.rssi, Some(-58));
        // untouched fields survive
        assert_eq!(adv.tx_power, Some(4));
        assert_eq!(adv.service_uuids, vec![uuid_from_u16(0x180f)]);
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(AdvertisementData::default().matches_service_filter(&[]));
        assert!(populated().matches_service_filter(&[]));
    }

    #[test]
    fn filter_drops_advertisements_without_uuids() {
        let filter = [uuid_from_u16(0x180f)];
        assert!(!AdvertisementData::default().matches_service_filter(&filter));
        assert!(populated().matches_service_filter(&filter));
        assert!(!populated().matches_service_filter(&[uuid_from_u16(0x1801)]));
    }

    #[test]
    fn property_names_round_trip() {
        let props = CharPropFlags::READ | CharPropFlags::NOTIFY | CharPropFlags::RELIABLE_WRITE;
        assert_eq!(props.names(), vec!["read", "notify", "reliable-write"]);
        for name in props.names() {
            assert!(props.contains(CharPropFlags::from_property_name(name).unwrap()));
        }
        assert_eq!(CharPropFlags::from_property_name("encrypt-read"), None);
    }

    #[test]
    fn attr_spec_conversions() {
        assert_eq!(AttrSpec::from(0x000bu16), AttrSpec::Handle(0x000b));
        let uuid = uuid_from_u16(0x2a00);
        assert_eq!(AttrSpec::from(uuid), AttrSpec::Uuid(uuid));
        assert_eq!(AttrSpec::try_from("2a00").unwrap(), AttrSpec::Uuid(uuid));
        assert!(AttrSpec::try_from("not-a-uuid").is_err());
    }
}
