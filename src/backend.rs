//! The contract between the portable façades and the per-OS backends.
//!
//! A backend owns the OS handles and threads; the façade owns all portable
//! state. Backends never call application callbacks themselves: they push
//! events into the channel handed to them at construction, and the façade's
//! dispatcher task (the only code that touches core state) drains it. The
//! façades hold backends as boxed trait objects chosen by
//! [`crate::platform`].

use crate::api::gatt::ServiceCollection;
use crate::api::{AdvertisementData, BleDevice};
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One raw advertisement sighting, as decoded by a scanner backend. The
/// core re-filters and deduplicates; backends report everything the OS
/// hands them.
#[derive(Debug, Clone)]
pub(crate) struct RawAdvertisement {
    pub device: BleDevice,
    pub data: AdvertisementData,
}

pub(crate) type ScannerEventSender = mpsc::UnboundedSender<RawAdvertisement>;
pub(crate) type ScannerEventReceiver = mpsc::UnboundedReceiver<RawAdvertisement>;

/// An event a client backend posts to its façade.
#[derive(Debug, Clone)]
pub(crate) enum ClientEvent {
    /// A notification or indication arrived for the characteristic with the
    /// given handle. Per-characteristic ordering follows OS delivery order.
    Notification { handle: u16, value: Vec<u8> },
    /// The OS reported the link dropped without a local `disconnect()`.
    UnsolicitedDisconnect,
}

pub(crate) type ClientEventSender = mpsc::UnboundedSender<ClientEvent>;
pub(crate) type ClientEventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Discovery driver implemented per OS. Created by the platform factory at
/// `Scanner::start()`; dropped at `stop()`.
#[async_trait]
pub(crate) trait ScannerBackend: Send + Sync {
    /// Begins OS-level discovery. The backend applies whatever subset of
    /// the scanner's filter the OS supports; the core re-filters anyway.
    async fn start(&self) -> Result<()>;

    /// Ends OS-level discovery. Must be safe to call more than once.
    async fn stop(&self) -> Result<()>;
}

/// Connection and GATT I/O driver implemented per OS. Created by the
/// platform factory when `Client::connect()` has resolved its target device.
#[async_trait]
pub(crate) trait ClientBackend: Send + Sync {
    /// Opens the OS-level connection, negotiates MTU where the OS exposes a
    /// knob, discovers the full GATT tree, and returns it. On failure every
    /// partially acquired OS resource is released before the error returns.
    async fn connect(&self, pair: bool) -> Result<ServiceCollection>;

    /// Triggers the OS disconnect and releases backend handles. Pending
    /// operation futures are failed with `Disconnected`. Safe to call when
    /// not connected.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the OS still considers the link up.
    async fn is_connected(&self) -> bool;

    /// The negotiated ATT MTU, or the 23-byte default where the OS hides it.
    fn mtu_size(&self) -> usize;

    /// Reads a characteristic value. `use_cached` asks the OS for its cached
    /// value without touching the device, on OSes that keep one.
    async fn read_char(&self, handle: u16, use_cached: bool) -> Result<Vec<u8>>;

    /// Writes a characteristic value in the given mode. The façade has
    /// already reconciled the mode against the characteristic properties.
    async fn write_char(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()>;

    async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>>;

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()>;

    /// Performs the CCCD write enabling notifications (or indications when
    /// `indicate`). `use_acquire` selects the BlueZ file-descriptor fast
    /// path; other backends ignore it.
    async fn start_notify(&self, handle: u16, indicate: bool, use_acquire: bool) -> Result<()>;

    /// Performs the CCCD write disabling value pushes for the handle.
    async fn stop_notify(&self, handle: u16) -> Result<()>;

    async fn pair(&self) -> Result<()>;

    async fn unpair(&self) -> Result<()>;

    /// The OS-resolved device name, when the OS keeps one.
    async fn name(&self) -> Result<Option<String>>;
}
