//! The client façade: connection lifecycle, GATT I/O, notifications, and
//! pairing against a single peripheral.
//!
//! All portable state (the connection state machine, the discovered service
//! tree, the notification callback table) lives here; the backend owns only
//! OS handles. Backend events arrive over a channel and are applied by a
//! dispatcher task, so OS threads never touch this state directly.

use crate::api::gatt::ServiceCollection;
use crate::api::{
    AttrSpec, BleDevice, CharPropFlags, ClientOptions, DisconnectedCallback, NoInputNoOutputAgent,
    NotificationCallback, NotifyOptions, PairingAgent,
};
use crate::backend::{ClientBackend, ClientEvent, ClientEventReceiver, ClientEventSender};
use crate::scanner::Scanner;
use crate::{Error, Result};
use futures::future::BoxFuture;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Connection lifecycle states. Transitions are serialized; `Connecting` and
/// `Disconnecting` are only observable from other tasks while a transition
/// is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Backend-facing configuration extracted from [`ClientOptions`].
#[derive(Clone)]
pub(crate) struct ClientConfig {
    /// Restrict service discovery to these UUIDs when non-empty.
    pub services: Vec<Uuid>,
    /// Agent consulted by OS pairing flows.
    pub agent: Arc<dyn PairingAgent>,
}

pub(crate) type ClientBackendFactory = Box<
    dyn Fn(
            BleDevice,
            ClientConfig,
            ClientEventSender,
        ) -> BoxFuture<'static, Result<Box<dyn ClientBackend>>>
        + Send
        + Sync,
>;

enum Target {
    Device(BleDevice),
    Address(String),
}

struct Connection {
    backend: Arc<dyn ClientBackend>,
    // Detached on drop; the dispatcher ends when the backend closes its
    // event sender.
    _dispatcher: tokio::task::JoinHandle<()>,
    disconnect_fired: Arc<AtomicBool>,
}

struct Shared {
    state: Mutex<ConnectionState>,
    connection: Mutex<Option<Connection>>,
    services: Mutex<Option<ServiceCollection>>,
    notify_callbacks: Mutex<HashMap<u16, Arc<NotificationCallback>>>,
    disconnected_callback: Mutex<Option<DisconnectedCallback>>,
}

impl Shared {
    /// Clears per-connection state. The disconnected callback is not fired
    /// here; each path owns that through [`Shared::fire_disconnected`].
    fn teardown(&self) {
        *self.services.lock().unwrap() = None;
        self.notify_callbacks.lock().unwrap().clear();
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
    }

    fn fire_disconnected(&self, fired: &AtomicBool) {
        if !fired.swap(true, Ordering::SeqCst) {
            if let Some(callback) = self.disconnected_callback.lock().unwrap().as_ref() {
                callback();
            }
        }
    }
}

/// A connection to one BLE peripheral: GATT discovery, reads, writes,
/// notifications, and pairing.
///
/// Construct from a [`BleDevice`] produced by a [`Scanner`], or from a bare
/// address (which costs a scan-based lookup inside `connect`).
pub struct Client {
    target: Target,
    timeout: Duration,
    config: ClientConfig,
    factory: ClientBackendFactory,
    shared: Arc<Shared>,
    // Serializes connect/disconnect transitions.
    transition: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match &self.target {
            Target::Device(device) => device.address.clone(),
            Target::Address(address) => address.clone(),
        };
        f.debug_struct("Client")
            .field("target", &target)
            .field("state", &self.state())
            .finish()
    }
}

impl Client {
    /// Creates a client for a device discovered by a scanner.
    pub fn new(device: BleDevice) -> Self {
        Self::with_options(device, ClientOptions::default())
    }

    pub fn with_options(device: BleDevice, options: ClientOptions) -> Self {
        Self::build(Target::Device(device), options, platform_factory())
    }

    /// Creates a client from an OS address. `connect` will first locate the
    /// device with a scan, failing with [`Error::DeviceNotFound`] if it is
    /// not advertising.
    pub fn from_address(address: impl Into<String>) -> Self {
        Self::from_address_with_options(address, ClientOptions::default())
    }

    pub fn from_address_with_options(address: impl Into<String>, options: ClientOptions) -> Self {
        Self::build(Target::Address(address.into()), options, platform_factory())
    }

    fn build(target: Target, options: ClientOptions, factory: ClientBackendFactory) -> Self {
        let ClientOptions {
            timeout,
            disconnected_callback,
            services,
            pairing_agent,
        } = options;
        Client {
            target,
            timeout,
            config: ClientConfig {
                services,
                agent: pairing_agent.unwrap_or_else(|| Arc::new(NoInputNoOutputAgent)),
            },
            factory,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                connection: Mutex::new(None),
                services: Mutex::new(None),
                notify_callbacks: Mutex::new(HashMap::new()),
                disconnected_callback: Mutex::new(disconnected_callback),
            }),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_factory(target_device: BleDevice, options: ClientOptions, factory: ClientBackendFactory) -> Self {
        Self::build(Target::Device(target_device), options, factory)
    }

    /// Replaces the disconnected callback.
    pub fn set_disconnected_callback(&self, callback: Option<DisconnectedCallback>) {
        *self.shared.disconnected_callback.lock().unwrap() = callback;
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    /// `true` iff the state is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connects without pairing. See [`connect_and_pair`](Client::connect_and_pair).
    pub async fn connect(&self) -> Result<()> {
        self.connect_inner(false).await
    }

    /// Connects, running the OS pairing flow where the backend supports
    /// pairing on connect (before the link opens where the OS allows it,
    /// after otherwise).
    ///
    /// The whole sequence — device lookup for address-constructed clients,
    /// the OS connection, MTU negotiation, and service discovery — is
    /// bounded by the client timeout; on expiry pending OS operations are
    /// abandoned, partial state is released, and [`Error::TimedOut`]
    /// returns.
    pub async fn connect_and_pair(&self) -> Result<()> {
        self.connect_inner(true).await
    }

    async fn connect_inner(&self, pair: bool) -> Result<()> {
        let _transition = self.transition.lock().await;
        if self.shared.connection.lock().unwrap().is_some() {
            return Err(Error::InvalidState("already connected".into()));
        }
        *self.shared.state.lock().unwrap() = ConnectionState::Connecting;

        // The backend lands in this slot as soon as it exists so that the
        // timeout arm can still release partially acquired OS state.
        let slot: Arc<Mutex<Option<Arc<dyn ClientBackend>>>> = Arc::new(Mutex::new(None));
        let attempt = tokio::time::timeout(self.timeout, self.do_connect(pair, &slot)).await;

        match attempt {
            Ok(Ok(())) => {
                *self.shared.state.lock().unwrap() = ConnectionState::Connected;
                Ok(())
            }
            Ok(Err(err)) => {
                self.abandon_connect(&slot).await;
                Err(err)
            }
            Err(_elapsed) => {
                debug!("connect timed out after {:?}", self.timeout);
                self.abandon_connect(&slot).await;
                Err(Error::TimedOut)
            }
        }
    }

    async fn abandon_connect(&self, slot: &Arc<Mutex<Option<Arc<dyn ClientBackend>>>>) {
        let backend = slot.lock().unwrap().take();
        if let Some(backend) = backend {
            if let Err(err) = backend.disconnect().await {
                warn!("cleanup after failed connect: {err}");
            }
        }
        self.shared.connection.lock().unwrap().take();
        self.shared.teardown();
    }

    async fn do_connect(
        &self,
        pair: bool,
        slot: &Arc<Mutex<Option<Arc<dyn ClientBackend>>>>,
    ) -> Result<()> {
        let device = match &self.target {
            Target::Device(device) => device.clone(),
            Target::Address(address) => {
                Scanner::find_device_by_address(address, self.timeout)
                    .await?
                    .ok_or(Error::DeviceNotFound)?
            }
        };

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let backend: Arc<dyn ClientBackend> =
            Arc::from((self.factory)(device, self.config.clone(), tx).await?);
        *slot.lock().unwrap() = Some(backend.clone());

        let mut collection = backend.connect(pair).await?;
        collection.set_mtu(backend.mtu_size());

        let disconnect_fired = Arc::new(AtomicBool::new(false));
        let dispatcher = tokio::spawn(dispatch(
            self.shared.clone(),
            rx,
            disconnect_fired.clone(),
        ));

        *self.shared.services.lock().unwrap() = Some(collection);
        *self.shared.connection.lock().unwrap() = Some(Connection {
            backend,
            _dispatcher: dispatcher,
            disconnect_fired,
        });
        Ok(())
    }

    /// Disconnects and releases all per-connection state. A no-op when
    /// already disconnected. The disconnected callback runs exactly once
    /// per connection, whichever of this method or an unsolicited OS
    /// disconnect gets there first.
    pub async fn disconnect(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let connection = self.shared.connection.lock().unwrap().take();
        let Some(connection) = connection else {
            return Ok(());
        };
        *self.shared.state.lock().unwrap() = ConnectionState::Disconnecting;

        let result = connection.backend.disconnect().await;
        self.shared.teardown();
        self.shared.fire_disconnected(&connection.disconnect_fired);
        result
    }

    /// The discovered GATT tree, present iff connected.
    pub fn services(&self) -> Option<ServiceCollection> {
        self.shared.services.lock().unwrap().clone()
    }

    /// The negotiated ATT MTU of the live connection.
    pub fn mtu_size(&self) -> Result<usize> {
        Ok(self.backend()?.mtu_size())
    }

    /// The OS-resolved name of the peripheral.
    pub async fn name(&self) -> Result<Option<String>> {
        self.backend()?.name().await
    }

    /// Reads a characteristic from the device.
    pub async fn read_gatt_char<S>(&self, spec: S) -> Result<Vec<u8>>
    where
        S: TryInto<AttrSpec>,
        S::Error: Into<Error>,
    {
        self.read_char_inner(spec, false).await
    }

    /// Reads a characteristic, allowing the OS to answer from its cached
    /// value without touching the device. BlueZ keeps no such cache and
    /// always reads fresh.
    pub async fn read_gatt_char_cached<S>(&self, spec: S) -> Result<Vec<u8>>
    where
        S: TryInto<AttrSpec>,
        S::Error: Into<Error>,
    {
        self.read_char_inner(spec, true).await
    }

    async fn read_char_inner<S>(&self, spec: S, use_cached: bool) -> Result<Vec<u8>>
    where
        S: TryInto<AttrSpec>,
        S::Error: Into<Error>,
    {
        let backend = self.backend()?;
        let handle = self.resolve_characteristic(spec)?.0;
        backend.read_char(handle, use_cached).await
    }

    /// Writes a characteristic. `response` selects write-with-response; the
    /// mode is reconciled against the characteristic properties: an
    /// unsupported requested mode falls back (with a warning) or upgrades to
    /// the supported one, and if the characteristic supports neither mode
    /// the write fails with [`Error::NotSupported`].
    ///
    /// Payloads larger than MTU − 3 are legal with `response = true` (the OS
    /// performs a long write); without response the outcome is OS-specific
    /// (BlueZ reports an error from the daemon, CoreBluetooth truncates,
    /// WinRT reports a protocol error).
    pub async fn write_gatt_char<S>(&self, spec: S, data: &[u8], response: bool) -> Result<()>
    where
        S: TryInto<AttrSpec>,
        S::Error: Into<Error>,
    {
        let backend = self.backend()?;
        let (handle, properties, uuid) = self.resolve_characteristic(spec)?;

        let has_write = properties.contains(CharPropFlags::WRITE);
        let has_command = properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE);
        let response = match (response, has_write, has_command) {
            (true, true, _) => true,
            (true, false, true) => {
                warn!(
                    "characteristic {uuid} does not support write with response, \
                     falling back to write without response"
                );
                false
            }
            (false, _, true) => false,
            (false, true, false) => {
                warn!(
                    "characteristic {uuid} does not support write without response, \
                     upgrading to write with response"
                );
                true
            }
            _ => {
                return Err(Error::NotSupported(format!(
                    "characteristic {uuid} supports no write mode"
                )))
            }
        };

        backend.write_char(handle, data, response).await
    }

    /// Reads a descriptor by handle.
    ///
    /// Descriptors are addressed by handle only. (Android's Java API does
    /// not expose descriptor handles at all; ports on top of it fabricate
    /// them from the characteristic handle plus an index, which is not
    /// guaranteed unique on every peripheral.)
    pub async fn read_gatt_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        let backend = self.backend()?;
        self.with_services(|services| services.descriptor(handle).map(|_| ()))?;
        backend.read_descriptor(handle).await
    }

    /// Writes a descriptor by handle.
    pub async fn write_gatt_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let backend = self.backend()?;
        self.with_services(|services| services.descriptor(handle).map(|_| ()))?;
        backend.write_descriptor(handle, data).await
    }

    /// Subscribes to value pushes from a characteristic. `callback` runs on
    /// the client's dispatcher, once per notification, in OS delivery order.
    /// Subscribing to an already subscribed characteristic replaces the
    /// callback without touching the CCCD.
    ///
    /// Notifications are preferred over indications unless only indications
    /// are supported or [`NotifyOptions::force_indicate`] is set.
    pub async fn start_notify<S>(
        &self,
        spec: S,
        callback: NotificationCallback,
        options: NotifyOptions,
    ) -> Result<()>
    where
        S: TryInto<AttrSpec>,
        S::Error: Into<Error>,
    {
        let backend = self.backend()?;
        let (handle, properties, uuid) = self.resolve_characteristic(spec)?;

        let has_notify = properties.contains(CharPropFlags::NOTIFY);
        let has_indicate = properties.contains(CharPropFlags::INDICATE);
        if !has_notify && !has_indicate {
            return Err(Error::NotSupported(format!(
                "characteristic {uuid} supports neither notify nor indicate"
            )));
        }
        let indicate = options.force_indicate || !has_notify;

        // Install the callback before the CCCD write: a peripheral may push
        // its first notification before the write acknowledges, and that
        // value must be delivered.
        let replaced = self
            .shared
            .notify_callbacks
            .lock()
            .unwrap()
            .insert(handle, Arc::new(callback))
            .is_some();
        if replaced {
            trace!("replaced notification callback for handle {handle:#06x}");
            return Ok(());
        }

        if let Err(err) = backend
            .start_notify(handle, indicate, options.use_acquire)
            .await
        {
            self.shared.notify_callbacks.lock().unwrap().remove(&handle);
            return Err(err);
        }
        Ok(())
    }

    /// Disables value pushes and removes the callback. Fails with
    /// [`Error::InvalidState`] when the characteristic is not subscribed.
    /// Subscriptions need not be stopped before disconnecting; they die
    /// with the connection.
    pub async fn stop_notify<S>(&self, spec: S) -> Result<()>
    where
        S: TryInto<AttrSpec>,
        S::Error: Into<Error>,
    {
        let backend = self.backend()?;
        let (handle, _, uuid) = self.resolve_characteristic(spec)?;
        if self
            .shared
            .notify_callbacks
            .lock()
            .unwrap()
            .remove(&handle)
            .is_none()
        {
            return Err(Error::InvalidState(format!(
                "characteristic {uuid} is not subscribed"
            )));
        }
        backend.stop_notify(handle).await
    }

    /// Runs the OS pairing flow for the connected device, consulting the
    /// configured [`PairingAgent`]. On CoreBluetooth this is a logged no-op:
    /// macOS pairs on demand when an encrypted attribute is first touched.
    pub async fn pair(&self) -> Result<()> {
        self.backend()?.pair().await
    }

    /// Removes the OS bond for the device.
    pub async fn unpair(&self) -> Result<()> {
        self.backend()?.unpair().await
    }

    fn backend(&self) -> Result<Arc<dyn ClientBackend>> {
        self.shared
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|connection| connection.backend.clone())
            .ok_or(Error::Disconnected)
    }

    fn with_services<T>(&self, f: impl FnOnce(&ServiceCollection) -> Result<T>) -> Result<T> {
        let services = self.shared.services.lock().unwrap();
        match services.as_ref() {
            Some(services) => f(services),
            None => Err(Error::Disconnected),
        }
    }

    fn resolve_characteristic<S>(&self, spec: S) -> Result<(u16, CharPropFlags, Uuid)>
    where
        S: TryInto<AttrSpec>,
        S::Error: Into<Error>,
    {
        let spec = spec.try_into().map_err(Into::into)?;
        self.with_services(|services| {
            let characteristic = services.characteristic(spec)?;
            Ok((
                characteristic.handle,
                characteristic.properties,
                characteristic.uuid,
            ))
        })
    }
}

fn platform_factory() -> ClientBackendFactory {
    Box::new(crate::platform::client_backend)
}

async fn dispatch(shared: Arc<Shared>, mut events: ClientEventReceiver, fired: Arc<AtomicBool>) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Notification { handle, value } => {
                let callback = shared.notify_callbacks.lock().unwrap().get(&handle).cloned();
                match callback {
                    Some(callback) => callback(value),
                    None => trace!("notification for unsubscribed handle {handle:#06x}"),
                }
            }
            ClientEvent::UnsolicitedDisconnect => {
                // Only tear down the connection this dispatcher belongs to;
                // a late event must not touch a newer connection.
                let mut slot = shared.connection.lock().unwrap();
                let is_current = slot
                    .as_ref()
                    .map(|connection| Arc::ptr_eq(&connection.disconnect_fired, &fired))
                    .unwrap_or(false);
                if is_current {
                    debug!("device disconnected unexpectedly");
                    slot.take();
                    drop(slot);
                    shared.teardown();
                    shared.fire_disconnected(&fired);
                } else {
                    drop(slot);
                    trace!("stale disconnect event ignored");
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;
    use crate::api::gatt::Characteristic;
    use crate::api::gatt::Descriptor;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct BackendLog {
        writes: Mutex<Vec<(u16, Vec<u8>, bool)>>,
        notify_starts: Mutex<Vec<(u16, bool, bool)>>,
        notify_stops: Mutex<Vec<u16>>,
        disconnects: AtomicUsize,
        connect_failure: Mutex<Option<Error>>,
        connect_delay: Mutex<Option<Duration>>,
    }

    struct MockClientBackend {
        log: Arc<BackendLog>,
        collection: Mutex<Option<ServiceCollection>>,
    }

    fn sample_collection() -> ServiceCollection {
        let mut collection = ServiceCollection::new();
        collection.add_service(0x0010, uuid_from_u16(0x180f)).unwrap();
        collection
            .add_characteristic(Characteristic::new(
                0x0012,
                uuid_from_u16(0x2a19),
                CharPropFlags::READ | CharPropFlags::NOTIFY,
                0x0010,
            ))
            .unwrap();
        collection
            .add_characteristic(Characteristic::new(
                0x0014,
                uuid_from_u16(0x2a1a),
                CharPropFlags::WRITE,
                0x0010,
            ))
            .unwrap();
        collection
            .add_characteristic(Characteristic::new(
                0x0016,
                uuid_from_u16(0x2a1b),
                CharPropFlags::WRITE_WITHOUT_RESPONSE,
                0x0010,
            ))
            .unwrap();
        collection
            .add_characteristic(Characteristic::new(
                0x0018,
                uuid_from_u16(0x2a1c),
                CharPropFlags::BROADCAST,
                0x0010,
            ))
            .unwrap();
        collection
            .add_descriptor(Descriptor {
                handle: 0x0013,
                uuid: uuid_from_u16(0x2902),
                characteristic_handle: 0x0012,
            })
            .unwrap();
        collection
    }

    #[async_trait]
    impl ClientBackend for MockClientBackend {
        async fn connect(&self, _pair: bool) -> Result<ServiceCollection> {
            let delay = *self.log.connect_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.log.connect_failure.lock().unwrap().take() {
                return Err(err);
            }
            Ok(self.collection.lock().unwrap().take().unwrap_or_else(sample_collection))
        }

        async fn disconnect(&self) -> Result<()> {
            self.log.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            true
        }

        fn mtu_size(&self) -> usize {
            247
        }

        async fn read_char(&self, handle: u16, use_cached: bool) -> Result<Vec<u8>> {
            let _ = use_cached;
            Ok(vec![handle as u8])
        }

        async fn write_char(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
            self.log
                .writes
                .lock()
                .unwrap()
                .push((handle, data.to_vec(), with_response));
            Ok(())
        }

        async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
            Ok(vec![handle as u8, 0])
        }

        async fn write_descriptor(&self, _handle: u16, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn start_notify(&self, handle: u16, indicate: bool, use_acquire: bool) -> Result<()> {
            self.log
                .notify_starts
                .lock()
                .unwrap()
                .push((handle, indicate, use_acquire));
            Ok(())
        }

        async fn stop_notify(&self, handle: u16) -> Result<()> {
            self.log.notify_stops.lock().unwrap().push(handle);
            Ok(())
        }

        async fn pair(&self) -> Result<()> {
            Ok(())
        }

        async fn unpair(&self) -> Result<()> {
            Ok(())
        }

        async fn name(&self) -> Result<Option<String>> {
            Ok(Some("mock".into()))
        }
    }

    struct Harness {
        client: Client,
        log: Arc<BackendLog>,
        sender: Arc<Mutex<Option<ClientEventSender>>>,
    }

    fn device() -> BleDevice {
        BleDevice {
            address: "AA:BB:CC:DD:EE:FF".into(),
            name: Some("mock".into()),
            details: "/mock/dev_AA_BB_CC_DD_EE_FF".into(),
        }
    }

    fn harness(options: ClientOptions) -> Harness {
        let log = Arc::new(BackendLog::default());
        let sender = Arc::new(Mutex::new(None));
        let factory_log = log.clone();
        let factory_sender = sender.clone();
        let client = Client::with_factory(
            device(),
            options,
            Box::new(move |_, _, tx| {
                *factory_sender.lock().unwrap() = Some(tx);
                let backend: Box<dyn ClientBackend> = Box::new(MockClientBackend {
                    log: factory_log.clone(),
                    collection: Mutex::new(None),
                });
                Box::pin(async move { Ok(backend) })
            }),
        );
        Harness {
            client,
            log,
            sender,
        }
    }

    impl Harness {
        fn emit(&self, event: ClientEvent) {
            self.sender
                .lock()
                .unwrap()
                .as_ref()
                .expect("not connected")
                .send(event)
                .unwrap();
        }

        async fn settle(&self) {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn connect_disconnect_state_machine() {
        let h = harness(ClientOptions::default());
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert!(!h.client.is_connected());
        assert!(h.client.services().is_none());

        h.client.connect().await.unwrap();
        assert!(h.client.is_connected());
        assert!(h.client.services().is_some());
        assert_eq!(h.client.mtu_size().unwrap(), 247);

        assert!(matches!(
            h.client.connect().await,
            Err(Error::InvalidState(_))
        ));

        h.client.disconnect().await.unwrap();
        assert!(!h.client.is_connected());
        assert!(h.client.services().is_none());

        // disconnect from disconnected is a no-op success
        h.client.disconnect().await.unwrap();
        assert_eq!(h.log.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_connect_releases_partial_state() {
        let h = harness(ClientOptions::default());
        *h.log.connect_failure.lock().unwrap() = Some(Error::os("link setup failed"));
        assert!(h.client.connect().await.is_err());
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert!(h.client.services().is_none());
        // cleanup ran against the backend
        assert_eq!(h.log.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_timeout_cleans_up() {
        let h = harness(ClientOptions {
            timeout: Duration::from_millis(20),
            ..Default::default()
        });
        *h.log.connect_delay.lock().unwrap() = Some(Duration::from_secs(5));
        assert!(matches!(h.client.connect().await, Err(Error::TimedOut)));
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert_eq!(h.log.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mtu_is_applied_to_collection() {
        let h = harness(ClientOptions::default());
        h.client.connect().await.unwrap();
        let services = h.client.services().unwrap();
        let characteristic = services.characteristic(uuid_from_u16(0x2a19)).unwrap();
        assert_eq!(characteristic.max_write_without_response(), 244);
        h.client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn read_by_uuid_handle_and_string() {
        let h = harness(ClientOptions::default());
        h.client.connect().await.unwrap();
        assert_eq!(h.client.read_gatt_char(0x0012u16).await.unwrap(), vec![0x12]);
        assert_eq!(
            h.client.read_gatt_char(uuid_from_u16(0x2a19)).await.unwrap(),
            vec![0x12]
        );
        assert_eq!(h.client.read_gatt_char("2a19").await.unwrap(), vec![0x12]);
        assert!(matches!(
            h.client.read_gatt_char("2aff").await,
            Err(Error::CharacteristicNotFound(_))
        ));
        assert!(matches!(
            h.client.read_gatt_char("bogus").await,
            Err(Error::InvalidUuid(_))
        ));
        h.client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn io_fails_when_disconnected() {
        let h = harness(ClientOptions::default());
        assert!(matches!(
            h.client.read_gatt_char(0x0012u16).await,
            Err(Error::Disconnected)
        ));
        assert!(matches!(
            h.client.write_gatt_char(0x0014u16, b"x", true).await,
            Err(Error::Disconnected)
        ));
    }

    #[tokio::test]
    async fn write_mode_reconciliation() {
        let h = harness(ClientOptions::default());
        h.client.connect().await.unwrap();

        // straightforward request
        h.client.write_gatt_char(0x0014u16, b"DATA", true).await.unwrap();
        // requested response on a command-only characteristic: falls back
        h.client.write_gatt_char(0x0016u16, b"DATA", true).await.unwrap();
        // requested command on a request-only characteristic: upgrades
        h.client.write_gatt_char(0x0014u16, b"DATA", false).await.unwrap();
        // zero-length write is legal when the mode is supported
        h.client.write_gatt_char(0x0016u16, b"", false).await.unwrap();
        // no write support at all
        assert!(matches!(
            h.client.write_gatt_char(0x0018u16, b"DATA", true).await,
            Err(Error::NotSupported(_))
        ));

        let writes = h.log.writes.lock().unwrap();
        assert_eq!(
            *writes,
            vec![
                (0x0014, b"DATA".to_vec(), true),
                (0x0016, b"DATA".to_vec(), false),
                (0x0014, b"DATA".to_vec(), true),
                (0x0016, Vec::new(), false),
            ]
        );
    }

    #[tokio::test]
    async fn notifications_are_delivered_in_order() {
        let h = harness(ClientOptions::default());
        h.client.connect().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        h.client
            .start_notify(
                0x0012u16,
                Box::new(move |value| sink.lock().unwrap().push(value)),
                NotifyOptions::default(),
            )
            .await
            .unwrap();

        h.emit(ClientEvent::Notification {
            handle: 0x0012,
            value: b"1234".to_vec(),
        });
        h.emit(ClientEvent::Notification {
            handle: 0x0012,
            value: b"2345".to_vec(),
        });
        h.settle().await;
        assert_eq!(
            *received.lock().unwrap(),
            vec![b"1234".to_vec(), b"2345".to_vec()]
        );

        h.client.stop_notify(0x0012u16).await.unwrap();
        h.emit(ClientEvent::Notification {
            handle: 0x0012,
            value: b"3456".to_vec(),
        });
        h.settle().await;
        assert_eq!(received.lock().unwrap().len(), 2);
        assert_eq!(*h.log.notify_stops.lock().unwrap(), vec![0x0012]);
    }

    #[tokio::test]
    async fn resubscribe_replaces_callback_without_second_cccd_write() {
        let h = harness(ClientOptions::default());
        h.client.connect().await.unwrap();

        let first = Arc::new(Mutex::new(Vec::new()));
        let sink = first.clone();
        h.client
            .start_notify(
                0x0012u16,
                Box::new(move |value| sink.lock().unwrap().push(value)),
                NotifyOptions::default(),
            )
            .await
            .unwrap();

        let second = Arc::new(Mutex::new(Vec::new()));
        let sink = second.clone();
        h.client
            .start_notify(
                0x0012u16,
                Box::new(move |value| sink.lock().unwrap().push(value)),
                NotifyOptions::default(),
            )
            .await
            .unwrap();

        h.emit(ClientEvent::Notification {
            handle: 0x0012,
            value: b"x".to_vec(),
        });
        h.settle().await;
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
        assert_eq!(h.log.notify_starts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn notify_on_unsupported_characteristic() {
        let h = harness(ClientOptions::default());
        h.client.connect().await.unwrap();
        let result = h
            .client
            .start_notify(0x0014u16, Box::new(|_| {}), NotifyOptions::default())
            .await;
        assert!(matches!(result, Err(Error::NotSupported(_))));
    }

    #[tokio::test]
    async fn stop_notify_when_not_subscribed_is_an_error() {
        let h = harness(ClientOptions::default());
        h.client.connect().await.unwrap();
        assert!(matches!(
            h.client.stop_notify(0x0012u16).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn disconnected_callback_fires_once_for_explicit_disconnect() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let h = harness(ClientOptions {
            disconnected_callback: Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });

        // not fired for a failed connect
        *h.log.connect_failure.lock().unwrap() = Some(Error::os("nope"));
        assert!(h.client.connect().await.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        h.client.connect().await.unwrap();
        h.client.disconnect().await.unwrap();
        h.client.disconnect().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnected_callback_fires_once_for_unsolicited_disconnect() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let h = harness(ClientOptions {
            disconnected_callback: Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        h.client.connect().await.unwrap();

        h.emit(ClientEvent::UnsolicitedDisconnect);
        h.settle().await;
        assert!(!h.client.is_connected());
        assert!(h.client.services().is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // a later explicit disconnect neither errors nor re-fires
        h.client.disconnect().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn descriptor_io_checks_existence() {
        let h = harness(ClientOptions::default());
        h.client.connect().await.unwrap();
        assert_eq!(
            h.client.read_gatt_descriptor(0x0013).await.unwrap(),
            vec![0x13, 0]
        );
        assert!(matches!(
            h.client.read_gatt_descriptor(0x0099).await,
            Err(Error::DescriptorNotFound(_))
        ));
        h.client.write_gatt_descriptor(0x0013, &[1, 0]).await.unwrap();
    }
}
