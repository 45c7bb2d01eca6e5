//! Client backend over `CBPeripheral`.
//!
//! The peripheral is retrieved by the identifier UUID recorded during
//! scanning; connection, discovery, and every I/O method start an operation
//! on the peripheral and await the matching delegate completion through the
//! pending-operation registry.

use crate::api::gatt::{Characteristic, Descriptor, ServiceCollection, DEFAULT_MTU};
use crate::api::{BleDevice, CharPropFlags};
use crate::backend::{ClientBackend, ClientEvent, ClientEventSender};
use crate::client::ClientConfig;
use crate::corebluetooth::delegates::{
    CentralDelegate, CentralEvent, PeripheralDelegate, PeripheralEvent,
};
use crate::corebluetooth::internal::{await_op, wait_for_powered_on, OpKey, PendingOps};
use crate::corebluetooth::map_ns_error;
use crate::corebluetooth::types::{
    serial_queue, CBCentralManager, CBCharacteristic, CBCharacteristicWriteType, CBDescriptor,
    CBService, CBUUID,
};
use crate::{Error, Result};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use objc_foundation::{INSArray, NSArray};
use objc_id::{Id, ShareId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Default)]
struct Gatt {
    connected: bool,
    mtu: usize,
    services: HashMap<u16, ShareId<CBService>>,
    characteristics: HashMap<u16, ShareId<CBCharacteristic>>,
    descriptors: HashMap<u16, ShareId<CBDescriptor>>,
}

// Retained CoreBluetooth objects; messaged only, never dereferenced.
unsafe impl Send for Gatt {}
unsafe impl Sync for Gatt {}

pub(crate) struct CoreBluetoothClient {
    manager: Id<CBCentralManager>,
    _central_delegate: Id<CentralDelegate>,
    _peripheral_delegate: Id<PeripheralDelegate>,
    peripheral: ShareId<crate::corebluetooth::types::CBPeripheral>,
    config: ClientConfig,
    pending: Arc<PendingOps>,
    gatt: Arc<Mutex<Gatt>>,
    _pump: JoinHandle<()>,
}

unsafe impl Send for CoreBluetoothClient {}
unsafe impl Sync for CoreBluetoothClient {}

impl CoreBluetoothClient {
    pub(crate) async fn new(
        device: BleDevice,
        config: ClientConfig,
        events: ClientEventSender,
    ) -> Result<Self> {
        let identifier = Uuid::parse_str(&device.details)
            .map_err(|_| Error::InvalidUuid(device.details.clone()))?;

        let (central_tx, mut central_rx) = mpsc::unbounded_channel();
        let central_delegate = CentralDelegate::with_sender(central_tx);
        let queue = serial_queue(b"blecentral-client\0");
        let manager = CBCentralManager::with_delegate(&central_delegate, queue);

        wait_for_powered_on(&manager, &mut central_rx).await?;

        let peripheral = manager
            .retrieve_peripheral(identifier)
            .ok_or(Error::DeviceNotFound)?;

        let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();
        let peripheral_delegate = PeripheralDelegate::with_sender(peripheral_tx);
        peripheral.set_delegate(&peripheral_delegate);

        let pending = Arc::new(PendingOps::default());
        let gatt = Arc::new(Mutex::new(Gatt {
            mtu: DEFAULT_MTU,
            ..Default::default()
        }));

        let pump = tokio::spawn(pump(
            central_rx,
            peripheral_rx,
            pending.clone(),
            gatt.clone(),
            events,
        ));

        Ok(CoreBluetoothClient {
            manager,
            _central_delegate: central_delegate,
            _peripheral_delegate: peripheral_delegate,
            peripheral,
            config,
            pending,
            gatt,
            _pump: pump,
        })
    }

    fn characteristic(&self, handle: u16) -> Result<ShareId<CBCharacteristic>> {
        self.gatt
            .lock()
            .unwrap()
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound(format!("handle {handle:#06x}")))
    }

    fn descriptor(&self, handle: u16) -> Result<ShareId<CBDescriptor>> {
        self.gatt
            .lock()
            .unwrap()
            .descriptors
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::DescriptorNotFound(format!("handle {handle:#06x}")))
    }

    async fn discover_gatt_tree(&self) -> Result<ServiceCollection> {
        let services_done = self.pending.register(OpKey::ServicesDiscovered)?;
        let filter = if self.config.services.is_empty() {
            None
        } else {
            let uuids: Vec<Id<CBUUID>> = self
                .config
                .services
                .iter()
                .map(|&uuid| CBUUID::from_uuid(uuid))
                .collect();
            Some(NSArray::from_vec(uuids))
        };
        self.peripheral.discover_services(filter);
        await_op(services_done).await?;

        let services = self.peripheral.services();
        for service in &services {
            let characteristics_done = self
                .pending
                .register(OpKey::CharacteristicsDiscovered(service.handle()))?;
            self.peripheral.discover_characteristics(service);
            await_op(characteristics_done).await?;

            for characteristic in &service.characteristics() {
                let descriptors_done = self
                    .pending
                    .register(OpKey::DescriptorsDiscovered(characteristic.handle()))?;
                self.peripheral.discover_descriptors(characteristic);
                await_op(descriptors_done).await?;
            }
        }

        let mut collection = ServiceCollection::new();
        let mut gatt = self.gatt.lock().unwrap();
        gatt.services.clear();
        gatt.characteristics.clear();
        gatt.descriptors.clear();
        for service in services {
            let service_handle = service.handle();
            collection.add_service(service_handle, service.uuid())?;
            for characteristic in service.characteristics() {
                let handle = characteristic.handle();
                collection.add_characteristic(Characteristic::new(
                    handle,
                    characteristic.uuid(),
                    // CoreBluetooth's property bits follow the GATT layout.
                    CharPropFlags::from_bits_truncate(characteristic.properties() as u16),
                    service_handle,
                ))?;
                for descriptor in characteristic.descriptors() {
                    collection.add_descriptor(Descriptor {
                        handle: descriptor.handle(),
                        uuid: descriptor.uuid(),
                        characteristic_handle: handle,
                    })?;
                    gatt.descriptors.insert(descriptor.handle(), descriptor);
                }
                gatt.characteristics.insert(handle, characteristic);
            }
            gatt.services.insert(service_handle, service);
        }
        Ok(collection)
    }
}

#[async_trait]
impl ClientBackend for CoreBluetoothClient {
    async fn connect(&self, pair: bool) -> Result<ServiceCollection> {
        if pair {
            // macOS owns pairing; it prompts when an encrypted attribute is
            // first touched.
            info!("pairing on connect is not programmable on CoreBluetooth");
        }

        let connected = self.pending.register(OpKey::Connect)?;
        self.manager.connect_peripheral(&self.peripheral);
        await_op(connected).await?;
        debug!("connected to {}", self.peripheral.identifier());

        let collection = self.discover_gatt_tree().await?;

        let mtu = self
            .peripheral
            .maximum_write_value_length(CBCharacteristicWriteType::WithoutResponse)
            + 3;
        self.gatt.lock().unwrap().mtu = mtu;

        Ok(collection)
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.gatt.lock().unwrap().connected {
            // Also cancels a connection attempt still in flight; no
            // delegate callback is guaranteed for that case.
            self.manager.cancel_peripheral_connection(&self.peripheral);
            self.pending.fail_all();
            return Ok(());
        }
        let disconnected = self.pending.register(OpKey::Disconnect)?;
        self.manager.cancel_peripheral_connection(&self.peripheral);
        await_op(disconnected).await?;
        self.pending.fail_all();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.gatt.lock().unwrap().connected
    }

    fn mtu_size(&self) -> usize {
        self.gatt.lock().unwrap().mtu
    }

    async fn read_char(&self, handle: u16, use_cached: bool) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(handle)?;
        if use_cached {
            if let Some(value) = characteristic.value() {
                return Ok(value);
            }
        }
        let done = self.pending.register(OpKey::CharRead(handle))?;
        self.peripheral.read_characteristic_value(&characteristic);
        await_op(done).await
    }

    async fn write_char(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.characteristic(handle)?;
        if with_response {
            let done = self.pending.register(OpKey::CharWrite(handle))?;
            self.peripheral.write_characteristic_value(
                &characteristic,
                data,
                CBCharacteristicWriteType::WithResponse,
            );
            await_op(done).await?;
        } else {
            self.peripheral.write_characteristic_value(
                &characteristic,
                data,
                CBCharacteristicWriteType::WithoutResponse,
            );
        }
        Ok(())
    }

    async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        let descriptor = self.descriptor(handle)?;
        let done = self.pending.register(OpKey::DescRead(handle))?;
        self.peripheral.read_descriptor_value(&descriptor);
        await_op(done).await
    }

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let descriptor = self.descriptor(handle)?;
        let done = self.pending.register(OpKey::DescWrite(handle))?;
        self.peripheral.write_descriptor_value(&descriptor, data);
        await_op(done).await?;
        Ok(())
    }

    async fn start_notify(&self, handle: u16, _indicate: bool, _use_acquire: bool) -> Result<()> {
        // CoreBluetooth picks notify or indicate from the properties itself.
        let characteristic = self.characteristic(handle)?;
        let done = self.pending.register(OpKey::NotifyState(handle))?;
        self.peripheral.set_notify(&characteristic, true);
        await_op(done).await?;
        Ok(())
    }

    async fn stop_notify(&self, handle: u16) -> Result<()> {
        let characteristic = self.characteristic(handle)?;
        let done = self.pending.register(OpKey::NotifyState(handle))?;
        self.peripheral.set_notify(&characteristic, false);
        await_op(done).await?;
        Ok(())
    }

    async fn pair(&self) -> Result<()> {
        // No programmatic pairing on CoreBluetooth.
        info!("pair() is a no-op on macOS/iOS");
        Ok(())
    }

    async fn unpair(&self) -> Result<()> {
        Err(Error::NotSupported(
            "unpairing must be done from system Bluetooth settings on macOS/iOS".into(),
        ))
    }

    async fn name(&self) -> Result<Option<String>> {
        Ok(self.peripheral.name())
    }
}

async fn pump(
    mut central: mpsc::UnboundedReceiver<CentralEvent>,
    mut peripheral: mpsc::UnboundedReceiver<PeripheralEvent>,
    pending: Arc<PendingOps>,
    gatt: Arc<Mutex<Gatt>>,
    events: ClientEventSender,
) {
    loop {
        tokio::select! {
            event = central.recv() => match event {
                Some(CentralEvent::Connected { .. }) => {
                    gatt.lock().unwrap().connected = true;
                    pending.resolve(OpKey::Connect, Ok(Vec::new()));
                }
                Some(CentralEvent::ConnectFailed { error, .. }) => {
                    let err = map_ns_error(error)
                        .unwrap_or_else(|| Error::os("connection attempt failed"));
                    pending.resolve(OpKey::Connect, Err(err));
                }
                Some(CentralEvent::Disconnected { error, .. }) => {
                    gatt.lock().unwrap().connected = false;
                    let requested = pending.is_pending(OpKey::Disconnect);
                    // Every in-flight operation dies with the link, before
                    // the disconnect is reported.
                    if requested {
                        pending.resolve(OpKey::Disconnect, Ok(Vec::new()));
                        pending.fail_all();
                    } else {
                        pending.fail_all();
                        if let Some(err) = map_ns_error(error) {
                            trace!("unsolicited disconnect: {err}");
                        }
                        let _ = events.send(ClientEvent::UnsolicitedDisconnect);
                    }
                }
                Some(_) => {}
                None => break,
            },
            event = peripheral.recv() => match event {
                Some(event) => route_peripheral_event(event, &pending, &events),
                None => break,
            },
        }
    }
}

fn route_peripheral_event(
    event: PeripheralEvent,
    pending: &PendingOps,
    events: &ClientEventSender,
) {
    match event {
        PeripheralEvent::DiscoveredServices { error } => {
            pending.resolve(OpKey::ServicesDiscovered, completion(error));
        }
        PeripheralEvent::DiscoveredCharacteristics { service, error } => {
            pending.resolve(
                OpKey::CharacteristicsDiscovered(service.handle()),
                completion(error),
            );
        }
        PeripheralEvent::DiscoveredDescriptors {
            characteristic,
            error,
        } => {
            pending.resolve(
                OpKey::DescriptorsDiscovered(characteristic.handle()),
                completion(error),
            );
        }
        PeripheralEvent::CharacteristicValueUpdate {
            characteristic,
            error,
        } => {
            let handle = characteristic.handle();
            let result = match map_ns_error(error) {
                Some(err) => Err(err),
                None => Ok(characteristic.value().unwrap_or_default()),
            };
            if pending.is_pending(OpKey::CharRead(handle)) {
                pending.resolve(OpKey::CharRead(handle), result);
            } else {
                match result {
                    // Unsolicited update: a notification or indication. This
                    // also covers values pushed before the CCCD write
                    // resolves.
                    Ok(value) => {
                        let _ = events.send(ClientEvent::Notification { handle, value });
                    }
                    Err(err) => warn!("characteristic {handle:#06x} update failed: {err}"),
                }
            }
        }
        PeripheralEvent::CharacteristicValueWrite {
            characteristic,
            error,
        } => {
            pending.resolve(OpKey::CharWrite(characteristic.handle()), completion(error));
        }
        PeripheralEvent::DescriptorValueUpdate { descriptor, error } => {
            let result = match map_ns_error(error) {
                Some(err) => Err(err),
                None => Ok(descriptor.value_bytes().unwrap_or_default()),
            };
            pending.resolve(OpKey::DescRead(descriptor.handle()), result);
        }
        PeripheralEvent::DescriptorValueWrite { descriptor, error } => {
            pending.resolve(OpKey::DescWrite(descriptor.handle()), completion(error));
        }
        PeripheralEvent::NotificationStateUpdate {
            characteristic,
            error,
        } => {
            pending.resolve(
                OpKey::NotifyState(characteristic.handle()),
                completion(error),
            );
        }
    }
}

fn completion(error: Option<ShareId<crate::corebluetooth::types::NSError>>) -> Result<Vec<u8>> {
    match map_ns_error(error) {
        Some(err) => Err(err),
        None => Ok(Vec::new()),
    }
}
