//! Client backend over `BluetoothLEDevice` and `GattSession`.
//!
//! The session's `MaintainConnection` flag expresses intent to stay
//! connected; `ConnectionStatusChanged` reports the result. Service
//! discovery loops until one pass completes without a concurrent
//! `GattServicesChanged` event, so a peripheral that re-configures its
//! table mid-connect cannot leave a half-updated tree behind.

use crate::api::gatt::{Characteristic, Descriptor, ServiceCollection, DEFAULT_MTU};
use crate::api::{BleDevice, CharPropFlags, PairingAgent};
use crate::backend::{ClientBackend, ClientEvent, ClientEventSender};
use crate::client::ClientConfig;
use crate::winrt::utils::{
    buffer_to_vec, check_status, ensure_mta, parse_address, to_uuid, vec_to_buffer,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::Either;
use futures::pin_mut;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDescriptor, GattDeviceService, GattSession,
    GattSessionStatus, GattSessionStatusChangedEventArgs, GattValueChangedEventArgs,
    GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Devices::Enumeration::{
    DevicePairingKinds, DevicePairingProtectionLevel, DevicePairingRequestedEventArgs,
    DevicePairingResultStatus,
};
use windows::Foundation::TypedEventHandler;

const DISCOVERY_ATTEMPTS: usize = 5;

#[derive(Default)]
struct Gatt {
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    services: HashMap<u16, GattDeviceService>,
    characteristics: HashMap<u16, GattCharacteristic>,
    descriptors: HashMap<u16, GattDescriptor>,
    value_tokens: HashMap<u16, i64>,
    status_token: Option<i64>,
    session_token: Option<i64>,
    mtu: usize,
}

pub(crate) struct WinrtClient {
    address: u64,
    config: ClientConfig,
    events: ClientEventSender,
    device_info: BleDevice,
    gatt: Arc<Mutex<Gatt>>,
}

impl WinrtClient {
    pub(crate) fn new(
        device: BleDevice,
        config: ClientConfig,
        events: ClientEventSender,
    ) -> Result<Self> {
        ensure_mta()?;
        let address = parse_address(&device.details)?;
        Ok(WinrtClient {
            address,
            config,
            events,
            device_info: device,
            gatt: Arc::new(Mutex::new(Gatt {
                mtu: DEFAULT_MTU,
                ..Default::default()
            })),
        })
    }

    fn device(&self) -> Result<BluetoothLEDevice> {
        self.gatt
            .lock()
            .unwrap()
            .device
            .clone()
            .ok_or(Error::Disconnected)
    }

    fn characteristic(&self, handle: u16) -> Result<GattCharacteristic> {
        self.gatt
            .lock()
            .unwrap()
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound(format!("handle {handle:#06x}")))
    }

    fn descriptor(&self, handle: u16) -> Result<GattDescriptor> {
        self.gatt
            .lock()
            .unwrap()
            .descriptors
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::DescriptorNotFound(format!("handle {handle:#06x}")))
    }

    /// One full discovery pass at the given cache mode.
    async fn discovery_pass(
        &self,
        device: &BluetoothLEDevice,
        cache_mode: BluetoothCacheMode,
    ) -> Result<ServiceCollection> {
        let mut collection = ServiceCollection::new();
        let mut gatt_services: HashMap<u16, GattDeviceService> = HashMap::new();
        let mut gatt_characteristics: HashMap<u16, GattCharacteristic> = HashMap::new();
        let mut gatt_descriptors: HashMap<u16, GattDescriptor> = HashMap::new();

        let result = device
            .GetGattServicesWithCacheModeAsync(cache_mode)?
            .await?;
        check_status(result.Status()?, "discovering services")?;

        let services: Vec<GattDeviceService> = result.Services()?.into_iter().collect();
        for service in services {
            let service_uuid = to_uuid(&service.Uuid()?);
            if !self.config.services.is_empty() && !self.config.services.contains(&service_uuid) {
                continue;
            }
            let service_handle = service.AttributeHandle()?;

            let characteristics_result = service
                .GetCharacteristicsWithCacheModeAsync(cache_mode)?
                .await?;
            if characteristics_result.Status()? == GattCommunicationStatus::AccessDenied {
                // Windows reserves some services (HID, Bond Manager) for
                // itself.
                debug!("skipping OS-protected service {service_uuid}");
                continue;
            }
            check_status(
                characteristics_result.Status()?,
                "discovering characteristics",
            )?;

            collection.add_service(service_handle, service_uuid)?;

            let characteristics: Vec<GattCharacteristic> =
                characteristics_result.Characteristics()?.into_iter().collect();
            for characteristic in characteristics {
                let handle = characteristic.AttributeHandle()?;
                let properties = characteristic.CharacteristicProperties()?;
                collection.add_characteristic(Characteristic::new(
                    handle,
                    to_uuid(&characteristic.Uuid()?),
                    CharPropFlags::from_bits_truncate(properties.0 as u16),
                    service_handle,
                ))?;

                let descriptors_result = characteristic
                    .GetDescriptorsWithCacheModeAsync(cache_mode)?
                    .await?;
                if descriptors_result.Status()? == GattCommunicationStatus::Success {
                    let descriptors: Vec<GattDescriptor> =
                        descriptors_result.Descriptors()?.into_iter().collect();
                    for descriptor in descriptors {
                        let descriptor_handle = descriptor.AttributeHandle()?;
                        collection.add_descriptor(Descriptor {
                            handle: descriptor_handle,
                            uuid: to_uuid(&descriptor.Uuid()?),
                            characteristic_handle: handle,
                        })?;
                        gatt_descriptors.insert(descriptor_handle, descriptor);
                    }
                }
                gatt_characteristics.insert(handle, characteristic);
            }
            gatt_services.insert(service_handle, service);
        }

        let mut gatt = self.gatt.lock().unwrap();
        gatt.services = gatt_services;
        gatt.characteristics = gatt_characteristics;
        gatt.descriptors = gatt_descriptors;
        Ok(collection)
    }

    /// Repeats discovery until a pass completes with no concurrent
    /// services-changed event, switching to cached reads on retry.
    async fn discover_to_fixed_point(
        &self,
        device: &BluetoothLEDevice,
    ) -> Result<ServiceCollection> {
        let changed = Arc::new(AtomicBool::new(false));
        let flag = changed.clone();
        let token = device.GattServicesChanged(&TypedEventHandler::new(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }))?;

        let mut cache_mode = BluetoothCacheMode::Uncached;
        let mut outcome = Err(Error::os("service discovery did not run"));
        for attempt in 0..DISCOVERY_ATTEMPTS {
            changed.store(false, Ordering::SeqCst);
            outcome = self.discovery_pass(device, cache_mode).await;
            if outcome.is_err() || !changed.load(Ordering::SeqCst) {
                break;
            }
            debug!(
                "GATT services changed during discovery (attempt {}), retrying from cache",
                attempt + 1
            );
            cache_mode = BluetoothCacheMode::Cached;
        }

        if let Err(err) = device.RemoveGattServicesChanged(token) {
            warn!("removing services-changed handler: {err:?}");
        }
        outcome
    }

    async fn pair_with_agent(&self, device: &BluetoothLEDevice) -> Result<()> {
        let pairing = device.DeviceInformation()?.Pairing()?;
        if pairing.IsPaired()? {
            return Ok(());
        }
        let custom = pairing.Custom()?;

        let agent = self.config.agent.clone();
        let device_info = self.device_info.clone();
        let (request_tx, mut request_rx) = tokio::sync::mpsc::unbounded_channel();
        let token = custom.PairingRequested(&TypedEventHandler::new(
            move |_custom, args: &Option<DevicePairingRequestedEventArgs>| {
                if let Some(args) = args {
                    let deferral = args.GetDeferral()?;
                    let _ = request_tx.send((args.clone(), deferral));
                }
                Ok(())
            },
        ))?;

        let kinds = DevicePairingKinds::ConfirmOnly
            | DevicePairingKinds::DisplayPin
            | DevicePairingKinds::ProvidePin
            | DevicePairingKinds::ConfirmPinMatch;

        // Try the strongest protection first, descending only when the
        // device cannot meet it.
        let mut status = DevicePairingResultStatus::Failed;
        for level in [
            DevicePairingProtectionLevel::EncryptionAndAuthentication,
            DevicePairingProtectionLevel::Encryption,
            DevicePairingProtectionLevel::None,
        ] {
            let operation = custom.PairWithProtectionLevelAsync(kinds, level)?;
            pin_mut!(operation);
            status = loop {
                let request = Box::pin(request_rx.recv());
                match futures::future::select(operation.as_mut(), request).await {
                    Either::Left((result, _)) => break result?.Status()?,
                    Either::Right((Some((args, deferral)), _)) => {
                        let outcome =
                            handle_pairing_request(agent.as_ref(), &device_info, &args).await;
                        if let Err(err) = outcome {
                            warn!("pairing agent failed: {err}");
                        }
                        deferral.Complete()?;
                    }
                    Either::Right((None, _)) => break operation.await?.Status()?,
                }
            };
            if status != DevicePairingResultStatus::ProtectionLevelCouldNotBeMet {
                break;
            }
            trace!("protection level {level:?} not met, descending");
        }

        if let Err(err) = custom.RemovePairingRequested(token) {
            warn!("removing pairing-requested handler: {err:?}");
        }

        match status {
            DevicePairingResultStatus::Paired | DevicePairingResultStatus::AlreadyPaired => Ok(()),
            DevicePairingResultStatus::PairingCanceled => Err(Error::PairingCancelled),
            other => Err(Error::PairingFailed(format!(
                "device pairing result {:?}",
                other.0
            ))),
        }
    }
}

async fn handle_pairing_request(
    agent: &dyn PairingAgent,
    device: &BleDevice,
    args: &DevicePairingRequestedEventArgs,
) -> Result<()> {
    match args.PairingKind()? {
        DevicePairingKinds::ConfirmOnly => {
            if agent.confirm(device).await? {
                args.Accept()?;
            }
        }
        DevicePairingKinds::DisplayPin => {
            let pin = args.Pin()?.to_string();
            agent.display_pin(device, &pin).await?;
            args.Accept()?;
        }
        DevicePairingKinds::ProvidePin => {
            if let Some(pin) = agent.request_pin(device).await? {
                args.AcceptWithPin(&windows::core::HSTRING::from(pin))?;
            }
        }
        DevicePairingKinds::ConfirmPinMatch => {
            let pin = args.Pin()?.to_string();
            if agent.confirm_pin(device, &pin).await? {
                args.Accept()?;
            }
        }
        other => trace!("unhandled pairing kind {:?}", other.0),
    }
    Ok(())
}

#[async_trait]
impl ClientBackend for WinrtClient {
    async fn connect(&self, pair: bool) -> Result<ServiceCollection> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(self.address)?
            .await
            .map_err(|_| Error::DeviceNotFound)?;

        if pair {
            self.pair_with_agent(&device).await?;
        }

        // Watch for link drops before bringing the session up.
        let events = self.events.clone();
        let status_token = device.ConnectionStatusChanged(&TypedEventHandler::new(
            move |sender: &Option<BluetoothLEDevice>, _| {
                if let Some(sender) = sender {
                    if sender.ConnectionStatus() == Ok(BluetoothConnectionStatus::Disconnected) {
                        let _ = events.send(ClientEvent::UnsolicitedDisconnect);
                    }
                }
                Ok(())
            },
        ))?;

        let session = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
        session.SetMaintainConnection(true)?;

        // The radio link can stay up while Windows revokes this app's GATT
        // session, so a closed session is a disconnect in its own right.
        let session_events = self.events.clone();
        let session_token = session.SessionStatusChanged(&TypedEventHandler::new(
            move |_sender: &Option<GattSession>,
                  args: &Option<GattSessionStatusChangedEventArgs>| {
                if let Some(args) = args {
                    if args.Status() == Ok(GattSessionStatus::Closed) {
                        let _ = session_events.send(ClientEvent::UnsolicitedDisconnect);
                    }
                }
                Ok(())
            },
        ))?;

        // Store the handles before discovery so a failed connect can still
        // be torn down through disconnect().
        {
            let mut gatt = self.gatt.lock().unwrap();
            gatt.status_token = Some(status_token);
            gatt.session_token = Some(session_token);
            gatt.session = Some(session.clone());
            gatt.device = Some(device.clone());
        }

        let collection = self.discover_to_fixed_point(&device).await?;
        let mtu = session.MaxPduSize()? as usize;
        self.gatt.lock().unwrap().mtu = mtu;

        debug!("connected to {:012X}, MTU {mtu}", self.address);
        Ok(collection)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut gatt = self.gatt.lock().unwrap();
        if let (Some(device), Some(token)) = (&gatt.device, gatt.status_token.take()) {
            if let Err(err) = device.RemoveConnectionStatusChanged(token) {
                warn!("removing connection-status handler: {err:?}");
            }
        }
        if let (Some(session), Some(token)) = (&gatt.session, gatt.session_token.take()) {
            if let Err(err) = session.RemoveSessionStatusChanged(token) {
                warn!("removing session-status handler: {err:?}");
            }
        }
        for (handle, token) in gatt.value_tokens.drain() {
            if let Some(characteristic) = gatt.characteristics.get(&handle) {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }
        gatt.services.clear();
        gatt.characteristics.clear();
        gatt.descriptors.clear();
        // Dropping the session clears MaintainConnection; closing the
        // device releases the OS handle and lets the link go down.
        if let Some(session) = gatt.session.take() {
            let _ = session.Close();
        }
        if let Some(device) = gatt.device.take() {
            let _ = device.Close();
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.gatt
            .lock()
            .unwrap()
            .device
            .as_ref()
            .map(|device| {
                device.ConnectionStatus() == Ok(BluetoothConnectionStatus::Connected)
            })
            .unwrap_or(false)
    }

    fn mtu_size(&self) -> usize {
        self.gatt.lock().unwrap().mtu
    }

    async fn read_char(&self, handle: u16, use_cached: bool) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(handle)?;
        let cache_mode = if use_cached {
            BluetoothCacheMode::Cached
        } else {
            BluetoothCacheMode::Uncached
        };
        let result = characteristic
            .ReadValueWithCacheModeAsync(cache_mode)?
            .await?;
        check_status(result.Status()?, "reading characteristic")?;
        buffer_to_vec(&result.Value()?)
    }

    async fn write_char(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.characteristic(handle)?;
        let option = if with_response {
            GattWriteOption::WriteWithResponse
        } else {
            GattWriteOption::WriteWithoutResponse
        };
        let buffer = vec_to_buffer(data)?;
        let result = characteristic
            .WriteValueWithResultAndOptionAsync(&buffer, option)?
            .await?;
        check_status(result.Status()?, "writing characteristic")
    }

    async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        let descriptor = self.descriptor(handle)?;
        let result = descriptor
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        check_status(result.Status()?, "reading descriptor")?;
        buffer_to_vec(&result.Value()?)
    }

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let descriptor = self.descriptor(handle)?;
        let buffer = vec_to_buffer(data)?;
        let result = descriptor.WriteValueWithResultAsync(&buffer)?.await?;
        check_status(result.Status()?, "writing descriptor")
    }

    async fn start_notify(&self, handle: u16, indicate: bool, _use_acquire: bool) -> Result<()> {
        let characteristic = self.characteristic(handle)?;

        // Register the value handler before the CCCD write; a peripheral
        // may push its first value before the write acknowledges.
        let events = self.events.clone();
        let token = characteristic.ValueChanged(&TypedEventHandler::new(
            move |sender: &Option<GattCharacteristic>,
                  args: &Option<GattValueChangedEventArgs>| {
                if let (Some(sender), Some(args)) = (sender, args) {
                    let handle = sender.AttributeHandle()?;
                    let value = buffer_to_vec(&args.CharacteristicValue()?)
                        .unwrap_or_default();
                    let _ = events.send(ClientEvent::Notification { handle, value });
                }
                Ok(())
            },
        ))?;
        self.gatt.lock().unwrap().value_tokens.insert(handle, token);

        let cccd = if indicate {
            GattClientCharacteristicConfigurationDescriptorValue::Indicate
        } else {
            GattClientCharacteristicConfigurationDescriptorValue::Notify
        };
        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(cccd)?
            .await?;
        if let Err(err) = check_status(status, "enabling notifications") {
            if let Some(token) = self.gatt.lock().unwrap().value_tokens.remove(&handle) {
                let _ = characteristic.RemoveValueChanged(token);
            }
            return Err(err);
        }
        Ok(())
    }

    async fn stop_notify(&self, handle: u16) -> Result<()> {
        let characteristic = self.characteristic(handle)?;
        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            )?
            .await?;
        check_status(status, "disabling notifications")?;
        if let Some(token) = self.gatt.lock().unwrap().value_tokens.remove(&handle) {
            let _ = characteristic.RemoveValueChanged(token);
        }
        Ok(())
    }

    async fn pair(&self) -> Result<()> {
        let device = self.device()?;
        self.pair_with_agent(&device).await
    }

    async fn unpair(&self) -> Result<()> {
        let device = match self.device() {
            Ok(device) => device,
            // Unpairing does not need a live connection.
            Err(_) => {
                BluetoothLEDevice::FromBluetoothAddressAsync(self.address)?
                    .await
                    .map_err(|_| Error::DeviceNotFound)?
            }
        };
        let result = device
            .DeviceInformation()?
            .Pairing()?
            .UnpairAsync()?
            .await?;
        use windows::Devices::Enumeration::DeviceUnpairingResultStatus;
        match result.Status()? {
            DeviceUnpairingResultStatus::Unpaired
            | DeviceUnpairingResultStatus::AlreadyUnpaired => Ok(()),
            other => Err(Error::Os {
                code: Some(other.0),
                message: "unpairing failed".into(),
            }),
        }
    }

    async fn name(&self) -> Result<Option<String>> {
        let device = self.device()?;
        let name = device.Name()?.to_string();
        Ok((!name.is_empty()).then_some(name))
    }
}
