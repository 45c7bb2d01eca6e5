//! Client backend: connection, GATT I/O, and pairing over `Device1` and the
//! GATT object tree.
//!
//! BlueZ performs service discovery itself and announces completion by
//! flipping `ServicesResolved`; the collection is then assembled from the
//! object cache. Attribute handles are the last four hex digits of the
//! GATT object paths.

use crate::api::bleuuid::uuid_from_u16;
use crate::api::gatt::{Characteristic, Descriptor, ServiceCollection, DEFAULT_MTU};
use crate::api::{BleDevice, CharPropFlags};
use crate::backend::{ClientBackend, ClientEvent, ClientEventSender};
use crate::bluez::agent;
use crate::bluez::defs::*;
use crate::bluez::manager::{
    global_manager, handle_from_path, BluezEvent, BluezObjectManager,
};
use crate::bluez::map_dbus_error;
use crate::client::ClientConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use dbus::arg::{OwnedFd, PropMap, Variant};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::FromRawFd;
use std::sync::{Arc, Mutex};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;

pub(crate) struct BluezClient {
    manager: Arc<BluezObjectManager>,
    device: BleDevice,
    device_path: String,
    adapter_path: String,
    config: ClientConfig,
    events: ClientEventSender,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    char_paths: HashMap<u16, String>,
    desc_paths: HashMap<u16, String>,
    mtu: usize,
    /// Handle of the synthesized battery characteristic, when BlueZ hides
    /// the battery service behind `Battery1`.
    battery_char: Option<u16>,
    watcher: Option<JoinHandle<()>>,
    acquired: HashMap<u16, JoinHandle<()>>,
}

impl BluezClient {
    pub(crate) async fn new(
        device: BleDevice,
        config: ClientConfig,
        events: ClientEventSender,
    ) -> Result<Self> {
        let manager = global_manager().await?;
        let device_path = device.details.clone();
        if !device_path.starts_with(BLUEZ_ROOT) {
            return Err(Error::DeviceNotFound);
        }
        let adapter_path = device_path
            .rfind('/')
            .map(|index| device_path[..index].to_owned())
            .ok_or(Error::DeviceNotFound)?;
        Ok(BluezClient {
            manager,
            device,
            device_path,
            adapter_path,
            config,
            events,
            state: Mutex::new(State {
                mtu: DEFAULT_MTU,
                ..Default::default()
            }),
        })
    }

    fn char_path(&self, handle: u16) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .char_paths
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound(format!("handle {handle:#06x}")))
    }

    fn desc_path(&self, handle: u16) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .desc_paths
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::DescriptorNotFound(format!("handle {handle:#06x}")))
    }

    fn build_collection(&self) -> Result<ServiceCollection> {
        let mut collection = ServiceCollection::new();
        let objects = self
            .manager
            .objects_under(&format!("{}/", self.device_path));

        let mut service_handles: HashMap<String, u16> = HashMap::new();
        for (path, object) in &objects {
            let Some(service) = &object.service else {
                continue;
            };
            if service.device.as_deref() != Some(self.device_path.as_str()) {
                continue;
            }
            let Some(uuid) = service.uuid else {
                continue;
            };
            if !self.config.services.is_empty() && !self.config.services.contains(&uuid) {
                trace!("skipping service {uuid} excluded by the service filter");
                continue;
            }
            let handle = handle_from_path(path)?;
            collection.add_service(handle, uuid)?;
            service_handles.insert(path.clone(), handle);
        }

        let mut char_handles: HashMap<String, u16> = HashMap::new();
        let mut state = self.state.lock().unwrap();
        state.char_paths.clear();
        state.desc_paths.clear();
        for (path, object) in &objects {
            let Some(characteristic) = &object.characteristic else {
                continue;
            };
            let Some(&service_handle) = characteristic
                .service
                .as_ref()
                .and_then(|service| service_handles.get(service))
            else {
                continue;
            };
            let Some(uuid) = characteristic.uuid else {
                continue;
            };
            let handle = handle_from_path(path)?;
            collection.add_characteristic(Characteristic::new(
                handle,
                uuid,
                characteristic.flags,
                service_handle,
            ))?;
            char_handles.insert(path.clone(), handle);
            state.char_paths.insert(handle, path.clone());
            if let Some(mtu) = characteristic.mtu {
                state.mtu = mtu as usize;
            }
        }

        for (path, object) in &objects {
            let Some(descriptor) = &object.descriptor else {
                continue;
            };
            let Some(&characteristic_handle) = descriptor
                .characteristic
                .as_ref()
                .and_then(|characteristic| char_handles.get(characteristic))
            else {
                continue;
            };
            let Some(uuid) = descriptor.uuid else {
                continue;
            };
            let handle = handle_from_path(path)?;
            collection.add_descriptor(Descriptor {
                handle,
                uuid,
                characteristic_handle,
            })?;
            state.desc_paths.insert(handle, path.clone());
        }

        // BlueZ >= 5.48 hides the battery service behind `Battery1`.
        // Synthesize it so battery level reads like any characteristic.
        let battery_service_uuid = uuid_from_u16(0x180f);
        let has_battery_interface = self
            .manager
            .get(&self.device_path)
            .map(|object| object.battery.is_some())
            .unwrap_or(false);
        let battery_wanted =
            self.config.services.is_empty() || self.config.services.contains(&battery_service_uuid);
        if has_battery_interface
            && battery_wanted
            && collection.service(battery_service_uuid)?.is_none()
        {
            let base = collection
                .descriptors()
                .map(|d| d.handle)
                .chain(collection.characteristics().map(|c| c.handle))
                .chain(collection.services().map(|s| s.handle))
                .max()
                .unwrap_or(0);
            let service_handle = base + 1;
            let char_handle = base + 2;
            collection.add_service(service_handle, battery_service_uuid)?;
            collection.add_characteristic(Characteristic::new(
                char_handle,
                uuid_from_u16(0x2a19),
                CharPropFlags::READ,
                service_handle,
            ))?;
            state.battery_char = Some(char_handle);
            debug!("synthesized battery service from org.bluez.Battery1");
        }

        Ok(collection)
    }

    fn spawn_watcher(&self) {
        let manager = self.manager.clone();
        let device_path = self.device_path.clone();
        let events = self.events.clone();
        let path_to_handle: HashMap<String, u16> = self
            .state
            .lock()
            .unwrap()
            .char_paths
            .iter()
            .map(|(&handle, path)| (path.clone(), handle))
            .collect();

        let mut bluez_events = manager.subscribe();
        let watcher = tokio::spawn(async move {
            loop {
                match bluez_events.recv().await {
                    Ok(BluezEvent::CharacteristicValue { path, value }) => {
                        if let Some(&handle) = path_to_handle.get(&path) {
                            if events
                                .send(ClientEvent::Notification { handle, value })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Ok(BluezEvent::DeviceChanged { path, changed })
                        if path == device_path && changed.iter().any(|p| p == "Connected") =>
                    {
                        let still_connected = manager
                            .device(&device_path)
                            .map(|device| device.connected)
                            .unwrap_or(false);
                        if !still_connected {
                            debug!("{device_path} disconnected");
                            let _ = events.send(ClientEvent::UnsolicitedDisconnect);
                            break;
                        }
                    }
                    Ok(BluezEvent::ObjectRemoved { path }) if path == device_path => {
                        let _ = events.send(ClientEvent::UnsolicitedDisconnect);
                        break;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("client watcher lagged behind BlueZ events, dropped {missed}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.state.lock().unwrap().watcher = Some(watcher);
    }

    fn stop_tasks(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(watcher) = state.watcher.take() {
            watcher.abort();
        }
        for (_, task) in state.acquired.drain() {
            task.abort();
        }
    }

    async fn wait_services_resolved(&self) -> Result<()> {
        let mut bluez_events = self.manager.subscribe();
        let resolved = self
            .manager
            .device(&self.device_path)
            .map(|device| device.services_resolved)
            .unwrap_or(false);
        if resolved {
            return Ok(());
        }
        loop {
            match bluez_events.recv().await {
                Ok(BluezEvent::DeviceChanged { path, .. }) if path == self.device_path => {
                    let device = self
                        .manager
                        .device(&self.device_path)
                        .ok_or(Error::DeviceNotFound)?;
                    if device.services_resolved {
                        return Ok(());
                    }
                    if !device.connected {
                        return Err(Error::Disconnected);
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Re-check the cache; the transition may be what we missed.
                    if self
                        .manager
                        .device(&self.device_path)
                        .map(|device| device.services_resolved)
                        .unwrap_or(false)
                    {
                        return Ok(());
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(Error::os("BlueZ event stream closed"));
                }
            }
        }
    }
}

#[async_trait]
impl ClientBackend for BluezClient {
    async fn connect(&self, pair: bool) -> Result<ServiceCollection> {
        // BlueZ allows pairing up front; Device1.Pair connects on its own.
        if pair {
            self.pair().await?;
        }

        self.manager
            .proxy(self.device_path.clone())
            .method_call::<(), _, _, _>(DEVICE_INTERFACE, "Connect", ())
            .await
            .map_err(map_dbus_error)?;
        debug!("connected to {}", self.device_path);

        self.wait_services_resolved().await?;
        let collection = self.build_collection()?;
        self.spawn_watcher();
        Ok(collection)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_tasks();
        let result = self
            .manager
            .proxy(self.device_path.clone())
            .method_call::<(), _, _, _>(DEVICE_INTERFACE, "Disconnect", ())
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.name() == Some("org.bluez.Error.NotConnected") => Ok(()),
            Err(err) => Err(map_dbus_error(err)),
        }
    }

    async fn is_connected(&self) -> bool {
        self.manager
            .device(&self.device_path)
            .map(|device| device.connected)
            .unwrap_or(false)
    }

    fn mtu_size(&self) -> usize {
        self.state.lock().unwrap().mtu
    }

    async fn read_char(&self, handle: u16, _use_cached: bool) -> Result<Vec<u8>> {
        if self.state.lock().unwrap().battery_char == Some(handle) {
            let percentage = self
                .manager
                .get(&self.device_path)
                .and_then(|object| object.battery)
                .and_then(|battery| battery.percentage)
                .ok_or_else(|| Error::os("Battery1 percentage not available"))?;
            return Ok(vec![percentage]);
        }
        let path = self.char_path(handle)?;
        let (value,): (Vec<u8>,) = self
            .manager
            .proxy(path)
            .method_call(CHARACTERISTIC_INTERFACE, "ReadValue", (PropMap::new(),))
            .await
            .map_err(map_dbus_error)?;
        Ok(value)
    }

    async fn write_char(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()> {
        let path = self.char_path(handle)?;
        let mut options: PropMap = HashMap::new();
        let write_type = if with_response { "request" } else { "command" };
        options.insert(
            "type".to_string(),
            Variant(Box::new(write_type.to_string())),
        );
        self.manager
            .proxy(path)
            .method_call::<(), _, _, _>(
                CHARACTERISTIC_INTERFACE,
                "WriteValue",
                (data.to_vec(), options),
            )
            .await
            .map_err(map_dbus_error)?;
        Ok(())
    }

    async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        let path = self.desc_path(handle)?;
        let (value,): (Vec<u8>,) = self
            .manager
            .proxy(path)
            .method_call(DESCRIPTOR_INTERFACE, "ReadValue", (PropMap::new(),))
            .await
            .map_err(map_dbus_error)?;
        Ok(value)
    }

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let path = self.desc_path(handle)?;
        self.manager
            .proxy(path)
            .method_call::<(), _, _, _>(
                DESCRIPTOR_INTERFACE,
                "WriteValue",
                (data.to_vec(), PropMap::new()),
            )
            .await
            .map_err(map_dbus_error)?;
        Ok(())
    }

    async fn start_notify(&self, handle: u16, _indicate: bool, use_acquire: bool) -> Result<()> {
        // The daemon writes the CCCD, choosing notify or indicate from the
        // characteristic flags itself.
        let path = self.char_path(handle)?;
        if use_acquire {
            let (fd, mtu): (OwnedFd, u16) = self
                .manager
                .proxy(path)
                .method_call(CHARACTERISTIC_INTERFACE, "AcquireNotify", (PropMap::new(),))
                .await
                .map_err(map_dbus_error)?;
            let task = spawn_acquired_reader(fd, mtu, handle, self.events.clone())?;
            self.state.lock().unwrap().acquired.insert(handle, task);
        } else {
            self.manager
                .proxy(path)
                .method_call::<(), _, _, _>(CHARACTERISTIC_INTERFACE, "StartNotify", ())
                .await
                .map_err(map_dbus_error)?;
        }
        Ok(())
    }

    async fn stop_notify(&self, handle: u16) -> Result<()> {
        let acquired = self.state.lock().unwrap().acquired.remove(&handle);
        if let Some(task) = acquired {
            // Dropping the reader closes the descriptor, which releases the
            // notify session on the daemon side.
            task.abort();
            return Ok(());
        }
        let path = self.char_path(handle)?;
        self.manager
            .proxy(path)
            .method_call::<(), _, _, _>(CHARACTERISTIC_INTERFACE, "StopNotify", ())
            .await
            .map_err(map_dbus_error)?;
        Ok(())
    }

    async fn pair(&self) -> Result<()> {
        if self
            .manager
            .device(&self.device_path)
            .map(|device| device.paired)
            .unwrap_or(false)
        {
            return Ok(());
        }
        let agent_handle = agent::register(
            self.manager.clone(),
            self.config.agent.clone(),
            self.device.clone(),
        )
        .await?;

        let result = self
            .manager
            .proxy(self.device_path.clone())
            .method_call::<(), _, _, _>(DEVICE_INTERFACE, "Pair", ())
            .await;

        if let Err(err) = agent_handle.unregister().await {
            warn!("unregistering pairing agent: {err}");
        }

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.name() == Some("org.bluez.Error.AlreadyExists") => Ok(()),
            Err(err) => Err(map_dbus_error(err)),
        }
    }

    async fn unpair(&self) -> Result<()> {
        // Removing the device also drops the bond. BlueZ has no way to
        // forget only the keys.
        self.manager
            .proxy(self.adapter_path.clone())
            .method_call::<(), _, _, _>(
                ADAPTER_INTERFACE,
                "RemoveDevice",
                (dbus::Path::from(self.device_path.clone()),),
            )
            .await
            .map_err(map_dbus_error)?;
        Ok(())
    }

    async fn name(&self) -> Result<Option<String>> {
        Ok(self
            .manager
            .device(&self.device_path)
            .and_then(|device| device.alias.or(device.name)))
    }
}

/// Pumps the descriptor obtained from `AcquireNotify`: each read returns one
/// notification payload.
fn spawn_acquired_reader(
    fd: OwnedFd,
    mtu: u16,
    handle: u16,
    events: ClientEventSender,
) -> Result<JoinHandle<()>> {
    let file = unsafe { std::fs::File::from_raw_fd(fd.into_fd()) };
    let async_fd = AsyncFd::new(file).map_err(|err| Error::Os {
        code: err.raw_os_error(),
        message: format!("watching acquired notify fd: {err}"),
    })?;
    Ok(tokio::spawn(async move {
        let mut buf = vec![0u8; usize::from(mtu.max(23))];
        loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    warn!("acquired notify fd failed: {err}");
                    break;
                }
            };
            match guard.try_io(|inner| (&*inner.get_ref()).read(&mut buf)) {
                Ok(Ok(0)) => {
                    trace!("acquired notify fd closed by BlueZ");
                    break;
                }
                Ok(Ok(n)) => {
                    if events
                        .send(ClientEvent::Notification {
                            handle,
                            value: buf[..n].to_vec(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    warn!("reading acquired notify fd: {err}");
                    break;
                }
                Err(_would_block) => continue,
            }
        }
    }))
}
