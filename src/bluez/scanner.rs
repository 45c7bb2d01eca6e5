//! Scanner backend: active discovery through `Adapter1`, passive discovery
//! through an advertisement monitor.
//!
//! Advertisements are not first-class D-Bus events; they surface as
//! `Device1` property changes. The pump task turns those deltas into
//! sightings, reporting a device when it is first seen or when a property
//! that originates in advertising data changes — a bare RSSI refresh is
//! not a new advertisement.

use crate::api::{AdvertisementData, BleDevice, ScanMode, ScannerOptions};
use crate::backend::{RawAdvertisement, ScannerBackend, ScannerEventSender};
use crate::bluez::defs::*;
use crate::bluez::manager::{global_manager, BluezEvent, BluezObjectManager};
use crate::bluez::monitor::{self, MonitorHandle};
use crate::{Error, NotAvailableReason, Result};
use async_trait::async_trait;
use dbus::arg::{PropMap, Variant};
use dbus::nonblock::stdintf::org_freedesktop_dbus::Properties;
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) struct BluezScanner {
    manager: Arc<BluezObjectManager>,
    adapter_path: String,
    options: ScannerOptions,
    events: ScannerEventSender,
    running: tokio::sync::Mutex<Option<Running>>,
}

struct Running {
    pump: JoinHandle<()>,
    monitor: Option<MonitorHandle>,
}

impl BluezScanner {
    pub(crate) async fn new(
        options: ScannerOptions,
        events: ScannerEventSender,
    ) -> Result<Self> {
        let manager = global_manager().await?;
        let adapter_path = match &options.adapter {
            Some(name) => format!("{BLUEZ_ROOT}/{name}"),
            None => manager
                .adapters()
                .into_iter()
                .next()
                .ok_or(Error::BluetoothNotAvailable {
                    reason: NotAvailableReason::NoBluetooth,
                })?,
        };
        if manager
            .get(&adapter_path)
            .and_then(|object| object.adapter)
            .is_none()
        {
            return Err(Error::BluetoothNotAvailable {
                reason: NotAvailableReason::NoBluetooth,
            });
        }
        Ok(BluezScanner {
            manager,
            adapter_path,
            options,
            events,
            running: tokio::sync::Mutex::new(None),
        })
    }

}

/// The `SetDiscoveryFilter` argument: LE transport, duplicates on (every
/// advertisement is an event, not just the first), and the service-UUID
/// filter when one is set.
fn discovery_filter(options: &ScannerOptions) -> PropMap {
    let mut filter: PropMap = HashMap::new();
    filter.insert("Transport".into(), Variant(Box::new("le".to_string())));
    filter.insert("DuplicateData".into(), Variant(Box::new(true)));
    if !options.service_uuids.is_empty() {
        let uuids: Vec<String> = options
            .service_uuids
            .iter()
            .map(|uuid| uuid.to_string())
            .collect();
        filter.insert("UUIDs".into(), Variant(Box::new(uuids)));
    }
    filter
}

#[async_trait]
impl ScannerBackend for BluezScanner {
    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::InvalidState("scan already running".into()));
        }

        let adapter = self.manager.proxy(self.adapter_path.clone());
        adapter
            .set(ADAPTER_INTERFACE, "Powered", true)
            .await
            .map_err(|_| Error::BluetoothNotAvailable {
                reason: NotAvailableReason::PoweredOff,
            })?;

        // Subscribe before starting so the first sightings are not lost.
        let bluez_events = self.manager.subscribe();
        let (found_tx, found_rx) = mpsc::unbounded_channel();

        let monitor = match self.options.mode {
            ScanMode::Active => {
                adapter
                    .method_call::<(), _, _, _>(
                        ADAPTER_INTERFACE,
                        "SetDiscoveryFilter",
                        (discovery_filter(&self.options),),
                    )
                    .await?;
                adapter
                    .method_call::<(), _, _, _>(ADAPTER_INTERFACE, "StartDiscovery", ())
                    .await?;
                debug!("started active discovery on {}", self.adapter_path);
                None
            }
            ScanMode::Passive => {
                let monitor = monitor::register(
                    self.manager.clone(),
                    &self.adapter_path,
                    &self.options.or_patterns,
                    found_tx,
                )
                .await?;
                debug!("started passive discovery on {}", self.adapter_path);
                Some(monitor)
            }
        };

        let pump = tokio::spawn(pump(
            self.manager.clone(),
            self.adapter_path.clone(),
            self.events.clone(),
            bluez_events,
            found_rx,
        ));

        *running = Some(Running { pump, monitor });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return Ok(());
        };
        run.pump.abort();
        match run.monitor {
            Some(monitor) => monitor.unregister().await?,
            None => {
                let adapter = self.manager.proxy(self.adapter_path.clone());
                adapter
                    .method_call::<(), _, _, _>(ADAPTER_INTERFACE, "StopDiscovery", ())
                    .await?;
                // Clear the filter so it does not bleed into other scans.
                adapter
                    .method_call::<(), _, _, _>(
                        ADAPTER_INTERFACE,
                        "SetDiscoveryFilter",
                        (PropMap::new(),),
                    )
                    .await?;
            }
        }
        debug!("stopped discovery on {}", self.adapter_path);
        Ok(())
    }
}

/// Converts the cached device state into one sighting.
fn build_sighting(manager: &BluezObjectManager, path: &str) -> Option<RawAdvertisement> {
    let device = manager.device(path)?;
    let address = device.address.clone()?;
    Some(RawAdvertisement {
        device: BleDevice {
            address,
            name: device.alias.clone().or_else(|| device.name.clone()),
            details: path.to_owned(),
        },
        data: AdvertisementData {
            local_name: device.name,
            manufacturer_data: device.manufacturer_data,
            service_data: device.service_data,
            service_uuids: device.uuids,
            tx_power: device.tx_power,
            rssi: device.rssi,
            platform_data: Some(path.to_owned()),
        },
    })
}

async fn pump(
    manager: Arc<BluezObjectManager>,
    adapter_path: String,
    events: ScannerEventSender,
    mut bluez_events: tokio::sync::broadcast::Receiver<BluezEvent>,
    mut device_found: mpsc::UnboundedReceiver<String>,
) {
    let device_prefix = format!("{adapter_path}/dev_");
    let mut seen: HashSet<String> = HashSet::new();
    // Closed immediately for active scans, which have no monitor.
    let mut found_open = true;

    loop {
        let path = tokio::select! {
            found = device_found.recv(), if found_open => match found {
                // A monitor match always counts as a sighting.
                Some(path) => {
                    seen.insert(path.clone());
                    Some(path)
                }
                None => {
                    found_open = false;
                    None
                }
            },
            event = bluez_events.recv() => match event {
                Ok(BluezEvent::DeviceChanged { path, changed }) if path.starts_with(&device_prefix) => {
                    let first_time = seen.insert(path.clone());
                    if first_time
                        || changed
                            .iter()
                            .any(|name| ADVERTISING_DATA_PROPERTIES.contains(&name.as_str()))
                    {
                        Some(path)
                    } else {
                        trace!("ignoring non-advertising property change on {path}");
                        None
                    }
                }
                Ok(_) => None,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("scanner lagged behind BlueZ events, dropped {missed}");
                    None
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        };

        if let Some(path) = path {
            if let Some(sighting) = build_sighting(&manager, &path) {
                if events.send(sighting).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;
    use dbus::arg::prop_cast;

    #[test]
    fn filter_without_uuids() {
        let filter = discovery_filter(&ScannerOptions::default());
        assert_eq!(
            filter.get("Transport").and_then(|v| v.0.as_str()),
            Some("le")
        );
        assert_eq!(
            filter.get("DuplicateData").and_then(|v| v.0.as_i64()),
            Some(1)
        );
        assert!(!filter.contains_key("UUIDs"));
    }

    #[test]
    fn filter_carries_service_uuids() {
        let options = ScannerOptions {
            service_uuids: vec![uuid_from_u16(0x180d), uuid_from_u16(0x180f)],
            ..Default::default()
        };
        let filter = discovery_filter(&options);
        let uuids = prop_cast::<Vec<String>>(&filter, "UUIDs").unwrap();
        assert_eq!(
            uuids,
            &vec![
                "0000180d-0000-1000-8000-00805f9b34fb".to_string(),
                "0000180f-0000-1000-8000-00805f9b34fb".to_string(),
            ]
        );
    }
}
