//! Scanner backend over `CBCentralManager`.
//!
//! A discovery callback carries one advertisement fragment: the legacy
//! advertisement and the scan response of the same peripheral arrive as
//! separate events, each with a subset of the fields. The pump merges each
//! fragment into the peripheral's accumulated advertisement before
//! reporting, so the core always sees the union.

use crate::api::{AdvertisementData, BleDevice, ScanMode, ScannerOptions};
use crate::backend::{RawAdvertisement, ScannerBackend, ScannerEventSender};
use crate::corebluetooth::delegates::{CentralDelegate, CentralEvent};
use crate::corebluetooth::internal::wait_for_powered_on;
use crate::corebluetooth::types::{
    advertisement_from_dictionary, serial_queue, CBCentralManager, CBUUID,
};
use crate::{Error, Result};
use async_trait::async_trait;
use log::debug;
use objc_foundation::{INSArray, NSArray};
use objc_id::Id;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub(crate) struct CoreBluetoothScanner {
    manager: Id<CBCentralManager>,
    _delegate: Id<CentralDelegate>,
    filter: Vec<Uuid>,
    _pump: JoinHandle<()>,
}

// The manager and delegate are only ever messaged, never dereferenced;
// CoreBluetooth serializes onto its dispatch queue internally.
unsafe impl Send for CoreBluetoothScanner {}
unsafe impl Sync for CoreBluetoothScanner {}

impl CoreBluetoothScanner {
    pub(crate) async fn new(
        options: ScannerOptions,
        events: ScannerEventSender,
    ) -> Result<Self> {
        if options.mode == ScanMode::Passive {
            return Err(Error::NoPassiveScan(
                "CoreBluetooth does not expose passive scanning".into(),
            ));
        }

        let (central_tx, mut central_rx) = mpsc::unbounded_channel();
        let delegate = CentralDelegate::with_sender(central_tx);
        let queue = serial_queue(b"blecentral-scan\0");
        let manager = CBCentralManager::with_delegate(&delegate, queue);

        wait_for_powered_on(&manager, &mut central_rx).await?;

        let pump = tokio::spawn(pump(central_rx, events));

        Ok(CoreBluetoothScanner {
            manager,
            _delegate: delegate,
            filter: options.service_uuids,
            _pump: pump,
        })
    }
}

#[async_trait]
impl ScannerBackend for CoreBluetoothScanner {
    async fn start(&self) -> Result<()> {
        let services = if self.filter.is_empty() {
            None
        } else {
            let uuids: Vec<Id<CBUUID>> = self.filter.iter().map(|&u| CBUUID::from_uuid(u)).collect();
            Some(NSArray::from_vec(uuids))
        };
        self.manager.scan_for_peripherals(services);
        debug!("CoreBluetooth scan started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.manager.stop_scan();
        debug!("CoreBluetooth scan stopped");
        Ok(())
    }
}

async fn pump(mut central: mpsc::UnboundedReceiver<CentralEvent>, events: ScannerEventSender) {
    // Accumulated advertisement per peripheral identifier, so scan-response
    // fragments extend rather than replace the base advertisement.
    let mut merged: HashMap<String, AdvertisementData> = HashMap::new();

    while let Some(event) = central.recv().await {
        if let CentralEvent::Discovered {
            peripheral,
            adv_data,
            rssi,
        } = event
        {
            let identifier = peripheral.identifier().to_string();
            let fragment = advertisement_from_dictionary(&adv_data, rssi);

            let advertisement = merged.entry(identifier.clone()).or_default();
            advertisement.merge(&fragment);

            let raw = RawAdvertisement {
                device: BleDevice {
                    address: identifier.clone(),
                    name: peripheral.name(),
                    details: identifier,
                },
                data: advertisement.clone(),
            };
            if events.send(raw).is_err() {
                break;
            }
        }
    }
}
