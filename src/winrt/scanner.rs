//! Scanner backend over `BluetoothLEAdvertisementWatcher`.

use crate::api::{AdvertisementData, BleDevice, ScanMode, ScannerOptions};
use crate::backend::{RawAdvertisement, ScannerBackend, ScannerEventSender};
use crate::winrt::utils::{buffer_to_vec, ensure_mta, to_address_string, to_guid, to_uuid};
use crate::Result;
use async_trait::async_trait;
use log::{debug, trace, warn};
use std::sync::Mutex;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

// Advertisement data-section type codes, per the GAP assigned numbers.
mod data_types {
    pub const SERVICE_DATA_16_BIT_UUID: u8 = 0x16;
    pub const SERVICE_DATA_32_BIT_UUID: u8 = 0x20;
    pub const SERVICE_DATA_128_BIT_UUID: u8 = 0x21;
}

pub(crate) struct WinrtScanner {
    watcher: BluetoothLEAdvertisementWatcher,
    events: ScannerEventSender,
    received_token: Mutex<Option<i64>>,
}

impl WinrtScanner {
    pub(crate) fn new(options: ScannerOptions, events: ScannerEventSender) -> Result<Self> {
        ensure_mta()?;
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(match options.mode {
            ScanMode::Active => BluetoothLEScanningMode::Active,
            ScanMode::Passive => BluetoothLEScanningMode::Passive,
        })?;
        // The OS-level filter is best effort; the core re-filters anyway.
        if !options.service_uuids.is_empty() {
            let advertisement = watcher.AdvertisementFilter()?.Advertisement()?;
            let uuids = advertisement.ServiceUuids()?;
            for uuid in &options.service_uuids {
                uuids.Append(to_guid(uuid))?;
            }
        }
        Ok(WinrtScanner {
            watcher,
            events,
            received_token: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ScannerBackend for WinrtScanner {
    async fn start(&self) -> Result<()> {
        let events = self.events.clone();
        let handler = TypedEventHandler::new(
            move |_sender: &Option<BluetoothLEAdvertisementWatcher>,
                  args: &Option<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args {
                    match parse_received(args) {
                        Ok(raw) => {
                            let _ = events.send(raw);
                        }
                        Err(err) => warn!("dropping malformed advertisement: {err}"),
                    }
                }
                Ok(())
            },
        );
        let token = self.watcher.Received(&handler)?;
        *self.received_token.lock().unwrap() = Some(token);
        self.watcher.Start()?;
        debug!("WinRT advertisement watcher started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.watcher.Stop()?;
        if let Some(token) = self.received_token.lock().unwrap().take() {
            self.watcher.RemoveReceived(token)?;
        }
        debug!("WinRT advertisement watcher stopped");
        Ok(())
    }
}

fn parse_received(args: &BluetoothLEAdvertisementReceivedEventArgs) -> Result<RawAdvertisement> {
    let address = args.BluetoothAddress()?;
    let rssi = args.RawSignalStrengthInDBm()?;
    let advertisement = args.Advertisement()?;

    let mut data = AdvertisementData {
        rssi: Some(rssi),
        ..Default::default()
    };

    let local_name = advertisement.LocalName()?.to_string();
    if !local_name.is_empty() {
        data.local_name = Some(local_name);
    }

    if let Ok(manufacturer_data) = advertisement.ManufacturerData() {
        for entry in &manufacturer_data {
            let company = entry.CompanyId()?;
            let bytes = buffer_to_vec(&entry.Data()?)?;
            data.manufacturer_data.insert(company, bytes);
        }
    }

    // Service data has no first-class accessor; it is recovered from the
    // raw data sections.
    if let Ok(sections) = advertisement.DataSections() {
        for section in &sections {
            let bytes = buffer_to_vec(&section.Data()?)?;
            let parsed = match section.DataType()? {
                data_types::SERVICE_DATA_16_BIT_UUID if bytes.len() >= 2 => Some((
                    crate::api::bleuuid::uuid_from_u16(u16::from_le_bytes([bytes[0], bytes[1]])),
                    bytes[2..].to_vec(),
                )),
                data_types::SERVICE_DATA_32_BIT_UUID if bytes.len() >= 4 => Some((
                    crate::api::bleuuid::uuid_from_u32(u32::from_le_bytes([
                        bytes[0], bytes[1], bytes[2], bytes[3],
                    ])),
                    bytes[4..].to_vec(),
                )),
                data_types::SERVICE_DATA_128_BIT_UUID if bytes.len() >= 16 => {
                    let mut uuid_bytes = [0u8; 16];
                    uuid_bytes.copy_from_slice(&bytes[..16]);
                    uuid_bytes.reverse();
                    Some((uuid::Uuid::from_bytes(uuid_bytes), bytes[16..].to_vec()))
                }
                _ => None,
            };
            if let Some((uuid, value)) = parsed {
                data.service_data.insert(uuid, value);
            }
        }
    }

    if let Ok(uuids) = advertisement.ServiceUuids() {
        for guid in &uuids {
            data.service_uuids.push(to_uuid(&guid));
        }
    }

    if let Ok(reference) = args.TransmitPowerLevelInDBm() {
        if let Ok(tx_power) = reference.Value() {
            data.tx_power = Some(tx_power);
        }
    }

    trace!("advertisement from {address:012X}");
    Ok(RawAdvertisement {
        device: BleDevice {
            address: to_address_string(address),
            name: data.local_name.clone(),
            details: format!("{address:012X}"),
        },
        data,
    })
}
