//! A cross-platform Bluetooth Low Energy central-role client library.
//!
//! `blecentral` lets an application discover nearby BLE peripherals, connect
//! to them, enumerate their GATT service tree, and perform reads, writes,
//! notifications, and pairing against remote characteristics and
//! descriptors. The portable [`Scanner`] and [`Client`] types delegate to a
//! per-OS backend: BlueZ over D-Bus on Linux, CoreBluetooth on macOS/iOS,
//! and WinRT on Windows.
//!
//! ```no_run
//! use blecentral::{Client, Scanner};
//! use std::time::Duration;
//!
//! # async fn example() -> blecentral::Result<()> {
//! let device = Scanner::find_device_by_address("AA:BB:CC:DD:EE:FF", Duration::from_secs(5))
//!     .await?
//!     .ok_or(blecentral::Error::DeviceNotFound)?;
//!
//! let client = Client::new(device);
//! client.connect().await?;
//! let value = client.read_gatt_char("2a19").await?;
//! println!("battery level: {value:?}");
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! All I/O methods are `async` and run on the caller's tokio runtime. OS
//! callbacks arrive on OS-owned threads and are marshaled onto the runtime
//! through channels, so application callbacks never run on an OS thread.

pub mod api;
mod backend;
mod client;
mod error;
mod platform;
mod scanner;

#[cfg(target_os = "linux")]
mod bluez;
#[cfg(target_vendor = "apple")]
mod corebluetooth;
#[cfg(target_os = "windows")]
mod winrt;

pub use api::{
    AdvertisementData, AttrSpec, BleDevice, CharPropFlags, ClientOptions, NoInputNoOutputAgent,
    NotifyOptions, OrPattern, PairingAgent, ScanMode, ScannerOptions,
};
pub use client::{Client, ConnectionState};
pub use error::{Error, NotAvailableReason, Result};
pub use scanner::{CallbackToken, Scanner};
