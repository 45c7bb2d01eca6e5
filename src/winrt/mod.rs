//! Windows backend over the WinRT Bluetooth projection.
//!
//! WinRT has no explicit connect call: holding a `GattSession` with
//! `MaintainConnection` set keeps the link up, and `ConnectionStatus` on
//! the `BluetoothLEDevice` reports it. Every `*Async` operation is awaited
//! directly; the projection bridges completion handlers to futures. All of
//! this requires the calling thread to live in the COM multi-threaded
//! apartment, which [`utils::ensure_mta`] establishes up front.

pub(crate) mod client;
pub(crate) mod scanner;
pub(crate) mod utils;
