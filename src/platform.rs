//! Compile-time backend selection. Exactly one backend is built per target;
//! the factories here are the only place the façades learn which.

use crate::api::BleDevice;
use crate::backend::{ClientBackend, ClientEventSender, ScannerBackend, ScannerEventSender};
use crate::client::ClientConfig;
use crate::Result;
use futures::future::BoxFuture;

#[cfg(target_os = "linux")]
pub(crate) fn scanner_backend(
    options: crate::api::ScannerOptions,
    events: ScannerEventSender,
) -> BoxFuture<'static, Result<Box<dyn ScannerBackend>>> {
    Box::pin(async move {
        let backend = crate::bluez::scanner::BluezScanner::new(options, events).await?;
        Ok(Box::new(backend) as Box<dyn ScannerBackend>)
    })
}

#[cfg(target_os = "linux")]
pub(crate) fn client_backend(
    device: BleDevice,
    config: ClientConfig,
    events: ClientEventSender,
) -> BoxFuture<'static, Result<Box<dyn ClientBackend>>> {
    Box::pin(async move {
        let backend = crate::bluez::client::BluezClient::new(device, config, events).await?;
        Ok(Box::new(backend) as Box<dyn ClientBackend>)
    })
}

#[cfg(target_vendor = "apple")]
pub(crate) fn scanner_backend(
    options: crate::api::ScannerOptions,
    events: ScannerEventSender,
) -> BoxFuture<'static, Result<Box<dyn ScannerBackend>>> {
    Box::pin(async move {
        let backend =
            crate::corebluetooth::scanner::CoreBluetoothScanner::new(options, events).await?;
        Ok(Box::new(backend) as Box<dyn ScannerBackend>)
    })
}

#[cfg(target_vendor = "apple")]
pub(crate) fn client_backend(
    device: BleDevice,
    config: ClientConfig,
    events: ClientEventSender,
) -> BoxFuture<'static, Result<Box<dyn ClientBackend>>> {
    Box::pin(async move {
        let backend =
            crate::corebluetooth::client::CoreBluetoothClient::new(device, config, events).await?;
        Ok(Box::new(backend) as Box<dyn ClientBackend>)
    })
}

#[cfg(target_os = "windows")]
pub(crate) fn scanner_backend(
    options: crate::api::ScannerOptions,
    events: ScannerEventSender,
) -> BoxFuture<'static, Result<Box<dyn ScannerBackend>>> {
    Box::pin(async move {
        let backend = crate::winrt::scanner::WinrtScanner::new(options, events)?;
        Ok(Box::new(backend) as Box<dyn ScannerBackend>)
    })
}

#[cfg(target_os = "windows")]
pub(crate) fn client_backend(
    device: BleDevice,
    config: ClientConfig,
    events: ClientEventSender,
) -> BoxFuture<'static, Result<Box<dyn ClientBackend>>> {
    Box::pin(async move {
        let backend = crate::winrt::client::WinrtClient::new(device, config, events)?;
        Ok(Box::new(backend) as Box<dyn ClientBackend>)
    })
}

#[cfg(not(any(target_os = "linux", target_vendor = "apple", target_os = "windows")))]
pub(crate) fn scanner_backend(
    _options: crate::api::ScannerOptions,
    _events: ScannerEventSender,
) -> BoxFuture<'static, Result<Box<dyn ScannerBackend>>> {
    Box::pin(async {
        Err(crate::Error::NotSupported(
            "no Bluetooth backend for this platform".into(),
        ))
    })
}

#[cfg(not(any(target_os = "linux", target_vendor = "apple", target_os = "windows")))]
pub(crate) fn client_backend(
    _device: BleDevice,
    _config: ClientConfig,
    _events: ClientEventSender,
) -> BoxFuture<'static, Result<Box<dyn ClientBackend>>> {
    Box::pin(async {
        Err(crate::Error::NotSupported(
            "no Bluetooth backend for this platform".into(),
        ))
    })
}

// Ensure the façades keep the auto-traits applications rely on.
use static_assertions::assert_impl_all;
assert_impl_all!(crate::Scanner: Send, Sync, Sized);
assert_impl_all!(crate::Client: Send, Sync, Sized);
