//! Linux backend over the BlueZ D-Bus API.
//!
//! BlueZ exposes the Bluetooth stack as a tree of D-Bus objects under
//! `/org/bluez`. A single process-wide [`manager::BluezObjectManager`]
//! mirrors that tree into a local cache fed by the object-manager signals;
//! the scanner and client backends consult the cache and call methods on
//! the remote objects.

pub(crate) mod agent;
pub(crate) mod client;
pub(crate) mod defs;
pub(crate) mod manager;
pub(crate) mod monitor;
pub(crate) mod scanner;

use crate::Error;

/// Maps a BlueZ method-call failure onto the portable error taxonomy.
pub(crate) fn map_dbus_error(err: dbus::Error) -> Error {
    match err.name() {
        Some("org.bluez.Error.AuthenticationCanceled") => Error::PairingCancelled,
        Some(
            name @ ("org.bluez.Error.AuthenticationFailed"
            | "org.bluez.Error.AuthenticationRejected"
            | "org.bluez.Error.AuthenticationTimeout"
            | "org.bluez.Error.ConnectionAttemptFailed"),
        ) => Error::PairingFailed(format!(
            "{name}: {}",
            err.message().unwrap_or("pairing failed")
        )),
        Some("org.bluez.Error.NotSupported") => Error::NotSupported(
            err.message().unwrap_or("not supported by BlueZ").to_owned(),
        ),
        Some("org.bluez.Error.NotConnected") => Error::Disconnected,
        _ => err.into(),
    }
}
