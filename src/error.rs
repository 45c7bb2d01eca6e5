//! The error types returned by every fallible operation in this crate.

use thiserror::Error;
use uuid::Uuid;

/// The reason Bluetooth is unavailable on this host.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NotAvailableReason {
    /// No Bluetooth radio is present.
    NoBluetooth,
    /// The user denied this application access to Bluetooth.
    DeniedByUser,
    /// A system policy denies this application access to Bluetooth.
    DeniedBySystem,
    /// Access was denied for an undetermined reason.
    DeniedByUnknown,
    /// The radio exists but is powered off.
    PoweredOff,
    /// The OS has not reported a usable state.
    Unknown,
}

impl std::fmt::Display for NotAvailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            NotAvailableReason::NoBluetooth => "no Bluetooth hardware",
            NotAvailableReason::DeniedByUser => "denied by user",
            NotAvailableReason::DeniedBySystem => "denied by system policy",
            NotAvailableReason::DeniedByUnknown => "denied for an unknown reason",
            NotAvailableReason::PoweredOff => "powered off",
            NotAvailableReason::Unknown => "state unknown",
        };
        f.write_str(reason)
    }
}

/// The error type for Bluetooth operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Bluetooth is not available: {reason}")]
    BluetoothNotAvailable { reason: NotAvailableReason },

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Not connected")]
    Disconnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(String),

    #[error("Descriptor {0} not found")]
    DescriptorNotFound(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("Pairing was cancelled")]
    PairingCancelled,

    #[error("Passive scanning is not supported: {0}")]
    NoPassiveScan(String),

    /// Multiple GATT entities share the UUID; the caller must address the
    /// entity by handle instead.
    #[error("UUID {0} matches more than one entity, look up by handle instead")]
    AmbiguousUuid(Uuid),

    #[error("Invalid UUID string {0:?}")]
    InvalidUuid(String),

    #[error("Operation timed out")]
    TimedOut,

    /// A backend-specific OS failure not covered by any other kind.
    #[error("OS error{}: {message}", .code.map(|c| format!(" {c}")).unwrap_or_default())]
    Os { code: Option<i32>, message: String },
}

impl Error {
    /// Wraps an OS-level failure that has no more specific kind.
    pub(crate) fn os(message: impl Into<String>) -> Self {
        Error::Os {
            code: None,
            message: message.into(),
        }
    }
}

#[cfg(target_os = "linux")]
impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        Error::Os {
            code: None,
            message: format!(
                "{}: {}",
                err.name().unwrap_or("org.freedesktop.DBus.Error.Failed"),
                err.message().unwrap_or("unknown D-Bus failure"),
            ),
        }
    }
}

#[cfg(target_os = "windows")]
impl From<windows::core::Error> for Error {
    fn from(err: windows::core::Error) -> Self {
        Error::Os {
            code: Some(err.code().0),
            message: err.message(),
        }
    }
}

/// Convenience alias for a result with this crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_available_reason_in_message() {
        let err = Error::BluetoothNotAvailable {
            reason: NotAvailableReason::PoweredOff,
        };
        assert_eq!(err.to_string(), "Bluetooth is not available: powered off");
    }

    #[test]
    fn os_error_formats_code() {
        let with_code = Error::Os {
            code: Some(-36),
            message: "host is down".into(),
        };
        assert_eq!(with_code.to_string(), "OS error -36: host is down");

        let without_code = Error::os("host is down");
        assert_eq!(without_code.to_string(), "OS error: host is down");
    }
}
