//! macOS/iOS backend over CoreBluetooth.
//!
//! CoreBluetooth is callback-only: every operation completes through a
//! delegate method on a GCD dispatch queue. The delegate classes forward
//! each callback as an event into a channel, and a per-client registry of
//! pending one-shot futures correlates completions with the operation that
//! started them. Peripheral addresses are not exposed by the OS; devices
//! are identified by the per-host random UUID CoreBluetooth assigns them.

pub(crate) mod client;
pub(crate) mod delegates;
pub(crate) mod internal;
pub(crate) mod scanner;
pub(crate) mod types;

use crate::Error;
use types::NSError;

pub(crate) fn map_ns_error(error: Option<objc_id::ShareId<NSError>>) -> Option<Error> {
    error.map(|error| Error::Os {
        code: Some(error.code() as i32),
        message: error.localized_description(),
    })
}
