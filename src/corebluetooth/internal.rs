//! Correlation of delegate callbacks with in-flight operations.
//!
//! CoreBluetooth completes every operation through a delegate method with
//! its own signature, so each client keeps one pending one-shot per
//! operation kind and key. A disconnect drains every map and fails each
//! pending future with `Disconnected` before the disconnect callback fires.

use crate::corebluetooth::delegates::CentralEvent;
use crate::corebluetooth::types::{CBCentralManager, CBManagerState};
use crate::{Error, NotAvailableReason, Result};
use log::trace;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

/// Identity of one in-flight operation. GATT entities are keyed by their
/// ATT handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OpKey {
    Connect,
    Disconnect,
    ServicesDiscovered,
    CharacteristicsDiscovered(u16),
    DescriptorsDiscovered(u16),
    CharRead(u16),
    CharWrite(u16),
    DescRead(u16),
    DescWrite(u16),
    NotifyState(u16),
}

#[derive(Default)]
pub(crate) struct PendingOps {
    pending: Mutex<HashMap<OpKey, oneshot::Sender<Result<Vec<u8>>>>>,
}

impl PendingOps {
    /// Registers an operation and returns the future its completion will
    /// resolve. At most one operation per key may be in flight.
    pub fn register(&self, key: OpKey) -> Result<oneshot::Receiver<Result<Vec<u8>>>> {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(&key) {
            return Err(Error::InvalidState(format!(
                "operation {key:?} already in flight"
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(key, tx);
        Ok(rx)
    }

    /// Whether an operation with this key is awaiting completion.
    pub fn is_pending(&self, key: OpKey) -> bool {
        self.pending.lock().unwrap().contains_key(&key)
    }

    /// Resolves a pending operation; a completion nobody is waiting for is
    /// dropped (the caller was cancelled, or the event was unsolicited).
    pub fn resolve(&self, key: OpKey, result: Result<Vec<u8>>) {
        let sender = self.pending.lock().unwrap().remove(&key);
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => trace!("completion for {key:?} with no pending operation"),
        }
    }

    /// Fails every pending operation. Used when the link drops.
    pub fn fail_all(&self) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (key, sender) in drained {
            trace!("failing pending {key:?}: disconnected");
            let _ = sender.send(Err(Error::Disconnected));
        }
    }
}

/// Waits for a completed pending operation, mapping channel teardown to a
/// disconnect.
pub(crate) async fn await_op(rx: oneshot::Receiver<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    rx.await.map_err(|_| Error::Disconnected)?
}

/// Gates construction on the manager power state: every unusable state maps
/// to a distinct `BluetoothNotAvailable` reason, and `Unknown` blocks until
/// the first state-update callback decides.
pub(crate) async fn wait_for_powered_on(
    manager: &CBCentralManager,
    central_events: &mut UnboundedReceiver<CentralEvent>,
) -> Result<()> {
    loop {
        let reason = match manager.state() {
            CBManagerState::PoweredOn => return Ok(()),
            CBManagerState::Unknown => {
                match central_events.recv().await {
                    Some(_) => continue,
                    None => return Err(Error::os("central manager event channel closed")),
                }
            }
            CBManagerState::Unsupported => NotAvailableReason::NoBluetooth,
            CBManagerState::Unauthorized => NotAvailableReason::DeniedByUser,
            CBManagerState::PoweredOff => NotAvailableReason::PoweredOff,
            CBManagerState::Resetting => NotAvailableReason::Unknown,
        };
        return Err(Error::BluetoothNotAvailable { reason });
    }
}
