//! Passive scanning via `org.bluez.AdvertisementMonitor1`.
//!
//! For a passive scan the roles flip: this process exports a monitor object
//! carrying the or-patterns, BlueZ matches raw advertisement PDUs against
//! them in the controller, and calls `DeviceFound` back on the monitor. The
//! monitor must be registered before it is exported, otherwise BlueZ
//! ignores it.

use crate::api::OrPattern;
use crate::bluez::defs::*;
use crate::bluez::manager::BluezObjectManager;
use crate::{Error, Result};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use log::{debug, trace};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static MONITOR_COUNT: AtomicUsize = AtomicUsize::new(0);

struct MonitorState {
    patterns: Vec<(u8, u8, Vec<u8>)>,
    device_found: mpsc::UnboundedSender<String>,
}

pub(crate) struct MonitorHandle {
    manager: Arc<BluezObjectManager>,
    adapter_path: String,
    path: dbus::Path<'static>,
}

/// Exports a monitor with the given patterns and registers it with the
/// adapter. `device_found` receives the device object path of every match.
pub(crate) async fn register(
    manager: Arc<BluezObjectManager>,
    adapter_path: &str,
    patterns: &[OrPattern],
    device_found: mpsc::UnboundedSender<String>,
) -> Result<MonitorHandle> {
    let path: dbus::Path<'static> = format!(
        "/io/blecentral/monitor{}",
        MONITOR_COUNT.fetch_add(1, Ordering::Relaxed)
    )
    .into();

    let state = Arc::new(MonitorState {
        patterns: patterns
            .iter()
            .map(|p| (p.start_position, p.data_type, p.content.clone()))
            .collect(),
        device_found,
    });

    // Register first, export second.
    let register = manager
        .proxy(adapter_path.to_owned())
        .method_call::<(), _, _, _>(
            ADVERTISEMENT_MONITOR_MANAGER_INTERFACE,
            "RegisterMonitor",
            (path.clone(),),
        )
        .await;
    match register {
        Ok(()) => {}
        Err(err) if err.name() == Some("org.freedesktop.DBus.Error.UnknownMethod") => {
            return Err(Error::NoPassiveScan(
                "passive scanning requires BlueZ >= 5.55 with advertisement-monitor support"
                    .into(),
            ));
        }
        Err(err) => return Err(err.into()),
    }

    {
        let exports = manager.exports();
        let mut crossroads = exports.lock().unwrap();
        let token = monitor_interface(&mut crossroads);
        crossroads.insert(path.clone(), &[token], state);
    }
    debug!("registered advertisement monitor at {path}");

    Ok(MonitorHandle {
        manager,
        adapter_path: adapter_path.to_owned(),
        path,
    })
}

impl MonitorHandle {
    pub(crate) async fn unregister(&self) -> Result<()> {
        {
            let exports = self.manager.exports();
            let mut crossroads = exports.lock().unwrap();
            let _: Option<Arc<MonitorState>> = crossroads.remove(&self.path);
        }
        self.manager
            .proxy(self.adapter_path.clone())
            .method_call::<(), _, _, _>(
                ADVERTISEMENT_MONITOR_MANAGER_INTERFACE,
                "UnregisterMonitor",
                (self.path.clone(),),
            )
            .await?;
        debug!("unregistered advertisement monitor at {}", self.path);
        Ok(())
    }
}

fn monitor_interface(crossroads: &mut Crossroads) -> IfaceToken<Arc<MonitorState>> {
    crossroads.register(
        ADVERTISEMENT_MONITOR_INTERFACE,
        |builder: &mut IfaceBuilder<Arc<MonitorState>>| {
            builder.method("Release", (), (), |_, _, (): ()| {
                debug!("advertisement monitor released by BlueZ");
                Ok(())
            });
            builder.method("Activate", (), (), |_, _, (): ()| {
                debug!("advertisement monitor activated");
                Ok(())
            });
            builder.method(
                "DeviceFound",
                ("device",),
                (),
                |_, state: &mut Arc<MonitorState>, (device,): (dbus::Path<'static>,)| {
                    trace!("monitor matched {device}");
                    let _ = state.device_found.send(device.to_string());
                    Ok(())
                },
            );
            builder.method(
                "DeviceLost",
                ("device",),
                (),
                |_, _, (device,): (dbus::Path<'static>,)| {
                    trace!("monitor lost {device}");
                    Ok(())
                },
            );
            builder
                .property("Type")
                .get(|_, _| Ok("or_patterns".to_string()));
            builder
                .property("Patterns")
                .get(|_, state| Ok(state.patterns.clone()));
        },
    )
}
