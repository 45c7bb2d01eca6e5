//! Pairing support via `org.bluez.Agent1`.
//!
//! BlueZ routes pairing I/O through an agent object the process exports.
//! The agent methods map one-to-one onto the portable
//! [`PairingAgent`](crate::api::PairingAgent) callbacks; a declined callback
//! answers with `org.bluez.Error.Rejected`, which BlueZ turns into a failed
//! pairing.

use crate::api::{BleDevice, PairingAgent};
use crate::bluez::defs::*;
use crate::bluez::manager::BluezObjectManager;
use crate::Result;
use dbus::MethodErr;
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static AGENT_COUNT: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone)]
struct AgentState {
    agent: Arc<dyn PairingAgent>,
    device: BleDevice,
}

pub(crate) struct AgentHandle {
    manager: Arc<BluezObjectManager>,
    path: dbus::Path<'static>,
}

fn rejected() -> MethodErr {
    MethodErr::from(("org.bluez.Error.Rejected", "rejected by pairing agent"))
}

fn canceled() -> MethodErr {
    MethodErr::from(("org.bluez.Error.Canceled", "pairing agent failed"))
}

/// Exports an agent bound to `device` and registers it with BlueZ for the
/// duration of one pairing attempt.
pub(crate) async fn register(
    manager: Arc<BluezObjectManager>,
    agent: Arc<dyn PairingAgent>,
    device: BleDevice,
) -> Result<AgentHandle> {
    let path: dbus::Path<'static> = format!(
        "/io/blecentral/agent{}",
        AGENT_COUNT.fetch_add(1, Ordering::Relaxed)
    )
    .into();

    {
        let exports = manager.exports();
        let mut crossroads = exports.lock().unwrap();
        let token = agent_interface(&mut crossroads);
        crossroads.insert(path.clone(), &[token], AgentState { agent, device });
    }

    manager
        .proxy(BLUEZ_ROOT)
        .method_call::<(), _, _, _>(
            AGENT_MANAGER_INTERFACE,
            "RegisterAgent",
            (path.clone(), "KeyboardDisplay"),
        )
        .await?;
    // Make BlueZ prefer this agent over the system one for our requests.
    if let Err(err) = manager
        .proxy(BLUEZ_ROOT)
        .method_call::<(), _, _, _>(AGENT_MANAGER_INTERFACE, "RequestDefaultAgent", (path.clone(),))
        .await
    {
        warn!("could not become default pairing agent: {err}");
    }
    debug!("registered pairing agent at {path}");

    Ok(AgentHandle { manager, path })
}

impl AgentHandle {
    pub(crate) async fn unregister(&self) -> Result<()> {
        let result = self
            .manager
            .proxy(BLUEZ_ROOT)
            .method_call::<(), _, _, _>(AGENT_MANAGER_INTERFACE, "UnregisterAgent", (self.path.clone(),))
            .await;
        {
            let exports = self.manager.exports();
            let mut crossroads = exports.lock().unwrap();
            let _: Option<AgentState> = crossroads.remove(&self.path);
        }
        result?;
        debug!("unregistered pairing agent at {}", self.path);
        Ok(())
    }
}

fn agent_interface(crossroads: &mut Crossroads) -> IfaceToken<AgentState> {
    crossroads.register(AGENT_INTERFACE, |builder: &mut IfaceBuilder<AgentState>| {
        builder.method("Release", (), (), |_, _, (): ()| {
            debug!("pairing agent released");
            Ok(())
        });
        builder.method("Cancel", (), (), |_, _, (): ()| {
            debug!("pairing request cancelled by BlueZ");
            Ok(())
        });

        builder.method_with_cr_async(
            "RequestPinCode",
            ("device",),
            ("pincode",),
            |mut ctx, cr, (device,): (dbus::Path<'static>,)| {
                trace!("RequestPinCode for {device}");
                let state = cr.data_mut::<AgentState>(ctx.path()).cloned();
                async move {
                    let reply = match state {
                        Some(state) => match state.agent.request_pin(&state.device).await {
                            Ok(Some(pin)) => Ok((pin,)),
                            Ok(None) => Err(rejected()),
                            Err(_) => Err(canceled()),
                        },
                        None => Err(MethodErr::no_path(ctx.path())),
                    };
                    ctx.reply(reply)
                }
            },
        );

        builder.method_with_cr_async(
            "RequestPasskey",
            ("device",),
            ("passkey",),
            |mut ctx, cr, (device,): (dbus::Path<'static>,)| {
                trace!("RequestPasskey for {device}");
                let state = cr.data_mut::<AgentState>(ctx.path()).cloned();
                async move {
                    let reply = match state {
                        Some(state) => match state.agent.request_pin(&state.device).await {
                            Ok(Some(pin)) => match pin.parse::<u32>() {
                                Ok(passkey) if passkey < 1_000_000 => Ok((passkey,)),
                                _ => Err(rejected()),
                            },
                            Ok(None) => Err(rejected()),
                            Err(_) => Err(canceled()),
                        },
                        None => Err(MethodErr::no_path(ctx.path())),
                    };
                    ctx.reply(reply)
                }
            },
        );

        builder.method_with_cr_async(
            "DisplayPinCode",
            ("device", "pincode"),
            (),
            |mut ctx, cr, (device, pincode): (dbus::Path<'static>, String)| {
                trace!("DisplayPinCode for {device}");
                let state = cr.data_mut::<AgentState>(ctx.path()).cloned();
                async move {
                    let reply = match state {
                        Some(state) => match state.agent.display_pin(&state.device, &pincode).await
                        {
                            Ok(()) => Ok(()),
                            Err(_) => Err(canceled()),
                        },
                        None => Err(MethodErr::no_path(ctx.path())),
                    };
                    ctx.reply(reply)
                }
            },
        );

        builder.method_with_cr_async(
            "DisplayPasskey",
            ("device", "passkey", "entered"),
            (),
            |mut ctx, cr, (device, passkey, _entered): (dbus::Path<'static>, u32, u16)| {
                trace!("DisplayPasskey for {device}");
                let state = cr.data_mut::<AgentState>(ctx.path()).cloned();
                async move {
                    let reply = match state {
                        Some(state) => {
                            let pin = format!("{passkey:06}");
                            match state.agent.display_pin(&state.device, &pin).await {
                                Ok(()) => Ok(()),
                                Err(_) => Err(canceled()),
                            }
                        }
                        None => Err(MethodErr::no_path(ctx.path())),
                    };
                    ctx.reply(reply)
                }
            },
        );

        builder.method_with_cr_async(
            "RequestConfirmation",
            ("device", "passkey"),
            (),
            |mut ctx, cr, (device, passkey): (dbus::Path<'static>, u32)| {
                trace!("RequestConfirmation for {device}");
                let state = cr.data_mut::<AgentState>(ctx.path()).cloned();
                async move {
                    let reply = match state {
                        Some(state) => {
                            let pin = format!("{passkey:06}");
                            match state.agent.confirm_pin(&state.device, &pin).await {
                                Ok(true) => Ok(()),
                                Ok(false) => Err(rejected()),
                                Err(_) => Err(canceled()),
                            }
                        }
                        None => Err(MethodErr::no_path(ctx.path())),
                    };
                    ctx.reply(reply)
                }
            },
        );

        builder.method_with_cr_async(
            "RequestAuthorization",
            ("device",),
            (),
            |mut ctx, cr, (device,): (dbus::Path<'static>,)| {
                trace!("RequestAuthorization for {device}");
                let state = cr.data_mut::<AgentState>(ctx.path()).cloned();
                async move {
                    let reply = match state {
                        Some(state) => match state.agent.confirm(&state.device).await {
                            Ok(true) => Ok(()),
                            Ok(false) => Err(rejected()),
                            Err(_) => Err(canceled()),
                        },
                        None => Err(MethodErr::no_path(ctx.path())),
                    };
                    ctx.reply(reply)
                }
            },
        );

        // Service authorization is not a pairing decision; accept it.
        builder.method(
            "AuthorizeService",
            ("device", "uuid"),
            (),
            |_, _, (device, uuid): (dbus::Path<'static>, String)| {
                trace!("AuthorizeService {uuid} for {device}");
                Ok(())
            },
        );
    })
}
