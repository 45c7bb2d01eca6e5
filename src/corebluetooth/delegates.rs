//! Objective-C delegate classes, declared at runtime, that forward every
//! CoreBluetooth callback into a channel. The sender is boxed into an ivar
//! at init and reclaimed at dealloc; callbacks run on the central manager's
//! dispatch queue and must do nothing but convert and send.

#![allow(clippy::let_unit_value)]

use objc::declare::ClassDecl;
use objc::runtime::{Class, Object, Protocol, Sel};
use objc::{class, msg_send, sel, sel_impl};
use objc_id::{Id, ShareId};
use std::os::raw::c_void;
use std::sync::Once;
use tokio::sync::mpsc::UnboundedSender;

use super::types::{id, CBCharacteristic, CBDescriptor, CBPeripheral, CBService, NSError};

pub(crate) enum CentralEvent {
    StateChanged,
    Discovered {
        peripheral: ShareId<CBPeripheral>,
        adv_data: ShareId<objc_foundation::NSDictionary<objc_foundation::NSString, objc_foundation::NSObject>>,
        rssi: i16,
    },
    Connected {
        peripheral: ShareId<CBPeripheral>,
    },
    ConnectFailed {
        peripheral: ShareId<CBPeripheral>,
        error: Option<ShareId<NSError>>,
    },
    Disconnected {
        peripheral: ShareId<CBPeripheral>,
        error: Option<ShareId<NSError>>,
    },
}

pub(crate) enum PeripheralEvent {
    DiscoveredServices {
        error: Option<ShareId<NSError>>,
    },
    DiscoveredCharacteristics {
        service: ShareId<CBService>,
        error: Option<ShareId<NSError>>,
    },
    DiscoveredDescriptors {
        characteristic: ShareId<CBCharacteristic>,
        error: Option<ShareId<NSError>>,
    },
    CharacteristicValueUpdate {
        characteristic: ShareId<CBCharacteristic>,
        error: Option<ShareId<NSError>>,
    },
    CharacteristicValueWrite {
        characteristic: ShareId<CBCharacteristic>,
        error: Option<ShareId<NSError>>,
    },
    DescriptorValueUpdate {
        descriptor: ShareId<CBDescriptor>,
        error: Option<ShareId<NSError>>,
    },
    DescriptorValueWrite {
        descriptor: ShareId<CBDescriptor>,
        error: Option<ShareId<NSError>>,
    },
    NotificationStateUpdate {
        characteristic: ShareId<CBCharacteristic>,
        error: Option<ShareId<NSError>>,
    },
}

// CoreBluetooth objects are safe to message from any thread; the events
// only carry retained object pointers.
unsafe impl Send for CentralEvent {}
unsafe impl Send for PeripheralEvent {}

fn nullable_error(error: id) -> Option<ShareId<NSError>> {
    unsafe { (!error.is_null()).then(|| ShareId::from_ptr(error as *mut NSError)) }
}

pub(crate) struct CentralDelegate {
    _private: (),
}
unsafe impl objc::Message for CentralDelegate {}

impl CentralDelegate {
    pub fn with_sender(sender: UnboundedSender<CentralEvent>) -> Id<CentralDelegate> {
        unsafe {
            let obj: *mut Self = msg_send![Self::class(), alloc];
            let obj: *mut Self =
                msg_send![obj, initWithSender: Box::into_raw(Box::new(sender)) as *mut c_void];
            Id::from_retained_ptr(obj)
        }
    }

    extern "C" fn init(this: &mut Object, _sel: Sel, sender: *mut c_void) -> id {
        unsafe { this.set_ivar("sender", sender) };
        this
    }

    extern "C" fn dealloc(this: &mut Object, _sel: Sel) {
        unsafe {
            let sender: *mut c_void = *this.get_ivar("sender");
            this.set_ivar("sender", std::ptr::null_mut::<c_void>());
            if !sender.is_null() {
                drop(Box::from_raw(sender as *mut UnboundedSender<CentralEvent>));
            }
        }
    }

    fn send(this: &mut Object, event: CentralEvent) {
        unsafe {
            let sender =
                *this.get_ivar::<*mut c_void>("sender") as *mut UnboundedSender<CentralEvent>;
            if !sender.is_null() {
                let _ = (*sender).send(event);
            }
        }
    }

    extern "C" fn did_update_state(this: &mut Object, _sel: Sel, _central: id) {
        Self::send(this, CentralEvent::StateChanged);
    }

    extern "C" fn did_discover_peripheral(
        this: &mut Object,
        _sel: Sel,
        _central: id,
        peripheral: id,
        adv_data: id,
        rssi: id,
    ) {
        unsafe {
            let rssi: i16 = msg_send![rssi, shortValue];
            Self::send(
                this,
                CentralEvent::Discovered {
                    peripheral: ShareId::from_ptr(peripheral as *mut _),
                    adv_data: ShareId::from_ptr(adv_data as *mut _),
                    rssi,
                },
            );
        }
    }

    extern "C" fn did_connect(this: &mut Object, _sel: Sel, _central: id, peripheral: id) {
        unsafe {
            Self::send(
                this,
                CentralEvent::Connected {
                    peripheral: ShareId::from_ptr(peripheral as *mut _),
                },
            );
        }
    }

    extern "C" fn did_fail_to_connect(
        this: &mut Object,
        _sel: Sel,
        _central: id,
        peripheral: id,
        error: id,
    ) {
        unsafe {
            Self::send(
                this,
                CentralEvent::ConnectFailed {
                    peripheral: ShareId::from_ptr(peripheral as *mut _),
                    error: nullable_error(error),
                },
            );
        }
    }

    extern "C" fn did_disconnect(
        this: &mut Object,
        _sel: Sel,
        _central: id,
        peripheral: id,
        error: id,
    ) {
        unsafe {
            Self::send(
                this,
                CentralEvent::Disconnected {
                    peripheral: ShareId::from_ptr(peripheral as *mut _),
                    error: nullable_error(error),
                },
            );
        }
    }

    fn class() -> &'static Class {
        static REGISTER: Once = Once::new();
        REGISTER.call_once(|| {
            let mut decl =
                ClassDecl::new("BlecentralCentralDelegate", class!(NSObject)).unwrap();
            decl.add_ivar::<*mut c_void>("sender");
            decl.add_protocol(Protocol::get("CBCentralManagerDelegate").unwrap());

            unsafe {
                decl.add_method(
                    sel!(initWithSender:),
                    Self::init as extern "C" fn(&mut Object, Sel, *mut c_void) -> id,
                );
                decl.add_method(sel!(dealloc), Self::dealloc as extern "C" fn(&mut Object, Sel));
                decl.add_method(
                    sel!(centralManagerDidUpdateState:),
                    Self::did_update_state as extern "C" fn(&mut Object, Sel, id),
                );
                decl.add_method(
                    sel!(centralManager:didDiscoverPeripheral:advertisementData:RSSI:),
                    Self::did_discover_peripheral
                        as extern "C" fn(&mut Object, Sel, id, id, id, id),
                );
                decl.add_method(
                    sel!(centralManager:didConnectPeripheral:),
                    Self::did_connect as extern "C" fn(&mut Object, Sel, id, id),
                );
                decl.add_method(
                    sel!(centralManager:didFailToConnectPeripheral:error:),
                    Self::did_fail_to_connect as extern "C" fn(&mut Object, Sel, id, id, id),
                );
                decl.add_method(
                    sel!(centralManager:didDisconnectPeripheral:error:),
                    Self::did_disconnect as extern "C" fn(&mut Object, Sel, id, id, id),
                );
            }

            decl.register();
        });

        class!(BlecentralCentralDelegate)
    }
}

pub(crate) struct PeripheralDelegate {
    _private: (),
}
unsafe impl objc::Message for PeripheralDelegate {}

macro_rules! peripheral_callback {
    ($name:ident => $event:ident { $($field:ident),* }) => {
        extern "C" fn $name(this: &mut Object, _sel: Sel, _peripheral: id, $($field: id),*) {
            unsafe {
                let sender = *this.get_ivar::<*mut c_void>("sender")
                    as *mut UnboundedSender<PeripheralEvent>;
                if !sender.is_null() {
                    let _ = (*sender).send(peripheral_callback!(@build $event, $($field),*));
                }
            }
        }
    };
    (@build $event:ident, error) => {
        PeripheralEvent::$event { error: nullable_error(error) }
    };
    (@build $event:ident, $object:ident, error) => {
        PeripheralEvent::$event {
            $object: unsafe { ShareId::from_ptr($object as *mut _) },
            error: nullable_error(error),
        }
    };
}

impl PeripheralDelegate {
    pub fn with_sender(sender: UnboundedSender<PeripheralEvent>) -> Id<PeripheralDelegate> {
        unsafe {
            let obj: *mut Self = msg_send![Self::class(), alloc];
            let obj: *mut Self =
                msg_send![obj, initWithSender: Box::into_raw(Box::new(sender)) as *mut c_void];
            Id::from_retained_ptr(obj)
        }
    }

    extern "C" fn init(this: &mut Object, _sel: Sel, sender: *mut c_void) -> id {
        unsafe { this.set_ivar("sender", sender) };
        this
    }

    extern "C" fn dealloc(this: &mut Object, _sel: Sel) {
        unsafe {
            let sender: *mut c_void = *this.get_ivar("sender");
            this.set_ivar("sender", std::ptr::null_mut::<c_void>());
            if !sender.is_null() {
                drop(Box::from_raw(sender as *mut UnboundedSender<PeripheralEvent>));
            }
        }
    }

    peripheral_callback!(did_discover_services => DiscoveredServices { error });
    peripheral_callback!(did_discover_characteristics => DiscoveredCharacteristics { service, error });
    peripheral_callback!(did_discover_descriptors => DiscoveredDescriptors { characteristic, error });
    peripheral_callback!(did_update_value_for_characteristic => CharacteristicValueUpdate { characteristic, error });
    peripheral_callback!(did_write_value_for_characteristic => CharacteristicValueWrite { characteristic, error });
    peripheral_callback!(did_update_value_for_descriptor => DescriptorValueUpdate { descriptor, error });
    peripheral_callback!(did_write_value_for_descriptor => DescriptorValueWrite { descriptor, error });
    peripheral_callback!(did_update_notification_state => NotificationStateUpdate { characteristic, error });

    fn class() -> &'static Class {
        static REGISTER: Once = Once::new();
        REGISTER.call_once(|| {
            let mut decl =
                ClassDecl::new("BlecentralPeripheralDelegate", class!(NSObject)).unwrap();
            decl.add_ivar::<*mut c_void>("sender");
            decl.add_protocol(Protocol::get("CBPeripheralDelegate").unwrap());

            unsafe {
                decl.add_method(
                    sel!(initWithSender:),
                    Self::init as extern "C" fn(&mut Object, Sel, *mut c_void) -> id,
                );
                decl.add_method(sel!(dealloc), Self::dealloc as extern "C" fn(&mut Object, Sel));
                decl.add_method(
                    sel!(peripheral:didDiscoverServices:),
                    Self::did_discover_services as extern "C" fn(&mut Object, Sel, id, id),
                );
                decl.add_method(
                    sel!(peripheral:didDiscoverCharacteristicsForService:error:),
                    Self::did_discover_characteristics
                        as extern "C" fn(&mut Object, Sel, id, id, id),
                );
                decl.add_method(
                    sel!(peripheral:didDiscoverDescriptorsForCharacteristic:error:),
                    Self::did_discover_descriptors as extern "C" fn(&mut Object, Sel, id, id, id),
                );
                decl.add_method(
                    sel!(peripheral:didUpdateValueForCharacteristic:error:),
                    Self::did_update_value_for_characteristic
                        as extern "C" fn(&mut Object, Sel, id, id, id),
                );
                decl.add_method(
                    sel!(peripheral:didWriteValueForCharacteristic:error:),
                    Self::did_write_value_for_characteristic
                        as extern "C" fn(&mut Object, Sel, id, id, id),
                );
                decl.add_method(
                    sel!(peripheral:didUpdateValueForDescriptor:error:),
                    Self::did_update_value_for_descriptor
                        as extern "C" fn(&mut Object, Sel, id, id, id),
                );
                decl.add_method(
                    sel!(peripheral:didWriteValueForDescriptor:error:),
                    Self::did_write_value_for_descriptor
                        as extern "C" fn(&mut Object, Sel, id, id, id),
                );
                decl.add_method(
                    sel!(peripheral:didUpdateNotificationStateForCharacteristic:error:),
                    Self::did_update_notification_state
                        as extern "C" fn(&mut Object, Sel, id, id, id),
                );
            }

            decl.register();
        });

        class!(BlecentralPeripheralDelegate)
    }
}
