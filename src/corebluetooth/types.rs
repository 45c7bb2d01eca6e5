//! Minimal Objective-C bindings for the CoreBluetooth classes this backend
//! drives. Methods may be called from any thread; delegate callbacks arrive
//! on the dispatch queue handed to the central manager.

#![allow(clippy::let_unit_value)]

use crate::api::bleuuid::{uuid_from_u16, uuid_from_u32};
use objc::runtime::{Object, BOOL, NO};
use objc::{class, msg_send, sel, sel_impl};
use objc_foundation::{
    object_struct, INSData, INSObject, INSString, NSArray, NSData, NSDictionary, NSObject,
    NSString,
};
use objc_id::{Id, ShareId};
use std::os::raw::c_char;
use uuid::Uuid;

use super::delegates::{CentralDelegate, PeripheralDelegate};

#[allow(non_camel_case_types)]
pub type id = *mut Object;

pub type NSInteger = isize;
pub type NSUInteger = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CBManagerState {
    Unknown = 0,
    Resetting = 1,
    Unsupported = 2,
    Unauthorized = 3,
    PoweredOff = 4,
    PoweredOn = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CBCharacteristicWriteType {
    WithResponse = 0,
    WithoutResponse = 1,
}

#[link(name = "CoreBluetooth", kind = "framework")]
extern "C" {
    pub fn dispatch_queue_create(label: *const c_char, attr: id) -> id;
}

/// A serial dispatch queue for delegate callbacks.
pub fn serial_queue(label: &'static [u8]) -> id {
    unsafe { dispatch_queue_create(label.as_ptr() as *const c_char, std::ptr::null_mut()) }
}

fn id_or_nil<T, O>(val: &Option<Id<T, O>>) -> *const T {
    match val {
        Some(x) => &**x,
        None => std::ptr::null(),
    }
}

object_struct!(NSError);
object_struct!(NSUUID);
object_struct!(NSNumber);
object_struct!(CBUUID);
object_struct!(CBCentralManager);
object_struct!(CBPeripheral);
object_struct!(CBService);
object_struct!(CBCharacteristic);
object_struct!(CBDescriptor);

impl NSError {
    pub fn code(&self) -> NSInteger {
        unsafe { msg_send![self, code] }
    }

    pub fn localized_description(&self) -> String {
        unsafe {
            let description: *mut NSString = msg_send![self, localizedDescription];
            let description = ShareId::from_ptr(description);
            description.as_str().to_string()
        }
    }
}

impl NSNumber {
    pub fn as_i16(&self) -> i16 {
        unsafe { msg_send![self, shortValue] }
    }
}

impl NSUUID {
    pub fn from_uuid(uuid: Uuid) -> Id<Self> {
        unsafe {
            let string = NSString::from_str(&uuid.to_string());
            let obj: *mut Self = msg_send![class!(NSUUID), alloc];
            let obj: *mut Self = msg_send![obj, initWithUUIDString: &*string];
            Id::from_retained_ptr(obj)
        }
    }

    pub fn to_uuid(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        let _: () = unsafe { msg_send![self, getUUIDBytes: bytes.as_mut_ptr()] };
        Uuid::from_bytes(bytes)
    }
}

impl CBUUID {
    /// CoreBluetooth abbreviates Bluetooth-base UUIDs to 2 or 4 bytes; this
    /// expands them back to canonical 128-bit form.
    pub fn to_uuid(&self) -> Uuid {
        unsafe {
            let data: *mut NSData = msg_send![self, data];
            let data = ShareId::from_ptr(data);
            let bytes = data.bytes();
            match bytes.len() {
                2 => uuid_from_u16(u16::from_be_bytes([bytes[0], bytes[1]])),
                4 => uuid_from_u32(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
                16 => Uuid::from_slice(bytes).unwrap_or_else(|_| Uuid::nil()),
                _ => Uuid::nil(),
            }
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Id<Self> {
        unsafe {
            let string = NSString::from_str(&uuid.to_string());
            let obj: *mut Self = msg_send![class!(CBUUID), UUIDWithString: &*string];
            Id::from_retained_ptr(obj)
        }
    }
}

impl CBCentralManager {
    pub fn with_delegate(delegate: &CentralDelegate, queue: id) -> Id<CBCentralManager> {
        unsafe {
            let obj: *mut Self = msg_send![class!(CBCentralManager), alloc];
            let obj: *mut Self = msg_send![obj, initWithDelegate: delegate queue: queue];
            Id::from_retained_ptr(obj)
        }
    }

    pub fn state(&self) -> CBManagerState {
        let state: NSInteger = unsafe { msg_send![self, state] };
        match state {
            1 => CBManagerState::Resetting,
            2 => CBManagerState::Unsupported,
            3 => CBManagerState::Unauthorized,
            4 => CBManagerState::PoweredOff,
            5 => CBManagerState::PoweredOn,
            _ => CBManagerState::Unknown,
        }
    }

    pub fn scan_for_peripherals(&self, services: Option<Id<NSArray<CBUUID>>>) {
        unsafe {
            // Without AllowDuplicates a peripheral is reported once per scan,
            // not once per advertisement.
            let key = NSString::from_str("kCBScanOptionAllowDuplicates");
            let yes: *mut Object = msg_send![class!(NSNumber), numberWithBool: true];
            let options: *mut Object = msg_send![
                class!(NSDictionary),
                dictionaryWithObject: yes
                forKey: &*key
            ];
            let _: () = msg_send![
                self,
                scanForPeripheralsWithServices: id_or_nil(&services)
                options: options
            ];
        }
    }

    pub fn stop_scan(&self) {
        unsafe { msg_send![self, stopScan] }
    }

    pub fn retrieve_peripheral(&self, identifier: Uuid) -> Option<ShareId<CBPeripheral>> {
        unsafe {
            let uuid = NSUUID::from_uuid(identifier);
            let identifiers: *mut Object =
                msg_send![class!(NSArray), arrayWithObject: &*uuid];
            let peripherals: *mut NSArray<CBPeripheral> =
                msg_send![self, retrievePeripheralsWithIdentifiers: identifiers];
            let count: NSUInteger = msg_send![peripherals, count];
            if count == 0 {
                return None;
            }
            let peripheral: *mut CBPeripheral = msg_send![peripherals, objectAtIndex: 0usize];
            Some(ShareId::from_ptr(peripheral))
        }
    }

    pub fn connect_peripheral(&self, peripheral: &CBPeripheral) {
        unsafe { msg_send![self, connectPeripheral: peripheral options: std::ptr::null::<Object>()] }
    }

    pub fn cancel_peripheral_connection(&self, peripheral: &CBPeripheral) {
        unsafe { msg_send![self, cancelPeripheralConnection: peripheral] }
    }
}

impl CBPeripheral {
    pub fn identifier(&self) -> Uuid {
        unsafe {
            let id: *mut NSUUID = msg_send![self, identifier];
            let id = ShareId::from_ptr(id);
            id.to_uuid()
        }
    }

    pub fn name(&self) -> Option<String> {
        unsafe {
            let name: *mut NSString = msg_send![self, name];
            (!name.is_null()).then(|| ShareId::from_ptr(name).as_str().to_string())
        }
    }

    pub fn set_delegate(&self, delegate: &PeripheralDelegate) {
        unsafe { msg_send![self, setDelegate: delegate] }
    }

    pub fn services(&self) -> Vec<ShareId<CBService>> {
        unsafe {
            let services: *mut NSArray<CBService> = msg_send![self, services];
            nsarray_to_vec(services)
        }
    }

    pub fn discover_services(&self, services: Option<Id<NSArray<CBUUID>>>) {
        unsafe { msg_send![self, discoverServices: id_or_nil(&services)] }
    }

    pub fn discover_characteristics(&self, service: &CBService) {
        unsafe {
            msg_send![self, discoverCharacteristics: std::ptr::null::<Object>() forService: service]
        }
    }

    pub fn discover_descriptors(&self, characteristic: &CBCharacteristic) {
        unsafe { msg_send![self, discoverDescriptorsForCharacteristic: characteristic] }
    }

    pub fn read_characteristic_value(&self, characteristic: &CBCharacteristic) {
        unsafe { msg_send![self, readValueForCharacteristic: characteristic] }
    }

    pub fn read_descriptor_value(&self, descriptor: &CBDescriptor) {
        unsafe { msg_send![self, readValueForDescriptor: descriptor] }
    }

    pub fn write_characteristic_value(
        &self,
        characteristic: &CBCharacteristic,
        value: &[u8],
        write_type: CBCharacteristicWriteType,
    ) {
        unsafe {
            let data = NSData::from_vec(value.to_vec());
            let write_type = write_type as NSInteger;
            msg_send![self, writeValue: &*data forCharacteristic: characteristic type: write_type]
        }
    }

    pub fn write_descriptor_value(&self, descriptor: &CBDescriptor, value: &[u8]) {
        unsafe {
            let data = NSData::from_vec(value.to_vec());
            msg_send![self, writeValue: &*data forDescriptor: descriptor]
        }
    }

    pub fn set_notify(&self, characteristic: &CBCharacteristic, enabled: bool) {
        unsafe { msg_send![self, setNotifyValue: enabled as BOOL forCharacteristic: characteristic] }
    }

    pub fn maximum_write_value_length(&self, write_type: CBCharacteristicWriteType) -> usize {
        let write_type = write_type as NSInteger;
        unsafe { msg_send![self, maximumWriteValueLengthForType: write_type] }
    }
}

impl CBService {
    pub fn uuid(&self) -> Uuid {
        unsafe {
            let uuid: *mut CBUUID = msg_send![self, UUID];
            ShareId::from_ptr(uuid).to_uuid()
        }
    }

    /// The ATT handle. CoreBluetooth keeps this selector private; there is
    /// no public equivalent.
    pub fn handle(&self) -> u16 {
        let handle: NSUInteger = unsafe { msg_send![self, startHandle] };
        handle as u16
    }

    pub fn characteristics(&self) -> Vec<ShareId<CBCharacteristic>> {
        unsafe {
            let characteristics: *mut NSArray<CBCharacteristic> =
                msg_send![self, characteristics];
            nsarray_to_vec(characteristics)
        }
    }
}

impl CBCharacteristic {
    pub fn uuid(&self) -> Uuid {
        unsafe {
            let uuid: *mut CBUUID = msg_send![self, UUID];
            ShareId::from_ptr(uuid).to_uuid()
        }
    }

    /// The ATT handle, via the same private selector as [`CBService::handle`].
    pub fn handle(&self) -> u16 {
        let handle: NSUInteger = unsafe { msg_send![self, handle] };
        handle as u16
    }

    pub fn properties(&self) -> NSUInteger {
        unsafe { msg_send![self, properties] }
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        unsafe {
            let value: *mut NSData = msg_send![self, value];
            (!value.is_null()).then(|| ShareId::from_ptr(value).bytes().to_vec())
        }
    }

    pub fn is_notifying(&self) -> bool {
        let notifying: BOOL = unsafe { msg_send![self, isNotifying] };
        notifying != NO
    }

    pub fn descriptors(&self) -> Vec<ShareId<CBDescriptor>> {
        unsafe {
            let descriptors: *mut NSArray<CBDescriptor> = msg_send![self, descriptors];
            nsarray_to_vec(descriptors)
        }
    }
}

impl CBDescriptor {
    pub fn uuid(&self) -> Uuid {
        unsafe {
            let uuid: *mut CBUUID = msg_send![self, UUID];
            ShareId::from_ptr(uuid).to_uuid()
        }
    }

    pub fn handle(&self) -> u16 {
        let handle: NSUInteger = unsafe { msg_send![self, handle] };
        handle as u16
    }

    /// Descriptor values are NSData, NSString, or NSNumber depending on the
    /// descriptor; normalize everything to bytes.
    pub fn value_bytes(&self) -> Option<Vec<u8>> {
        unsafe {
            let value: *mut NSObject = msg_send![self, value];
            if value.is_null() {
                return None;
            }
            let is_data: BOOL = msg_send![value, isKindOfClass: class!(NSData)];
            if is_data != NO {
                let data = ShareId::<NSData>::from_ptr(value as *mut NSData);
                return Some(data.bytes().to_vec());
            }
            let is_string: BOOL = msg_send![value, isKindOfClass: class!(NSString)];
            if is_string != NO {
                let string = ShareId::<NSString>::from_ptr(value as *mut NSString);
                return Some(string.as_str().as_bytes().to_vec());
            }
            let is_number: BOOL = msg_send![value, isKindOfClass: class!(NSNumber)];
            if is_number != NO {
                let number = ShareId::<NSNumber>::from_ptr(value as *mut NSNumber);
                return Some(number.as_i16().to_le_bytes().to_vec());
            }
            None
        }
    }
}

unsafe fn nsarray_to_vec<T: objc::Message>(array: *mut NSArray<T>) -> Vec<ShareId<T>> {
    if array.is_null() {
        return Vec::new();
    }
    let count: NSUInteger = msg_send![array, count];
    (0..count)
        .map(|index| {
            let item: *mut T = msg_send![array, objectAtIndex: index];
            ShareId::from_ptr(item)
        })
        .collect()
}

/// Parses the advertisement dictionary delivered with a discovery event.
pub fn advertisement_from_dictionary(
    adv_data: &NSDictionary<NSString, NSObject>,
    rssi: i16,
) -> crate::api::AdvertisementData {
    use std::collections::HashMap;

    let mut data = crate::api::AdvertisementData {
        rssi: Some(rssi),
        ..Default::default()
    };

    unsafe {
        let local_name: *mut Object = dict_value(adv_data, "kCBAdvDataLocalName");
        if !local_name.is_null() {
            let name = ShareId::<NSString>::from_ptr(local_name as *mut NSString);
            data.local_name = Some(name.as_str().to_string());
        }

        let manufacturer: *mut Object = dict_value(adv_data, "kCBAdvDataManufacturerData");
        if !manufacturer.is_null() {
            let bytes = ShareId::<NSData>::from_ptr(manufacturer as *mut NSData);
            let bytes = bytes.bytes();
            if bytes.len() >= 2 {
                let company = u16::from_le_bytes([bytes[0], bytes[1]]);
                data.manufacturer_data = HashMap::from([(company, bytes[2..].to_vec())]);
            }
        }

        let service_data: *mut Object = dict_value(adv_data, "kCBAdvDataServiceData");
        if !service_data.is_null() {
            let dictionary = service_data as *mut NSDictionary<CBUUID, NSData>;
            let keys: *mut NSArray<CBUUID> = msg_send![dictionary, allKeys];
            for key in nsarray_to_vec(keys) {
                let value: *mut NSData = msg_send![dictionary, objectForKey: &*key];
                if !value.is_null() {
                    let value = ShareId::<NSData>::from_ptr(value);
                    data.service_data
                        .insert(key.to_uuid(), value.bytes().to_vec());
                }
            }
        }

        let service_uuids: *mut Object = dict_value(adv_data, "kCBAdvDataServiceUUIDs");
        if !service_uuids.is_null() {
            let array = service_uuids as *mut NSArray<CBUUID>;
            data.service_uuids = nsarray_to_vec(array)
                .into_iter()
                .map(|uuid| uuid.to_uuid())
                .collect();
        }

        let tx_power: *mut Object = dict_value(adv_data, "kCBAdvDataTxPowerLevel");
        if !tx_power.is_null() {
            let number = ShareId::<NSNumber>::from_ptr(tx_power as *mut NSNumber);
            data.tx_power = Some(number.as_i16());
        }
    }

    data
}

unsafe fn dict_value(dictionary: &NSDictionary<NSString, NSObject>, key: &str) -> *mut Object {
    let key = NSString::from_str(key);
    msg_send![dictionary, objectForKey: &*key]
}
