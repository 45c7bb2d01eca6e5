//! The GATT object model: the service → characteristic → descriptor tree
//! discovered on a connected peripheral.
//!
//! Handles are the OS-reported attribute handles, unique per connection and
//! per entity kind. The tree is built from scratch by the backend on every
//! connection and discarded on disconnect; nothing in it survives the link.

use crate::api::{bleuuid, AttrSpec, CharPropFlags};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Default ATT MTU, and therefore the default write-without-response payload
/// bound of MTU − 3.
pub const DEFAULT_MTU: usize = 23;

/// A GATT service: a group of characteristics, standard or device-specific.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// The OS-reported attribute handle of this service.
    pub handle: u16,
    /// The UUID identifying the kind of service.
    pub uuid: Uuid,
    /// The characteristics of this service, keyed by handle.
    pub characteristics: BTreeMap<u16, Characteristic>,
}

impl Display for Service {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "service {:#06x}: {}",
            self.handle,
            bleuuid::to_short_string(&self.uuid)
        )
    }
}

/// A GATT characteristic, the main point of interaction with a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// The OS-reported attribute handle of this characteristic.
    pub handle: u16,
    /// The UUID identifying what this characteristic is.
    pub uuid: Uuid,
    /// The supported operations. An operation attempted without the matching
    /// flag fails.
    pub properties: CharPropFlags,
    /// Handle of the service this characteristic belongs to.
    pub service_handle: u16,
    /// The descriptors of this characteristic, keyed by handle.
    pub descriptors: BTreeMap<u16, Descriptor>,
    pub(crate) max_write_without_response_size: usize,
}

impl Characteristic {
    pub fn new(handle: u16, uuid: Uuid, properties: CharPropFlags, service_handle: u16) -> Self {
        Characteristic {
            handle,
            uuid,
            properties,
            service_handle,
            descriptors: BTreeMap::new(),
            max_write_without_response_size: DEFAULT_MTU - 3,
        }
    }

    /// The largest payload a write-without-response can carry on the current
    /// connection (negotiated MTU − 3).
    pub fn max_write_without_response(&self) -> usize {
        self.max_write_without_response_size
    }
}

impl Display for Characteristic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "characteristic {:#06x}: {} ({})",
            self.handle,
            bleuuid::to_short_string(&self.uuid),
            self.properties.names().join("|")
        )
    }
}

/// A GATT descriptor: a metadata attribute of a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// The OS-reported attribute handle of this descriptor.
    pub handle: u16,
    /// The UUID identifying what this descriptor is.
    pub uuid: Uuid,
    /// Handle of the characteristic this descriptor belongs to.
    pub characteristic_handle: u16,
}

impl Display for Descriptor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "descriptor {:#06x}: {}",
            self.handle,
            bleuuid::to_short_string(&self.uuid)
        )
    }
}

/// The full GATT tree of one connection, with handle- and UUID-addressed
/// lookup.
///
/// Insertion enforces the tree invariants: parents must exist before their
/// children, and no two entities of the same kind may share a handle. UUID
/// lookup that matches more than one entity fails with
/// [`Error::AmbiguousUuid`]; such entities can only be addressed by handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCollection {
    services: BTreeMap<u16, Service>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        ServiceCollection::default()
    }

    /// The services of this collection, in handle order.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// All characteristics of all services, in handle order.
    pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.services
            .values()
            .flat_map(|service| service.characteristics.values())
    }

    /// All descriptors of all characteristics, in handle order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.characteristics()
            .flat_map(|characteristic| characteristic.descriptors.values())
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn add_service(&mut self, handle: u16, uuid: Uuid) -> Result<()> {
        if self.services.contains_key(&handle) {
            return Err(Error::os(format!(
                "duplicate service handle {handle:#06x} reported by the OS"
            )));
        }
        self.services.insert(
            handle,
            Service {
                handle,
                uuid,
                characteristics: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn add_characteristic(&mut self, characteristic: Characteristic) -> Result<()> {
        if self
            .characteristics()
            .any(|c| c.handle == characteristic.handle)
        {
            return Err(Error::os(format!(
                "duplicate characteristic handle {:#06x} reported by the OS",
                characteristic.handle
            )));
        }
        let service = self
            .services
            .get_mut(&characteristic.service_handle)
            .ok_or_else(|| {
                Error::os(format!(
                    "characteristic {:#06x} references unknown service {:#06x}",
                    characteristic.handle, characteristic.service_handle
                ))
            })?;
        service
            .characteristics
            .insert(characteristic.handle, characteristic);
        Ok(())
    }

    pub fn add_descriptor(&mut self, descriptor: Descriptor) -> Result<()> {
        if self.descriptors().any(|d| d.handle == descriptor.handle) {
            return Err(Error::os(format!(
                "duplicate descriptor handle {:#06x} reported by the OS",
                descriptor.handle
            )));
        }
        let characteristic = self
            .services
            .values_mut()
            .find_map(|service| {
                service
                    .characteristics
                    .get_mut(&descriptor.characteristic_handle)
            })
            .ok_or_else(|| {
                Error::os(format!(
                    "descriptor {:#06x} references unknown characteristic {:#06x}",
                    descriptor.handle, descriptor.characteristic_handle
                ))
            })?;
        characteristic
            .descriptors
            .insert(descriptor.handle, descriptor);
        Ok(())
    }

    /// Records the negotiated MTU on every characteristic of the tree.
    pub(crate) fn set_mtu(&mut self, mtu: usize) {
        let payload = mtu.saturating_sub(3);
        for service in self.services.values_mut() {
            for characteristic in service.characteristics.values_mut() {
                characteristic.max_write_without_response_size = payload;
            }
        }
    }

    /// Looks up a service by handle or UUID. `Ok(None)` when absent; UUID
    /// lookup fails when two services share the UUID.
    pub fn service(&self, spec: impl Into<AttrSpec>) -> Result<Option<&Service>> {
        match spec.into() {
            AttrSpec::Handle(handle) => Ok(self.services.get(&handle)),
            AttrSpec::Uuid(uuid) => {
                let mut matches = self.services.values().filter(|s| s.uuid == uuid);
                match (matches.next(), matches.next()) {
                    (first, None) => Ok(first),
                    (_, Some(_)) => Err(Error::AmbiguousUuid(uuid)),
                }
            }
        }
    }

    /// Looks up a characteristic by handle or UUID.
    pub fn characteristic(&self, spec: impl Into<AttrSpec>) -> Result<&Characteristic> {
        let spec = spec.into();
        match spec {
            AttrSpec::Handle(handle) => self
                .characteristics()
                .find(|c| c.handle == handle)
                .ok_or_else(|| Error::CharacteristicNotFound(spec.to_string())),
            AttrSpec::Uuid(uuid) => {
                let mut matches = self.characteristics().filter(|c| c.uuid == uuid);
                match (matches.next(), matches.next()) {
                    (Some(first), None) => Ok(first),
                    (None, _) => Err(Error::CharacteristicNotFound(spec.to_string())),
                    (Some(_), Some(_)) => Err(Error::AmbiguousUuid(uuid)),
                }
            }
        }
    }

    /// Looks up a descriptor. Descriptors are addressed by handle only.
    pub fn descriptor(&self, handle: u16) -> Result<&Descriptor> {
        self.descriptors()
            .find(|d| d.handle == handle)
            .ok_or_else(|| Error::DescriptorNotFound(format!("handle {handle:#06x}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;

    fn sample_collection() -> ServiceCollection {
        let mut collection = ServiceCollection::new();
        collection
            .add_service(0x0010, uuid_from_u16(0x180f))
            .unwrap();
        collection
            .add_service(0x0020, uuid_from_u16(0x1809))
            .unwrap();
        collection
            .add_characteristic(Characteristic::new(
                0x0012,
                uuid_from_u16(0x2a19),
                CharPropFlags::READ | CharPropFlags::NOTIFY,
                0x0010,
            ))
            .unwrap();
        collection
            .add_characteristic(Characteristic::new(
                0x0022,
                uuid_from_u16(0x2a1c),
                CharPropFlags::INDICATE,
                0x0020,
            ))
            .unwrap();
        collection
            .add_descriptor(Descriptor {
                handle: 0x0013,
                uuid: uuid_from_u16(0x2902),
                characteristic_handle: 0x0012,
            })
            .unwrap();
        collection
    }

    #[test]
    fn tree_links_are_consistent() {
        let collection = sample_collection();
        for descriptor in collection.descriptors() {
            let parent = collection
                .characteristic(descriptor.characteristic_handle)
                .unwrap();
            assert!(parent.descriptors.contains_key(&descriptor.handle));
        }
        for characteristic in collection.characteristics() {
            let parent = collection
                .service(characteristic.service_handle)
                .unwrap()
                .unwrap();
            assert!(parent.characteristics.contains_key(&characteristic.handle));
        }
    }

    #[test]
    fn orphans_are_rejected() {
        let mut collection = ServiceCollection::new();
        let orphan = Characteristic::new(0x0042, uuid_from_u16(0x2a19), CharPropFlags::READ, 0x0040);
        assert!(collection.add_characteristic(orphan).is_err());
        let orphan = Descriptor {
            handle: 0x0043,
            uuid: uuid_from_u16(0x2902),
            characteristic_handle: 0x0042,
        };
        assert!(collection.add_descriptor(orphan).is_err());
    }

    #[test]
    fn duplicate_handles_are_rejected() {
        let mut collection = sample_collection();
        assert!(collection.add_service(0x0010, uuid_from_u16(0x1801)).is_err());
        let duplicate = Characteristic::new(0x0012, uuid_from_u16(0x2a00), CharPropFlags::READ, 0x0020);
        assert!(collection.add_characteristic(duplicate).is_err());
    }

    #[test]
    fn uuid_lookup() {
        let collection = sample_collection();
        let characteristic = collection.characteristic(uuid_from_u16(0x2a19)).unwrap();
        assert_eq!(characteristic.handle, 0x0012);
        assert!(matches!(
            collection.characteristic(uuid_from_u16(0x2aff)),
            Err(Error::CharacteristicNotFound(_))
        ));
    }

    #[test]
    fn duplicate_uuid_requires_handle_lookup() {
        let mut collection = sample_collection();
        // second battery service, same UUID
        collection
            .add_service(0x0030, uuid_from_u16(0x180f))
            .unwrap();
        assert!(matches!(
            collection.service(uuid_from_u16(0x180f)),
            Err(Error::AmbiguousUuid(_))
        ));
        assert!(collection.service(0x0010u16).unwrap().is_some());
        assert!(collection.service(0x0030u16).unwrap().is_some());
    }

    #[test]
    fn descriptor_lookup_by_handle() {
        let collection = sample_collection();
        assert_eq!(collection.descriptor(0x0013).unwrap().uuid, uuid_from_u16(0x2902));
        assert!(matches!(
            collection.descriptor(0x0077),
            Err(Error::DescriptorNotFound(_))
        ));
    }

    #[test]
    fn mtu_updates_write_bound() {
        let mut collection = sample_collection();
        assert_eq!(
            collection
                .characteristic(0x0012u16)
                .unwrap()
                .max_write_without_response(),
            DEFAULT_MTU - 3
        );
        collection.set_mtu(247);
        assert_eq!(
            collection
                .characteristic(0x0012u16)
                .unwrap()
                .max_write_without_response(),
            244
        );
    }
}
