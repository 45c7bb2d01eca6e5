//! Conversions between WinRT and portable types, plus the COM apartment
//! guard.

use crate::{Error, Result};
use log::warn;
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::GattCommunicationStatus;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};
use windows::Win32::System::Com::{
    CoGetApartmentType, CoUninitialize, APTTYPE, APTTYPE_MTA, APTTYPE_NA, APTTYPEQUALIFIER,
};

pub(crate) fn to_uuid(guid: &GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

pub(crate) fn to_guid(uuid: &Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

/// Formats a WinRT `u64` Bluetooth address as colon-separated hex.
pub(crate) fn to_address_string(addr: u64) -> String {
    let bytes = addr.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parses the backend detail string (12 hex digits) back to the `u64`
/// address.
pub(crate) fn parse_address(details: &str) -> Result<u64> {
    u64::from_str_radix(details, 16).map_err(|_| Error::DeviceNotFound)
}

pub(crate) fn check_status(status: GattCommunicationStatus, context: &str) -> Result<()> {
    match status {
        GattCommunicationStatus::Success => Ok(()),
        GattCommunicationStatus::Unreachable => Err(Error::Disconnected),
        GattCommunicationStatus::AccessDenied => Err(Error::Os {
            code: None,
            message: format!("{context}: access denied"),
        }),
        GattCommunicationStatus::ProtocolError => Err(Error::Os {
            code: None,
            message: format!("{context}: GATT protocol error"),
        }),
        other => Err(Error::Os {
            code: Some(other.0),
            message: format!("{context}: communication status {}", other.0),
        }),
    }
}

pub(crate) fn buffer_to_vec(buffer: &IBuffer) -> Result<Vec<u8>> {
    let length = buffer.Length()? as usize;
    let reader = DataReader::FromBuffer(buffer)?;
    let mut data = vec![0u8; length];
    reader.ReadBytes(&mut data)?;
    Ok(data)
}

pub(crate) fn vec_to_buffer(data: &[u8]) -> Result<IBuffer> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(data)?;
    Ok(writer.DetachBuffer()?)
}

/// WinRT callbacks deadlock against a single-threaded apartment; the
/// backend requires the multi-threaded apartment. A stray STA initialized
/// on this thread is torn down, after which the implicit MTA applies.
pub(crate) fn ensure_mta() -> Result<()> {
    let mut apartment = APTTYPE::default();
    let mut qualifier = APTTYPEQUALIFIER::default();
    let queried = unsafe { CoGetApartmentType(&mut apartment, &mut qualifier) };
    match queried {
        Ok(()) if apartment == APTTYPE_MTA || apartment == APTTYPE_NA => Ok(()),
        Ok(()) => {
            warn!("thread was initialized as a single-threaded apartment; uninitializing");
            unsafe { CoUninitialize() };
            Ok(())
        }
        // CO_E_NOTINITIALIZED: no apartment yet, WinRT will join the MTA.
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;

    #[test]
    fn address_round_trip() {
        let addr = 0xE4_5F_01_AB_CD_EFu64;
        assert_eq!(to_address_string(addr), "E4:5F:01:AB:CD:EF");
        assert_eq!(parse_address(&format!("{addr:012X}")).unwrap(), addr);
    }

    #[test]
    fn guid_round_trip() {
        let uuid = uuid_from_u16(0x2a19);
        assert_eq!(to_uuid(&to_guid(&uuid)), uuid);
    }
}
