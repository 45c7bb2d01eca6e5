//! BLE UUID handling.
//!
//! GATT interfaces hand UUIDs around in three shapes: 16-bit and 32-bit
//! shorthand occupying the four leading bytes of the Bluetooth Base UUID,
//! and full 128-bit vendor UUIDs. Everything here normalizes toward the
//! canonical 128-bit form on the way in and the shortest faithful form on
//! the way out.

use crate::{Error, Result};
use uuid::Uuid;

/// The Bluetooth Base UUID. A shorthand UUID is this value with the short
/// form written into the zeroed leading four bytes.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// The Client Characteristic Configuration Descriptor, whose write enables
/// notifications (0x0001) or indications (0x0002) on its characteristic.
pub const CCCD_UUID: Uuid = uuid_from_u16(0x2902);

/// Expands a 32-bit shorthand UUID against the Bluetooth Base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | (short as u128) << 96)
}

/// Expands a 16-bit shorthand UUID against the Bluetooth Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// The shorthand value of a Bluetooth-base UUID; `None` for vendor UUIDs.
/// Values at or below `0xffff` were (or may be) 16-bit shorthand.
pub fn short_value(uuid: &Uuid) -> Option<u32> {
    let value = uuid.as_u128();
    let tail_mask = (1u128 << 96) - 1;
    (value & tail_mask == BLUETOOTH_BASE_UUID.as_u128()).then(|| (value >> 96) as u32)
}

/// Renders a UUID the way BLE tooling writes it: `0x2902`-style shorthand
/// when the UUID sits on the Bluetooth base, the full lowercase form
/// otherwise.
pub fn to_short_string(uuid: &Uuid) -> String {
    match short_value(uuid) {
        Some(short @ ..=0xffff) => format!("{short:#06x}"),
        Some(short) => format!("{short:#010x}"),
        None => uuid.to_string(),
    }
}

/// Parses a UUID in any of the forms BLE APIs commonly hand around: a
/// 16-bit (`"180a"`) or 32-bit (`"0000180a"`) shorthand, optionally
/// prefixed with `0x`, or a full 128-bit string. Shorthand is expanded
/// against the Bluetooth Base UUID. The result is the canonical 128-bit
/// form, so parsing is idempotent over its own output.
pub fn parse_uuid(s: &str) -> Result<Uuid> {
    let invalid = || Error::InvalidUuid(s.to_string());
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"));
    match (hex, s.len()) {
        (Some(hex), _) if hex.len() == 4 || hex.len() == 8 => {
            let short = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
            Ok(uuid_from_u32(short))
        }
        (None, 4) | (None, 8) => {
            let short = u32::from_str_radix(s, 16).map_err(|_| invalid())?;
            Ok(uuid_from_u32(short))
        }
        (None, _) => Uuid::parse_str(s).map_err(|_| invalid()),
        (Some(_), _) => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_lands_in_the_base_uuid() {
        assert_eq!(
            uuid_from_u16(0x180f).to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            uuid_from_u32(0xfeedc0de).to_string(),
            "feedc0de-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn short_value_round_trips_through_expansion() {
        assert_eq!(short_value(&uuid_from_u16(0x2a19)), Some(0x2a19));
        assert_eq!(short_value(&uuid_from_u32(0x0102_0304)), Some(0x0102_0304));
    }

    #[test]
    fn short_value_rejects_vendor_uuids() {
        let vendor = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        assert_eq!(short_value(&vendor), None);
        // same head as a shorthand, off-base tail
        let near_miss = Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fc").unwrap();
        assert_eq!(short_value(&near_miss), None);
        assert_eq!(short_value(&Uuid::nil()), None);
    }

    #[test]
    fn short_strings_pick_the_narrowest_form() {
        assert_eq!(to_short_string(&uuid_from_u16(0x2902)), "0x2902");
        assert_eq!(to_short_string(&uuid_from_u16(0x0023)), "0x0023");
        assert_eq!(to_short_string(&uuid_from_u32(0xfeedc0de)), "0xfeedc0de");
        let vendor = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        assert_eq!(to_short_string(&vendor), vendor.to_string());
    }

    #[test]
    fn parse_accepts_every_shorthand_form() {
        let expected = uuid_from_u16(0x1801);
        for form in ["1801", "0x1801", "00001801", "0x00001801"] {
            assert_eq!(parse_uuid(form).unwrap(), expected, "form {form:?}");
        }
        assert_eq!(
            parse_uuid("00001801-0000-1000-8000-00805f9b34fb").unwrap(),
            expected
        );
    }

    #[test]
    fn parse_is_idempotent_over_its_own_output() {
        let once = parse_uuid("1801").unwrap();
        let twice = parse_uuid(&once.to_string()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for bad in ["cheese", "0x18", "18015", "", "0x", "1801-0000"] {
            assert!(
                matches!(parse_uuid(bad), Err(Error::InvalidUuid(_))),
                "input {bad:?}"
            );
        }
    }

    #[test]
    fn cccd_is_the_assigned_number() {
        assert_eq!(CCCD_UUID, parse_uuid("2902").unwrap());
    }
}
