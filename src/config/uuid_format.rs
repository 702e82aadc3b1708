//! UUID text forms accepted in configuration.
//! Short Bluetooth SIG forms ("FFE0", "0000FFE0") are expanded over the base
//! UUID; anything else must be a full 128-bit UUID.

use serde::{Deserialize, Deserializer, Serializer};
use uuid::Uuid;

use crate::core::serial::{SerialError, BLUETOOTH_BASE_UUID};

/// Parses a 16-bit, 32-bit or 128-bit UUID string
pub fn parse_uuid(text: &str) -> Result<Uuid, SerialError> {
    let text = text.trim();
    let is_hex = !text.is_empty() && text.chars().all(|c| c.is_ascii_hexdigit());

    if is_hex && (text.len() == 4 || text.len() == 8) {
        let short = u32::from_str_radix(text, 16).map_err(|_| SerialError::InvalidUuid(text.to_string()))?;
        return Ok(from_short(short));
    }

    Uuid::parse_str(text).map_err(|_| SerialError::InvalidUuid(text.to_string()))
}

/// Expands a 16-bit or 32-bit UUID over the Bluetooth base UUID
pub fn from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Shortest text form: 4 hex digits for 16-bit UUIDs, the full form otherwise
pub fn format_uuid(uuid: &Uuid) -> String {
    let value = uuid.as_u128();
    let base_mask = (1u128 << 96) - 1;
    if value & base_mask == BLUETOOTH_BASE_UUID.as_u128() && value >> 96 <= 0xffff {
        format!("{:04X}", value >> 96)
    } else {
        uuid.hyphenated().to_string()
    }
}

pub fn serialize<S: Serializer>(uuid: &Uuid, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_uuid(uuid))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse_uuid(&text).map_err(serde::de::Error::custom)
}
