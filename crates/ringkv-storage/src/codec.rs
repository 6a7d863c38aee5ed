// Framing for every file the storage engine writes
//
// Frame format (binary):
// [magic: u32 LE] [version: u16 LE] [length: u32 LE] [payload bytes] [crc32: u32 LE]
//
// The CRC covers version, length and payload. The payload is bincode.

use crc32fast::Hasher;
use ringkv_core::format_version::FormatVersion;
use ringkv_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// magic + version + length
const HEADER_LEN: usize = 4 + 2 + 4;
const CRC_LEN: usize = 4;

/// Serialize `value` into a checksummed frame
pub fn encode_frame<T: Serialize>(magic: u32, version: &FormatVersion, value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)
        .map_err(|e| Error::Serialization(format!("Failed to serialize payload: {}", e)))?;

    let version_bytes = version.current.to_le_bytes();
    let length_bytes = (payload.len() as u32).to_le_bytes();

    let mut hasher = Hasher::new();
    hasher.update(&version_bytes);
    hasher.update(&length_bytes);
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    frame.extend_from_slice(&magic.to_le_bytes());
    frame.extend_from_slice(&version_bytes);
    frame.extend_from_slice(&length_bytes);
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());

    Ok(frame)
}

/// Validate a frame and deserialize its payload
pub fn decode_frame<T: DeserializeOwned>(
    magic: u32,
    version: &FormatVersion,
    data: &[u8],
) -> Result<T> {
    if data.len() < HEADER_LEN + CRC_LEN {
        return Err(Error::Corruption(format!(
            "Frame too short: {} bytes",
            data.len()
        )));
    }

    let found_magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if found_magic != magic {
        return Err(Error::Corruption(format!(
            "Bad magic: expected {:08x}, found {:08x}",
            magic, found_magic
        )));
    }

    let found_version = u16::from_le_bytes([data[4], data[5]]);
    if !version.can_read(found_version) {
        return Err(Error::Corruption(format!(
            "Unsupported format version {}",
            found_version
        )));
    }

    let length = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
    let total = HEADER_LEN + length + CRC_LEN;
    if data.len() != total {
        return Err(Error::Corruption(format!(
            "Frame length mismatch: header says {} bytes, found {}",
            total,
            data.len()
        )));
    }

    let payload = &data[HEADER_LEN..HEADER_LEN + length];
    let crc_offset = HEADER_LEN + length;
    let expected_crc = u32::from_le_bytes([
        data[crc_offset],
        data[crc_offset + 1],
        data[crc_offset + 2],
        data[crc_offset + 3],
    ]);

    let mut hasher = Hasher::new();
    hasher.update(&data[4..HEADER_LEN]);
    hasher.update(payload);
    let actual_crc = hasher.finalize();

    if actual_crc != expected_crc {
        return Err(Error::Corruption(format!(
            "CRC mismatch: expected {}, got {}",
            expected_crc, actual_crc
        )));
    }

    bincode::deserialize(payload)
        .map_err(|e| Error::Serialization(format!("Failed to deserialize payload: {}", e)))
}
