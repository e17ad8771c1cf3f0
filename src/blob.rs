//! Binary encoding of one window's readings.
//!
//! Layout, little-endian with no padding:
//!
//! ```text
//! sensor_count(u8) | sensor_count x { mac(6) | temperature(f64) | humidity(f64) | rssi(i8) }
//! ```

use crate::mac_address::MacAddress;
use crate::reading::Reading;
use std::collections::BTreeMap;
use thiserror::Error;

/// Bytes per sensor entry.
pub const ENTRY_SIZE: usize = 6 + 8 + 8 + 1;

/// Most entries the count byte can express.
pub const MAX_ENTRIES: usize = u8::MAX as usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob is empty")]
    Empty,
    #[error("blob declares {count} sensors ({expected} bytes) but has {actual} bytes")]
    LengthMismatch {
        count: usize,
        expected: usize,
        actual: usize,
    },
}

/// One decoded blob entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobEntry {
    pub mac: MacAddress,
    pub temperature: f64,
    pub humidity: f64,
    pub rssi: i8,
}

/// Serialize the latest reading per address, in address order.
///
/// An address that does not parse as a MAC is written as six zero bytes.
/// Only the first [`MAX_ENTRIES`] readings fit.
pub fn encode(readings: &BTreeMap<String, Reading>) -> Vec<u8> {
    if readings.len() > MAX_ENTRIES {
        log::warn!(
            "window holds {} sensors, encoding the first {MAX_ENTRIES}",
            readings.len()
        );
    }
    let count = readings.len().min(MAX_ENTRIES);

    let mut blob = Vec::with_capacity(1 + count * ENTRY_SIZE);
    blob.push(count as u8);

    for reading in readings.values().take(count) {
        let mac = reading
            .device_address
            .parse::<MacAddress>()
            .unwrap_or_else(|e| {
                log::warn!("writing zero address for '{}': {e}", reading.device_address);
                MacAddress::ZERO
            });

        blob.extend_from_slice(&mac.octets());
        blob.extend_from_slice(&reading.temperature.to_le_bytes());
        blob.extend_from_slice(&reading.humidity.to_le_bytes());
        blob.extend_from_slice(&reading.rssi.to_le_bytes());
    }

    blob
}

/// Parse a blob produced by [`encode`].
pub fn decode(blob: &[u8]) -> Result<Vec<BlobEntry>, BlobError> {
    let (&count, entries) = blob.split_first().ok_or(BlobError::Empty)?;
    let count = usize::from(count);

    let expected = 1 + count * ENTRY_SIZE;
    if blob.len() != expected {
        return Err(BlobError::LengthMismatch {
            count,
            expected,
            actual: blob.len(),
        });
    }

    Ok(entries.chunks_exact(ENTRY_SIZE).map(decode_entry).collect())
}

fn decode_entry(entry: &[u8]) -> BlobEntry {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&entry[0..6]);
    let mut temperature = [0u8; 8];
    temperature.copy_from_slice(&entry[6..14]);
    let mut humidity = [0u8; 8];
    humidity.copy_from_slice(&entry[14..22]);

    BlobEntry {
        mac: MacAddress(mac),
        temperature: f64::from_le_bytes(temperature),
        humidity: f64::from_le_bytes(humidity),
        rssi: entry[22] as i8,
    }
}
