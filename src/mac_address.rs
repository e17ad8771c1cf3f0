//! Compact MAC address type for Bluetooth devices.
//!
//! Addresses travel through the pipeline as canonical lowercase strings
//! (`aa:bb:cc:dd:ee:ff`); this type is the bridge between that form and the
//! raw bytes found on the wire and in serialized blobs.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth MAC address stored as 6 bytes in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// All-zero address written for unparsable address strings.
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    /// Build an address from the little-endian byte order used by HCI.
    pub fn from_link_layer(bytes: [u8; 6]) -> Self {
        let mut display = bytes;
        display.reverse();
        Self(display)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Errors returned when parsing a MAC address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address: expected 6 parts, got {0}")]
    InvalidLength(usize),
    #[error("invalid MAC address: part {0} has wrong length")]
    InvalidPartLength(usize),
    #[error("invalid MAC address: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseMacError::InvalidLength(parts.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseMacError::InvalidPartLength(i));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseMacError::InvalidHex(part.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_lowercase() {
        let addr = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(format!("{}", addr), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_display_with_zeros() {
        let addr = MacAddress([0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(format!("{}", addr), "00:01:02:03:04:05");
    }

    #[test]
    fn test_from_link_layer_reverses() {
        let addr = MacAddress::from_link_layer([0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(addr, MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
    }

    #[test]
    fn test_from_str_either_case() {
        let upper: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let lower: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.octets(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn test_from_str_invalid() {
        assert!(matches!(
            "invalid".parse::<MacAddress>(),
            Err(ParseMacError::InvalidLength(1))
        ));
        assert!(matches!(
            "".parse::<MacAddress>(),
            Err(ParseMacError::InvalidLength(1))
        ));
        assert!(matches!(
            "AA:BB:CC".parse::<MacAddress>(),
            Err(ParseMacError::InvalidLength(3))
        ));
        assert!(matches!(
            "AA:BB:CC:DD:EE:F".parse::<MacAddress>(),
            Err(ParseMacError::InvalidPartLength(5))
        ));
        assert!(matches!(
            "AA:BB:CC:DD:EE:GG".parse::<MacAddress>(),
            Err(ParseMacError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_round_trips_through_display() {
        let addr = MacAddress([0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]);
        assert_eq!(addr.to_string().parse::<MacAddress>().unwrap(), addr);
    }
}
