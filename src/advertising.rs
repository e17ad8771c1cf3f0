//! BLE advertising data (AD structure) decoding.
//!
//! Advertising data is a sequence of `len | type | value` structures where
//! `len` counts the type byte plus the value. A zero length terminates the
//! sequence early. Everything here borrows from the caller's buffer.

use crate::reading::ABSENT;
use std::fmt;
use thiserror::Error;

/// Shortened Local Name
pub const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
/// Complete Local Name
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// Manufacturer Specific Data
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Errors found while walking advertising data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A field declares more bytes than remain in the buffer
    #[error("AD field at offset {offset} declares {declared} bytes but only {available} remain")]
    TruncatedField {
        offset: usize,
        declared: usize,
        available: usize,
    },
}

/// One `type | value` structure, borrowed from the advertising data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingField<'a> {
    pub field_type: u8,
    pub payload: &'a [u8],
}

/// Iterator over the AD structures of an advertisement.
///
/// Yields at most one error, after which it is exhausted.
#[derive(Debug, Clone)]
pub struct Fields<'a> {
    data: &'a [u8],
    offset: usize,
}

/// Walk the AD structures in `data`.
pub fn fields(data: &[u8]) -> Fields<'_> {
    Fields { data, offset: 0 }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<AdvertisingField<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset;
        let field_len = usize::from(*self.data.get(offset)?);
        if field_len == 0 {
            self.offset = self.data.len();
            return None;
        }

        let available = self.data.len() - offset - 1;
        if field_len > available {
            self.offset = self.data.len();
            return Some(Err(DecodeError::TruncatedField {
                offset,
                declared: field_len,
                available,
            }));
        }

        let field_type = self.data[offset + 1];
        let payload = &self.data[offset + 2..offset + 1 + field_len];
        self.offset = offset + 1 + field_len;

        Some(Ok(AdvertisingField {
            field_type,
            payload,
        }))
    }
}

/// The parts of an advertisement the gateway cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvertisingData<'a> {
    /// Local name; the last name field in byte order wins
    pub name: Option<String>,
    /// Raw manufacturer-specific value, company ID included
    pub manufacturer_payload: Option<&'a [u8]>,
}

/// A decode that stopped early, with whatever was captured before the error.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialDecode<'a> {
    pub partial: AdvertisingData<'a>,
    pub error: DecodeError,
}

impl fmt::Display for PartialDecode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partial advertising data: {}", self.error)
    }
}

impl std::error::Error for PartialDecode<'_> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Extract the local name and manufacturer data from advertising data.
///
/// Broadcasts come from a public radio channel, so malformed input is
/// expected: a truncated field stops the walk and the fields decoded so far
/// are returned inside the error.
pub fn decode(adv_data: &[u8]) -> Result<AdvertisingData<'_>, PartialDecode<'_>> {
    let mut decoded = AdvertisingData::default();

    for field in fields(adv_data) {
        let field = match field {
            Ok(field) => field,
            Err(error) => {
                return Err(PartialDecode {
                    partial: decoded,
                    error,
                });
            }
        };

        match field.field_type {
            AD_TYPE_COMPLETE_LOCAL_NAME | AD_TYPE_SHORT_LOCAL_NAME => {
                decoded.name = Some(String::from_utf8_lossy(field.payload).into_owned());
            }
            AD_TYPE_MANUFACTURER_DATA => {
                if field.payload.len() >= 2 {
                    log::trace!(
                        "manufacturer data from company 0x{:04x}",
                        u16::from_le_bytes([field.payload[0], field.payload[1]])
                    );
                }
                decoded.manufacturer_payload = Some(field.payload);
            }
            _ => {}
        }
    }

    Ok(decoded)
}

/// Where temperature and humidity live inside a manufacturer payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PayloadLayout {
    /// `company_id(2) | temperature(2, LE signed) | humidity(1)`
    #[default]
    CompanyPrefixed,
    /// ThermoPro framing: temperature at bytes 1-2, humidity at byte 3
    ThermoPro,
}

impl fmt::Display for PayloadLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadLayout::CompanyPrefixed => write!(f, "company-prefixed"),
            PayloadLayout::ThermoPro => write!(f, "thermo-pro"),
        }
    }
}

/// Temperature and humidity decoded from a manufacturer payload.
///
/// Values that the payload is too short to carry stay at [`ABSENT`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorValues {
    /// Celsius
    pub temperature: f64,
    /// Percent
    pub humidity: f64,
}

impl Default for SensorValues {
    fn default() -> Self {
        Self {
            temperature: ABSENT,
            humidity: ABSENT,
        }
    }
}

impl SensorValues {
    /// Decode a manufacturer payload. Short payloads are missing data, not
    /// errors.
    pub fn decode(payload: &[u8], layout: PayloadLayout) -> Self {
        let (temperature_at, humidity_at) = match layout {
            PayloadLayout::CompanyPrefixed => (2, 4),
            PayloadLayout::ThermoPro => (1, 3),
        };

        let mut values = SensorValues::default();
        if payload.len() < 4 {
            return values;
        }

        if let Some(raw) = payload.get(temperature_at..temperature_at + 2) {
            values.temperature = f64::from(i16::from_le_bytes([raw[0], raw[1]])) / 10.0;
        }
        if let Some(&humidity) = payload.get(humidity_at) {
            values.humidity = f64::from(humidity);
        }
        values
    }
}
