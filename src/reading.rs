//! Sensor reading data structure.

use std::time::SystemTime;

/// Sentinel stored in `temperature`/`humidity` when the value was not
/// present in the advertisement or could not be decoded.
pub const ABSENT: f64 = -999.0;

/// One decoded observation from a thermo-hygrometer.
///
/// Readings are built by a device handler at decode time and moved by value
/// through the [`crate::queue::ReadingQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Canonical lowercase colon-hex address, e.g. `aa:bb:cc:dd:ee:ff`
    pub device_address: String,
    /// Operator-assigned label, falls back to the decoded name
    pub display_name: String,
    /// Local name found in the advertising data
    pub decoded_name: String,
    /// Temperature in Celsius, [`ABSENT`] if missing
    pub temperature: f64,
    /// Relative humidity in percent (0-100), [`ABSENT`] if missing
    pub humidity: f64,
    /// Received signal strength of the packet in dBm
    pub rssi: i8,
    /// Wall-clock capture time
    pub observed_at: SystemTime,
}

impl Reading {
    /// The all-empty reading a controller pushes to wake up consumers on
    /// shutdown.
    pub fn sentinel() -> Self {
        Self::default()
    }

    /// True when address, display name and decoded name are all empty.
    pub fn is_sentinel(&self) -> bool {
        self.device_address.is_empty() && self.display_name.is_empty() && self.decoded_name.is_empty()
    }

    pub fn temperature(&self) -> Option<f64> {
        present(self.temperature)
    }

    pub fn humidity(&self) -> Option<f64> {
        present(self.humidity)
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self {
            device_address: String::new(),
            display_name: String::new(),
            decoded_name: String::new(),
            temperature: ABSENT,
            humidity: ABSENT,
            rssi: 0,
            observed_at: SystemTime::UNIX_EPOCH,
        }
    }
}

fn present(value: f64) -> Option<f64> {
    (value != ABSENT).then_some(value)
}
