//! `ble-sensor-gateway` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup
//! and process exit codes. The pipeline itself lives here: the scan loop
//! ([`scanner`]) decodes advertisements into readings, the
//! [`queue::ReadingQueue`] carries them to the [`aggregator`], and each
//! window is serialized by [`blob`] and handed to an [`output::BlobSink`].

pub mod advertising;
pub mod aggregator;
pub mod alias;
pub mod app;
pub mod blob;
pub mod cancel;
pub mod duration;
pub mod handler;
pub mod mac_address;
pub mod output;
pub mod queue;
pub mod reading;
pub mod scanner;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertising::{AdvertisingData, PayloadLayout, SensorValues};
pub use aggregator::{AggregatorError, WindowAggregator, WindowState};
pub use alias::{Alias, AliasMap, parse_alias, to_map};
pub use blob::{BlobEntry, BlobError};
pub use cancel::CancellationToken;
pub use duration::parse_duration;
pub use handler::{DeviceHandler, DeviceRegistry, SensorHandler};
pub use mac_address::MacAddress;
pub use output::{BlobSink, SinkError};
pub use queue::{ReadingQueue, TimedOut};
pub use reading::Reading;
pub use scanner::hci::HciSocket;
pub use scanner::{ControlChannel, DeviceError, ScanError, ScanLoop, ScanState};
