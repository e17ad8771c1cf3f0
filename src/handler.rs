//! Device handlers and the registry that dispatches advertisements to them.
//!
//! Handlers are consulted in registration order and the first one whose
//! predicate accepts the decoded device name wins, even if a later handler
//! would match more specifically.

use crate::advertising::{AdvertisingData, PayloadLayout, SensorValues};
use crate::alias::{AliasMap, resolve_name};
use crate::reading::Reading;
use crate::scanner::event::AdvertisingReport;
use std::time::SystemTime;

/// Name fragment advertised by ThermoPro TP357 thermo-hygrometers.
pub const TP357_NAME_PATTERN: &str = "TP357";

/// Converts advertisements of one device family into readings.
pub trait DeviceHandler: Send + Sync {
    /// Short label used in logs.
    fn label(&self) -> &str;

    /// Whether this handler is responsible for devices advertising `decoded_name`.
    fn can_handle(&self, decoded_name: &str) -> bool;

    /// Produce at most one reading from a report. `None` suppresses emission.
    fn handle(&self, report: &AdvertisingReport<'_>, adv: &AdvertisingData<'_>) -> Option<Reading>;
}

/// Handler for temperature/humidity sensors identified by a name fragment.
#[derive(Debug, Clone)]
pub struct SensorHandler {
    pattern: String,
    layout: PayloadLayout,
    aliases: AliasMap,
}

impl SensorHandler {
    pub fn new(pattern: impl Into<String>, layout: PayloadLayout, aliases: AliasMap) -> Self {
        Self {
            pattern: pattern.into(),
            layout,
            aliases,
        }
    }

    /// TP357 sensors with the default payload layout.
    pub fn tp357(aliases: AliasMap) -> Self {
        Self::new(TP357_NAME_PATTERN, PayloadLayout::default(), aliases)
    }
}

impl DeviceHandler for SensorHandler {
    fn label(&self) -> &str {
        &self.pattern
    }

    fn can_handle(&self, decoded_name: &str) -> bool {
        decoded_name.contains(self.pattern.as_str())
    }

    fn handle(&self, report: &AdvertisingReport<'_>, adv: &AdvertisingData<'_>) -> Option<Reading> {
        // Nothing to report without manufacturer data
        let payload = adv.manufacturer_payload?;
        let values = SensorValues::decode(payload, self.layout);

        let device_address = report.mac().to_string();
        let decoded_name = adv.name.clone().unwrap_or_default();
        let display_name = resolve_name(&device_address, &decoded_name, &self.aliases);

        log::debug!(
            "{} {} ({}): temperature {} C, humidity {} %, rssi {}",
            self.pattern,
            device_address,
            display_name,
            values.temperature,
            values.humidity,
            report.rssi
        );

        Some(Reading {
            device_address,
            display_name,
            decoded_name,
            temperature: values.temperature,
            humidity: values.humidity,
            rssi: report.rssi,
            observed_at: SystemTime::now(),
        })
    }
}

/// Ordered set of handlers.
#[derive(Default)]
pub struct DeviceRegistry {
    handlers: Vec<Box<dyn DeviceHandler>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; it is tried after every handler registered before it.
    pub fn register(&mut self, handler: Box<dyn DeviceHandler>) {
        self.handlers.push(handler);
    }

    /// Builder-style [`DeviceRegistry::register`].
    pub fn with(mut self, handler: impl DeviceHandler + 'static) -> Self {
        self.register(Box::new(handler));
        self
    }

    /// First registered handler accepting `decoded_name`.
    pub fn find_handler(&self, decoded_name: &str) -> Option<&dyn DeviceHandler> {
        self.handlers
            .iter()
            .find(|h| h.can_handle(decoded_name))
            .map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.label()))
            .finish()
    }
}
