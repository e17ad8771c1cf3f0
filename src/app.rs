//! Core application wiring for `ble-sensor-gateway`.
//!
//! This module is decoupled from CLI entry, logging setup and process exit
//! codes so the whole pipeline can be driven in tests over a fake control
//! channel.

use crate::advertising::PayloadLayout;
use crate::aggregator::{AggregatorError, WindowAggregator};
use crate::alias::{Alias, to_map};
use crate::cancel::CancellationToken;
use crate::handler::{DeviceRegistry, SensorHandler, TP357_NAME_PATTERN};
use crate::output::BlobSink;
use crate::output::line::LineSink;
use crate::queue::ReadingQueue;
use crate::scanner::{ControlChannel, ScanError, ScanLoop};
use clap::Parser;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Command-line and environment configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Index of the HCI adapter to scan with (0 for hci0)
    #[arg(long, env = "BLE_GATEWAY_DEVICE", default_value_t = 0)]
    pub device: u16,

    /// Aggregation window.
    /// Accepts duration with suffix: 30s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, env = "BLE_GATEWAY_WINDOW", default_value = "60s", value_parser = crate::duration::parse_window)]
    pub window: Duration,

    /// Specify human-readable alias for a sensor address.
    /// Format: --alias DE:AD:BE:EF:00:00=Sauna
    #[arg(
        long = "alias",
        env = "BLE_GATEWAY_ALIAS",
        value_parser = crate::alias::parse_alias,
        value_name = "ALIAS"
    )]
    pub aliases: Vec<Alias>,

    /// Only devices whose advertised name contains this text are decoded
    #[arg(long, env = "BLE_GATEWAY_DEVICE_PATTERN", default_value = TP357_NAME_PATTERN)]
    pub device_pattern: String,

    /// Where temperature and humidity sit in the manufacturer data
    #[arg(long, env = "BLE_GATEWAY_PAYLOAD_LAYOUT", default_value_t, value_enum)]
    pub payload_layout: PayloadLayout,

    /// Append blob lines to this file instead of stdout
    #[arg(long, env = "BLE_GATEWAY_OUTPUT", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Verbose output, log every decoded reading
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by the application.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handlers for the configured device family.
pub fn registry(options: &Options) -> DeviceRegistry {
    DeviceRegistry::new().with(SensorHandler::new(
        options.device_pattern.clone(),
        options.payload_layout,
        to_map(&options.aliases),
    ))
}

/// Line sink writing to `path` (appending) or to stdout.
pub fn open_output(path: Option<&Path>) -> io::Result<LineSink<Box<dyn Write + Send>>> {
    let out: Box<dyn Write + Send> = match path {
        Some(path) => Box::new(OpenOptions::new().create(true).append(true).open(path)?),
        None => Box::new(io::stdout()),
    };
    Ok(LineSink::new(out))
}

/// Scanner and aggregator sharing one reading queue.
pub struct Gateway<C: ControlChannel + 'static, S: BlobSink + Send + 'static> {
    scanner: Arc<ScanLoop<C>>,
    aggregator: WindowAggregator<S>,
}

impl<C: ControlChannel + 'static, S: BlobSink + Send + 'static> Gateway<C, S> {
    pub fn new(options: &Options, sink: S) -> io::Result<Self> {
        let queue = Arc::new(ReadingQueue::new());
        let scanner = ScanLoop::new(
            Arc::new(registry(options)),
            Arc::clone(&queue),
            CancellationToken::new()?,
        );
        let aggregator =
            WindowAggregator::new(queue, options.window, sink, CancellationToken::new()?);

        Ok(Self {
            scanner: Arc::new(scanner),
            aggregator,
        })
    }

    /// Start aggregating and program the adapter behind `channel`.
    pub fn start(&mut self, channel: C) -> Result<(), RunError> {
        self.aggregator.start()?;
        if let Err(e) = self.scanner.initialize(channel) {
            self.aggregator.stop();
            return Err(e.into());
        }
        Ok(())
    }

    /// Handle for running the scan loop on another thread.
    pub fn scanner(&self) -> Arc<ScanLoop<C>> {
        Arc::clone(&self.scanner)
    }

    /// Stop scanning, then flush the last window.
    pub fn shutdown(&mut self) {
        self.scanner.stop();
        self.aggregator.stop();
    }
}
