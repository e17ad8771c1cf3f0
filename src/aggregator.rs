//! Time-windowed aggregation of readings.
//!
//! A worker thread pops readings off the shared queue and keeps the latest one
//! per device address. When the window expires the map is serialized with
//! [`crate::blob::encode`], handed to a [`BlobSink`] and cleared. `stop`
//! performs a final flush of whatever the last window collected.

use crate::blob;
use crate::cancel::CancellationToken;
use crate::output::BlobSink;
use crate::queue::{ReadingQueue, TimedOut};
use crate::reading::Reading;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Shortest wait on the queue, so an expired window never turns into a spin.
pub const MIN_WAIT: Duration = Duration::from_millis(1);

/// Pause after handing another consumer's sentinel back to the queue.
const SENTINEL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("failed to spawn aggregator thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("aggregator was already started")]
    AlreadyStarted,
}

/// The active window: when it started and the latest reading per address.
#[derive(Debug, Clone)]
pub struct WindowState {
    start_time: Instant,
    duration: Duration,
    latest_by_address: BTreeMap<String, Reading>,
}

impl WindowState {
    pub fn new(duration: Duration, now: Instant) -> Self {
        Self {
            start_time: now,
            duration,
            latest_by_address: BTreeMap::new(),
        }
    }

    /// Keep `reading` as the latest for its address, replacing any earlier one.
    pub fn record(&mut self, reading: Reading) {
        log::trace!(
            "{} ({}): {} C, {} %",
            reading.device_address,
            reading.display_name,
            reading.temperature,
            reading.humidity
        );
        self.latest_by_address
            .insert(reading.device_address.clone(), reading);
    }

    pub fn latest(&self, address: &str) -> Option<&Reading> {
        self.latest_by_address.get(address)
    }

    pub fn len(&self) -> usize {
        self.latest_by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest_by_address.is_empty()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start_time) >= self.duration
    }

    /// Time left in the window, never less than [`MIN_WAIT`].
    pub fn remaining(&self, now: Instant) -> Duration {
        self.duration
            .saturating_sub(now.saturating_duration_since(self.start_time))
            .max(MIN_WAIT)
    }

    /// Start a new window at `now`, returning the previous window's readings
    /// if there were any.
    pub fn take_flush(&mut self, now: Instant) -> Option<BTreeMap<String, Reading>> {
        self.start_time = now;
        if self.latest_by_address.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.latest_by_address))
    }
}

/// Flush timestamp, `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn flush<S: BlobSink>(readings: &BTreeMap<String, Reading>, sink: &mut S) {
    let blob = blob::encode(readings);
    let timestamp = format_timestamp(Utc::now());
    log::info!(
        "flushing window at {timestamp}: {} sensors, {} bytes",
        readings.len(),
        blob.len()
    );

    if let Err(e) = sink.deliver(&timestamp, &blob) {
        log::error!("dropping window blob: {e}");
    }
}

/// What the worker hands back to `stop`.
type Finished<S> = (WindowState, S, bool);

fn run<S: BlobSink>(
    queue: &ReadingQueue,
    cancel: &CancellationToken,
    mut window: WindowState,
    mut sink: S,
) -> Finished<S> {
    let mut took_sentinel = false;
    loop {
        match queue.pop_timeout(window.remaining(Instant::now())) {
            Ok(reading) if reading.is_sentinel() => {
                if cancel.is_cancelled() {
                    took_sentinel = true;
                    break;
                }
                // Meant for another consumer of the same queue
                queue.push(reading);
                thread::sleep(SENTINEL_BACKOFF.min(window.remaining(Instant::now())));
            }
            Ok(reading) => window.record(reading),
            Err(TimedOut) => {
                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        let now = Instant::now();
        if window.is_expired(now)
            && let Some(readings) = window.take_flush(now)
        {
            flush(&readings, &mut sink);
        }
    }

    (window, sink, took_sentinel)
}

/// Consumes readings from a queue on its own thread and flushes one blob per
/// non-empty window.
#[derive(Debug)]
pub struct WindowAggregator<S: BlobSink + Send + 'static> {
    queue: Arc<ReadingQueue>,
    cancel: CancellationToken,
    pending: Option<(WindowState, S)>,
    worker: Option<JoinHandle<Finished<S>>>,
}

impl<S: BlobSink + Send + 'static> WindowAggregator<S> {
    pub fn new(
        queue: Arc<ReadingQueue>,
        window: Duration,
        sink: S,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            cancel,
            pending: Some((WindowState::new(window, Instant::now()), sink)),
            worker: None,
        }
    }

    /// Spawn the worker. The first window starts now.
    pub fn start(&mut self) -> Result<(), AggregatorError> {
        let (mut window, sink) = self.pending.take().ok_or(AggregatorError::AlreadyStarted)?;
        window.start_time = Instant::now();

        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.clone();
        let duration = window.duration;
        let worker = thread::Builder::new()
            .name("window-aggregator".to_string())
            .spawn(move || run(&queue, &cancel, window, sink))
            .map_err(AggregatorError::Spawn)?;

        self.worker = Some(worker);
        log::info!("aggregating readings in {duration:?} windows");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stop the worker and flush the readings of the last window.
    ///
    /// Readings already queued are taken into the last window first. Calling
    /// this again does nothing.
    pub fn stop(&mut self) {
        self.cancel.cancel();

        let Some(worker) = self.worker.take() else {
            self.pending = None;
            return;
        };

        self.queue.push(Reading::sentinel());
        let finished = worker.join();
        if !matches!(finished, Ok((_, _, true))) {
            // The worker ended without popping it
            self.queue.remove_sentinel();
        }

        match finished {
            Ok((mut window, mut sink, _)) => {
                if let Some(readings) = window.take_flush(Instant::now()) {
                    flush(&readings, &mut sink);
                }
                log::info!("aggregator stopped");
            }
            Err(_) => log::error!("aggregator thread panicked, last window lost"),
        }
    }
}

impl<S: BlobSink + Send + 'static> Drop for WindowAggregator<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
