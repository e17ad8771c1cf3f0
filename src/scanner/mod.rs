//! BLE scan loop over a kernel HCI control channel.
//!
//! The loop owns the channel descriptor, multiplexes it with the
//! cancellation wakeup in a bounded `poll(2)`, and turns advertising reports
//! into [`Reading`](crate::reading::Reading)s pushed onto the shared queue.

pub mod event;
pub mod hci;

use crate::advertising;
use crate::cancel::CancellationToken;
use crate::handler::DeviceRegistry;
use crate::queue::ReadingQueue;
use event::Event;
use hci::{HciFilter, OCF_LE_SET_SCAN_ENABLE, OCF_LE_SET_SCAN_PARAMETERS, OGF_LE_CTL, ScanParameters};
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long a command may take to be acknowledged by the controller.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a single wait inside the scan loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Largest HCI event: 1 type byte, 2 header bytes and 255 parameter bytes,
/// rounded up like the kernel's `HCI_MAX_EVENT_SIZE`.
pub const MAX_FRAME_SIZE: usize = 260;

/// Failures while acquiring or programming the adapter. Fatal at init.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to open HCI socket for hci{dev_id}: {source}")]
    Open {
        dev_id: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind HCI socket to hci{dev_id}: {source}")]
    Bind {
        dev_id: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to install HCI event filter: {0}")]
    Filter(#[source] io::Error),
    #[error("{command} failed: {source}")]
    Command {
        command: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{command} rejected by controller with status 0x{status:02x}")]
    Rejected { command: &'static str, status: u8 },
    #[error("timed out waiting for {command} to complete")]
    Timeout { command: &'static str },
}

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A read or poll on the control channel failed for good
    #[error("control channel I/O failed: {0}")]
    FatalIo(#[source] io::Error),
    #[error("cannot {operation} scanner in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ScanState,
    },
}

/// Lifecycle of a [`ScanLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Created,
    Initialized,
    Running,
    Stopping,
    Closed,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Created => "created",
            ScanState::Initialized => "initialized",
            ScanState::Running => "running",
            ScanState::Stopping => "stopping",
            ScanState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The kernel control channel, abstracted so the loop can run over any
/// datagram-oriented descriptor.
pub trait ControlChannel: AsFd + Send + Sync {
    /// Restrict which packets the channel delivers.
    fn set_filter(&self, filter: &HciFilter) -> io::Result<()>;

    /// Read one frame.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one command packet.
    fn send(&self, packet: &[u8]) -> io::Result<()>;
}

/// Errors that are retried rather than ending the loop.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Channel,
    Cancelled,
    Idle,
}

/// Wait until the channel is readable, the wakeup fires, or `timeout` passes.
fn wait_readable(
    channel: BorrowedFd<'_>,
    wakeup: Option<BorrowedFd<'_>>,
    timeout: Duration,
) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd: channel.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        // Negative descriptors are skipped by poll(2)
        libc::pollfd {
            fd: wakeup.map_or(-1, |fd| fd.as_raw_fd()),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let timeout_ms = timeout.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int;

    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    if fds[1].revents & libc::POLLIN != 0 {
        Ok(Readiness::Cancelled)
    } else if fds[0].revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
        Ok(Readiness::Channel)
    } else {
        Ok(Readiness::Idle)
    }
}

/// Parse one frame and push a reading for every report a handler accepts.
///
/// Malformed frames and reports are logged and dropped. Returns the number of
/// readings pushed.
pub fn process_frame(frame: &[u8], registry: &DeviceRegistry, queue: &ReadingQueue) -> usize {
    let reports = match event::parse(frame) {
        Ok(Event::AdvertisingReports(reports)) => reports,
        Ok(other) => {
            log::trace!("ignoring {other:?}");
            return 0;
        }
        Err(e) => {
            log::debug!("dropping HCI frame: {e}");
            return 0;
        }
    };

    let mut pushed = 0;
    for report in reports {
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                log::debug!("dropping rest of advertising event: {e}");
                break;
            }
        };

        let adv = advertising::decode(report.data).unwrap_or_else(|partial| {
            log::debug!("{}: {partial}", report.mac());
            partial.partial
        });

        let name = adv.name.as_deref().unwrap_or_default();
        let Some(handler) = registry.find_handler(name) else {
            continue;
        };

        if let Some(reading) = handler.handle(&report, &adv) {
            queue.push(reading);
            pushed += 1;
        }
    }
    pushed
}

/// Send one LE controller command and wait for its acknowledgement.
///
/// Frames that arrive before the matching Command Complete or Command Status
/// are discarded.
fn run_command<C: ControlChannel + ?Sized>(
    channel: &C,
    command: &'static str,
    ocf: u16,
    params: &[u8],
) -> Result<(), DeviceError> {
    let opcode = hci::opcode(OGF_LE_CTL, ocf);
    let packet = hci::hci_command_packet(OGF_LE_CTL, ocf, params);
    channel
        .send(&packet)
        .map_err(|source| DeviceError::Command { command, source })?;

    let deadline = Instant::now() + COMMAND_TIMEOUT;
    let mut buf = [0u8; MAX_FRAME_SIZE];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DeviceError::Timeout { command });
        }

        match wait_readable(channel.as_fd(), None, remaining) {
            Ok(Readiness::Channel) => {}
            Ok(_) => continue,
            Err(e) if is_transient(&e) => continue,
            Err(source) => return Err(DeviceError::Command { command, source }),
        }

        let n = match channel.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if is_transient(&e) => continue,
            Err(source) => return Err(DeviceError::Command { command, source }),
        };

        match event::parse(&buf[..n]) {
            Ok(Event::CommandComplete { opcode: op, status })
            | Ok(Event::CommandStatus { opcode: op, status })
                if op == opcode =>
            {
                if status != 0 {
                    return Err(DeviceError::Rejected { command, status });
                }
                log::debug!("{command} complete");
                return Ok(());
            }
            _ => {}
        }
    }
}

/// Program the adapter for continuous LE scanning.
fn program_adapter<C: ControlChannel + ?Sized>(
    channel: &C,
    params: &ScanParameters,
) -> Result<(), DeviceError> {
    // A controller that is not scanning rejects the disable
    if let Err(e) = run_command(
        channel,
        "LE Set Scan Enable (disable)",
        OCF_LE_SET_SCAN_ENABLE,
        &hci::scan_enable_params(false),
    ) {
        log::debug!("ignoring: {e}");
    }

    run_command(
        channel,
        "LE Set Scan Parameters",
        OCF_LE_SET_SCAN_PARAMETERS,
        &params.to_bytes(),
    )?;
    run_command(
        channel,
        "LE Set Scan Enable",
        OCF_LE_SET_SCAN_ENABLE,
        &hci::scan_enable_params(true),
    )?;
    Ok(())
}

#[derive(Debug)]
struct Inner<C> {
    state: ScanState,
    channel: Option<Arc<C>>,
}

/// Drains the control channel and dispatches advertising reports.
///
/// `start` blocks the calling thread; `stop` may be called from any thread.
/// The channel is shared between the two so a concurrent `stop` never closes
/// a descriptor the loop is still polling.
#[derive(Debug)]
pub struct ScanLoop<C: ControlChannel> {
    registry: Arc<DeviceRegistry>,
    queue: Arc<ReadingQueue>,
    cancel: CancellationToken,
    params: ScanParameters,
    inner: Mutex<Inner<C>>,
}

impl<C: ControlChannel> ScanLoop<C> {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        queue: Arc<ReadingQueue>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            queue,
            cancel,
            params: ScanParameters::default(),
            inner: Mutex::new(Inner {
                state: ScanState::Created,
                channel: None,
            }),
        }
    }

    pub fn with_parameters(mut self, params: ScanParameters) -> Self {
        self.params = params;
        self
    }

    pub fn state(&self) -> ScanState {
        self.lock().state
    }

    /// Install the event filter on `channel` and enable scanning.
    ///
    /// On failure the channel is dropped, which closes it.
    pub fn initialize(&self, channel: C) -> Result<(), ScanError> {
        let mut inner = self.lock();
        if inner.state != ScanState::Created {
            return Err(ScanError::InvalidState {
                operation: "initialize",
                state: inner.state,
            });
        }

        let programmed = channel
            .set_filter(&HciFilter::scanner())
            .map_err(DeviceError::Filter)
            .and_then(|()| program_adapter(&channel, &self.params));

        if let Err(e) = programmed {
            inner.state = ScanState::Closed;
            log::error!("scanner initialization failed: {e}");
            return Err(e.into());
        }

        inner.channel = Some(Arc::new(channel));
        inner.state = ScanState::Initialized;
        log::info!("LE scan enabled");
        Ok(())
    }

    /// Run the read/dispatch loop until [`ScanLoop::stop`] is called or the
    /// channel fails.
    pub fn start(&self) -> Result<(), ScanError> {
        let channel = {
            let mut inner = self.lock();
            let channel = match inner.channel.clone() {
                Some(channel) if inner.state == ScanState::Initialized => channel,
                _ => {
                    return Err(ScanError::InvalidState {
                        operation: "start",
                        state: inner.state,
                    });
                }
            };
            inner.state = ScanState::Running;
            channel
        };

        log::info!("scan loop running");
        let result = self.run(channel.as_ref());
        if let Err(e) = &result {
            log::error!("scan loop failed: {e}");
        }

        self.stop();
        drop(channel);
        self.lock().state = ScanState::Closed;
        log::info!("scan loop exited");
        result
    }

    fn run(&self, channel: &C) -> Result<(), ScanError> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match wait_readable(channel.as_fd(), Some(self.cancel.as_fd()), POLL_INTERVAL) {
                Ok(Readiness::Channel) => {}
                Ok(Readiness::Idle) => continue,
                Ok(Readiness::Cancelled) => {
                    self.cancel.drain();
                    self.mark_stopping();
                    return Ok(());
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(ScanError::FatalIo(e)),
            }

            match channel.recv(&mut buf) {
                Ok(n) => {
                    process_frame(&buf[..n], &self.registry, &self.queue);
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(ScanError::FatalIo(e)),
            }
        }
    }

    fn mark_stopping(&self) {
        let mut inner = self.lock();
        if inner.state == ScanState::Running {
            inner.state = ScanState::Stopping;
        }
    }

    /// Cancel the loop, disable scanning and release the channel.
    ///
    /// Idempotent; safe to call from any thread and before `start`.
    pub fn stop(&self) {
        self.cancel.cancel();

        let channel = {
            let mut inner = self.lock();
            inner.state = match inner.state {
                ScanState::Running | ScanState::Stopping => ScanState::Stopping,
                _ => ScanState::Closed,
            };
            inner.channel.take()
        };

        if let Some(channel) = channel {
            let packet = hci::hci_command_packet(
                OGF_LE_CTL,
                OCF_LE_SET_SCAN_ENABLE,
                &hci::scan_enable_params(false),
            );
            if let Err(e) = channel.send(&packet) {
                log::debug!("scan disable on stop failed: {e}");
            }
            log::info!("scanner stopped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
