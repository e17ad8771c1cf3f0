use crate::advertising::{AD_TYPE_COMPLETE_LOCAL_NAME, AD_TYPE_MANUFACTURER_DATA};
use crate::output::{BlobSink, SinkError};
use crate::reading::Reading;
use crate::scanner::ControlChannel;
use crate::scanner::event::{EVT_CMD_COMPLETE, EVT_LE_ADVERTISING_REPORT, EVT_LE_META_EVENT, HCI_EVENT_PKT};
use crate::scanner::hci::HciFilter;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Company ID used by [`tp357_adv_data`].
pub const TEST_COMPANY_ID: u16 = 0xEC88;

/// A reading for `address` with 60 % humidity and -60 dBm.
pub fn reading(address: &str, temperature: f64) -> Reading {
    Reading {
        device_address: address.to_string(),
        display_name: "TP357 (2B54)".to_string(),
        decoded_name: "TP357 (2B54)".to_string(),
        temperature,
        humidity: 60.0,
        rssi: -60,
        observed_at: SystemTime::now(),
    }
}

/// One AD structure: `len | type | value`.
pub fn ad_field(field_type: u8, value: &[u8]) -> Vec<u8> {
    let mut field = Vec::with_capacity(2 + value.len());
    field.push((value.len() + 1) as u8);
    field.push(field_type);
    field.extend_from_slice(value);
    field
}

/// Manufacturer payload in the company-prefixed layout.
pub fn sensor_payload(company_id: u16, temp_raw: i16, humidity: u8) -> Vec<u8> {
    let mut payload = company_id.to_le_bytes().to_vec();
    payload.extend_from_slice(&temp_raw.to_le_bytes());
    payload.push(humidity);
    payload
}

/// Flags, complete local name and a company-prefixed sensor payload.
pub fn tp357_adv_data(name: &str, temp_raw: i16, humidity: u8) -> Vec<u8> {
    let mut data = ad_field(0x01, &[0x06]);
    data.extend(ad_field(AD_TYPE_COMPLETE_LOCAL_NAME, name.as_bytes()));
    data.extend(ad_field(
        AD_TYPE_MANUFACTURER_DATA,
        &sensor_payload(TEST_COMPANY_ID, temp_raw, humidity),
    ));
    data
}

/// Contents of one advertising report record.
#[derive(Debug, Clone)]
pub struct ReportSpec {
    /// Link-layer (reversed) byte order
    pub address: [u8; 6],
    pub data: Vec<u8>,
    pub rssi: i8,
}

impl ReportSpec {
    pub fn new(address: [u8; 6], data: &[u8], rssi: i8) -> Self {
        Self {
            address,
            data: data.to_vec(),
            rssi,
        }
    }
}

/// An LE Advertising Report event frame carrying `reports`.
pub fn advertising_frame(reports: &[ReportSpec]) -> Vec<u8> {
    let mut params = vec![EVT_LE_ADVERTISING_REPORT, reports.len() as u8];
    for report in reports {
        params.push(0x00); // ADV_IND
        params.push(0x00); // public address
        params.extend_from_slice(&report.address);
        params.push(report.data.len() as u8);
        params.extend_from_slice(&report.data);
        params.push(report.rssi as u8);
    }

    let mut frame = vec![HCI_EVENT_PKT, EVT_LE_META_EVENT, params.len() as u8];
    frame.extend(params);
    frame
}

/// A Command Complete event acknowledging `opcode` with `status`.
pub fn command_complete_frame(opcode: u16, status: u8) -> Vec<u8> {
    let opcode = opcode.to_le_bytes();
    vec![HCI_EVENT_PKT, EVT_CMD_COMPLETE, 4, 0x01, opcode[0], opcode[1], status]
}

#[derive(Debug, Default)]
struct FakeState {
    sent: Mutex<Vec<Vec<u8>>>,
    filter: Mutex<Option<HciFilter>>,
    next_status: Mutex<Option<u8>>,
    rejected: Mutex<Vec<(u16, u8)>>,
    silent: AtomicBool,
    fail_filter: AtomicBool,
    fail_reads: AtomicBool,
    closed: AtomicBool,
}

/// A [`ControlChannel`] over a datagram socket pair that acknowledges every
/// command like a controller would.
#[derive(Debug)]
pub struct FakeChannel {
    socket: UnixDatagram,
    controller: UnixDatagram,
    state: Arc<FakeState>,
}

/// Test-side handle to a [`FakeChannel`].
#[derive(Debug)]
pub struct FakeController {
    peer: UnixDatagram,
    state: Arc<FakeState>,
}

impl FakeChannel {
    pub fn new() -> (FakeChannel, FakeController) {
        let (socket, peer) = UnixDatagram::pair().unwrap();
        socket.set_nonblocking(true).unwrap();
        let state = Arc::new(FakeState::default());

        let channel = FakeChannel {
            socket,
            controller: peer.try_clone().unwrap(),
            state: Arc::clone(&state),
        };
        (channel, FakeController { peer, state })
    }

    fn status_for(&self, opcode: u16) -> u8 {
        if let Some(status) = self.state.next_status.lock().unwrap().take() {
            return status;
        }
        self.state
            .rejected
            .lock()
            .unwrap()
            .iter()
            .find(|(op, _)| *op == opcode)
            .map_or(0, |&(_, status)| status)
    }
}

impl AsFd for FakeChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl ControlChannel for FakeChannel {
    fn set_filter(&self, filter: &HciFilter) -> io::Result<()> {
        if self.state.fail_filter.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        *self.state.filter.lock().unwrap() = Some(filter.clone());
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected read failure"));
        }
        self.socket.recv(buf)
    }

    fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.state.sent.lock().unwrap().push(packet.to_vec());
        if self.state.silent.load(Ordering::SeqCst) || packet.len() < 3 {
            return Ok(());
        }

        let opcode = u16::from_le_bytes([packet[1], packet[2]]);
        let status = self.status_for(opcode);
        self.controller
            .send(&command_complete_frame(opcode, status))?;
        Ok(())
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

impl FakeController {
    /// Deliver a frame as if the controller had emitted it.
    pub fn inject(&self, frame: &[u8]) {
        self.peer.send(frame).unwrap();
    }

    /// Every command packet written so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn filter(&self) -> Option<HciFilter> {
        self.state.filter.lock().unwrap().clone()
    }

    /// Acknowledge the next command with `status`.
    pub fn reject_next(&self, status: u8) {
        *self.state.next_status.lock().unwrap() = Some(status);
    }

    /// Acknowledge every command with `opcode` with `status`.
    pub fn reject_opcode(&self, opcode: u16, status: u8) {
        self.state.rejected.lock().unwrap().push((opcode, status));
    }

    /// Stop acknowledging commands.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn fail_filter(&self) {
        self.state.fail_filter.store(true, Ordering::SeqCst);
    }

    pub fn fail_reads(&self) {
        self.state.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn channel_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

/// A sink that keeps every delivery, shareable across threads.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    deliveries: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<(String, Vec<u8>)> {
        self.deliveries.lock().unwrap().clone()
    }
}

impl BlobSink for CollectingSink {
    fn deliver(&mut self, timestamp: &str, blob: &[u8]) -> Result<(), SinkError> {
        self.deliveries
            .lock()
            .unwrap()
            .push((timestamp.to_string(), blob.to_vec()));
        Ok(())
    }
}
