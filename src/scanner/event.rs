//! HCI event framing.
//!
//! Each `read()` on a raw HCI socket returns exactly one packet:
//! `packet_type | event_code | param_len | params`. Frames are validated as a
//! whole and dropped on any inconsistency; the socket is datagram oriented so
//! there is nothing to re-synchronize.

use crate::mac_address::MacAddress;
use thiserror::Error;

/// HCI packet type of events
pub const HCI_EVENT_PKT: u8 = 0x04;
/// Event code + parameter length
pub const HCI_EVENT_HDR_SIZE: usize = 2;

pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

/// LE Meta sub-event carrying advertising reports
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

/// `event_type | address_type | address(6) | data_len` ahead of the data
const REPORT_HEADER_SIZE: usize = 9;

/// Reasons a frame is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("frame of {0} bytes is shorter than the event header")]
    TruncatedFrame(usize),
    #[error("unexpected HCI packet type 0x{0:02x}")]
    UnexpectedPacketType(u8),
    #[error("event declares {declared} parameter bytes but frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("advertising report {index} overruns the frame")]
    TruncatedReport { index: usize },
}

/// A decoded HCI event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<'a> {
    /// LE Advertising Report sub-event
    AdvertisingReports(Reports<'a>),
    CommandComplete { opcode: u16, status: u8 },
    CommandStatus { opcode: u16, status: u8 },
    /// Any event the gateway does not decode further
    Ignored { event_code: u8 },
}

/// One advertising report, borrowed from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingReport<'a> {
    pub event_type: u8,
    pub address_type: u8,
    /// Address in link-layer (little-endian) byte order
    pub address: [u8; 6],
    pub data: &'a [u8],
    pub rssi: i8,
}

impl AdvertisingReport<'_> {
    pub fn mac(&self) -> MacAddress {
        MacAddress::from_link_layer(self.address)
    }
}

/// Lazy sequence of the advertising reports packed into one event.
///
/// Finite and single-pass: it ends after the declared report count, or after
/// the first record that would read past the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reports<'a> {
    buf: &'a [u8],
    offset: usize,
    index: usize,
    count: usize,
}

impl<'a> Reports<'a> {
    fn new(buf: &'a [u8], count: usize) -> Self {
        Self {
            buf,
            offset: 0,
            index: 0,
            count,
        }
    }

    /// Number of reports the event declares.
    pub fn declared(&self) -> usize {
        self.count
    }

    /// Bytes consumed so far, relative to the first report.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn fail(&mut self) -> Option<Result<AdvertisingReport<'a>, FormatError>> {
        let index = self.index;
        self.index = self.count;
        Some(Err(FormatError::TruncatedReport { index }))
    }
}

impl<'a> Iterator for Reports<'a> {
    type Item = Result<AdvertisingReport<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }

        let rest = &self.buf[self.offset..];
        if rest.len() < REPORT_HEADER_SIZE {
            return self.fail();
        }

        let data_len = usize::from(rest[8]);
        let record_len = REPORT_HEADER_SIZE + data_len + 1;
        if rest.len() < record_len {
            return self.fail();
        }

        let mut address = [0u8; 6];
        address.copy_from_slice(&rest[2..8]);
        let report = AdvertisingReport {
            event_type: rest[0],
            address_type: rest[1],
            address,
            data: &rest[REPORT_HEADER_SIZE..REPORT_HEADER_SIZE + data_len],
            rssi: rest[REPORT_HEADER_SIZE + data_len] as i8,
        };

        self.offset += record_len;
        self.index += 1;
        Some(Ok(report))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.count - self.index))
    }
}

/// Validate one frame read from the control channel and classify it.
pub fn parse(frame: &[u8]) -> Result<Event<'_>, FormatError> {
    if frame.len() < 1 + HCI_EVENT_HDR_SIZE {
        return Err(FormatError::TruncatedFrame(frame.len()));
    }

    if frame[0] != HCI_EVENT_PKT {
        return Err(FormatError::UnexpectedPacketType(frame[0]));
    }

    let event_code = frame[1];
    let declared = usize::from(frame[2]);
    let params = &frame[1 + HCI_EVENT_HDR_SIZE..];
    if declared != params.len() {
        return Err(FormatError::LengthMismatch {
            declared,
            actual: params.len(),
        });
    }

    match event_code {
        EVT_LE_META_EVENT => parse_le_meta(params, frame.len()),
        EVT_CMD_COMPLETE => {
            // num_hci_command_packets | opcode(2) | return parameters (status first)
            match params.len() {
                0..3 => return Err(FormatError::TruncatedFrame(frame.len())),
                // No return parameters, e.g. the NOP credit update
                3 => return Ok(Event::Ignored { event_code }),
                _ => {}
            }
            Ok(Event::CommandComplete {
                opcode: u16::from_le_bytes([params[1], params[2]]),
                status: params[3],
            })
        }
        EVT_CMD_STATUS => {
            // status | num_hci_command_packets | opcode(2)
            if params.len() < 4 {
                return Err(FormatError::TruncatedFrame(frame.len()));
            }
            Ok(Event::CommandStatus {
                opcode: u16::from_le_bytes([params[2], params[3]]),
                status: params[0],
            })
        }
        _ => Ok(Event::Ignored { event_code }),
    }
}

fn parse_le_meta(params: &[u8], frame_len: usize) -> Result<Event<'_>, FormatError> {
    let Some((&subevent, payload)) = params.split_first() else {
        return Err(FormatError::TruncatedFrame(frame_len));
    };

    if subevent != EVT_LE_ADVERTISING_REPORT {
        return Ok(Event::Ignored {
            event_code: EVT_LE_META_EVENT,
        });
    }

    let Some((&count, reports)) = payload.split_first() else {
        return Err(FormatError::TruncatedFrame(frame_len));
    };

    Ok(Event::AdvertisingReports(Reports::new(
        reports,
        usize::from(count),
    )))
}
