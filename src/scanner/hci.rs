//! Raw Linux HCI socket and the LE scan commands written to it.
//!
//! The socket talks to the kernel directly, without the BlueZ daemon. It
//! requires CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges.

use super::event::{
    EVT_CMD_COMPLETE, EVT_CMD_STATUS, EVT_DISCONN_COMPLETE, EVT_LE_META_EVENT, HCI_EVENT_PKT,
};
use super::{ControlChannel, DeviceError};
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

/// HCI command packet type
pub const HCI_COMMAND_PKT: u8 = 0x01;

// HCI commands
pub const OGF_LE_CTL: u16 = 0x08;
pub const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
pub const LE_SCAN_PASSIVE: u8 = 0x00;
pub const LE_SCAN_ACTIVE: u8 = 0x01;

// Own address type
pub const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
pub const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    pub fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    /// Events the scan loop listens to: advertising reports, disconnects and
    /// the command acknowledgements needed while programming the adapter.
    pub fn scanner() -> Self {
        let mut filter = Self::new();
        filter.set_ptype(HCI_EVENT_PKT);
        filter.set_event(EVT_LE_META_EVENT);
        filter.set_event(EVT_DISCONN_COMPLETE);
        filter.set_event(EVT_CMD_STATUS);
        filter.set_event(EVT_CMD_COMPLETE);
        filter
    }

    pub fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    pub fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }

    pub fn has_event(&self, event: u8) -> bool {
        let bit = event as usize;
        self.event_mask[bit / 32] & (1 << (bit % 32)) != 0
    }
}

impl Default for HciFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of LE Set Scan Parameters.
///
/// Interval and window are in 0.625 ms units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
    pub scan_type: u8,
    pub interval: u16,
    pub window: u16,
    pub own_address_type: u8,
    pub filter_policy: u8,
}

impl Default for ScanParameters {
    /// Active scan (scan responses carry the device name), 10 ms interval and window.
    fn default() -> Self {
        Self {
            scan_type: LE_SCAN_ACTIVE,
            interval: 0x0010,
            window: 0x0010,
            own_address_type: LE_PUBLIC_ADDRESS,
            filter_policy: FILTER_POLICY_ACCEPT_ALL,
        }
    }
}

impl ScanParameters {
    pub fn to_bytes(&self) -> [u8; 7] {
        let interval = self.interval.to_le_bytes();
        let window = self.window.to_le_bytes();
        [
            self.scan_type,
            interval[0],
            interval[1],
            window[0],
            window[1],
            self.own_address_type,
            self.filter_policy,
        ]
    }
}

/// Parameters of LE Set Scan Enable. Duplicates are never filtered so every
/// broadcast is reported.
pub fn scan_enable_params(enable: bool) -> [u8; 2] {
    [u8::from(enable), 0x00]
}

pub const fn opcode(ogf: u16, ocf: u16) -> u16 {
    (ogf << 10) | ocf
}

/// Create an HCI command packet
pub fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = opcode(ogf, ocf);
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// A raw HCI socket bound to one adapter.
///
/// The descriptor is non-blocking and closed on drop.
#[derive(Debug)]
pub struct HciSocket {
    fd: OwnedFd,
    dev_id: u16,
}

impl HciSocket {
    /// Open a raw HCI socket and bind it to adapter `hci<dev_id>`.
    pub fn open(dev_id: u16) -> Result<Self, DeviceError> {
        // nix doesn't support BTPROTO_HCI, so go through libc directly
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(DeviceError::Open {
                dev_id,
                source: io::Error::last_os_error(),
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(DeviceError::Bind {
                dev_id,
                source: io::Error::last_os_error(),
            });
        }

        log::info!("opened HCI socket for hci{dev_id}");
        Ok(Self { fd, dev_id })
    }

    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }
}

impl AsFd for HciSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl ControlChannel for HciSocket {
    fn set_filter(&self, filter: &HciFilter) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn send(&self, packet: &[u8]) -> io::Result<()> {
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret as usize != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short HCI command write: {ret} of {} bytes", packet.len()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hci_filter_setup() {
        let filter = HciFilter::scanner();

        // HCI_EVENT_PKT (0x04) sets bit 4 in type_mask
        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
        // EVT_LE_META_EVENT (0x3E = 62) sets bit 30 in event_mask[1]
        assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT % 32));
        // Disconnection Complete, Command Complete, Command Status in the first word
        assert_eq!(
            filter.event_mask[0],
            (1 << EVT_DISCONN_COMPLETE) | (1 << EVT_CMD_COMPLETE) | (1 << EVT_CMD_STATUS)
        );
        assert!(filter.has_event(EVT_CMD_COMPLETE));
        assert!(!filter.has_event(0x13));
        assert_eq!(filter.opcode, 0);
    }

    #[test]
    fn test_hci_command_packet() {
        let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00]);

        assert_eq!(packet, vec![HCI_COMMAND_PKT, 0x0C, 0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_opcode() {
        assert_eq!(opcode(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS), 0x200B);
        assert_eq!(opcode(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE), 0x200C);
    }

    #[test]
    fn test_scan_parameters_encoding() {
        let params = ScanParameters {
            scan_type: LE_SCAN_PASSIVE,
            interval: 0x0123,
            window: 0x0010,
            ..ScanParameters::default()
        };
        assert_eq!(params.to_bytes(), [0x00, 0x23, 0x01, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(ScanParameters::default().to_bytes()[0], LE_SCAN_ACTIVE);
    }

    #[test]
    fn test_scan_enable_params() {
        assert_eq!(scan_enable_params(true), [0x01, 0x00]);
        assert_eq!(scan_enable_params(false), [0x00, 0x00]);
    }
}
