//! UDP Protocol Implementation (RFC 768)
//!
//! Header codec and the datagram constructor used by DHCP and TFTP.
//! Checksums are filled in by the stack at transmit time.

use core::fmt;
use core::net::Ipv4Addr;

use super::buffer::{HeaderOffsets, Packet};
use super::ethernet::{ETHERTYPE_IPV4, EthernetHeader, HEADER_SIZE as ETH_HEADER_SIZE, MacAddr};
use super::ipv4::{self, Ipv4Header, protocol};

/// Minimum UDP header size (8 bytes)
pub const UDP_HEADER_SIZE: usize = 8;

/// UDP port range for ephemeral (dynamic) port allocation
pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

/// Errors that can occur during UDP operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    /// Packet is too short to contain a valid UDP header
    PacketTooShort,
    /// Length field doesn't match actual packet size
    InvalidLength,
    /// Checksum verification failed
    ChecksumMismatch,
}

impl fmt::Display for UdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdpError::PacketTooShort => write!(f, "UDP packet too short"),
            UdpError::InvalidLength => write!(f, "UDP length field invalid"),
            UdpError::ChecksumMismatch => write!(f, "UDP checksum mismatch"),
        }
    }
}

/// UDP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dest_port: u16,
    /// Length of UDP header + data (minimum 8 bytes)
    pub length: u16,
    /// Zero when the sender did not compute one
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse a UDP header
    ///
    /// # Arguments
    /// * `bytes` - UDP header and payload, bounded by the IPv4 total length
    ///
    /// # Returns
    /// * `Ok(UdpHeader)` - The length field fits inside `bytes`
    /// * `Err(UdpError)` - Parsing failed
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UdpError> {
        if bytes.len() < UDP_HEADER_SIZE {
            return Err(UdpError::PacketTooShort);
        }

        let length = u16::from_be_bytes([bytes[4], bytes[5]]);
        if (length as usize) < UDP_HEADER_SIZE || length as usize > bytes.len() {
            return Err(UdpError::InvalidLength);
        }

        Ok(Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dest_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            length,
            checksum: u16::from_be_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dest_port.to_be_bytes());
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
        buf[6..8].copy_from_slice(&self.checksum.to_be_bytes());
    }

    /// Payload length implied by the length field
    pub fn payload_length(&self) -> usize {
        self.length as usize - UDP_HEADER_SIZE
    }
}

/// Addressing for an outbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpEndpoints {
    pub src_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
}

/// Build a complete Ethernet/IPv4/UDP frame carrying `payload`
///
/// The destination MAC is left zero for ARP to fill in; checksums are left
/// zero for the transmit path.
///
/// # Arguments
/// * `ends` - Source and destination addressing
/// * `ip_id` - IPv4 identification value
/// * `payload` - Datagram body
pub fn build_datagram(ends: &UdpEndpoints, ip_id: u16, payload: &[u8]) -> Packet {
    let udp_len = UDP_HEADER_SIZE + payload.len();
    let ip_start = ETH_HEADER_SIZE;
    let udp_start = ip_start + ipv4::HEADER_SIZE;
    let payload_start = udp_start + UDP_HEADER_SIZE;

    let mut packet = Packet::alloc(payload_start + payload.len());
    let frame = packet.data_mut();

    EthernetHeader::new(MacAddr::ZERO, ends.src_mac, ETHERTYPE_IPV4).write(frame);

    let mut ip = Ipv4Header::new(ends.src_ip, ends.dest_ip, protocol::UDP, udp_len);
    ip.identification = ip_id;
    ip.write(&mut frame[ip_start..udp_start]);

    UdpHeader {
        src_port: ends.src_port,
        dest_port: ends.dest_port,
        length: udp_len as u16,
        checksum: 0,
    }
    .write(&mut frame[udp_start..payload_start]);

    frame[payload_start..].copy_from_slice(payload);

    packet.set_offsets(HeaderOffsets {
        network: ip_start,
        transport: udp_start,
        payload: payload_start,
        payload_len: payload.len(),
    });
    packet
}
