//! IPv4 Protocol Implementation
//!
//! Fixed 20-byte header codec and single-gateway next-hop selection.
//! Fragments are recognised so they can be dropped; reassembly is not done.
//!
//! # References
//! - RFC 791: Internet Protocol (IPv4)

use core::fmt;

/// IPv4 Address type (re-export for convenience)
pub use core::net::Ipv4Addr;

/// IPv4 Protocol Numbers (IANA assigned)
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// IPv4 Header Flags (upper bits of the flags/fragment word)
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
    pub const MORE_FRAGMENTS: u16 = 0x2000;
    pub const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;
}

/// Default TTL (Time To Live) value
pub const DEFAULT_TTL: u8 = 64;

/// Header size without options; the only size this stack emits
pub const HEADER_SIZE: usize = 20;

/// IPv4 Header Structure
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version|  IHL  |    DSCP   |ECN|         Total Length          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Identification        |Flags|      Fragment Offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Time to Live |    Protocol   |         Header Checksum       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Source Address                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Destination Address                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Internet Header Length in 32-bit words (5 on everything we build)
    pub ihl: u8,
    /// DSCP/ECN byte
    pub tos: u8,
    /// Total packet length (header + data) in bytes
    pub total_length: u16,
    pub identification: u16,
    /// Flags and fragment offset as on the wire
    pub flags_fragment: u16,
    pub ttl: u8,
    /// Protocol number (ICMP=1, TCP=6, UDP=17)
    pub protocol: u8,
    pub checksum: u16,
    pub src_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
}

impl Ipv4Header {
    /// Create a header for an unfragmented datagram
    ///
    /// # Arguments
    /// * `src_ip` - Source IP address
    /// * `dest_ip` - Destination IP address
    /// * `protocol` - Protocol number (use `protocol::*` constants)
    /// * `payload_len` - Length of the data following the header
    pub fn new(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: u8, payload_len: usize) -> Self {
        Self {
            ihl: 5,
            tos: 0,
            total_length: (HEADER_SIZE + payload_len) as u16,
            identification: 0,
            flags_fragment: flags::DONT_FRAGMENT,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src_ip,
            dest_ip,
        }
    }

    /// Parse an IPv4 header from raw bytes
    ///
    /// # Arguments
    /// * `data` - Bytes starting at the IPv4 header
    ///
    /// # Returns
    /// - `Ok(Ipv4Header)` - Parsed header; the checksum has been verified
    /// - `Err(Ipv4Error)` - Truncated, not version 4, inconsistent lengths, or bad checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self, Ipv4Error> {
        if data.len() < HEADER_SIZE {
            return Err(Ipv4Error::PacketTooShort);
        }

        let version = data[0] >> 4;
        let ihl = data[0] & 0x0F;
        if version != 4 {
            return Err(Ipv4Error::InvalidVersion(version));
        }
        if ihl < 5 {
            return Err(Ipv4Error::InvalidIhl(ihl));
        }

        let header_len = ihl as usize * 4;
        if data.len() < header_len {
            return Err(Ipv4Error::PacketTooShort);
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if (total_length as usize) < header_len || total_length as usize > data.len() {
            return Err(Ipv4Error::InvalidLength);
        }

        if !super::checksum::verify_ipv4(&data[..header_len]) {
            return Err(Ipv4Error::ChecksumMismatch);
        }

        Ok(Self {
            ihl,
            tos: data[1],
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags_fragment: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src_ip: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dest_ip: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Write a 20-byte header into `buf`; the checksum field is left zero
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = 0x45;
        buf[1] = self.tos;
        buf[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        buf[4..6].copy_from_slice(&self.identification.to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        buf[10] = 0;
        buf[11] = 0;
        buf[12..16].copy_from_slice(&self.src_ip.octets());
        buf[16..20].copy_from_slice(&self.dest_ip.octets());
    }

    /// More-fragments set or a non-zero offset
    pub fn is_fragment(&self) -> bool {
        self.flags_fragment & flags::MORE_FRAGMENTS != 0
            || self.flags_fragment & flags::FRAGMENT_OFFSET_MASK != 0
    }

    /// Get the header length in bytes
    pub fn header_length(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Length of the data after the header
    pub fn payload_length(&self) -> usize {
        self.total_length as usize - self.header_length()
    }
}

/// IPv4 Routing Table
///
/// One interface, one optional default gateway.
#[derive(Debug, Clone, Copy)]
pub struct RoutingTable {
    /// Our local IP address
    pub local_ip: Ipv4Addr,
    /// Network mask (e.g., 255.255.255.0)
    pub netmask: Ipv4Addr,
    /// Default gateway (if any)
    pub gateway: Option<Ipv4Addr>,
}

impl RoutingTable {
    pub fn new(local_ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            local_ip,
            netmask,
            gateway,
        }
    }

    /// Determine the next hop for a destination IP
    ///
    /// # Returns
    /// - `Some(ip)` - The destination itself when on-subnet, else the gateway
    /// - `None` - Off-subnet with no gateway configured
    pub fn next_hop(&self, dest_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.is_local(dest_ip) {
            Some(dest_ip)
        } else {
            self.gateway
        }
    }

    /// Check if a destination IP is on the local subnet
    pub fn is_local(&self, dest_ip: Ipv4Addr) -> bool {
        let mask = self.netmask.to_bits();
        self.local_ip.to_bits() & mask == dest_ip.to_bits() & mask
    }

    /// Limited broadcast or the directed broadcast of our subnet
    pub fn is_broadcast(&self, dest_ip: Ipv4Addr) -> bool {
        if dest_ip.is_broadcast() {
            return true;
        }
        let mask = self.netmask.to_bits();
        mask != u32::MAX && self.is_local(dest_ip) && dest_ip.to_bits() | mask == u32::MAX
    }
}

/// IPv4 Error Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Error {
    /// Packet is too short to contain a valid header
    PacketTooShort,
    /// Invalid IP version (not 4)
    InvalidVersion(u8),
    /// Invalid IHL (Internet Header Length < 5)
    InvalidIhl(u8),
    /// Invalid total length field
    InvalidLength,
    /// Header checksum mismatch
    ChecksumMismatch,
}

impl fmt::Display for Ipv4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ipv4Error::PacketTooShort => write!(f, "Packet too short"),
            Ipv4Error::InvalidVersion(v) => write!(f, "Invalid IP version: {}", v),
            Ipv4Error::InvalidIhl(ihl) => write!(f, "Invalid IHL: {}", ihl),
            Ipv4Error::InvalidLength => write!(f, "Invalid total length"),
            Ipv4Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::checksum;

    fn sample() -> [u8; 28] {
        let header = Ipv4Header::new(
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(192, 168, 1, 1),
            protocol::UDP,
            8,
        );
        let mut buf = [0u8; 28];
        header.write(&mut buf);
        checksum::compute_ipv4(&mut buf[..HEADER_SIZE]);
        buf
    }

    #[test]
    fn test_parse_built_header() {
        let buf = sample();
        let header = Ipv4Header::from_bytes(&buf).unwrap();
        assert_eq!(header.protocol, protocol::UDP);
        assert_eq!(header.total_length, 28);
        assert_eq!(header.payload_length(), 8);
        assert!(!header.is_fragment());
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut buf = sample();
        buf[8] = 1;
        assert_eq!(
            Ipv4Header::from_bytes(&buf),
            Err(Ipv4Error::ChecksumMismatch)
        );
    }

    #[test]
    fn test_total_length_beyond_buffer() {
        let mut buf = sample();
        buf[2..4].copy_from_slice(&40u16.to_be_bytes());
        checksum::compute_ipv4(&mut buf[..HEADER_SIZE]);
        assert_eq!(Ipv4Header::from_bytes(&buf), Err(Ipv4Error::InvalidLength));
    }

    #[test]
    fn test_fragment_detection() {
        let mut header = Ipv4Header::new(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 17, 0);
        header.flags_fragment = flags::MORE_FRAGMENTS;
        assert!(header.is_fragment());
        header.flags_fragment = 0x0010;
        assert!(header.is_fragment());
    }

    #[test]
    fn test_next_hop() {
        let routes = RoutingTable::new(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(255, 255, 255, 0),
            Some(Ipv4Addr::new(10, 0, 0, 1)),
        );
        assert_eq!(
            routes.next_hop(Ipv4Addr::new(10, 0, 0, 9)),
            Some(Ipv4Addr::new(10, 0, 0, 9))
        );
        assert_eq!(
            routes.next_hop(Ipv4Addr::new(8, 8, 8, 8)),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert!(routes.is_broadcast(Ipv4Addr::new(10, 0, 0, 255)));
        assert!(!routes.is_broadcast(Ipv4Addr::new(10, 0, 1, 255)));

        let isolated = RoutingTable::new(routes.local_ip, routes.netmask, None);
        assert_eq!(isolated.next_hop(Ipv4Addr::new(8, 8, 8, 8)), None);
    }
}
