//Ethernet Frame Layer (OSI Layer 2)
//
//Ethernet II header parsing and building.
//Frame structure: [Dest MAC (6)][Src MAC (6)][EtherType (2)][Payload (46-1500)]
//The controller appends and strips the CRC.

use core::fmt;

/// EtherType constants
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Minimum Ethernet payload size (padding required if smaller)
pub const MIN_PAYLOAD_SIZE: usize = 46;

/// Maximum Ethernet payload size (MTU)
pub const MAX_PAYLOAD_SIZE: usize = 1500;

/// Ethernet frame header size (excluding CRC)
pub const HEADER_SIZE: usize = 14;

/// Shortest frame handed to the controller
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + MIN_PAYLOAD_SIZE;

/// Longest frame handed to the controller
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// A 48-bit Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Broadcast MAC address (FF:FF:FF:FF:FF:FF)
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        MacAddr([a, b, c, d, e, f])
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[..6]);
        MacAddr(mac)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set; includes broadcast
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Errors that can occur during Ethernet frame operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthernetError {
    /// Frame is too short to be valid
    FrameTooShort,
    /// Payload exceeds MTU
    PayloadTooLarge,
}

impl fmt::Display for EthernetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EthernetError::FrameTooShort => write!(f, "Ethernet frame too short"),
            EthernetError::PayloadTooLarge => write!(f, "Ethernet payload exceeds MTU"),
        }
    }
}

/// Represents an Ethernet II header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    /// Destination MAC address (6 bytes)
    pub dest_mac: MacAddr,
    /// Source MAC address (6 bytes)
    pub src_mac: MacAddr,
    /// EtherType field (2 bytes) - indicates protocol of payload
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn new(dest_mac: MacAddr, src_mac: MacAddr, ethertype: u16) -> Self {
        Self {
            dest_mac,
            src_mac,
            ethertype,
        }
    }

    /// Parse an Ethernet header from the start of a raw frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, EthernetError> {
        if data.len() < HEADER_SIZE {
            return Err(EthernetError::FrameTooShort);
        }
        if data.len() > MAX_FRAME_SIZE + 4 {
            // Allow a trailing CRC some controllers leave in place
            return Err(EthernetError::PayloadTooLarge);
        }

        Ok(Self {
            dest_mac: MacAddr::from_slice(&data[0..6]),
            src_mac: MacAddr::from_slice(&data[6..12]),
            ethertype: u16::from_be_bytes([data[12], data[13]]),
        })
    }

    /// Write the header into the first 14 bytes of `buf`
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..6].copy_from_slice(&self.dest_mac.0);
        buf[6..12].copy_from_slice(&self.src_mac.0);
        buf[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }
}
