//! Owned frame buffer and FIFO queue
//!
//! A [`Packet`] owns one contiguous Ethernet frame plus the offsets of the
//! headers parsed out of it. It is not `Clone`: a packet lives in exactly one
//! place at a time (a sink queue, the ARP pending list, the transmit backlog,
//! or a local binding on its way to the driver) and moves between them by
//! value.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use super::ethernet::{EthernetHeader, HEADER_SIZE, MIN_FRAME_SIZE, MacAddr};

/// Offsets into the frame of each parsed layer
///
/// `transport` and `payload` are zero until the corresponding header has
/// been parsed or built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderOffsets {
    /// Start of the ARP or IPv4 header
    pub network: usize,
    /// Start of the UDP/ICMP header
    pub transport: usize,
    /// Start of the application payload
    pub payload: usize,
    pub payload_len: usize,
}

/// One Ethernet frame in flight through the stack
#[derive(Debug)]
pub struct Packet {
    data: Vec<u8>,
    offsets: HeaderOffsets,
    /// Destination MAC in the frame is final; skip next-hop resolution
    dest_mac_valid: bool,
    /// Next hop chosen by routing, awaiting ARP
    nexthop: Option<Ipv4Addr>,
}

impl Packet {
    /// Allocate a zeroed frame of `len` bytes
    ///
    /// The network offset is set to just past the Ethernet header.
    pub fn alloc(len: usize) -> Self {
        Self {
            data: vec![0u8; len.max(HEADER_SIZE)],
            offsets: HeaderOffsets {
                network: HEADER_SIZE,
                ..HeaderOffsets::default()
            },
            dest_mac_valid: false,
            nexthop: None,
        }
    }

    /// Wrap a frame pulled from the driver
    pub fn from_frame(data: Vec<u8>) -> Self {
        Self {
            data,
            offsets: HeaderOffsets {
                network: HEADER_SIZE,
                ..HeaderOffsets::default()
            },
            dest_mac_valid: false,
            nexthop: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The whole frame
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Give up the frame bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Drop trailing bytes (Ethernet padding, CRC)
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Zero-pad the frame to the Ethernet minimum
    pub fn pad(&mut self) {
        if self.data.len() < MIN_FRAME_SIZE {
            self.data.resize(MIN_FRAME_SIZE, 0);
        }
    }

    pub fn offsets(&self) -> HeaderOffsets {
        self.offsets
    }

    pub fn set_offsets(&mut self, offsets: HeaderOffsets) {
        self.offsets = offsets;
    }

    pub fn ethernet(&self) -> EthernetHeader {
        EthernetHeader {
            dest_mac: MacAddr::from_slice(&self.data[0..6]),
            src_mac: MacAddr::from_slice(&self.data[6..12]),
            ethertype: self.ethertype(),
        }
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.data[12], self.data[13]])
    }

    pub fn dest_mac(&self) -> MacAddr {
        MacAddr::from_slice(&self.data[0..6])
    }

    pub fn set_dest_mac(&mut self, mac: MacAddr) {
        self.data[0..6].copy_from_slice(&mac.0);
    }

    pub fn src_mac(&self) -> MacAddr {
        MacAddr::from_slice(&self.data[6..12])
    }

    pub fn set_src_mac(&mut self, mac: MacAddr) {
        self.data[6..12].copy_from_slice(&mac.0);
    }

    /// ARP or IPv4 header onwards
    pub fn network(&self) -> &[u8] {
        &self.data[self.offsets.network..]
    }

    pub fn network_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offsets.network..]
    }

    /// Transport header onwards
    pub fn transport(&self) -> &[u8] {
        &self.data[self.offsets.transport..]
    }

    pub fn transport_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offsets.transport..]
    }

    /// Application payload bounded by `payload_len`
    pub fn payload(&self) -> &[u8] {
        let start = self.offsets.payload;
        &self.data[start..start + self.offsets.payload_len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.offsets.payload;
        &mut self.data[start..start + self.offsets.payload_len]
    }

    pub fn dest_mac_valid(&self) -> bool {
        self.dest_mac_valid
    }

    pub fn set_dest_mac_valid(&mut self, valid: bool) {
        self.dest_mac_valid = valid;
    }

    pub fn nexthop(&self) -> Option<Ipv4Addr> {
        self.nexthop
    }

    pub fn set_nexthop(&mut self, nexthop: Option<Ipv4Addr>) {
        self.nexthop = nexthop;
    }
}

/// FIFO of owned packets
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: VecDeque<Packet>,
}

impl PacketQueue {
    pub const fn new() -> Self {
        Self {
            packets: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    pub fn pop_front(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    /// Look at the head without removing it
    pub fn peek(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Remove every queued packet
    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }
}
