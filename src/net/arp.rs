//! ARP (Address Resolution Protocol) - RFC 826
//!
//! Maps IPv4 addresses to MAC addresses on local networks.
//! Packet format: [HW Type (2)][Proto Type (2)][HW Len (1)][Proto Len (1)]
//!                [Operation (2)][Sender MAC (6)][Sender IP (4)]
//!                [Target MAC (6)][Target IP (4)]
//!
//! Each cache entry is either VALID (stamp = expiry) or RESOLVING on one of
//! four attempts (stamp = next retry deadline). Only the resolver advances or
//! evicts RESOLVING entries; the periodic sweep purges expired VALID ones.

use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;

use log::{debug, trace};

use super::buffer::{HeaderOffsets, Packet};
use super::ethernet::{ETHERTYPE_ARP, EthernetHeader, HEADER_SIZE, MacAddr};
use super::stack::{NetCore, NetError};
use crate::time::{Tick, Timer, is_expired, set_timer};

/// ARP hardware type for Ethernet
pub const HW_TYPE_ETHERNET: u16 = 1;

/// ARP protocol type for IPv4
pub const PROTO_TYPE_IPV4: u16 = 0x0800;

/// ARP operation codes
pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// ARP packet size (fixed at 28 bytes)
pub const ARP_PACKET_SIZE: usize = 28;

/// Requests sent for one address before giving up
pub const MAX_TRIES: u8 = 4;

/// Errors that can occur during ARP operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    /// Packet is too short to be valid
    PacketTooShort,
    /// Invalid hardware type (not Ethernet)
    InvalidHardwareType,
    /// Invalid protocol type (not IPv4)
    InvalidProtocolType,
    /// Invalid hardware or protocol address length
    InvalidAddressLength,
    /// Unknown operation code
    UnknownOperation,
}

impl fmt::Display for ArpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArpError::PacketTooShort => write!(f, "ARP packet too short"),
            ArpError::InvalidHardwareType => write!(f, "ARP hardware type is not Ethernet"),
            ArpError::InvalidProtocolType => write!(f, "ARP protocol type is not IPv4"),
            ArpError::InvalidAddressLength => write!(f, "ARP address length mismatch"),
            ArpError::UnknownOperation => write!(f, "Unknown ARP operation"),
        }
    }
}

/// ARP packet structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    /// Operation (1 = request, 2 = reply)
    pub operation: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Create a new ARP request packet
    ///
    /// # Arguments
    /// * `sender_mac` - Our MAC address
    /// * `sender_ip` - Our IP address (0.0.0.0 while unconfigured)
    /// * `target_ip` - The IP address we want to resolve
    pub fn new_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ARP_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    /// Create a new ARP reply packet
    ///
    /// # Arguments
    /// * `sender_mac` - Our MAC address
    /// * `sender_ip` - Our IP address
    /// * `target_mac` - The MAC address of the requester
    /// * `target_ip` - The IP address of the requester
    pub fn new_reply(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ARP_REPLY,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// Parse an ARP packet from raw bytes
    ///
    /// # Arguments
    /// * `data` - Raw ARP packet data (must be at least 28 bytes)
    pub fn from_bytes(data: &[u8]) -> Result<Self, ArpError> {
        if data.len() < ARP_PACKET_SIZE {
            return Err(ArpError::PacketTooShort);
        }
        if u16::from_be_bytes([data[0], data[1]]) != HW_TYPE_ETHERNET {
            return Err(ArpError::InvalidHardwareType);
        }
        if u16::from_be_bytes([data[2], data[3]]) != PROTO_TYPE_IPV4 {
            return Err(ArpError::InvalidProtocolType);
        }
        if data[4] != 6 || data[5] != 4 {
            return Err(ArpError::InvalidAddressLength);
        }

        let operation = u16::from_be_bytes([data[6], data[7]]);
        if operation != ARP_REQUEST && operation != ARP_REPLY {
            return Err(ArpError::UnknownOperation);
        }

        Ok(Self {
            operation,
            sender_mac: MacAddr::from_slice(&data[8..14]),
            sender_ip: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            target_mac: MacAddr::from_slice(&data[18..24]),
            target_ip: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
        })
    }

    /// Write the 28-byte body into `buf`
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
        buf[2..4].copy_from_slice(&PROTO_TYPE_IPV4.to_be_bytes());
        buf[4] = 6;
        buf[5] = 4;
        buf[6..8].copy_from_slice(&self.operation.to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_mac.0);
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(&self.target_mac.0);
        buf[24..28].copy_from_slice(&self.target_ip.octets());
    }

    pub fn is_request(&self) -> bool {
        self.operation == ARP_REQUEST
    }

    pub fn is_reply(&self) -> bool {
        self.operation == ARP_REPLY
    }

    /// Wrap in an Ethernet frame addressed to `dest_mac`
    ///
    /// The frame is marked as fully addressed so it bypasses resolution.
    pub fn into_frame(self, dest_mac: MacAddr) -> Packet {
        let mut packet = Packet::alloc(HEADER_SIZE + ARP_PACKET_SIZE);
        let frame = packet.data_mut();
        EthernetHeader::new(dest_mac, self.sender_mac, ETHERTYPE_ARP).write(frame);
        self.write(&mut frame[HEADER_SIZE..]);
        packet.set_offsets(HeaderOffsets {
            network: HEADER_SIZE,
            transport: 0,
            payload: HEADER_SIZE,
            payload_len: ARP_PACKET_SIZE,
        });
        packet.set_dest_mac_valid(true);
        packet
    }
}

/// Resolution state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Valid,
    /// Attempt number, 1 through [`MAX_TRIES`]
    Resolving(u8),
}

/// ARP cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    /// Zero while resolving
    pub mac: MacAddr,
    pub state: EntryState,
    /// Expiry when VALID, next retry deadline when RESOLVING
    pub stamp: Tick,
}

/// Outcome of [`ArpCache::resolve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Cached and unexpired
    Hit(MacAddr),
    /// A request must go out now; the packet waits
    SendRequest,
    /// A request is outstanding; the packet waits
    Wait,
    /// All attempts unanswered; the entry has been removed
    Fail,
}

/// IP → MAC cache with per-entry resolution state
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: Vec<ArpEntry>,
}

impl ArpCache {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn position(&self, ip: Ipv4Addr) -> Option<usize> {
        self.entries.iter().position(|e| e.ip == ip)
    }

    /// Advance resolution of `ip`
    ///
    /// # Arguments
    /// * `ip` - Next hop to resolve
    /// * `now` - Current tick
    /// * `retry_interval` - Delay before the next attempt
    ///
    /// # Returns
    /// What the caller must do with the packet bound for `ip`
    pub fn resolve(&mut self, ip: Ipv4Addr, now: Tick, retry_interval: Tick) -> Resolution {
        let Some(index) = self.position(ip) else {
            self.entries.push(ArpEntry {
                ip,
                mac: MacAddr::ZERO,
                state: EntryState::Resolving(1),
                stamp: set_timer(now, retry_interval),
            });
            return Resolution::SendRequest;
        };

        let ArpEntry {
            mac, state, stamp, ..
        } = self.entries[index];
        match state {
            EntryState::Valid if !is_expired(now, stamp) => Resolution::Hit(mac),
            EntryState::Valid => {
                let entry = &mut self.entries[index];
                entry.state = EntryState::Resolving(1);
                entry.stamp = set_timer(now, retry_interval);
                Resolution::SendRequest
            }
            EntryState::Resolving(_) if !is_expired(now, stamp) => Resolution::Wait,
            EntryState::Resolving(attempt) if attempt < MAX_TRIES => {
                let entry = &mut self.entries[index];
                entry.state = EntryState::Resolving(attempt + 1);
                entry.stamp = set_timer(now, retry_interval);
                Resolution::SendRequest
            }
            EntryState::Resolving(_) => {
                self.entries.remove(index);
                Resolution::Fail
            }
        }
    }

    /// Record a binding heard on the wire
    ///
    /// Creates or refreshes a VALID entry regardless of any resolution in
    /// progress.
    pub fn learn(&mut self, ip: Ipv4Addr, mac: MacAddr, now: Tick, ttl: Tick) {
        let entry = ArpEntry {
            ip,
            mac,
            state: EntryState::Valid,
            stamp: set_timer(now, ttl),
        };
        match self.position(ip) {
            Some(index) => self.entries[index] = entry,
            None => self.entries.push(entry),
        }
    }

    /// Look up a MAC address without starting resolution
    pub fn lookup(&self, ip: Ipv4Addr, now: Tick) -> Option<MacAddr> {
        self.entries
            .iter()
            .find(|e| e.ip == ip && e.state == EntryState::Valid && !is_expired(now, e.stamp))
            .map(|e| e.mac)
    }

    pub fn entry(&self, ip: Ipv4Addr) -> Option<&ArpEntry> {
        self.entries.iter().find(|e| e.ip == ip)
    }

    /// Remove expired VALID entries
    ///
    /// # Returns
    /// Number of entries removed
    pub fn sweep(&mut self, now: Tick) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.state == EntryState::Valid && is_expired(now, e.stamp)));
        before - self.entries.len()
    }

    /// Get the number of entries in the cache
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[ArpEntry] {
        &self.entries
    }
}

/// Receive handler of the ARP sink
///
/// Learns the sender of every request or reply and answers requests for
/// our own address with a unicast reply.
pub fn handle_packet(core: &mut NetCore, packet: Packet) -> Result<(), NetError> {
    let arp = match ArpPacket::from_bytes(packet.network()) {
        Ok(arp) => arp,
        Err(e) => {
            trace!("ARP: dropping packet: {}", e);
            core.stats_mut().rx_malformed += 1;
            return Ok(());
        }
    };

    let now = core.now();
    let ttl = core.config().arp_ttl;
    if !arp.sender_ip.is_unspecified() {
        core.arp_cache_mut().learn(arp.sender_ip, arp.sender_mac, now, ttl);
    }

    let Some(our_ip) = core.our_ip() else {
        return Ok(());
    };
    if arp.is_request() && arp.target_ip == our_ip {
        debug!("ARP: {} is at {}, replying to {}", our_ip, core.mac_address(), arp.sender_ip);
        let reply =
            ArpPacket::new_reply(core.mac_address(), our_ip, arp.sender_mac, arp.sender_ip);
        core.send_frame(reply.into_frame(arp.sender_mac))?;
    }
    Ok(())
}

/// Timer handler of the ARP sink
pub fn handle_sweep(core: &mut NetCore, timer: &mut Timer) {
    let now = core.now();
    let removed = core.arp_cache_mut().sweep(now);
    if removed > 0 {
        debug!("ARP: swept {} expired entries", removed);
    }
    timer.arm(now, core.config().arp_sweep_interval);
}
