//! ICMP (Internet Control Message Protocol) Implementation
//! RFC 792 - https://www.rfc-editor.org/rfc/rfc792
//!
//! Two sinks live here. The echo sink answers pings addressed to us by
//! turning the request around in its own buffer. The unreachable sink sits
//! below every other IPv4 sink and answers whatever nobody claimed with a
//! rate-limited port unreachable.

use core::fmt;
use core::net::Ipv4Addr;

use log::trace;

use super::buffer::{HeaderOffsets, Packet};
use super::config::ICMP_UNREACHABLE_INTERVAL;
use super::ethernet::{ETHERTYPE_IPV4, EthernetHeader, HEADER_SIZE as ETH_HEADER_SIZE, MacAddr};
use super::ipv4::{self, DEFAULT_TTL, Ipv4Header, protocol};
use super::stack::{NetCore, NetError};
use crate::time::{Tick, is_expired, set_timer};

/// Type, code, checksum and the 4-byte rest-of-header
pub const HEADER_SIZE: usize = 8;

/// Bytes of the offending datagram quoted after its IP header
pub const QUOTED_PAYLOAD: usize = 8;

/// Destination unreachable code for a closed port
pub const CODE_PORT_UNREACHABLE: u8 = 3;

/// ICMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    /// Echo Reply (Type 0)
    EchoReply,
    /// Destination Unreachable (Type 3)
    DestinationUnreachable,
    /// Echo Request (Type 8)
    EchoRequest,
    /// Anything this stack does not act on
    Unknown(u8),
}

impl From<u8> for IcmpType {
    fn from(value: u8) -> Self {
        match value {
            0 => IcmpType::EchoReply,
            3 => IcmpType::DestinationUnreachable,
            8 => IcmpType::EchoRequest,
            other => IcmpType::Unknown(other),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(icmp_type: IcmpType) -> Self {
        match icmp_type {
            IcmpType::EchoReply => 0,
            IcmpType::DestinationUnreachable => 3,
            IcmpType::EchoRequest => 8,
            IcmpType::Unknown(val) => val,
        }
    }
}

impl fmt::Display for IcmpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpType::EchoReply => write!(f, "Echo Reply"),
            IcmpType::DestinationUnreachable => write!(f, "Destination Unreachable"),
            IcmpType::EchoRequest => write!(f, "Echo Request"),
            IcmpType::Unknown(val) => write!(f, "Unknown({})", val),
        }
    }
}

/// An outbound ICMP message body
///
/// Format:
/// ```text
/// [Type (1)][Code (1)][Checksum (2)]
/// [Rest of header (4)][Data (variable)]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpMessage<'a> {
    pub icmp_type: IcmpType,
    pub code: u8,
    /// Identifier/sequence for echo, unused (zero) for unreachable
    pub rest: [u8; 4],
    pub data: &'a [u8],
}

impl<'a> IcmpMessage<'a> {
    pub fn echo_request(identifier: u16, sequence: u16, data: &'a [u8]) -> Self {
        let mut rest = [0u8; 4];
        rest[0..2].copy_from_slice(&identifier.to_be_bytes());
        rest[2..4].copy_from_slice(&sequence.to_be_bytes());
        Self {
            icmp_type: IcmpType::EchoRequest,
            code: 0,
            rest,
            data,
        }
    }

    pub fn port_unreachable(quoted: &'a [u8]) -> Self {
        Self {
            icmp_type: IcmpType::DestinationUnreachable,
            code: CODE_PORT_UNREACHABLE,
            rest: [0; 4],
            data: quoted,
        }
    }

    /// Build a complete Ethernet/IPv4/ICMP frame
    ///
    /// # Arguments
    /// * `src` - Sender MAC and IP
    /// * `dest` - Receiver MAC and IP; the frame is marked fully addressed
    /// * `ip_id` - IPv4 identification value
    ///
    /// Checksums are left for the transmit path.
    pub fn build_frame(
        &self,
        src: (MacAddr, Ipv4Addr),
        dest: (MacAddr, Ipv4Addr),
        ip_id: u16,
    ) -> Packet {
        let icmp_len = HEADER_SIZE + self.data.len();
        let ip_start = ETH_HEADER_SIZE;
        let icmp_start = ip_start + ipv4::HEADER_SIZE;

        let mut packet = Packet::alloc(icmp_start + icmp_len);
        let frame = packet.data_mut();
        EthernetHeader::new(dest.0, src.0, ETHERTYPE_IPV4).write(frame);

        let mut ip = Ipv4Header::new(src.1, dest.1, protocol::ICMP, icmp_len);
        ip.identification = ip_id;
        ip.write(&mut frame[ip_start..icmp_start]);

        let icmp = &mut frame[icmp_start..];
        icmp[0] = self.icmp_type.into();
        icmp[1] = self.code;
        icmp[4..8].copy_from_slice(&self.rest);
        icmp[HEADER_SIZE..].copy_from_slice(self.data);

        packet.set_offsets(HeaderOffsets {
            network: ip_start,
            transport: icmp_start,
            payload: icmp_start + HEADER_SIZE,
            payload_len: self.data.len(),
        });
        packet.set_dest_mac_valid(true);
        packet
    }
}

/// Receive handler of the echo sink
///
/// Rewrites the request into a reply in place: MACs and IPs swapped, type
/// set to echo reply, TTL refreshed. Identifier, sequence and data are
/// returned untouched.
pub fn handle_echo(core: &mut NetCore, mut packet: Packet) -> Result<(), NetError> {
    let offsets = packet.offsets();
    let icmp = packet.transport();
    if icmp.len() < HEADER_SIZE {
        core.stats_mut().rx_malformed += 1;
        return Ok(());
    }
    let icmp_type = IcmpType::from(icmp[0]);
    if icmp_type != IcmpType::EchoRequest {
        trace!("ICMP: ignoring {}", icmp_type);
        return Ok(());
    }

    let requester = packet.src_mac();
    let frame = packet.data_mut();

    let ip = &mut frame[offsets.network..offsets.transport];
    let mut src = [0u8; 4];
    src.copy_from_slice(&ip[12..16]);
    ip.copy_within(16..20, 12);
    ip[16..20].copy_from_slice(&src);
    ip[8] = DEFAULT_TTL;

    frame[offsets.transport] = IcmpType::EchoReply.into();
    frame[offsets.transport + 1] = 0;

    packet.set_dest_mac(requester);
    packet.set_src_mac(core.mac_address());
    packet.set_dest_mac_valid(true);
    trace!("ICMP: echo reply to {}", Ipv4Addr::from(src));
    core.transmit(packet)
}

/// Spaces out port-unreachable replies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreachableLimiter {
    last_sent: Option<Tick>,
}

impl UnreachableLimiter {
    pub const fn new() -> Self {
        Self { last_sent: None }
    }

    /// Claim the right to send at `now`
    pub fn permit(&mut self, now: Tick) -> bool {
        let allowed = self
            .last_sent
            .is_none_or(|last| is_expired(now, set_timer(last, ICMP_UNREACHABLE_INTERVAL)));
        if allowed {
            self.last_sent = Some(now);
        }
        allowed
    }
}

/// Receive handler of the unreachable sink
///
/// Quotes the offending IP header and the first eight bytes of its payload
/// back to the sender.
pub fn handle_unreachable(
    core: &mut NetCore,
    limiter: &mut UnreachableLimiter,
    packet: Packet,
) -> Result<(), NetError> {
    let Some(our_ip) = core.our_ip() else {
        return Ok(());
    };
    if !limiter.permit(core.now()) {
        trace!("ICMP: unreachable rate limited");
        return Ok(());
    }

    let offsets = packet.offsets();
    let frame = packet.data();
    let sender_ip = Ipv4Addr::new(
        frame[offsets.network + 12],
        frame[offsets.network + 13],
        frame[offsets.network + 14],
        frame[offsets.network + 15],
    );
    let quoted_end = (offsets.transport + QUOTED_PAYLOAD).min(frame.len());
    let quoted = &frame[offsets.network..quoted_end];

    trace!("ICMP: port unreachable to {}", sender_ip);
    let ip_id = core.next_ip_id();
    let reply = IcmpMessage::port_unreachable(quoted).build_frame(
        (core.mac_address(), our_ip),
        (packet.src_mac(), sender_ip),
        ip_id,
    );
    core.transmit(reply)
}
