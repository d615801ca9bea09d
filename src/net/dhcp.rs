//! DHCP Client Implementation
//! RFC 2131 - https://www.rfc-editor.org/rfc/rfc2131
//!
//! The client runs as a sink: replies arrive on its queue and every
//! retransmission is driven by its one-shot timer. It never gives up; any
//! failure loops back to DISCOVER.
//!
//! ```text
//! DISCOVER -> SELECT -> REQUEST -> BOUND -> RENEW
//!    ^          |          |                  |
//!    +----------+----------+------------------+
//! ```

use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;

use log::{debug, info, trace, warn};

use super::buffer::Packet;
use super::config::NetworkConfig;
use super::ethernet::{ETHERTYPE_IPV4, MacAddr};
use super::ipv4::protocol;
use super::sink::{Sink, SinkId, SinkKind, SinkMatch};
use super::stack::{NetCore, NetError, NetStack};
use crate::time::{MAX_DELAY, Tick, Timer, secs_to_ticks};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

pub const BOOT_REQUEST: u8 = 1;
pub const BOOT_REPLY: u8 = 2;

const HTYPE_ETHERNET: u8 = 1;
const HLEN_ETHERNET: u8 = 6;

/// Ask servers to broadcast their replies; we have no address to unicast to
const FLAG_BROADCAST: u16 = 0x8000;

/// Fixed BOOTP header before the magic cookie
const BOOTP_HEADER_SIZE: usize = 236;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Largest DHCP message we accept (option 57)
const MAX_MESSAGE_SIZE: u16 = 576;

/// Option codes
pub mod option {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVER: u8 = 6;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_LIST: u8 = 55;
    pub const MAX_MESSAGE_SIZE: u8 = 57;
    pub const END: u8 = 255;
}

/// Options requested in DISCOVER and REQUEST
const REQUESTED_PARAMS: [u8; 5] = [
    option::SUBNET_MASK,
    option::ROUTER,
    option::DNS_SERVER,
    option::LEASE_TIME,
    option::SERVER_ID,
];

/// First SELECT timeout; doubles on every empty round
pub const INITIAL_BACKOFF: Tick = secs_to_ticks(2);
/// SELECT timeout cap
pub const MAX_BACKOFF: Tick = secs_to_ticks(120);
/// Offers with a shorter lease are refused
pub const MIN_LEASE_SECS: u32 = 180;
/// How long to wait for ACK/NAK after REQUEST
pub const REQUEST_TIMEOUT: Tick = secs_to_ticks(4);
/// REQUESTs sent while renewing before the lease is given up
pub const RENEW_RETRIES: u32 = 5;
/// Spacing of renewal REQUESTs, in seconds
pub const RENEW_INTERVAL_SECS: u32 = 10;

/// DHCP message types (option 53)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            8 => MessageType::Inform,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Discover => 1,
            MessageType::Offer => 2,
            MessageType::Request => 3,
            MessageType::Decline => 4,
            MessageType::Ack => 5,
            MessageType::Nak => 6,
            MessageType::Release => 7,
            MessageType::Inform => 8,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Discover => "DHCPDISCOVER",
            MessageType::Offer => "DHCPOFFER",
            MessageType::Request => "DHCPREQUEST",
            MessageType::Decline => "DHCPDECLINE",
            MessageType::Ack => "DHCPACK",
            MessageType::Nak => "DHCPNAK",
            MessageType::Release => "DHCPRELEASE",
            MessageType::Inform => "DHCPINFORM",
        };
        write!(f, "{}", name)
    }
}

/// DHCP parse errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpError {
    /// Shorter than the BOOTP header plus cookie
    PacketTooShort,
    /// Magic cookie missing
    BadMagicCookie,
    /// Option length runs past the end of the packet
    TruncatedOption,
    /// Option carries a length its type does not allow
    BadOptionLength(u8),
    /// No message type option
    MissingMessageType,
    UnknownMessageType(u8),
}

impl fmt::Display for DhcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhcpError::PacketTooShort => write!(f, "DHCP message too short"),
            DhcpError::BadMagicCookie => write!(f, "Bad DHCP magic cookie"),
            DhcpError::TruncatedOption => write!(f, "Truncated DHCP option"),
            DhcpError::BadOptionLength(code) => write!(f, "Bad length for DHCP option {}", code),
            DhcpError::MissingMessageType => write!(f, "DHCP message type missing"),
            DhcpError::UnknownMessageType(t) => write!(f, "Unknown DHCP message type {}", t),
        }
    }
}

/// A DHCP message, request or reply
///
/// Only the options this client uses are carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub xid: u32,
    /// Client address, set while renewing
    pub ciaddr: Ipv4Addr,
    /// Address offered to the client
    pub yiaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    pub message_type: MessageType,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns_server: Option<Ipv4Addr>,
    pub lease_secs: Option<u32>,
    pub server_id: Option<Ipv4Addr>,
    pub requested_ip: Option<Ipv4Addr>,
}

impl DhcpMessage {
    /// Client message with every optional field empty
    pub fn request(message_type: MessageType, xid: u32, chaddr: MacAddr) -> Self {
        Self {
            op: BOOT_REQUEST,
            xid,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            message_type,
            subnet_mask: None,
            router: None,
            dns_server: None,
            lease_secs: None,
            server_id: None,
            requested_ip: None,
        }
    }

    /// Parse a DHCP message from a UDP payload
    ///
    /// # Returns
    /// - `Ok(DhcpMessage)` - Header and recognised options
    /// - `Err(DhcpError)` - Truncated, no cookie, or a malformed option
    pub fn parse(bytes: &[u8]) -> Result<Self, DhcpError> {
        if bytes.len() < BOOTP_HEADER_SIZE + MAGIC_COOKIE.len() {
            return Err(DhcpError::PacketTooShort);
        }
        if bytes[BOOTP_HEADER_SIZE..BOOTP_HEADER_SIZE + 4] != MAGIC_COOKIE {
            return Err(DhcpError::BadMagicCookie);
        }

        let ip_at = |at: usize| Ipv4Addr::new(bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]);
        let mut msg = Self::request(
            MessageType::Discover,
            u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            MacAddr::from_slice(&bytes[28..34]),
        );
        msg.op = bytes[0];
        msg.ciaddr = ip_at(12);
        msg.yiaddr = ip_at(16);

        let mut message_type = None;
        let mut at = BOOTP_HEADER_SIZE + MAGIC_COOKIE.len();
        while at < bytes.len() {
            let code = bytes[at];
            if code == option::PAD {
                at += 1;
                continue;
            }
            if code == option::END {
                break;
            }
            let len = *bytes.get(at + 1).ok_or(DhcpError::TruncatedOption)? as usize;
            let value = bytes
                .get(at + 2..at + 2 + len)
                .ok_or(DhcpError::TruncatedOption)?;

            match code {
                option::MESSAGE_TYPE => {
                    let [t] = value else {
                        return Err(DhcpError::BadOptionLength(code));
                    };
                    message_type =
                        Some(MessageType::from_u8(*t).ok_or(DhcpError::UnknownMessageType(*t))?);
                }
                option::SUBNET_MASK => msg.subnet_mask = Some(single_addr(code, value)?),
                option::SERVER_ID => msg.server_id = Some(single_addr(code, value)?),
                option::REQUESTED_IP => msg.requested_ip = Some(single_addr(code, value)?),
                option::ROUTER => msg.router = Some(first_addr(code, value)?),
                option::DNS_SERVER => msg.dns_server = Some(first_addr(code, value)?),
                option::LEASE_TIME => {
                    let secs: [u8; 4] = value
                        .try_into()
                        .map_err(|_| DhcpError::BadOptionLength(code))?;
                    msg.lease_secs = Some(u32::from_be_bytes(secs));
                }
                _ => {}
            }
            at += 2 + len;
        }

        msg.message_type = message_type.ok_or(DhcpError::MissingMessageType)?;
        Ok(msg)
    }

    /// Serialize to a UDP payload
    ///
    /// Requests additionally carry the parameter request list and maximum
    /// message size options.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BOOTP_HEADER_SIZE + 64);
        out.extend_from_slice(&[self.op, HTYPE_ETHERNET, HLEN_ETHERNET, 0]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&[0, 0]); // secs
        out.extend_from_slice(&FLAG_BROADCAST.to_be_bytes());
        out.extend_from_slice(&self.ciaddr.octets());
        out.extend_from_slice(&self.yiaddr.octets());
        out.extend_from_slice(&[0; 8]); // siaddr, giaddr
        out.extend_from_slice(&self.chaddr.octets());
        out.resize(BOOTP_HEADER_SIZE, 0); // chaddr padding, sname, file
        out.extend_from_slice(&MAGIC_COOKIE);

        out.extend_from_slice(&[option::MESSAGE_TYPE, 1, self.message_type.as_u8()]);
        let addrs = [
            (option::REQUESTED_IP, self.requested_ip),
            (option::SERVER_ID, self.server_id),
            (option::SUBNET_MASK, self.subnet_mask),
            (option::ROUTER, self.router),
            (option::DNS_SERVER, self.dns_server),
        ];
        for (code, addr) in addrs {
            if let Some(addr) = addr {
                out.extend_from_slice(&[code, 4]);
                out.extend_from_slice(&addr.octets());
            }
        }
        if let Some(secs) = self.lease_secs {
            out.extend_from_slice(&[option::LEASE_TIME, 4]);
            out.extend_from_slice(&secs.to_be_bytes());
        }
        if self.op == BOOT_REQUEST {
            out.extend_from_slice(&[option::PARAMETER_LIST, REQUESTED_PARAMS.len() as u8]);
            out.extend_from_slice(&REQUESTED_PARAMS);
            out.extend_from_slice(&[option::MAX_MESSAGE_SIZE, 2]);
            out.extend_from_slice(&MAX_MESSAGE_SIZE.to_be_bytes());
        }
        out.push(option::END);
        out
    }
}

fn single_addr(code: u8, value: &[u8]) -> Result<Ipv4Addr, DhcpError> {
    let octets: [u8; 4] = value
        .try_into()
        .map_err(|_| DhcpError::BadOptionLength(code))?;
    Ok(Ipv4Addr::from(octets))
}

/// First entry of an address list option
fn first_addr(code: u8, value: &[u8]) -> Result<Ipv4Addr, DhcpError> {
    if value.is_empty() || value.len() % 4 != 0 {
        return Err(DhcpError::BadOptionLength(code));
    }
    single_addr(code, &value[..4])
}

/// Client states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    Discover,
    Select,
    Request,
    Bound,
    Renew,
}

/// Configuration offered by a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub server_id: Ipv4Addr,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub lease_secs: u32,
}

impl Lease {
    /// Validate an offer
    ///
    /// # Returns
    /// - `Ok(Lease)` - The offer carries everything a diskless boot needs
    /// - `Err(reason)` - Why the offer was refused
    pub fn from_offer(msg: &DhcpMessage) -> Result<Self, &'static str> {
        if msg.yiaddr.is_unspecified() {
            return Err("no address");
        }
        let gateway = msg.router.ok_or("no gateway")?;
        let dns = msg.dns_server.ok_or("no DNS server")?;
        let server_id = msg.server_id.ok_or("no server identifier")?;
        let lease_secs = msg.lease_secs.ok_or("no lease time")?;
        if lease_secs < MIN_LEASE_SECS {
            return Err("lease too short");
        }
        Ok(Self {
            server_id,
            address: msg.yiaddr,
            netmask: msg.subnet_mask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
            gateway,
            dns,
            lease_secs,
        })
    }

    /// Delay from binding until the first renewal REQUEST
    ///
    /// Leaves room for the whole renewal budget before the lease runs out.
    /// Infinite and very long leases renew at the furthest deadline a timer
    /// can hold.
    pub fn renew_after(&self) -> Tick {
        let budget = RENEW_RETRIES * RENEW_INTERVAL_SECS;
        secs_to_ticks(self.lease_secs.saturating_sub(budget).max(1)).min(MAX_DELAY)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            ip_addr: self.address,
            netmask: self.netmask,
            gateway: Some(self.gateway),
            dns: Some(self.dns),
        }
    }
}

/// DHCP client state machine
#[derive(Debug, Clone)]
pub struct DhcpClient {
    state: DhcpState,
    mac: MacAddr,
    xid: u32,
    offer: Option<Lease>,
    backoff: Tick,
    renew_attempts: u32,
}

impl DhcpClient {
    pub fn new(mac: MacAddr) -> Self {
        let m = mac.octets();
        Self {
            state: DhcpState::Discover,
            mac,
            xid: u32::from_be_bytes([m[2], m[3], m[4], m[5]]),
            offer: None,
            backoff: INITIAL_BACKOFF,
            renew_attempts: 0,
        }
    }

    pub fn state(&self) -> DhcpState {
        self.state
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// The offer being requested, or the lease currently held
    pub fn lease(&self) -> Option<&Lease> {
        self.offer.as_ref()
    }

    /// Begin acquisition from scratch
    pub fn start(&mut self, core: &mut NetCore, timer: &mut Timer) -> Result<(), NetError> {
        self.backoff = INITIAL_BACKOFF;
        self.discover(core, timer)
    }

    fn discover(&mut self, core: &mut NetCore, timer: &mut Timer) -> Result<(), NetError> {
        self.state = DhcpState::Discover;
        self.offer = None;
        self.xid = self
            .xid
            .wrapping_mul(1_103_515_245)
            .wrapping_add(12_345)
            ^ core.now();

        debug!("DHCP: DISCOVER xid 0x{:08x}", self.xid);
        let msg = DhcpMessage::request(MessageType::Discover, self.xid, self.mac);
        self.state = DhcpState::Select;
        timer.arm(core.now(), self.backoff);
        send(core, &msg)
    }

    fn request(&mut self, core: &mut NetCore) -> Result<(), NetError> {
        let Some(lease) = self.offer else {
            return Ok(());
        };
        let mut msg = DhcpMessage::request(MessageType::Request, self.xid, self.mac);
        msg.server_id = Some(lease.server_id);
        if self.state == DhcpState::Renew {
            msg.ciaddr = lease.address;
        } else {
            msg.requested_ip = Some(lease.address);
        }
        debug!("DHCP: REQUEST {} from {}", lease.address, lease.server_id);
        send(core, &msg)
    }

    /// Receive handler
    pub fn handle_packet(
        &mut self,
        core: &mut NetCore,
        timer: &mut Timer,
        packet: Packet,
    ) -> Result<(), NetError> {
        let msg = match DhcpMessage::parse(packet.payload()) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("DHCP: dropping reply: {}", e);
                core.stats_mut().rx_malformed += 1;
                return Ok(());
            }
        };
        if msg.op != BOOT_REPLY || msg.xid != self.xid || msg.chaddr != self.mac {
            trace!("DHCP: ignoring {} xid 0x{:08x}", msg.message_type, msg.xid);
            return Ok(());
        }

        match (self.state, msg.message_type) {
            (DhcpState::Select, MessageType::Offer) => match Lease::from_offer(&msg) {
                Ok(lease) => {
                    debug!("DHCP: accepting offer {} from {}", lease.address, lease.server_id);
                    self.offer = Some(lease);
                    self.backoff = INITIAL_BACKOFF;
                    self.state = DhcpState::Request;
                    timer.arm(core.now(), REQUEST_TIMEOUT);
                    self.request(core)
                }
                Err(reason) => {
                    debug!("DHCP: rejecting offer {}: {}", msg.yiaddr, reason);
                    Ok(())
                }
            },
            (DhcpState::Request | DhcpState::Renew, MessageType::Ack) => {
                self.bind(core, timer, &msg);
                Ok(())
            }
            (DhcpState::Request | DhcpState::Renew, MessageType::Nak) => {
                warn!("DHCP: NAK from server, restarting");
                if self.state == DhcpState::Renew {
                    core.set_interface(NetworkConfig::UNCONFIGURED);
                }
                self.discover(core, timer)
            }
            (state, other) => {
                trace!("DHCP: ignoring {} in {:?}", other, state);
                Ok(())
            }
        }
    }

    fn bind(&mut self, core: &mut NetCore, timer: &mut Timer, ack: &DhcpMessage) {
        let Some(lease) = self.offer.as_mut() else {
            return;
        };
        if let Some(secs) = ack.lease_secs {
            lease.lease_secs = secs;
        }
        let lease = *lease;
        let renewing = self.state == DhcpState::Renew;
        core.set_interface(lease.network_config());
        self.state = DhcpState::Bound;
        self.renew_attempts = 0;
        timer.arm(core.now(), lease.renew_after());

        if renewing {
            debug!("DHCP: renewed {} for {}s", lease.address, lease.lease_secs);
        } else {
            info!(
                "DHCP: bound {} / {} gateway {} dns {} lease {}s",
                lease.address, lease.netmask, lease.gateway, lease.dns, lease.lease_secs
            );
        }
    }

    /// Timer handler
    pub fn handle_timeout(&mut self, core: &mut NetCore, timer: &mut Timer) -> Result<(), NetError> {
        match self.state {
            DhcpState::Discover => self.discover(core, timer),
            DhcpState::Select => {
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                debug!("DHCP: no usable offer, backing off to {} ticks", self.backoff);
                self.discover(core, timer)
            }
            DhcpState::Request => {
                debug!("DHCP: no answer to REQUEST");
                self.discover(core, timer)
            }
            DhcpState::Bound => {
                self.state = DhcpState::Renew;
                self.renew_attempts = 1;
                timer.arm(core.now(), secs_to_ticks(RENEW_INTERVAL_SECS));
                self.request(core)
            }
            DhcpState::Renew if self.renew_attempts >= RENEW_RETRIES => {
                warn!("DHCP: lease lost after {} renewal attempts", self.renew_attempts);
                core.set_interface(NetworkConfig::UNCONFIGURED);
                self.backoff = INITIAL_BACKOFF;
                self.discover(core, timer)
            }
            DhcpState::Renew => {
                self.renew_attempts += 1;
                timer.arm(core.now(), secs_to_ticks(RENEW_INTERVAL_SECS));
                self.request(core)
            }
        }
    }
}

fn send(core: &mut NetCore, msg: &DhcpMessage) -> Result<(), NetError> {
    let packet = core.udp_packet(CLIENT_PORT, Ipv4Addr::BROADCAST, SERVER_PORT, &msg.to_bytes());
    core.transmit(packet)
}

impl NetStack {
    /// Start the DHCP client
    ///
    /// Replaces any client already running. The client keeps the interface
    /// configured from then on; poll [`NetStack::dhcp_state`] for `Bound`.
    pub fn dhcp_init(&mut self) -> SinkId {
        let existing: Vec<SinkId> = self
            .sinks
            .iter()
            .filter(|s| matches!(s.kind, SinkKind::Dhcp(_)))
            .map(Sink::id)
            .collect();
        for id in existing {
            self.remove_sink(id);
        }

        let mut client = DhcpClient::new(self.core.mac_address());
        let mut timer = Timer::new();
        if let Err(e) = client.start(&mut self.core, &mut timer) {
            warn!("DHCP: DISCOVER not sent: {}", e);
        }
        let filter = SinkMatch::ethertype(ETHERTYPE_IPV4)
            .with_protocol(protocol::UDP)
            .with_local_port(CLIENT_PORT)
            .with_remote_port(SERVER_PORT);
        self.add_sink(Sink::with_timer(filter, SinkKind::Dhcp(client), timer))
    }

    fn dhcp_client(&self) -> Option<&DhcpClient> {
        self.sinks.iter().find_map(|s| match &s.kind {
            SinkKind::Dhcp(client) => Some(client),
            _ => None,
        })
    }

    /// State of the DHCP client, `None` if it was never started
    pub fn dhcp_state(&self) -> Option<DhcpState> {
        self.dhcp_client().map(DhcpClient::state)
    }

    /// Lease held (or being requested) by the DHCP client
    pub fn dhcp_lease(&self) -> Option<Lease> {
        self.dhcp_client().and_then(|c| c.lease().copied())
    }
}
