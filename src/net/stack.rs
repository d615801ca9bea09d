//! Network Stack Integration
//!
//! [`NetStack`] is the one context object for the interface: the device,
//! the ARP cache, the sink table and the counters all hang off it, and
//! nothing is global. All protocol work happens inside [`NetStack::pump`],
//! which makes one non-blocking pass over, in order:
//!
//! 1. packets waiting on ARP resolution
//! 2. the device (its own pump, received frames, the transmit backlog)
//! 3. every sink's receive queue, drained completely
//! 4. every sink whose one-shot timer has expired
//!
//! Received frames are only ever queued on a sink, never handed to a
//! handler synchronously, so handlers can transmit without re-entering
//! frame delivery.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::mem;
use core::net::Ipv4Addr;

use crossbeam_queue::ArrayQueue;
use log::{debug, info, trace, warn};

use super::arp::{self, ArpCache, ArpPacket, Resolution};
use super::buffer::{HeaderOffsets, Packet};
use super::checksum;
use super::config::{NetworkConfig, StackConfig};
use super::ethernet::{ETHERTYPE_ARP, ETHERTYPE_IPV4, EthernetHeader, HEADER_SIZE, MacAddr};
use super::icmp::{self, UnreachableLimiter};
use super::ipv4::{self, Ipv4Error, Ipv4Header, protocol};
use super::sink::{FrameInfo, Sink, SinkId, SinkKind, SinkMatch, SinkTable};
use super::udp::{self, EPHEMERAL_PORT_END, EPHEMERAL_PORT_START, UdpEndpoints, UdpHeader};
use crate::drivers::net::{DeviceError, NetworkDevice, TransmitError};
use crate::time::{Clock, Tick, Timer};

/// UDP port the DHCP client sends from; the only traffic allowed unconfigured
const DHCP_CLIENT_PORT: u16 = 68;

/// Frames pulled from the device per pump
const RX_BUDGET: usize = 64;

/// Errors surfaced by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Interface has no address, or the packet is sourced from 0.0.0.0
    NotConfigured,
    /// Destination is off-subnet and there is no gateway
    NoRoute,
    /// Next hop did not answer ARP
    ArpFailed(Ipv4Addr),
    /// Software transmit queue is full
    BacklogFull,
    /// Outbound packet has inconsistent headers
    Malformed,
    /// Device failed to come up
    Device(DeviceError),
    /// Device refused a frame
    Transmit(TransmitError),
    /// A blocking wait was cancelled by the user
    Cancelled,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::NotConfigured => write!(f, "Interface not configured"),
            NetError::NoRoute => write!(f, "No route to host"),
            NetError::ArpFailed(ip) => write!(f, "No ARP reply from {}", ip),
            NetError::BacklogFull => write!(f, "Transmit queue full"),
            NetError::Malformed => write!(f, "Malformed outbound packet"),
            NetError::Device(e) => write!(f, "Device error: {}", e),
            NetError::Transmit(e) => write!(f, "Transmit error: {}", e),
            NetError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Interface counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    pub rx_frames: u64,
    /// Addressed to another station
    pub rx_dropped_mac: u64,
    pub rx_bad_ipv4_checksum: u64,
    /// UDP or ICMP checksum failures
    pub rx_bad_l4_checksum: u64,
    pub rx_malformed: u64,
    pub rx_fragments: u64,
    /// No sink matched
    pub rx_unclaimed: u64,
    pub tx_frames: u64,
    /// Frames that went through the software backlog
    pub tx_backlogged: u64,
    pub tx_backlog_drops: u64,
    /// Refused because the interface is unconfigured
    pub tx_refused: u64,
    /// Packets dropped after ARP gave up on their next hop
    pub arp_failures: u64,
}

/// Addressing read back from an outbound IPv4 frame
struct OutboundIp {
    src: Ipv4Addr,
    dest: Ipv4Addr,
    protocol: u8,
    header_len: usize,
    total_len: usize,
}

impl OutboundIp {
    fn read(packet: &Packet) -> Result<Self, NetError> {
        let start = packet.offsets().network;
        let frame = packet.data();
        if frame.len() < start + ipv4::HEADER_SIZE {
            return Err(NetError::Malformed);
        }
        let ip = &frame[start..];
        let header_len = (ip[0] & 0x0F) as usize * 4;
        let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
        if header_len < ipv4::HEADER_SIZE || total_len < header_len || start + total_len > frame.len()
        {
            return Err(NetError::Malformed);
        }
        Ok(Self {
            src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
            dest: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
            protocol: ip[9],
            header_len,
            total_len,
        })
    }

    fn src_port(&self, packet: &Packet) -> Option<u16> {
        let l4 = &packet.data()[packet.offsets().network + self.header_len..];
        (self.protocol == protocol::UDP && l4.len() >= 2).then(|| u16::from_be_bytes([l4[0], l4[1]]))
    }

    /// Fill in the IPv4 and transport checksums
    fn finalize(&self, packet: &mut Packet) {
        let start = packet.offsets().network;
        let frame = packet.data_mut();
        checksum::compute_ipv4(&mut frame[start..start + self.header_len]);
        let l4 = &mut frame[start + self.header_len..start + self.total_len];
        match self.protocol {
            protocol::ICMP if l4.len() >= icmp::HEADER_SIZE => checksum::compute_icmp(l4),
            protocol::UDP if l4.len() >= udp::UDP_HEADER_SIZE => {
                checksum::compute_udp(self.src, self.dest, l4)
            }
            _ => {}
        }
    }
}

/// Everything a sink handler may touch
///
/// Split from the sink table so a handler can hold its own sink mutably
/// while transmitting through the core.
pub struct NetCore {
    device: Box<dyn NetworkDevice>,
    clock: Box<dyn Clock>,
    config: StackConfig,
    iface: NetworkConfig,
    mac: MacAddr,
    arp: ArpCache,
    /// Packets waiting for their next hop to resolve
    arp_pending: Vec<Packet>,
    /// Frames waiting for a free transmit descriptor
    tx_backlog: ArrayQueue<Packet>,
    stats: NetStats,
    ip_id: u16,
}

impl NetCore {
    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    pub fn mac_address(&self) -> MacAddr {
        self.mac
    }

    pub fn interface(&self) -> NetworkConfig {
        self.iface
    }

    pub fn set_interface(&mut self, iface: NetworkConfig) {
        self.iface = iface;
    }

    /// Interface address, `None` while unconfigured
    pub fn our_ip(&self) -> Option<Ipv4Addr> {
        self.iface.is_valid().then_some(self.iface.ip_addr)
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut NetStats {
        &mut self.stats
    }

    pub fn arp_cache(&self) -> &ArpCache {
        &self.arp
    }

    pub fn arp_cache_mut(&mut self) -> &mut ArpCache {
        &mut self.arp
    }

    /// Packets parked on ARP resolution
    pub fn arp_pending(&self) -> usize {
        self.arp_pending.len()
    }

    pub fn tx_backlog_len(&self) -> usize {
        self.tx_backlog.len()
    }

    pub fn next_ip_id(&mut self) -> u16 {
        self.ip_id = self.ip_id.wrapping_add(1);
        self.ip_id
    }

    /// Build a UDP datagram from the interface address
    ///
    /// # Arguments
    /// * `src_port` - Local port
    /// * `dest_ip` - Destination address
    /// * `dest_port` - Destination port
    /// * `payload` - Datagram body
    pub fn udp_packet(
        &mut self,
        src_port: u16,
        dest_ip: Ipv4Addr,
        dest_port: u16,
        payload: &[u8],
    ) -> Packet {
        let ends = UdpEndpoints {
            src_mac: self.mac,
            src_ip: self.iface.ip_addr,
            src_port,
            dest_ip,
            dest_port,
        };
        let ip_id = self.next_ip_id();
        udp::build_datagram(&ends, ip_id, payload)
    }

    /// Build a reply datagram from a sink's match fields
    ///
    /// The sink's local port is the source and its remote address and port
    /// the destination. Returns `None` unless all three are pinned.
    pub fn udp_packet_for(&mut self, filter: &SinkMatch, payload: &[u8]) -> Option<Packet> {
        let ends = UdpEndpoints {
            src_mac: self.mac,
            src_ip: filter.local_ip.unwrap_or(self.iface.ip_addr),
            src_port: filter.local_port?,
            dest_ip: filter.remote_ip?,
            dest_port: filter.remote_port?,
        };
        let ip_id = self.next_ip_id();
        Some(udp::build_datagram(&ends, ip_id, payload))
    }

    /// Send an IPv4 (or pre-addressed) frame
    ///
    /// Computes checksums, then either sends straight away (destination MAC
    /// known, broadcast, or resolved from the cache) or parks the packet
    /// until ARP resolves its next hop. Parked packets count as accepted.
    pub fn transmit(&mut self, mut packet: Packet) -> Result<(), NetError> {
        if packet.ethertype() != ETHERTYPE_IPV4 {
            return self.send_frame(packet);
        }

        let ip = OutboundIp::read(&packet)?;
        let is_dhcp = ip.src_port(&packet) == Some(DHCP_CLIENT_PORT);
        if (!self.iface.is_valid() || ip.src.is_unspecified()) && !is_dhcp {
            self.stats.tx_refused += 1;
            return Err(NetError::NotConfigured);
        }
        ip.finalize(&mut packet);

        if packet.dest_mac_valid() {
            return self.send_frame(packet);
        }

        let routes = self.iface.routing_table();
        if ip.dest.is_broadcast() || routes.is_some_and(|r| r.is_broadcast(ip.dest)) {
            packet.set_dest_mac(MacAddr::BROADCAST);
            packet.set_dest_mac_valid(true);
            return self.send_frame(packet);
        }

        let hop = routes
            .ok_or(NetError::NotConfigured)?
            .next_hop(ip.dest)
            .ok_or(NetError::NoRoute)?;
        packet.set_nexthop(Some(hop));
        self.resolve_next_hop(packet, hop)
    }

    fn resolve_next_hop(&mut self, mut packet: Packet, hop: Ipv4Addr) -> Result<(), NetError> {
        let now = self.now();
        match self.arp.resolve(hop, now, self.config.arp_retry_interval) {
            Resolution::Hit(mac) => {
                packet.set_dest_mac(mac);
                packet.set_dest_mac_valid(true);
                self.send_frame(packet)
            }
            Resolution::SendRequest => {
                self.arp_pending.push(packet);
                self.send_arp_request(hop)
            }
            Resolution::Wait => {
                self.arp_pending.push(packet);
                Ok(())
            }
            Resolution::Fail => {
                warn!("ARP: {} did not answer, dropping packet", hop);
                self.stats.arp_failures += 1;
                Err(NetError::ArpFailed(hop))
            }
        }
    }

    fn send_arp_request(&mut self, target: Ipv4Addr) -> Result<(), NetError> {
        debug!("ARP: who-has {} tell {}", target, self.iface.ip_addr);
        let request = ArpPacket::new_request(self.mac, self.iface.ip_addr, target);
        self.send_frame(request.into_frame(MacAddr::BROADCAST))
    }

    /// Retry resolution for every parked packet
    ///
    /// Once an address fails, the rest of its packets are dropped in the
    /// same pass rather than starting a fresh resolution.
    fn service_arp_pending(&mut self) {
        if self.arp_pending.is_empty() {
            return;
        }
        let now = self.now();
        let retry = self.config.arp_retry_interval;
        let mut failed: Vec<Ipv4Addr> = Vec::new();

        for mut packet in mem::take(&mut self.arp_pending) {
            let Some(hop) = packet.nexthop() else {
                continue;
            };
            if failed.contains(&hop) {
                self.stats.arp_failures += 1;
                continue;
            }
            let result = match self.arp.resolve(hop, now, retry) {
                Resolution::Hit(mac) => {
                    packet.set_dest_mac(mac);
                    packet.set_dest_mac_valid(true);
                    self.send_frame(packet)
                }
                Resolution::SendRequest => {
                    self.arp_pending.push(packet);
                    self.send_arp_request(hop)
                }
                Resolution::Wait => {
                    self.arp_pending.push(packet);
                    Ok(())
                }
                Resolution::Fail => {
                    warn!("ARP: {} did not answer, dropping packet", hop);
                    self.stats.arp_failures += 1;
                    failed.push(hop);
                    Ok(())
                }
            };
            if let Err(e) = result {
                debug!("ARP: send for {} failed: {}", hop, e);
            }
        }
    }

    /// Hand a fully addressed frame to the device
    ///
    /// Falls back to the software backlog when the device has no free
    /// descriptor, or when earlier frames are still backlogged.
    pub fn send_frame(&mut self, mut packet: Packet) -> Result<(), NetError> {
        packet.pad();
        if self.tx_backlog.is_empty() && self.device.can_transmit() {
            match self.device.transmit(packet.data()) {
                Ok(()) => {
                    self.stats.tx_frames += 1;
                    return Ok(());
                }
                Err(TransmitError::BufferFull | TransmitError::NotReady) => {}
                Err(e) => return Err(NetError::Transmit(e)),
            }
        }
        self.backlog(packet)
    }

    fn backlog(&mut self, packet: Packet) -> Result<(), NetError> {
        match self.tx_backlog.push(packet) {
            Ok(()) => {
                self.stats.tx_backlogged += 1;
                Ok(())
            }
            Err(_) => {
                self.stats.tx_backlog_drops += 1;
                Err(NetError::BacklogFull)
            }
        }
    }

    fn flush_backlog(&mut self) {
        while self.device.can_transmit() {
            let Some(packet) = self.tx_backlog.pop() else {
                break;
            };
            match self.device.transmit(packet.data()) {
                Ok(()) => self.stats.tx_frames += 1,
                Err(e) => {
                    warn!("TX: {} dropped backlogged frame: {}", self.device.device_name(), e);
                    self.stats.tx_backlog_drops += 1;
                }
            }
        }
    }

    /// Validate an inbound frame and extract the fields sinks match on
    ///
    /// Anything failing validation is counted and dropped here.
    fn classify(&mut self, frame: Vec<u8>) -> Option<(Packet, FrameInfo)> {
        self.stats.rx_frames += 1;

        let eth = match EthernetHeader::from_bytes(&frame) {
            Ok(eth) => eth,
            Err(e) => {
                trace!("RX: {}", e);
                self.stats.rx_malformed += 1;
                return None;
            }
        };
        if eth.dest_mac != self.mac && !eth.dest_mac.is_multicast() {
            self.stats.rx_dropped_mac += 1;
            return None;
        }

        let mut packet = Packet::from_frame(frame);
        let mut info = FrameInfo {
            ethertype: eth.ethertype,
            ..FrameInfo::default()
        };

        match eth.ethertype {
            ETHERTYPE_ARP => {
                packet.set_offsets(HeaderOffsets {
                    network: HEADER_SIZE,
                    transport: 0,
                    payload: HEADER_SIZE,
                    payload_len: packet.len() - HEADER_SIZE,
                });
            }
            ETHERTYPE_IPV4 => {
                let ip = match Ipv4Header::from_bytes(&packet.data()[HEADER_SIZE..]) {
                    Ok(ip) => ip,
                    Err(Ipv4Error::ChecksumMismatch) => {
                        self.stats.rx_bad_ipv4_checksum += 1;
                        return None;
                    }
                    Err(e) => {
                        trace!("RX: {}", e);
                        self.stats.rx_malformed += 1;
                        return None;
                    }
                };
                if ip.is_fragment() {
                    self.stats.rx_fragments += 1;
                    return None;
                }
                // Strip Ethernet padding
                packet.truncate(HEADER_SIZE + ip.total_length as usize);

                info.ip_protocol = Some(ip.protocol);
                info.src_ip = Some(ip.src_ip);
                info.dest_ip = Some(ip.dest_ip);
                let transport = HEADER_SIZE + ip.header_length();
                self.classify_transport(&mut packet, &ip, transport, &mut info)?;
            }
            _ => {}
        }
        Some((packet, info))
    }

    fn classify_transport(
        &mut self,
        packet: &mut Packet,
        ip: &Ipv4Header,
        transport: usize,
        info: &mut FrameInfo,
    ) -> Option<()> {
        let l4 = &packet.data()[transport..];
        let mut offsets = HeaderOffsets {
            network: HEADER_SIZE,
            transport,
            payload: transport,
            payload_len: l4.len(),
        };

        match ip.protocol {
            protocol::UDP => {
                let udp = match UdpHeader::from_bytes(l4) {
                    Ok(udp) => udp,
                    Err(e) => {
                        trace!("RX: {}", e);
                        self.stats.rx_malformed += 1;
                        return None;
                    }
                };
                let datagram = &l4[..udp.length as usize];
                if !checksum::verify_udp(ip.src_ip, ip.dest_ip, datagram) {
                    self.stats.rx_bad_l4_checksum += 1;
                    return None;
                }
                info.src_port = Some(udp.src_port);
                info.dest_port = Some(udp.dest_port);
                offsets.payload = transport + udp::UDP_HEADER_SIZE;
                offsets.payload_len = udp.payload_length();
            }
            protocol::ICMP => {
                if l4.len() < icmp::HEADER_SIZE {
                    self.stats.rx_malformed += 1;
                    return None;
                }
                if !checksum::verify_icmp(l4) {
                    self.stats.rx_bad_l4_checksum += 1;
                    return None;
                }
                offsets.payload = transport + icmp::HEADER_SIZE;
                offsets.payload_len = l4.len() - icmp::HEADER_SIZE;
            }
            _ => {}
        }
        packet.set_offsets(offsets);
        Some(())
    }
}

/// The network stack context
pub struct NetStack {
    pub(crate) core: NetCore,
    pub(crate) sinks: SinkTable,
    next_port: u16,
}

/// Bring up the interface and register the built-in sinks
///
/// # Arguments
/// * `device` - The NIC driver
/// * `clock` - Source of the tick count
/// * `config` - Stack tunables; `config.network` sets a static address
///
/// # Returns
/// A stack with the ARP, ICMP echo and ICMP unreachable sinks registered.
/// DHCP is not started; call [`NetStack::dhcp_init`] for that.
pub fn net_init<D, C>(mut device: D, clock: C, config: StackConfig) -> Result<NetStack, NetError>
where
    D: NetworkDevice + 'static,
    C: Clock + 'static,
{
    device.init().map_err(NetError::Device)?;
    let mac = device.mac_address();
    info!("net: {} up, MAC {}", device.device_name(), mac);

    let core = NetCore {
        device: Box::new(device),
        clock: Box::new(clock),
        config,
        iface: config.network.unwrap_or_default(),
        mac,
        arp: ArpCache::new(),
        arp_pending: Vec::new(),
        tx_backlog: ArrayQueue::new(config.tx_backlog_capacity.max(1)),
        stats: NetStats::default(),
        ip_id: 0,
    };
    let mut stack = NetStack {
        core,
        sinks: SinkTable::new(),
        next_port: EPHEMERAL_PORT_START,
    };

    let mut sweep = Timer::new();
    sweep.arm(stack.core.now(), config.arp_sweep_interval);
    stack.add_sink(Sink::with_timer(
        SinkMatch::ethertype(ETHERTYPE_ARP),
        SinkKind::Arp,
        sweep,
    ));
    stack.add_sink(Sink::new(
        SinkMatch::ethertype(ETHERTYPE_IPV4)
            .with_protocol(protocol::ICMP)
            .to_our_ip(),
        SinkKind::IcmpEcho,
    ));
    stack.add_sink(Sink::new(
        SinkMatch::ethertype(ETHERTYPE_IPV4).to_our_ip(),
        SinkKind::IcmpUnreachable(UnreachableLimiter::new()),
    ));

    if let Some(network) = config.network {
        info!("net: static address {} / {}", network.ip_addr, network.netmask);
    }
    Ok(stack)
}

impl NetStack {
    /// One non-blocking pass over ARP, the device, sink queues and sink timers
    pub fn pump(&mut self) {
        self.core.service_arp_pending();

        self.core.device.pump();
        for _ in 0..RX_BUDGET {
            let Some(frame) = self.core.device.receive() else {
                break;
            };
            self.on_frame_received(frame);
        }
        self.core.flush_backlog();

        let NetStack { core, sinks, .. } = self;
        for sink in sinks.iter_mut() {
            while let Some(packet) = sink.queue.pop_front() {
                if let Err(e) = deliver(core, sink, packet) {
                    debug!("{} ({}): {}", sink.id(), sink.kind.name(), e);
                }
            }
        }

        let now = core.now();
        for sink in sinks.iter_mut() {
            if sink.timer.is_due(now) {
                sink.timer.disarm();
                if let Err(e) = expire(core, sink) {
                    debug!("{} ({}) timer: {}", sink.id(), sink.kind.name(), e);
                }
            }
        }
    }

    /// Queue an inbound frame on the most specific matching sink
    pub fn on_frame_received(&mut self, frame: Vec<u8>) {
        let Some((packet, info)) = self.core.classify(frame) else {
            return;
        };
        let our_ip = self.core.our_ip();
        match self
            .sinks
            .find_match(&info, our_ip)
            .and_then(|index| self.sinks.by_index_mut(index))
        {
            Some(sink) => {
                trace!("RX: {} bytes to {}", packet.len(), sink.id());
                sink.queue.push_back(packet);
            }
            None => {
                trace!("RX: unclaimed ethertype 0x{:04X}", info.ethertype);
                self.core.stats.rx_unclaimed += 1;
            }
        }
    }

    /// Send a packet; see [`NetCore::transmit`]
    pub fn transmit(&mut self, packet: Packet) -> Result<(), NetError> {
        self.core.transmit(packet)
    }

    pub fn add_sink(&mut self, sink: Sink) -> SinkId {
        let name = sink.kind.name();
        let id = self.sinks.insert(sink);
        debug!("net: registered {} ({})", id, name);
        id
    }

    /// Unregister a sink
    ///
    /// Delivery stops immediately; packets still queued come back with the
    /// sink for the owner to dispose of.
    pub fn remove_sink(&mut self, id: SinkId) -> Option<Sink> {
        let sink = self.sinks.remove(id)?;
        debug!("net: removed {} ({})", id, sink.kind.name());
        Some(sink)
    }

    pub fn sinks(&self) -> &SinkTable {
        &self.sinks
    }

    /// Pick a free ephemeral UDP port
    ///
    /// Ports named as `local_port` by a live sink are skipped.
    pub fn allocate_port(&mut self) -> Option<u16> {
        let span = (EPHEMERAL_PORT_END - EPHEMERAL_PORT_START) as usize + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == EPHEMERAL_PORT_END {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            if !self.sinks.iter().any(|s| s.filter.local_port == Some(port)) {
                return Some(port);
            }
        }
        None
    }

    /// Pump until `done` holds
    ///
    /// `cancel` is polled once per pass; returning true abandons the wait.
    pub fn pump_until<F, C>(&mut self, mut done: F, mut cancel: C) -> Result<(), NetError>
    where
        F: FnMut(&NetStack) -> bool,
        C: FnMut() -> bool,
    {
        loop {
            if done(self) {
                return Ok(());
            }
            if cancel() {
                return Err(NetError::Cancelled);
            }
            self.pump();
        }
    }

    /// Halt the device and drop every sink
    pub fn shutdown(mut self) {
        info!("net: {} down", self.core.device.device_name());
        self.core.device.halt();
    }

    pub fn core(&self) -> &NetCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut NetCore {
        &mut self.core
    }

    pub fn now(&self) -> Tick {
        self.core.now()
    }

    pub fn mac_address(&self) -> MacAddr {
        self.core.mac
    }

    pub fn interface(&self) -> NetworkConfig {
        self.core.iface
    }

    pub fn set_interface(&mut self, iface: NetworkConfig) {
        info!("net: configured {} / {} gateway {:?}", iface.ip_addr, iface.netmask, iface.gateway);
        self.core.iface = iface;
    }

    pub fn stats(&self) -> &NetStats {
        &self.core.stats
    }

    pub fn arp_cache(&self) -> &ArpCache {
        &self.core.arp
    }
}

/// Route a queued packet to its sink's receive handler
fn deliver(core: &mut NetCore, sink: &mut Sink, packet: Packet) -> Result<(), NetError> {
    match &mut sink.kind {
        SinkKind::Arp => arp::handle_packet(core, packet),
        SinkKind::IcmpEcho => icmp::handle_echo(core, packet),
        SinkKind::IcmpUnreachable(limiter) => icmp::handle_unreachable(core, limiter, packet),
        SinkKind::Dhcp(client) => client.handle_packet(core, &mut sink.timer, packet),
        SinkKind::Tftp(transfer) => transfer.handle_packet(core, &mut sink.timer, packet),
    }
}

/// Run a sink's timer handler; the timer is already disarmed
fn expire(core: &mut NetCore, sink: &mut Sink) -> Result<(), NetError> {
    match &mut sink.kind {
        SinkKind::Arp => {
            arp::handle_sweep(core, &mut sink.timer);
            Ok(())
        }
        SinkKind::IcmpEcho | SinkKind::IcmpUnreachable(_) => Ok(()),
        SinkKind::Dhcp(client) => client.handle_timeout(core, &mut sink.timer),
        SinkKind::Tftp(transfer) => transfer.handle_timeout(core, &mut sink.timer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::loopback::{VirtualWire, WirePort};
    use crate::time::TickCounter;
    use alloc::sync::Arc;

    const OUR_MAC: MacAddr = MacAddr::new(0x02, 0, 0, 0, 0, 0x01);
    const PEER_MAC: MacAddr = MacAddr::new(0x02, 0, 0, 0, 0, 0x02);

    fn configured() -> (NetStack, WirePort, Arc<TickCounter>) {
        let (ours, peer) = VirtualWire::pair(OUR_MAC, PEER_MAC);
        let clock = Arc::new(TickCounter::new());
        let config = StackConfig {
            network: Some(NetworkConfig::new(
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(255, 255, 255, 0),
                Some(Ipv4Addr::new(10, 0, 0, 1)),
            )),
            ..StackConfig::default()
        };
        let stack = net_init(ours, clock.clone(), config).unwrap();
        (stack, peer, clock)
    }

    #[test]
    fn test_builtin_sinks_registered() {
        let (stack, _peer, _clock) = configured();
        let kinds: Vec<&str> = stack.sinks().iter().map(|s| s.kind.name()).collect();
        assert_eq!(kinds, ["icmp-echo", "icmp-unreachable", "arp"]);
    }

    #[test]
    fn test_unconfigured_refuses_non_dhcp() {
        let (ours, _peer) = VirtualWire::pair(OUR_MAC, PEER_MAC);
        let mut stack =
            net_init(ours, Arc::new(TickCounter::new()), StackConfig::default()).unwrap();
        let packet = stack
            .core_mut()
            .udp_packet(50000, Ipv4Addr::new(10, 0, 0, 1), 69, b"x");
        assert_eq!(stack.transmit(packet), Err(NetError::NotConfigured));
        assert_eq!(stack.stats().tx_refused, 1);

        let dhcp = stack
            .core_mut()
            .udp_packet(68, Ipv4Addr::BROADCAST, 67, b"x");
        assert_eq!(stack.transmit(dhcp), Ok(()));
    }

    #[test]
    fn test_backlog_when_device_busy() {
        let (mut stack, peer, _clock) = configured();
        stack.core_mut().arp_cache_mut().learn(
            Ipv4Addr::new(10, 0, 0, 1),
            PEER_MAC,
            0,
            1000,
        );
        peer.set_peer_tx_ready(false);
        let packet = stack
            .core_mut()
            .udp_packet(50000, Ipv4Addr::new(10, 0, 0, 1), 69, b"x");
        stack.transmit(packet).unwrap();
        assert_eq!(stack.core().tx_backlog_len(), 1);
        assert_eq!(peer.pending(), 0);

        peer.set_peer_tx_ready(true);
        stack.pump();
        assert_eq!(stack.core().tx_backlog_len(), 0);
        assert_eq!(peer.pending(), 1);
        assert_eq!(stack.stats().tx_backlogged, 1);
    }

    #[test]
    fn test_allocate_port_skips_claimed() {
        let (mut stack, _peer, _clock) = configured();
        stack.add_sink(Sink::new(
            SinkMatch::ethertype(ETHERTYPE_IPV4).with_local_port(EPHEMERAL_PORT_START),
            SinkKind::IcmpEcho,
        ));
        assert_eq!(stack.allocate_port(), Some(EPHEMERAL_PORT_START + 1));
    }

    #[test]
    fn test_off_subnet_resolves_gateway() {
        let (mut stack, peer, _clock) = configured();
        let packet = stack
            .core_mut()
            .udp_packet(50000, Ipv4Addr::new(192, 168, 9, 9), 69, b"x");
        stack.transmit(packet).unwrap();
        assert_eq!(stack.core().arp_pending(), 1);

        let request = peer.recv().unwrap();
        let arp = ArpPacket::from_bytes(&request[HEADER_SIZE..]).unwrap();
        assert_eq!(arp.target_ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_udp_packet_for_sink() {
        let (mut stack, peer, _clock) = configured();
        let server = Ipv4Addr::new(10, 0, 0, 1);
        stack.core_mut().arp_cache_mut().learn(server, PEER_MAC, 0, 1000);

        let loose = SinkMatch::ethertype(ETHERTYPE_IPV4)
            .with_protocol(protocol::UDP)
            .with_local_port(50001);
        assert!(stack.core_mut().udp_packet_for(&loose, b"x").is_none());

        let filter = loose.with_remote_ip(server).with_remote_port(69);
        let packet = stack.core_mut().udp_packet_for(&filter, b"hello").unwrap();
        stack.transmit(packet).unwrap();

        let frame = peer.recv().unwrap();
        let ip = Ipv4Header::from_bytes(&frame[HEADER_SIZE..]).unwrap();
        assert_eq!(ip.src_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ip.dest_ip, server);
        let udp = UdpHeader::from_bytes(&frame[HEADER_SIZE + 20..]).unwrap();
        assert_eq!((udp.src_port, udp.dest_port), (50001, 69));
    }

    #[test]
    fn test_shutdown_halts_device() {
        let (ours, peer) = VirtualWire::with_depth(OUR_MAC, PEER_MAC, 1);
        let stack = net_init(ours, Arc::new(TickCounter::new()), StackConfig::default()).unwrap();
        peer.send(&[0; 60]).unwrap();
        assert!(!peer.can_transmit());

        // Halting discards the unread frame, freeing the lane
        stack.shutdown();
        assert!(peer.can_transmit());
    }
}
