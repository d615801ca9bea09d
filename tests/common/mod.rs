//! Shared fixtures for the integration tests
//!
//! Frame builders and parsers for the far end of the wire, a configured
//! stack on a [`VirtualWire`], and a NIC with a scripted TFTP server
//! behind it for end-to-end transfers.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use bootnet::drivers::net::loopback::{VirtualWire, WirePort};
use bootnet::drivers::net::{DeviceError, LinkStatus, NetworkDevice, TransmitError};
use bootnet::net::arp::ArpPacket;
use bootnet::net::checksum;
use bootnet::net::config::{NetworkConfig, Rollover, StackConfig};
use bootnet::net::ethernet::{ETHERTYPE_ARP, ETHERTYPE_IPV4, EthernetHeader, MacAddr};
use bootnet::net::icmp::IcmpMessage;
use bootnet::net::ipv4::{Ipv4Header, protocol};
use bootnet::net::tftp::packet::{TftpOptions, TftpPacket, error_code};
use bootnet::net::udp::{UdpEndpoints, UdpHeader, build_datagram};
use bootnet::time::{TICKS_PER_SEC, TickCounter};
use bootnet::{NetStack, net_init};

pub const OUR_MAC: MacAddr = MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);
pub const PEER_MAC: MacAddr = MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x02);
pub const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Port the scripted server answers from after the request
pub const SERVER_TID: u16 = 3069;

pub fn static_config() -> StackConfig {
    StackConfig {
        network: Some(NetworkConfig::new(OUR_IP, NETMASK, Some(PEER_IP))),
        ..StackConfig::default()
    }
}

/// Stack with a static address; the test holds the far end of the wire
pub fn configured_stack() -> (NetStack, WirePort, Arc<TickCounter>) {
    stack_with(static_config())
}

pub fn stack_with(config: StackConfig) -> (NetStack, WirePort, Arc<TickCounter>) {
    let (ours, peer) = VirtualWire::pair(OUR_MAC, PEER_MAC);
    let clock = Arc::new(TickCounter::new());
    let stack = net_init(ours, clock.clone(), config).unwrap();
    (stack, peer, clock)
}

/// Seed the ARP cache so transmissions to the peer go out immediately
pub fn prime_arp(stack: &mut NetStack) {
    let now = stack.now();
    stack
        .core_mut()
        .arp_cache_mut()
        .learn(PEER_IP, PEER_MAC, now, 1_000_000);
}

/// Build a checksummed Ethernet/IPv4/UDP frame
pub fn udp_frame(
    src: (MacAddr, Ipv4Addr, u16),
    dest: (MacAddr, Ipv4Addr, u16),
    payload: &[u8],
) -> Vec<u8> {
    let ends = UdpEndpoints {
        src_mac: src.0,
        src_ip: src.1,
        src_port: src.2,
        dest_ip: dest.1,
        dest_port: dest.2,
    };
    let mut packet = build_datagram(&ends, 0x4242, payload);
    packet.set_dest_mac(dest.0);
    let frame = packet.data_mut();
    checksum::compute_ipv4(&mut frame[14..34]);
    checksum::compute_udp(src.1, dest.1, &mut frame[34..]);
    packet.pad();
    packet.into_bytes()
}

/// UDP frame from the peer to our address
pub fn udp_from_peer(src_port: u16, dest_port: u16, payload: &[u8]) -> Vec<u8> {
    udp_frame(
        (PEER_MAC, PEER_IP, src_port),
        (OUR_MAC, OUR_IP, dest_port),
        payload,
    )
}

/// Checksummed ICMP echo request from the peer
pub fn echo_request(dest_ip: Ipv4Addr, id: u16, seq: u16, data: &[u8]) -> Vec<u8> {
    let mut packet = IcmpMessage::echo_request(id, seq, data).build_frame(
        (PEER_MAC, PEER_IP),
        (OUR_MAC, dest_ip),
        7,
    );
    let frame = packet.data_mut();
    checksum::compute_ipv4(&mut frame[14..34]);
    checksum::compute_icmp(&mut frame[34..]);
    packet.pad();
    packet.into_bytes()
}

pub fn arp_reply_frame(sender_mac: MacAddr, sender_ip: Ipv4Addr) -> Vec<u8> {
    let mut packet = ArpPacket::new_reply(sender_mac, sender_ip, OUR_MAC, OUR_IP).into_frame(OUR_MAC);
    packet.pad();
    packet.into_bytes()
}

pub fn arp_request_frame(sender_mac: MacAddr, sender_ip: Ipv4Addr, target: Ipv4Addr) -> Vec<u8> {
    let mut packet = ArpPacket::new_request(sender_mac, sender_ip, target).into_frame(MacAddr::BROADCAST);
    packet.pad();
    packet.into_bytes()
}

/// Decoded IPv4 frame sent by the stack
#[derive(Debug, Clone)]
pub struct IpFrame {
    pub eth: EthernetHeader,
    pub ip: Ipv4Header,
    /// Transport header and payload, bounded by the IPv4 total length
    pub l4: Vec<u8>,
}

/// Parse an IPv4 frame, checking its IPv4 checksum
pub fn parse_ipv4(frame: &[u8]) -> Option<IpFrame> {
    let eth = EthernetHeader::from_bytes(frame).ok()?;
    if eth.ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = Ipv4Header::from_bytes(&frame[14..]).ok()?;
    let start = 14 + ip.header_length();
    let end = 14 + ip.total_length as usize;
    Some(IpFrame {
        eth,
        ip,
        l4: frame[start..end].to_vec(),
    })
}

/// Decoded UDP datagram sent by the stack
#[derive(Debug, Clone)]
pub struct UdpFrame {
    pub eth: EthernetHeader,
    pub src_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub udp: UdpHeader,
    pub payload: Vec<u8>,
}

/// Parse a UDP frame, checking both checksums
pub fn parse_udp(frame: &[u8]) -> Option<UdpFrame> {
    let ipf = parse_ipv4(frame)?;
    if ipf.ip.protocol != protocol::UDP {
        return None;
    }
    let udp = UdpHeader::from_bytes(&ipf.l4).ok()?;
    assert!(
        checksum::verify_udp(ipf.ip.src_ip, ipf.ip.dest_ip, &ipf.l4),
        "stack sent a bad UDP checksum"
    );
    Some(UdpFrame {
        eth: ipf.eth,
        src_ip: ipf.ip.src_ip,
        dest_ip: ipf.ip.dest_ip,
        udp,
        payload: ipf.l4[8..udp.length as usize].to_vec(),
    })
}

pub fn parse_arp(frame: &[u8]) -> Option<ArpPacket> {
    let eth = EthernetHeader::from_bytes(frame).ok()?;
    if eth.ethertype != ETHERTYPE_ARP {
        return None;
    }
    ArpPacket::from_bytes(&frame[14..]).ok()
}

/// Every UDP frame waiting on the peer side
pub fn drain_udp(peer: &WirePort) -> Vec<UdpFrame> {
    peer.drain().iter().filter_map(|f| parse_udp(f)).collect()
}

/// What the scripted server does with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Negotiate options with an OACK
    Extended,
    /// Ignore options, as a plain RFC 1350 server would
    Plain,
}

enum Session {
    Idle,
    Get {
        client_port: u16,
        data: Vec<u8>,
        blksize: usize,
        window: u64,
        rollover: Rollover,
        /// Number of the short final block
        last_block: u64,
    },
    Put {
        client_port: u16,
        name: String,
        data: Vec<u8>,
        blksize: usize,
        window: u64,
        expected: u64,
        since_ack: u64,
    },
}

/// Files served and received by [`TftpServerNic`]
#[derive(Clone, Default)]
pub struct ServerFiles(pub Arc<Mutex<BTreeMap<String, Vec<u8>>>>);

impl ServerFiles {
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        self.0.lock().unwrap().insert(name.to_string(), data);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(name).cloned()
    }
}

/// NIC with a TFTP server on the other end of the cable
///
/// Every `pump` advances the clock by one tick and answers whatever the
/// stack transmitted since the last one.
pub struct TftpServerNic {
    clock: Arc<TickCounter>,
    files: ServerFiles,
    mode: ServerMode,
    to_stack: VecDeque<Vec<u8>>,
    from_stack: VecDeque<Vec<u8>>,
    session: Session,
    /// DATA frames to drop once, by absolute block number
    pub lose_blocks: Vec<u64>,
    /// Every frame the stack sent
    pub log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TftpServerNic {
    pub fn new(clock: Arc<TickCounter>, files: ServerFiles, mode: ServerMode) -> Self {
        Self {
            clock,
            files,
            mode,
            to_stack: VecDeque::new(),
            from_stack: VecDeque::new(),
            session: Session::Idle,
            lose_blocks: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn reply(&mut self, src_port: u16, dest_port: u16, packet: &TftpPacket<'_>) {
        self.to_stack.push_back(udp_from_peer(src_port, dest_port, &packet.to_bytes()));
    }

    fn serve(&mut self, frame: &[u8]) {
        if let Some(arp) = parse_arp(frame) {
            if arp.is_request() && arp.target_ip == PEER_IP {
                self.to_stack.push_back(arp_reply_frame(PEER_MAC, PEER_IP));
            }
            return;
        }
        let Some(udp) = parse_udp(frame) else {
            return;
        };
        let client_port = udp.udp.src_port;
        let Ok(msg) = TftpPacket::parse(&udp.payload) else {
            return;
        };

        match msg {
            TftpPacket::ReadRequest { filename, options, .. } => {
                let Some(data) = self.files.get(filename) else {
                    self.reply(SERVER_TID, client_port, &TftpPacket::Error {
                        code: error_code::FILE_NOT_FOUND,
                        message: "File not found",
                    });
                    return;
                };
                if self.mode == ServerMode::Plain {
                    let blksize = 512;
                    let first = &data[..data.len().min(blksize)];
                    self.reply(SERVER_TID, client_port, &TftpPacket::Data { block: 1, data: first });
                    return;
                }
                let blksize = options.blksize.unwrap_or(512);
                let window = options.windowsize.unwrap_or(1);
                let rollover = options.rollover.unwrap_or(Rollover::Zero);
                let oack = TftpOptions {
                    blksize: Some(blksize),
                    tsize: Some(data.len() as u64),
                    windowsize: Some(window),
                    rollover: Some(rollover),
                };
                self.session = Session::Get {
                    client_port,
                    last_block: data.len() as u64 / blksize as u64 + 1,
                    data,
                    blksize: blksize as usize,
                    window: window as u64,
                    rollover,
                };
                self.reply(SERVER_TID, client_port, &TftpPacket::OptionAck(oack));
            }
            TftpPacket::WriteRequest { filename, options, .. } => {
                if self.mode == ServerMode::Plain {
                    self.reply(SERVER_TID, client_port, &TftpPacket::Ack { block: 0 });
                    return;
                }
                let blksize = options.blksize.unwrap_or(512);
                let window = options.windowsize.unwrap_or(1);
                self.session = Session::Put {
                    client_port,
                    name: filename.to_string(),
                    data: Vec::new(),
                    blksize: blksize as usize,
                    window: window as u64,
                    expected: 1,
                    since_ack: 0,
                };
                let oack = TftpOptions {
                    blksize: Some(blksize),
                    windowsize: Some(window),
                    tsize: options.tsize,
                    rollover: None,
                };
                self.reply(SERVER_TID, client_port, &TftpPacket::OptionAck(oack));
            }
            TftpPacket::Ack { block } => self.on_ack(block),
            TftpPacket::Data { block, data } => self.on_data(block, data),
            _ => {}
        }
    }

    fn on_ack(&mut self, block: u16) {
        let Session::Get {
            client_port,
            ref data,
            blksize,
            window,
            rollover,
            last_block,
        } = self.session
        else {
            return;
        };
        // Small transfers only: wire and absolute numbers coincide
        let acked = block as u64;
        if acked >= last_block {
            self.session = Session::Idle;
            return;
        }
        let mut frames = Vec::new();
        for abs in acked + 1..=(acked + window).min(last_block) {
            if let Some(pos) = self.lose_blocks.iter().position(|&b| b == abs) {
                self.lose_blocks.remove(pos);
                continue;
            }
            let start = ((abs - 1) as usize * blksize).min(data.len());
            let end = (start + blksize).min(data.len());
            let wire = bootnet::net::tftp::wire_block(abs, rollover);
            let packet = TftpPacket::Data {
                block: wire,
                data: &data[start..end],
            };
            frames.push(udp_from_peer(SERVER_TID, client_port, &packet.to_bytes()));
        }
        self.to_stack.extend(frames);
    }

    fn on_data(&mut self, block: u16, payload: &[u8]) {
        let Session::Put {
            client_port,
            ref name,
            ref mut data,
            blksize,
            window,
            ref mut expected,
            ref mut since_ack,
        } = self.session
        else {
            return;
        };
        if block as u64 != *expected {
            return;
        }
        data.extend_from_slice(payload);
        *expected += 1;
        *since_ack += 1;
        let last = payload.len() < blksize;
        if last || *since_ack >= window {
            *since_ack = 0;
            let ack = (*expected - 1) as u16;
            if last {
                self.files.insert(name, data.clone());
            }
            let frame = udp_from_peer(
                SERVER_TID,
                client_port,
                &TftpPacket::Ack { block: ack }.to_bytes(),
            );
            self.to_stack.push_back(frame);
        }
    }
}

impl NetworkDevice for TftpServerNic {
    fn mac_address(&self) -> MacAddr {
        OUR_MAC
    }

    fn init(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn halt(&mut self) {}

    fn pump(&mut self) {
        self.clock.tick();
        while let Some(frame) = self.from_stack.pop_front() {
            self.serve(&frame);
        }
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), TransmitError> {
        self.log.lock().unwrap().push(frame.to_vec());
        self.from_stack.push_back(frame.to_vec());
        Ok(())
    }

    fn can_transmit(&self) -> bool {
        true
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.to_stack.pop_front()
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus::Up
    }

    fn device_name(&self) -> &str {
        "tftp-server"
    }
}

/// Stack wired to a scripted TFTP server
pub fn tftp_stack(
    files: ServerFiles,
    mode: ServerMode,
    config: StackConfig,
) -> (NetStack, Arc<TickCounter>, Arc<Mutex<Vec<Vec<u8>>>>) {
    tftp_stack_losing(files, mode, config, Vec::new())
}

pub fn tftp_stack_losing(
    files: ServerFiles,
    mode: ServerMode,
    config: StackConfig,
    lose_blocks: Vec<u64>,
) -> (NetStack, Arc<TickCounter>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let clock = Arc::new(TickCounter::new());
    let mut nic = TftpServerNic::new(clock.clone(), files, mode);
    nic.lose_blocks = lose_blocks;
    let log = nic.log.clone();
    let stack = net_init(nic, clock.clone(), config).unwrap();
    (stack, clock, log)
}

/// Deterministic test content
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// Cancellation hook that gives up after `secs` of simulated time
pub fn deadline(clock: &Arc<TickCounter>, secs: u32) -> impl FnMut() -> bool + 'static {
    let clock = clock.clone();
    let limit = clock.get() + secs * TICKS_PER_SEC;
    move || clock.get() >= limit
}
