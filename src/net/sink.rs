//! Sink table
//!
//! A sink is a registered interest in inbound traffic: a match predicate,
//! a receive queue, a one-shot timer and the protocol state that handles
//! both. The table keeps sinks ordered by descending specificity so the
//! first match found is always the most specific one.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;

use super::buffer::PacketQueue;
use super::dhcp::DhcpClient;
use super::icmp::UnreachableLimiter;
use super::tftp::TftpTransfer;
use crate::time::Timer;

/// Handle returned by [`SinkTable::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SinkId(u32);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

/// Header fields extracted from an inbound frame for matching
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub ethertype: u16,
    pub ip_protocol: Option<u8>,
    pub src_ip: Option<Ipv4Addr>,
    pub dest_ip: Option<Ipv4Addr>,
    pub src_port: Option<u16>,
    pub dest_port: Option<u16>,
}

/// Match predicate; `None` fields match anything
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkMatch {
    pub ethertype: Option<u16>,
    pub ip_protocol: Option<u8>,
    pub local_ip: Option<Ipv4Addr>,
    pub remote_ip: Option<Ipv4Addr>,
    /// Destination must be the interface address
    pub to_our_ip: bool,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
}

impl SinkMatch {
    pub fn ethertype(ethertype: u16) -> Self {
        Self {
            ethertype: Some(ethertype),
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.ip_protocol = Some(protocol);
        self
    }

    pub fn with_local_ip(mut self, ip: Ipv4Addr) -> Self {
        self.local_ip = Some(ip);
        self
    }

    pub fn with_remote_ip(mut self, ip: Ipv4Addr) -> Self {
        self.remote_ip = Some(ip);
        self
    }

    pub fn to_our_ip(mut self) -> Self {
        self.to_our_ip = true;
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    /// Number of constrained fields
    pub fn specificity(&self) -> usize {
        [
            self.ethertype.is_some(),
            self.ip_protocol.is_some(),
            self.local_ip.is_some(),
            self.remote_ip.is_some(),
            self.to_our_ip,
            self.local_port.is_some(),
            self.remote_port.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// Does `frame` satisfy every constrained field?
    ///
    /// # Arguments
    /// * `frame` - Fields parsed from the inbound frame
    /// * `our_ip` - Interface address, `None` while unconfigured
    pub fn matches(&self, frame: &FrameInfo, our_ip: Option<Ipv4Addr>) -> bool {
        fn field<T: PartialEq>(want: Option<T>, have: Option<T>) -> bool {
            want.is_none() || want == have
        }

        self.ethertype.is_none_or(|t| t == frame.ethertype)
            && field(self.ip_protocol, frame.ip_protocol)
            && field(self.local_ip, frame.dest_ip)
            && field(self.remote_ip, frame.src_ip)
            && field(self.local_port, frame.dest_port)
            && field(self.remote_port, frame.src_port)
            && (!self.to_our_ip || (our_ip.is_some() && frame.dest_ip == our_ip))
    }
}

/// Protocol state behind a sink
pub enum SinkKind {
    Arp,
    IcmpEcho,
    IcmpUnreachable(UnreachableLimiter),
    Dhcp(DhcpClient),
    Tftp(Box<TftpTransfer>),
}

impl SinkKind {
    pub fn name(&self) -> &'static str {
        match self {
            SinkKind::Arp => "arp",
            SinkKind::IcmpEcho => "icmp-echo",
            SinkKind::IcmpUnreachable(_) => "icmp-unreachable",
            SinkKind::Dhcp(_) => "dhcp",
            SinkKind::Tftp(_) => "tftp",
        }
    }
}

/// A registered sink
pub struct Sink {
    id: SinkId,
    pub filter: SinkMatch,
    pub queue: PacketQueue,
    pub timer: Timer,
    pub kind: SinkKind,
}

impl Sink {
    pub fn new(filter: SinkMatch, kind: SinkKind) -> Self {
        Self::with_timer(filter, kind, Timer::new())
    }

    /// Sink whose timer was armed before registration
    pub fn with_timer(filter: SinkMatch, kind: SinkKind, timer: Timer) -> Self {
        Self {
            id: SinkId(0),
            filter,
            queue: PacketQueue::new(),
            timer,
            kind,
        }
    }

    pub fn id(&self) -> SinkId {
        self.id
    }
}

/// Sinks ordered by descending specificity
pub struct SinkTable {
    sinks: Vec<Sink>,
    next_id: u32,
}

impl SinkTable {
    pub const fn new() -> Self {
        Self {
            sinks: Vec::new(),
            next_id: 1,
        }
    }

    /// Insert after every sink at least as specific
    pub fn insert(&mut self, mut sink: Sink) -> SinkId {
        let id = SinkId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        sink.id = id;

        let score = sink.filter.specificity();
        let pos = self
            .sinks
            .iter()
            .position(|s| s.filter.specificity() < score)
            .unwrap_or(self.sinks.len());
        self.sinks.insert(pos, sink);
        id
    }

    /// Unregister a sink, handing back any packets still queued on it
    pub fn remove(&mut self, id: SinkId) -> Option<Sink> {
        let pos = self.sinks.iter().position(|s| s.id == id)?;
        Some(self.sinks.remove(pos))
    }

    /// Index of the first (most specific) sink matching `frame`
    pub fn find_match(&self, frame: &FrameInfo, our_ip: Option<Ipv4Addr>) -> Option<usize> {
        self.sinks.iter().position(|s| s.filter.matches(frame, our_ip))
    }

    pub fn get(&self, id: SinkId) -> Option<&Sink> {
        self.sinks.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SinkId) -> Option<&mut Sink> {
        self.sinks.iter_mut().find(|s| s.id == id)
    }

    pub fn by_index_mut(&mut self, index: usize) -> Option<&mut Sink> {
        self.sinks.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sink> {
        self.sinks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Sink> {
        self.sinks.iter_mut()
    }
}

impl Default for SinkTable {
    fn default() -> Self {
        Self::new()
    }
}
