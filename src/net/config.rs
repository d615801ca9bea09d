//! Interface configuration and stack tunables
//!
//! All times are in ticks (see [`crate::time::TICKS_PER_SEC`]).

use core::net::Ipv4Addr;

use super::ipv4::RoutingTable;
use crate::time::{Tick, ms_to_ticks, secs_to_ticks};

/// Network configuration of the single interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Local IP address
    pub ip_addr: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
    /// Default gateway
    pub gateway: Option<Ipv4Addr>,
    /// Name server handed out by DHCP; unused by the stack itself
    pub dns: Option<Ipv4Addr>,
}

impl NetworkConfig {
    /// No address assigned; only DHCP may transmit
    pub const UNCONFIGURED: NetworkConfig = NetworkConfig {
        ip_addr: Ipv4Addr::UNSPECIFIED,
        netmask: Ipv4Addr::UNSPECIFIED,
        gateway: None,
        dns: None,
    };

    pub fn new(ip_addr: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            ip_addr,
            netmask,
            gateway,
            dns: None,
        }
    }

    /// Check if configuration is valid (IP is not 0.0.0.0)
    pub fn is_valid(&self) -> bool {
        !self.ip_addr.is_unspecified()
    }

    /// Get the routing table based on this configuration
    pub fn routing_table(&self) -> Option<RoutingTable> {
        if self.is_valid() {
            Some(RoutingTable::new(self.ip_addr, self.netmask, self.gateway))
        } else {
            None
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::UNCONFIGURED
    }
}

/// What the 16-bit TFTP block counter becomes after 65535
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rollover {
    #[default]
    Zero,
    One,
}

impl Rollover {
    /// First block number used after wrapping
    pub fn first_block(self) -> u16 {
        match self {
            Rollover::Zero => 0,
            Rollover::One => 1,
        }
    }
}

/// TFTP client tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TftpConfig {
    /// Requested block size (RFC 2348); 1468 fills a 1500-byte MTU
    pub blksize: u16,
    /// Requested window size (RFC 7440)
    pub windowsize: u16,
    /// Requested block counter rollover policy
    pub rollover: Rollover,
    /// Retransmission timeout
    pub retry_timeout: Tick,
    /// Consecutive retransmissions of one step before giving up
    pub max_retries: u32,
    /// How often progress is logged
    pub progress_interval: Tick,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            blksize: 1468,
            windowsize: 8,
            rollover: Rollover::Zero,
            retry_timeout: secs_to_ticks(1),
            max_retries: 20,
            progress_interval: secs_to_ticks(2),
        }
    }
}

/// Stack-wide tunables handed to [`crate::net_init`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    /// Static address; `None` leaves the interface for DHCP to configure
    pub network: Option<NetworkConfig>,
    /// Lifetime of a resolved ARP entry
    pub arp_ttl: Tick,
    /// Delay between ARP requests for one address
    pub arp_retry_interval: Tick,
    /// Period of the sweep that purges expired ARP entries
    pub arp_sweep_interval: Tick,
    /// Frames held while the driver has no free transmit descriptor
    pub tx_backlog_capacity: usize,
    pub tftp: TftpConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            network: None,
            arp_ttl: secs_to_ticks(300),
            arp_retry_interval: secs_to_ticks(1),
            arp_sweep_interval: secs_to_ticks(10),
            tx_backlog_capacity: 64,
            tftp: TftpConfig::default(),
        }
    }
}

/// Minimum spacing of ICMP port-unreachable replies
pub const ICMP_UNREACHABLE_INTERVAL: Tick = ms_to_ticks(100);
