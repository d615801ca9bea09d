//! Network stack implementation
//!
//! Leaf modules (buffer, checksum, headers) first, then the dispatcher in
//! `stack` and the protocol clients that register sinks with it.

pub mod buffer;
pub mod checksum;
pub mod config;
pub mod ethernet;
pub mod arp;
pub mod ipv4;
pub mod icmp;
pub mod udp;
pub mod sink;
pub mod stack;
pub mod dhcp;      // Address acquisition
pub mod tftp;      // Boot image transfer
