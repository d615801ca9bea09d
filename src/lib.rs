//! Polled network core for a ROM-resident boot monitor.
//!
//! Brings up one Ethernet interface without an operating system and offers
//! DHCP address acquisition, ARP resolution, ICMP echo/unreachable handling
//! and a windowed TFTP client for fetching boot images. All protocol work
//! happens inside [`net::stack::NetStack::pump`]; the timer interrupt only
//! advances a [`time::TickCounter`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod time;

//Network drivers
pub mod drivers;

// Filesystem collaborator interface used by TFTP
pub mod fs;

//Networking infrastructure
pub mod net;

pub use net::stack::{NetError, NetStack, net_init};
