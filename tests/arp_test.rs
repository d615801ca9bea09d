mod common;

use std::net::Ipv4Addr;

use bootnet::net::arp::{EntryState, MAX_TRIES};
use bootnet::net::ethernet::MacAddr;
use bootnet::time::secs_to_ticks;
use common::*;

const STRANGER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 77);
const STRANGER_MAC: MacAddr = MacAddr::new(0x02, 0, 0, 0, 0, 0x77);

fn send_to_stranger(stack: &mut bootnet::NetStack) {
    let packet = stack.core_mut().udp_packet(50000, STRANGER, 9, b"hello");
    stack.transmit(packet).unwrap();
}

fn arp_frames(peer: &bootnet::drivers::net::loopback::WirePort) -> Vec<bootnet::net::arp::ArpPacket> {
    peer.drain().iter().filter_map(|f| parse_arp(f)).collect()
}

#[test]
fn test_repeated_resolve_creates_one_entry() {
    let (mut stack, peer, clock) = configured_stack();

    send_to_stranger(&mut stack);
    send_to_stranger(&mut stack);
    stack.pump();

    // Two packets waiting, one entry, one request on the wire
    assert_eq!(stack.core().arp_pending(), 2);
    assert_eq!(stack.arp_cache().len(), 1);
    let requests = arp_frames(&peer);
    assert_eq!(requests.len(), 1);
    assert!(requests[0].is_request());
    assert_eq!(requests[0].target_ip, STRANGER);
    assert_eq!(requests[0].sender_ip, OUR_IP);

    // Nothing more within the retry interval
    clock.advance(secs_to_ticks(1) - 1);
    stack.pump();
    assert!(arp_frames(&peer).is_empty());

    clock.advance(1);
    stack.pump();
    assert_eq!(arp_frames(&peer).len(), 1);
    assert_eq!(
        stack.arp_cache().entry(STRANGER).map(|e| e.state),
        Some(EntryState::Resolving(2))
    );
}

#[test]
fn test_resolution_fails_after_last_try() {
    let (mut stack, peer, clock) = configured_stack();
    send_to_stranger(&mut stack);
    send_to_stranger(&mut stack);

    let retry = stack.core().config().arp_retry_interval;
    for _ in 1..MAX_TRIES {
        clock.advance(retry);
        stack.pump();
    }
    assert_eq!(arp_frames(&peer).len(), MAX_TRIES as usize);
    assert_eq!(
        stack.arp_cache().entry(STRANGER).map(|e| e.state),
        Some(EntryState::Resolving(MAX_TRIES))
    );

    clock.advance(retry);
    stack.pump();
    assert!(stack.arp_cache().entry(STRANGER).is_none());
    assert_eq!(stack.core().arp_pending(), 0);
    assert_eq!(stack.stats().arp_failures, 2);
    assert!(peer.drain().is_empty());
}

#[test]
fn test_reply_releases_pending_packets() {
    let (mut stack, peer, clock) = configured_stack();
    send_to_stranger(&mut stack);
    stack.pump();
    peer.drain();

    peer.send(&arp_reply_frame(STRANGER_MAC, STRANGER)).unwrap();
    stack.pump();
    clock.tick();
    stack.pump();

    let sent = drain_udp(&peer);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].eth.dest_mac, STRANGER_MAC);
    assert_eq!(sent[0].payload, b"hello");
    assert_eq!(stack.core().arp_pending(), 0);
    assert_eq!(stack.arp_cache().lookup(STRANGER, stack.now()), Some(STRANGER_MAC));
}

#[test]
fn test_request_for_our_ip_answered() {
    let (mut stack, peer, _clock) = configured_stack();
    peer.send(&arp_request_frame(PEER_MAC, PEER_IP, OUR_IP)).unwrap();
    stack.pump();

    let replies = arp_frames(&peer);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].is_reply());
    assert_eq!(replies[0].sender_mac, OUR_MAC);
    assert_eq!(replies[0].sender_ip, OUR_IP);
    assert_eq!(replies[0].target_mac, PEER_MAC);
    // The requester is learned as a side effect
    assert_eq!(stack.arp_cache().lookup(PEER_IP, stack.now()), Some(PEER_MAC));
}

#[test]
fn test_request_for_other_ip_only_learns() {
    let (mut stack, peer, _clock) = configured_stack();
    peer.send(&arp_request_frame(PEER_MAC, PEER_IP, STRANGER)).unwrap();
    stack.pump();

    assert!(peer.drain().is_empty());
    assert_eq!(stack.arp_cache().lookup(PEER_IP, stack.now()), Some(PEER_MAC));
}

#[test]
fn test_sweep_purges_expired_entries() {
    let (mut stack, peer, clock) = configured_stack();
    peer.send(&arp_reply_frame(PEER_MAC, PEER_IP)).unwrap();
    stack.pump();
    assert_eq!(stack.arp_cache().len(), 1);

    let ttl = stack.core().config().arp_ttl;
    let sweep = stack.core().config().arp_sweep_interval;
    clock.advance(ttl + sweep);
    stack.pump();
    assert!(stack.arp_cache().is_empty());
}
