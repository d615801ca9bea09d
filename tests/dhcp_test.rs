mod common;

use std::net::Ipv4Addr;

use bootnet::drivers::net::loopback::WirePort;
use bootnet::net::config::NetworkConfig;
use bootnet::net::dhcp::{
    BOOT_REPLY, CLIENT_PORT, DhcpMessage, DhcpState, INITIAL_BACKOFF, MessageType,
    RENEW_INTERVAL_SECS, RENEW_RETRIES, SERVER_PORT,
};
use bootnet::net::ethernet::MacAddr;
use bootnet::time::{MAX_DELAY, TickCounter, secs_to_ticks};
use bootnet::NetStack;
use common::*;

const OFFERED: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
const DNS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 53);

fn unconfigured() -> (NetStack, WirePort, std::sync::Arc<TickCounter>) {
    stack_with(Default::default())
}

/// DHCP messages the client broadcast since the last call
fn client_messages(peer: &WirePort) -> Vec<DhcpMessage> {
    drain_udp(peer)
        .into_iter()
        .filter(|f| f.udp.src_port == CLIENT_PORT && f.udp.dest_port == SERVER_PORT)
        .map(|f| {
            assert_eq!(f.dest_ip, Ipv4Addr::BROADCAST);
            assert_eq!(f.eth.dest_mac, MacAddr::BROADCAST);
            DhcpMessage::parse(&f.payload).unwrap()
        })
        .collect()
}

fn reply(kind: MessageType, xid: u32, lease_secs: u32) -> DhcpMessage {
    DhcpMessage {
        op: BOOT_REPLY,
        yiaddr: OFFERED,
        subnet_mask: Some(NETMASK),
        router: Some(PEER_IP),
        dns_server: Some(DNS),
        lease_secs: Some(lease_secs),
        server_id: Some(PEER_IP),
        ..DhcpMessage::request(kind, xid, OUR_MAC)
    }
}

fn server_send(peer: &WirePort, msg: &DhcpMessage) {
    let frame = udp_frame(
        (PEER_MAC, PEER_IP, SERVER_PORT),
        (MacAddr::BROADCAST, Ipv4Addr::BROADCAST, CLIENT_PORT),
        &msg.to_bytes(),
    );
    peer.send(&frame).unwrap();
}

/// Run DISCOVER/OFFER/REQUEST/ACK and return the REQUEST the client sent
fn bind(stack: &mut NetStack, peer: &WirePort, lease_secs: u32) -> DhcpMessage {
    stack.dhcp_init();
    let discover = client_messages(peer).remove(0);
    server_send(peer, &reply(MessageType::Offer, discover.xid, lease_secs));
    stack.pump();

    let request = client_messages(peer).remove(0);
    server_send(peer, &reply(MessageType::Ack, request.xid, lease_secs));
    stack.pump();
    request
}

#[test]
fn test_dora_configures_interface() {
    let (mut stack, peer, _clock) = unconfigured();
    assert!(!stack.interface().is_valid());

    stack.dhcp_init();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Select));

    let sent = client_messages(&peer);
    assert_eq!(sent.len(), 1);
    let discover = sent[0];
    assert_eq!(discover.message_type, MessageType::Discover);
    assert_eq!(discover.chaddr, OUR_MAC);

    server_send(&peer, &reply(MessageType::Offer, discover.xid, 3600));
    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Request));

    let sent = client_messages(&peer);
    assert_eq!(sent.len(), 1);
    let request = sent[0];
    assert_eq!(request.message_type, MessageType::Request);
    assert_eq!(request.xid, discover.xid);
    assert_eq!(request.requested_ip, Some(OFFERED));
    assert_eq!(request.server_id, Some(PEER_IP));

    server_send(&peer, &reply(MessageType::Ack, request.xid, 3600));
    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Bound));
    assert_eq!(
        stack.interface(),
        NetworkConfig {
            ip_addr: OFFERED,
            netmask: NETMASK,
            gateway: Some(PEER_IP),
            dns: Some(DNS),
        }
    );
    assert_eq!(stack.dhcp_lease().map(|l| l.lease_secs), Some(3600));
}

#[test]
fn test_short_lease_offer_rejected() {
    let (mut stack, peer, _clock) = unconfigured();
    stack.dhcp_init();
    let discover = client_messages(&peer).remove(0);

    server_send(&peer, &reply(MessageType::Offer, discover.xid, 100));
    stack.pump();

    assert_eq!(stack.dhcp_state(), Some(DhcpState::Select));
    assert!(client_messages(&peer).is_empty());
    assert!(!stack.interface().is_valid());
}

#[test]
fn test_offer_missing_dns_rejected() {
    let (mut stack, peer, _clock) = unconfigured();
    stack.dhcp_init();
    let discover = client_messages(&peer).remove(0);

    let mut offer = reply(MessageType::Offer, discover.xid, 3600);
    offer.dns_server = None;
    server_send(&peer, &offer);
    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Select));
}

#[test]
fn test_offer_for_other_transaction_ignored() {
    let (mut stack, peer, _clock) = unconfigured();
    stack.dhcp_init();
    let discover = client_messages(&peer).remove(0);

    server_send(&peer, &reply(MessageType::Offer, discover.xid ^ 1, 3600));
    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Select));
    assert!(client_messages(&peer).is_empty());
}

#[test]
fn test_truncated_options_dropped() {
    let (mut stack, peer, _clock) = unconfigured();
    stack.dhcp_init();
    let discover = client_messages(&peer).remove(0);

    let mut bytes = reply(MessageType::Offer, discover.xid, 3600).to_bytes();
    bytes.pop();
    bytes.extend_from_slice(&[51, 4, 0]);
    let frame = udp_frame(
        (PEER_MAC, PEER_IP, SERVER_PORT),
        (MacAddr::BROADCAST, Ipv4Addr::BROADCAST, CLIENT_PORT),
        &bytes,
    );
    peer.send(&frame).unwrap();
    stack.pump();

    assert_eq!(stack.dhcp_state(), Some(DhcpState::Select));
    assert_eq!(stack.stats().rx_malformed, 1);
}

#[test]
fn test_select_backoff_doubles() {
    let (mut stack, peer, clock) = unconfigured();
    stack.dhcp_init();
    let first = client_messages(&peer).remove(0);

    clock.advance(INITIAL_BACKOFF - 1);
    stack.pump();
    assert!(client_messages(&peer).is_empty());

    clock.advance(1);
    stack.pump();
    let second = client_messages(&peer).remove(0);
    assert_eq!(second.message_type, MessageType::Discover);
    assert_ne!(second.xid, first.xid);

    // Next round waits twice as long
    clock.advance(INITIAL_BACKOFF * 2 - 1);
    stack.pump();
    assert!(client_messages(&peer).is_empty());
    clock.advance(1);
    stack.pump();
    assert_eq!(client_messages(&peer).len(), 1);
}

#[test]
fn test_nak_restarts_discovery() {
    let (mut stack, peer, _clock) = unconfigured();
    stack.dhcp_init();
    let discover = client_messages(&peer).remove(0);
    server_send(&peer, &reply(MessageType::Offer, discover.xid, 3600));
    stack.pump();
    let request = client_messages(&peer).remove(0);

    server_send(&peer, &reply(MessageType::Nak, request.xid, 3600));
    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Select));
    let sent = client_messages(&peer);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, MessageType::Discover);
}

#[test]
fn test_renewal_keeps_lease() {
    let (mut stack, peer, clock) = unconfigured();
    bind(&mut stack, &peer, 3600);
    let lease = stack.dhcp_lease().unwrap();

    clock.advance(lease.renew_after());
    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Renew));
    let renew = client_messages(&peer).remove(0);
    assert_eq!(renew.message_type, MessageType::Request);
    assert_eq!(renew.ciaddr, OFFERED);
    // Still usable while renewing
    assert!(stack.interface().is_valid());

    server_send(&peer, &reply(MessageType::Ack, renew.xid, 7200));
    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Bound));
    assert_eq!(stack.dhcp_lease().map(|l| l.lease_secs), Some(7200));
}

#[test]
fn test_unanswered_renewal_loses_lease() {
    let (mut stack, peer, clock) = unconfigured();
    bind(&mut stack, &peer, 3600);
    let lease = stack.dhcp_lease().unwrap();

    clock.advance(lease.renew_after());
    stack.pump();
    let mut requests = client_messages(&peer).len();
    for _ in 1..RENEW_RETRIES {
        clock.advance(secs_to_ticks(RENEW_INTERVAL_SECS));
        stack.pump();
        requests += client_messages(&peer).len();
    }
    assert_eq!(requests, RENEW_RETRIES as usize);
    assert!(stack.interface().is_valid());

    clock.advance(secs_to_ticks(RENEW_INTERVAL_SECS));
    stack.pump();
    assert!(!stack.interface().is_valid());
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Select));
    let sent = client_messages(&peer);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, MessageType::Discover);
}

#[test]
fn test_infinite_lease_renews_at_furthest_deadline() {
    let (mut stack, peer, clock) = unconfigured();
    bind(&mut stack, &peer, u32::MAX);
    let lease = stack.dhcp_lease().unwrap();
    assert_eq!(lease.renew_after(), MAX_DELAY);

    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Bound));
    assert!(client_messages(&peer).is_empty());

    clock.advance(MAX_DELAY - 1);
    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Bound));

    clock.advance(1);
    stack.pump();
    assert_eq!(stack.dhcp_state(), Some(DhcpState::Renew));
}
