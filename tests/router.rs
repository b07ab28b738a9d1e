//! End-to-end pipeline tests
//!
//! Drives a fully configured router through mock transports: frames go in
//! on one interface, and the tests assert on the frames that come out.

use fourward::capture::MockTransport;
use fourward::dataplane::{DeviceId, Router, NAT_GLOBAL_PORT_MIN};
use fourward::protocol::checksum::{checksum16, transport_checksum};
use fourward::protocol::ethernet::{Frame, FrameBuilder};
use fourward::protocol::icmp::IcmpMessage;
use fourward::protocol::ipv4::{self, Ipv4Header};
use fourward::protocol::{EtherType, MacAddr};
use fourward::telemetry::MetricsRegistry;
use std::net::Ipv4Addr;
use std::sync::Arc;

const ROUTER_MAC_A: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x0a]);
const ROUTER_MAC_B: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x0b]);
const HOST_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const GATEWAY_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

struct Harness {
    router: Router,
    net_a: MockTransport,
    net_b: MockTransport,
    dev_a: DeviceId,
    dev_b: DeviceId,
}

/// Two-interface router: A = 192.168.1.1/24, B = 192.168.0.1/24, with a
/// static route to 192.168.2.0/24 via 192.168.0.2
fn two_port_router() -> Harness {
    let mut router = Router::new(Arc::new(MetricsRegistry::new()));

    let net_a = MockTransport::new();
    let net_b = MockTransport::new();
    let dev_a = router.register_device("netA".into(), ROUTER_MAC_A, Box::new(net_a.clone()));
    let dev_b = router.register_device("netB".into(), ROUTER_MAC_B, Box::new(net_b.clone()));

    router.set_address(
        dev_a,
        Ipv4Addr::new(192, 168, 1, 1),
        Ipv4Addr::new(255, 255, 255, 0),
    );
    router.set_address(
        dev_b,
        Ipv4Addr::new(192, 168, 0, 1),
        Ipv4Addr::new(255, 255, 255, 0),
    );
    router.add_route(Ipv4Addr::new(192, 168, 2, 0), 24, Ipv4Addr::new(192, 168, 0, 2));

    Harness {
        router,
        net_a,
        net_b,
        dev_a,
        dev_b,
    }
}

/// Deliver every queued frame on a device
fn drain(router: &mut Router, dev: DeviceId) {
    while router.poll_device(dev).unwrap() {}
}

/// Teach the router a neighbor's MAC by injecting an ARP reply
fn seed_arp(router: &mut Router, dev: DeviceId, router_mac: MacAddr, mac: MacAddr, ip: Ipv4Addr) {
    let mut arp = vec![0u8; 28];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes());
    arp[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&2u16.to_be_bytes());
    arp[8..14].copy_from_slice(&mac.0);
    arp[14..18].copy_from_slice(&ip.octets());
    arp[18..24].copy_from_slice(&router_mac.0);

    let frame = FrameBuilder::new()
        .dst_mac(router_mac)
        .src_mac(mac)
        .ethertype(EtherType::Arp as u16)
        .payload(&arp)
        .build();

    router.ethernet_input(dev, &frame);
}

fn icmp_echo_request(identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    let mut message = vec![8u8, 0, 0, 0];
    message.extend_from_slice(&identifier.to_be_bytes());
    message.extend_from_slice(&sequence.to_be_bytes());
    message.extend_from_slice(data);
    let sum = checksum16(&message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
    message
}

fn ip_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, ttl: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = ipv4::build_header(src, dst, protocol, 0x4242, ttl, payload.len()).to_vec();
    packet.extend_from_slice(payload);
    packet
}

fn eth(dst: MacAddr, src: MacAddr, ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
    FrameBuilder::new()
        .dst_mac(dst)
        .src_mac(src)
        .ethertype(ethertype as u16)
        .payload(payload)
        .build()
}

fn tcp_segment(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, syn_ack: bool) -> Vec<u8> {
    let mut segment = vec![0u8; 20];
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[12] = 0x50;
    segment[13] = if syn_ack { 0x12 } else { 0x02 };
    segment[14..16].copy_from_slice(&0x7210u16.to_be_bytes());
    let sum = transport_checksum(src, dst, 6, &segment);
    segment[16..18].copy_from_slice(&sum.to_be_bytes());
    segment
}

#[test]
fn echo_to_self() {
    let Harness {
        mut router,
        net_a,
        dev_a,
        ..
    } = two_port_router();

    // The host ARPs first, which also teaches the router its MAC
    seed_arp(&mut router, dev_a, ROUTER_MAC_A, HOST_MAC, Ipv4Addr::new(192, 168, 1, 2));
    net_a.take_sent();

    let request = icmp_echo_request(0x1234, 1, b"ABCDEFGH");
    let packet = ip_packet(
        Ipv4Addr::new(192, 168, 1, 2),
        Ipv4Addr::new(192, 168, 1, 1),
        1,
        64,
        &request,
    );
    net_a.inject(&eth(ROUTER_MAC_A, HOST_MAC, EtherType::Ipv4, &packet));
    drain(&mut router, dev_a);

    let sent = net_a.take_sent();
    assert_eq!(sent.len(), 1);

    let frame = Frame::parse(&sent[0]).unwrap();
    assert_eq!(frame.dst_mac(), HOST_MAC);
    assert_eq!(frame.src_mac(), ROUTER_MAC_A);
    assert_eq!(frame.ethertype(), EtherType::Ipv4 as u16);

    let header = Ipv4Header::parse(frame.payload()).unwrap();
    assert_eq!(header.src_addr(), Ipv4Addr::new(192, 168, 1, 1));
    assert_eq!(header.dst_addr(), Ipv4Addr::new(192, 168, 1, 2));
    assert_eq!(checksum16(&frame.payload()[..20]), 0);

    let reply = IcmpMessage::parse(header.payload()).unwrap();
    assert_eq!(reply.icmp_type(), 0);
    assert_eq!(reply.code(), 0);
    assert_eq!(reply.identifier(), 0x1234);
    assert_eq!(reply.sequence(), 1);
    assert_eq!(reply.payload(), b"ABCDEFGH");
    assert_eq!(checksum16(header.payload()), 0);
}

#[test]
fn arp_request_gets_unicast_reply() {
    let Harness {
        mut router,
        net_a,
        dev_a,
        ..
    } = two_port_router();

    // Broadcast ARP request: who has 192.168.1.1, tell 192.168.1.2
    let mut request = vec![0u8; 46];
    request[0..2].copy_from_slice(&1u16.to_be_bytes());
    request[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
    request[4] = 6;
    request[5] = 4;
    request[6..8].copy_from_slice(&1u16.to_be_bytes());
    request[8..14].copy_from_slice(&HOST_MAC.0);
    request[14..18].copy_from_slice(&Ipv4Addr::new(192, 168, 1, 2).octets());
    request[24..28].copy_from_slice(&Ipv4Addr::new(192, 168, 1, 1).octets());

    net_a.inject(&eth(MacAddr::BROADCAST, HOST_MAC, EtherType::Arp, &request));
    drain(&mut router, dev_a);

    let sent = net_a.take_sent();
    assert_eq!(sent.len(), 1);

    let frame = Frame::parse(&sent[0]).unwrap();
    assert_eq!(frame.dst_mac(), HOST_MAC);
    assert_eq!(frame.ethertype(), EtherType::Arp as u16);

    let reply = frame.payload();
    assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 2); // op = reply
    assert_eq!(&reply[8..14], &ROUTER_MAC_A.0); // sender = router
    assert_eq!(&reply[14..18], &Ipv4Addr::new(192, 168, 1, 1).octets());
    assert_eq!(&reply[18..24], &HOST_MAC.0); // target = requester
    assert_eq!(&reply[24..28], &Ipv4Addr::new(192, 168, 1, 2).octets());

    // The sender was learned on interface A
    let entry = router.arp_table().lookup(Ipv4Addr::new(192, 168, 1, 2)).unwrap();
    assert_eq!(entry.mac, HOST_MAC);
    assert_eq!(entry.dev, dev_a);
}

#[test]
fn forwarding_decrements_ttl() {
    let Harness {
        mut router,
        net_a,
        net_b,
        dev_a,
        dev_b,
    } = two_port_router();

    seed_arp(&mut router, dev_b, ROUTER_MAC_B, GATEWAY_MAC, Ipv4Addr::new(192, 168, 0, 2));
    net_b.take_sent();

    let payload = icmp_echo_request(7, 7, b"transit!");
    let packet = ip_packet(
        Ipv4Addr::new(192, 168, 1, 2),
        Ipv4Addr::new(192, 168, 2, 5),
        1,
        64,
        &payload,
    );
    net_a.inject(&eth(ROUTER_MAC_A, HOST_MAC, EtherType::Ipv4, &packet));
    drain(&mut router, dev_a);

    assert!(net_a.sent().is_empty());
    let sent = net_b.take_sent();
    assert_eq!(sent.len(), 1);

    let frame = Frame::parse(&sent[0]).unwrap();
    assert_eq!(frame.dst_mac(), GATEWAY_MAC);
    assert_eq!(frame.src_mac(), ROUTER_MAC_B);

    let header = Ipv4Header::parse(frame.payload()).unwrap();
    assert_eq!(header.ttl(), 63);
    assert_eq!(header.dst_addr(), Ipv4Addr::new(192, 168, 2, 5));
    // Header checksum was recomputed after the TTL change
    assert_eq!(checksum16(&frame.payload()[..20]), 0);
    // Payload is untouched
    assert_eq!(header.payload(), &payload[..]);
}

#[test]
fn ttl_expiry_generates_time_exceeded() {
    let Harness {
        mut router,
        net_a,
        net_b,
        dev_a,
        ..
    } = two_port_router();

    seed_arp(&mut router, dev_a, ROUTER_MAC_A, HOST_MAC, Ipv4Addr::new(192, 168, 1, 2));
    net_a.take_sent();

    let packet = ip_packet(
        Ipv4Addr::new(192, 168, 1, 2),
        Ipv4Addr::new(192, 168, 2, 5),
        1,
        1,
        &icmp_echo_request(7, 7, b"expiring"),
    );
    net_a.inject(&eth(ROUTER_MAC_A, HOST_MAC, EtherType::Ipv4, &packet));
    drain(&mut router, dev_a);

    // Nothing was forwarded
    assert!(net_b.sent().is_empty());

    let sent = net_a.take_sent();
    assert_eq!(sent.len(), 1);

    let frame = Frame::parse(&sent[0]).unwrap();
    assert_eq!(frame.dst_mac(), HOST_MAC);

    let header = Ipv4Header::parse(frame.payload()).unwrap();
    // Error originates from the input interface's address
    assert_eq!(header.src_addr(), Ipv4Addr::new(192, 168, 1, 1));
    assert_eq!(header.dst_addr(), Ipv4Addr::new(192, 168, 1, 2));
    assert_eq!(header.protocol(), 1);

    let message = IcmpMessage::parse(header.payload()).unwrap();
    assert_eq!(message.icmp_type(), 11);
    assert_eq!(message.code(), 0);
    assert_eq!(checksum16(header.payload()), 0);
    // The embedded packet is the original, TTL still 1
    assert_eq!(&message.payload()[..20], &packet[..20]);
}

#[test]
fn napt_outgoing_then_incoming() {
    let mut router = Router::new(Arc::new(MetricsRegistry::new()));

    let inside = MockTransport::new();
    let outside = MockTransport::new();
    let dev_in = router.register_device("inside".into(), ROUTER_MAC_A, Box::new(inside.clone()));
    let dev_out = router.register_device("outside".into(), ROUTER_MAC_B, Box::new(outside.clone()));

    router.set_address(dev_in, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 0));
    router.set_address(
        dev_out,
        Ipv4Addr::new(203, 0, 113, 2),
        Ipv4Addr::new(255, 255, 255, 0),
    );
    router.add_route(Ipv4Addr::new(0, 0, 0, 0), 0, Ipv4Addr::new(203, 0, 113, 1));
    router.enable_napt(dev_in, dev_out).unwrap();

    seed_arp(&mut router, dev_out, ROUTER_MAC_B, GATEWAY_MAC, Ipv4Addr::new(203, 0, 113, 1));
    seed_arp(&mut router, dev_in, ROUTER_MAC_A, HOST_MAC, Ipv4Addr::new(10, 0, 0, 5));
    outside.take_sent();
    inside.take_sent();

    // SYN from the local host egresses with a rewritten source
    let syn = tcp_segment(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(8, 8, 8, 8), 44444, 80, false);
    let packet = ip_packet(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(8, 8, 8, 8), 6, 64, &syn);
    inside.inject(&eth(ROUTER_MAC_A, HOST_MAC, EtherType::Ipv4, &packet));
    drain(&mut router, dev_in);

    let sent = outside.take_sent();
    assert_eq!(sent.len(), 1);
    let frame = Frame::parse(&sent[0]).unwrap();
    assert_eq!(frame.dst_mac(), GATEWAY_MAC);

    let header = Ipv4Header::parse(frame.payload()).unwrap();
    assert_eq!(header.src_addr(), Ipv4Addr::new(203, 0, 113, 2));
    assert_eq!(header.dst_addr(), Ipv4Addr::new(8, 8, 8, 8));
    assert_eq!(checksum16(&frame.payload()[..20]), 0);

    let segment = header.payload();
    let src_port = u16::from_be_bytes([segment[0], segment[1]]);
    assert_eq!(src_port, NAT_GLOBAL_PORT_MIN); // first free slot
    assert_eq!(
        transport_checksum(header.src_addr(), header.dst_addr(), 6, segment),
        0
    );

    // The SYN-ACK addressed to the global endpoint is restored and
    // delivered to the local host
    let syn_ack = tcp_segment(
        Ipv4Addr::new(8, 8, 8, 8),
        Ipv4Addr::new(203, 0, 113, 2),
        80,
        NAT_GLOBAL_PORT_MIN,
        true,
    );
    let packet = ip_packet(
        Ipv4Addr::new(8, 8, 8, 8),
        Ipv4Addr::new(203, 0, 113, 2),
        6,
        64,
        &syn_ack,
    );
    outside.inject(&eth(ROUTER_MAC_B, GATEWAY_MAC, EtherType::Ipv4, &packet));
    drain(&mut router, dev_out);

    let sent = inside.take_sent();
    assert_eq!(sent.len(), 1);
    let frame = Frame::parse(&sent[0]).unwrap();
    assert_eq!(frame.dst_mac(), HOST_MAC);

    let header = Ipv4Header::parse(frame.payload()).unwrap();
    assert_eq!(header.dst_addr(), Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(header.src_addr(), Ipv4Addr::new(8, 8, 8, 8));
    assert_eq!(checksum16(&frame.payload()[..20]), 0);

    let segment = header.payload();
    let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
    assert_eq!(dst_port, 44444);
    assert_eq!(
        transport_checksum(header.src_addr(), header.dst_addr(), 6, segment),
        0
    );
}

#[test]
fn arp_miss_requests_and_drops() {
    let Harness {
        mut router,
        net_a,
        net_b,
        dev_b,
        ..
    } = two_port_router();

    // Transit packet towards a connected host whose MAC is unknown
    let packet = ip_packet(
        Ipv4Addr::new(192, 168, 0, 9),
        Ipv4Addr::new(192, 168, 1, 99),
        1,
        64,
        &icmp_echo_request(1, 1, b"anyone?"),
    );
    net_b.inject(&eth(ROUTER_MAC_B, HOST_MAC, EtherType::Ipv4, &packet));
    drain(&mut router, dev_b);

    // The only emission is a broadcast ARP request on the matching
    // interface; the packet itself is gone
    assert!(net_b.sent().is_empty());
    let sent = net_a.take_sent();
    assert_eq!(sent.len(), 1);

    let frame = Frame::parse(&sent[0]).unwrap();
    assert!(frame.dst_mac().is_broadcast());
    assert_eq!(frame.ethertype(), EtherType::Arp as u16);

    let request = frame.payload();
    assert_eq!(u16::from_be_bytes([request[6], request[7]]), 1); // op = request
    assert_eq!(&request[8..14], &ROUTER_MAC_A.0);
    assert_eq!(&request[14..18], &Ipv4Addr::new(192, 168, 1, 1).octets());
    assert_eq!(&request[24..28], &Ipv4Addr::new(192, 168, 1, 99).octets());

    // Late resolution does not replay the packet; nothing was queued
    let dev_a = router.find_device("netA").unwrap();
    seed_arp(&mut router, dev_a, ROUTER_MAC_A, HOST_MAC, Ipv4Addr::new(192, 168, 1, 99));
    assert!(net_a.take_sent().is_empty());
}
