//! Layer-three scenarios: longest-prefix forwarding, TTL exhaustion,
//! end-to-end ping, RIP propagation and split horizon.

use netlab_clock::secs;
use netlab_network::message::{IcmpPacket, Ipv4Packet, Ipv4Payload, Message};
use netlab_network::message::EtherPayload;
use netlab_network::rip::RIP_INFINITY;
use netlab_network::{Ipv4Addr, Network, NodeId};

use crate::topo::{any_frame_counter, echo_reply_counter, host, icmp_counter, ip, mask, network};

/// Router with addressed interfaces `eth0..ethN`.
fn router(net: &mut Network, name: &str, addrs: &[(Ipv4Addr, u8)]) -> NodeId {
    let id = net.add_router(name);
    for (n, (addr, prefix)) in addrs.iter().enumerate() {
        let iface = alloc::format!("eth{}", n);
        net.add_interface(id, &iface).unwrap();
        net.set_ip(id, &iface, *addr).unwrap();
        net.set_mask(id, &iface, mask(*prefix)).unwrap();
    }
    id
}

/// Scenario S4: a packet arriving with TTL 1 for a non-local
/// destination produces exactly one Time Exceeded and is not forwarded.
#[test]
fn test_ttl_exhaustion_answers_time_exceeded() {
    let mut net = network();

    let a = host(&mut net, "a", ip(10, 0, 0, 10), 24);
    let far = host(&mut net, "far", ip(192, 168, 50, 10), 24);
    let r = router(
        &mut net,
        "r",
        &[(ip(10, 0, 0, 1), 24), (ip(192, 168, 50, 1), 24)],
    );
    net.link(a, "eth0", r, "eth0", 1).unwrap();
    net.link(far, "eth0", r, "eth1", 1).unwrap();

    // A route exists, so only the TTL stops the packet.
    net.add_route(r, ip(172, 16, 0, 0), mask(16), ip(192, 168, 50, 10))
        .unwrap();

    let exceeded_at_a = icmp_counter(&net, a, IcmpPacket::TIME_EXCEEDED);
    let at_far = any_frame_counter(&net, far);

    let a_mac = net.node(a).unwrap().iface(0).unwrap().mac;
    let r_mac = net.node(r).unwrap().iface(0).unwrap().mac;
    let packet = Ipv4Packet {
        src: ip(10, 0, 0, 10),
        dst: ip(172, 16, 0, 5),
        ttl: 1,
        payload: Ipv4Payload::Icmp(IcmpPacket::echo_request()),
    };
    let frame = Message::ethernet(a_mac, r_mac, EtherPayload::Ipv4(packet));
    net.transmit(a, 0, frame).unwrap();
    net.run_for(secs(1));

    assert_eq!(exceeded_at_a.get(), 1, "exactly one Time Exceeded");
    assert_eq!(at_far.get(), 0, "the original packet is not forwarded");
}

/// No route and a healthy TTL: the packet is dropped silently.
#[test]
fn test_no_route_drops_silently() {
    let mut net = network();
    let a = host(&mut net, "a", ip(10, 0, 0, 10), 24);
    let r = router(&mut net, "r", &[(ip(10, 0, 0, 1), 24)]);
    net.link(a, "eth0", r, "eth0", 1).unwrap();

    let icmp_at_a = icmp_counter(&net, a, IcmpPacket::TIME_EXCEEDED);
    let unreachable_at_a = icmp_counter(&net, a, IcmpPacket::DEST_UNREACHABLE);

    net.set_gateway(a, "eth0", ip(10, 0, 0, 1)).unwrap();
    net.ping(a, ip(8, 8, 8, 8)).unwrap();
    net.run_for(secs(1));

    assert_eq!(icmp_at_a.get(), 0);
    assert_eq!(unreachable_at_a.get(), 0);
}

/// Ping across two routed hops, with static routes both ways.
#[test]
fn test_ping_across_two_routers() {
    let mut net = network();

    let h1 = host(&mut net, "h1", ip(10, 0, 1, 10), 24);
    let h2 = host(&mut net, "h2", ip(10, 0, 2, 10), 24);
    let r1 = router(
        &mut net,
        "r1",
        &[(ip(10, 0, 1, 1), 24), (ip(10, 0, 12, 1), 24)],
    );
    let r2 = router(
        &mut net,
        "r2",
        &[(ip(10, 0, 12, 2), 24), (ip(10, 0, 2, 1), 24)],
    );
    net.link(h1, "eth0", r1, "eth0", 1).unwrap();
    net.link(r1, "eth1", r2, "eth0", 1).unwrap();
    net.link(r2, "eth1", h2, "eth0", 1).unwrap();

    net.set_gateway(h1, "eth0", ip(10, 0, 1, 1)).unwrap();
    net.set_gateway(h2, "eth0", ip(10, 0, 2, 1)).unwrap();
    net.add_route(r1, ip(10, 0, 2, 0), mask(24), ip(10, 0, 12, 2))
        .unwrap();
    net.add_route(r2, ip(10, 0, 1, 0), mask(24), ip(10, 0, 12, 1))
        .unwrap();

    let replies = echo_reply_counter(&net, h1);
    let requests_at_h2 = icmp_counter(&net, h2, IcmpPacket::ECHO_REQUEST);

    net.ping(h1, ip(10, 0, 2, 10)).unwrap();
    net.run_for(secs(2));

    assert_eq!(requests_at_h2.get(), 1);
    assert_eq!(replies.get(), 1);
}

/// Longest-prefix selection through the public query.
#[test]
fn test_next_hop_longest_prefix() {
    let mut net = network();
    let r = router(&mut net, "r", &[(ip(10, 0, 0, 1), 24)]);

    net.add_route(r, ip(172, 16, 0, 0), mask(12), ip(10, 0, 0, 5))
        .unwrap();
    net.add_route(r, ip(172, 16, 4, 0), mask(24), ip(10, 0, 0, 6))
        .unwrap();

    assert_eq!(
        net.next_hop(r, ip(172, 16, 4, 1)).unwrap(),
        Some(ip(10, 0, 0, 6))
    );
    assert_eq!(
        net.next_hop(r, ip(172, 16, 200, 1)).unwrap(),
        Some(ip(10, 0, 0, 5))
    );
    // Directly connected beats nothing: the destination itself.
    assert_eq!(
        net.next_hop(r, ip(10, 0, 0, 77)).unwrap(),
        Some(ip(10, 0, 0, 77))
    );
    assert_eq!(net.next_hop(r, ip(8, 8, 8, 8)).unwrap(), None);
}

fn rip_line() -> (Network, NodeId, NodeId, NodeId) {
    let mut net = network();
    // R1 —10.0.0.0/24— R2 —172.16.0.0/24— R3, with stub LANs on both
    // ends.
    let r1 = router(
        &mut net,
        "r1",
        &[(ip(192, 168, 1, 1), 24), (ip(10, 0, 0, 1), 24)],
    );
    let r2 = router(
        &mut net,
        "r2",
        &[(ip(10, 0, 0, 2), 24), (ip(172, 16, 0, 1), 24)],
    );
    let r3 = router(
        &mut net,
        "r3",
        &[(ip(172, 16, 0, 2), 24), (ip(10, 1, 1, 1), 24)],
    );
    net.link(r1, "eth1", r2, "eth0", 1).unwrap();
    net.link(r2, "eth1", r3, "eth0", 1).unwrap();

    for r in [r1, r2, r3] {
        net.rip_enable(r).unwrap();
        net.rip_enable_on_interface(r, "eth0").unwrap();
        net.rip_enable_on_interface(r, "eth1").unwrap();
    }
    (net, r1, r2, r3)
}

/// Scenario S3: after three simulated seconds the end routers know the
/// far stub networks at metric 3 via the middle router.
#[test]
fn test_rip_three_router_line() {
    let (mut net, r1, _r2, r3) = rip_line();
    net.run_for(secs(3));

    let r1_routes = net.rip_routes(r1).unwrap();
    let far = r1_routes
        .iter()
        .find(|r| r.network == ip(10, 1, 1, 0))
        .expect("r1 must learn the far stub");
    assert_eq!(far.metric, 3);
    assert_eq!(far.next_hop, ip(10, 0, 0, 2));

    let r3_routes = net.rip_routes(r3).unwrap();
    let far = r3_routes
        .iter()
        .find(|r| r.network == ip(192, 168, 1, 0))
        .expect("r3 must learn the far stub");
    assert_eq!(far.metric, 3);
    assert_eq!(far.next_hop, ip(172, 16, 0, 2));
}

/// Scenario S5: split horizon without poison reverse — no route echoes
/// back to the router that originated it.
#[test]
fn test_rip_split_horizon() {
    let mut net = network();
    let r1 = router(
        &mut net,
        "r1",
        &[(ip(192, 168, 1, 1), 24), (ip(10, 0, 0, 1), 24)],
    );
    let r2 = router(
        &mut net,
        "r2",
        &[(ip(10, 0, 0, 2), 24), (ip(10, 1, 1, 1), 24)],
    );
    net.link(r1, "eth1", r2, "eth0", 1).unwrap();

    for r in [r1, r2] {
        net.rip_enable(r).unwrap();
        net.rip_enable_on_interface(r, "eth0").unwrap();
        net.rip_enable_on_interface(r, "eth1").unwrap();
        net.rip_set_poison_reverse(r, false).unwrap();
    }
    net.run_for(secs(2));

    // R2 learned exactly R1's stub; nothing it advertised came back.
    let r2_routes = net.rip_routes(r2).unwrap();
    assert_eq!(r2_routes.len(), 1);
    assert_eq!(r2_routes[0].network, ip(192, 168, 1, 0));
    assert_eq!(r2_routes[0].next_hop, ip(10, 0, 0, 1));
    assert!(r2_routes[0].metric < RIP_INFINITY);

    let r1_routes = net.rip_routes(r1).unwrap();
    assert_eq!(r1_routes.len(), 1);
    assert_eq!(r1_routes[0].network, ip(10, 1, 1, 0));
}

/// Disabling RIP clears every learned route.
#[test]
fn test_rip_disable_clears_routes() {
    let (mut net, r1, _r2, _r3) = rip_line();
    net.run_for(secs(3));
    assert!(!net.rip_routes(r1).unwrap().is_empty());

    net.rip_disable(r1).unwrap();
    assert!(net.rip_routes(r1).is_err());

    // Re-enabled, the table starts empty and repopulates.
    net.rip_enable(r1).unwrap();
    net.rip_enable_on_interface(r1, "eth0").unwrap();
    net.rip_enable_on_interface(r1, "eth1").unwrap();
    assert!(net.rip_routes(r1).unwrap().is_empty());
    net.run_for(secs(3));
    assert!(!net.rip_routes(r1).unwrap().is_empty());
}
