//! Layer-two scenarios: VLAN trunking, MAC learning, VLAN isolation.

use alloc::vec;

use netlab_clock::secs;
use netlab_network::iface::VlanMode;
use netlab_network::message::EtherPayload;
use netlab_network::{Mac, Message, Network, NodeId};

use crate::topo::{any_frame_counter, host, ip, network, switch};

fn mac_of(net: &Network, node: NodeId, iface: usize) -> Mac {
    net.node(node).unwrap().iface(iface).unwrap().mac
}

fn broadcast_data(net: &mut Network, node: NodeId) {
    let src = mac_of(net, node, 0);
    let frame = Message::ethernet(src, Mac::BROADCAST, EtherPayload::Data(vec![0xAB]));
    net.transmit(node, 0, frame).unwrap();
}

/// Scenario S1: two switches joined by a trunk; VLAN 10 traffic reaches
/// the VLAN 10 host behind the far switch and never the VLAN 20 host.
#[test]
fn test_vlan_trunk_across_two_switches() {
    let mut net = network();

    let pc_a = host(&mut net, "pc-a", ip(192, 168, 10, 10), 24);
    let pc_c = host(&mut net, "pc-c", ip(192, 168, 10, 20), 24);
    let pc_d = host(&mut net, "pc-d", ip(192, 168, 20, 20), 24);

    let sw1 = switch(&mut net, "sw1", 3);
    let sw2 = switch(&mut net, "sw2", 3);

    // sw1: fa0/0 access VLAN 10, fa0/1 access VLAN 20, fa0/2 trunk.
    net.add_vlan(sw1, "fa0/0", 10).unwrap();
    net.add_vlan(sw1, "fa0/1", 20).unwrap();
    net.set_vlan_mode(sw1, "fa0/2", VlanMode::Trunk).unwrap();
    net.add_vlan(sw1, "fa0/2", 10).unwrap();
    net.add_vlan(sw1, "fa0/2", 20).unwrap();

    // sw2: fa0/0 trunk, fa0/1 access VLAN 10, fa0/2 access VLAN 20.
    net.set_vlan_mode(sw2, "fa0/0", VlanMode::Trunk).unwrap();
    net.add_vlan(sw2, "fa0/0", 10).unwrap();
    net.add_vlan(sw2, "fa0/0", 20).unwrap();
    net.add_vlan(sw2, "fa0/1", 10).unwrap();
    net.add_vlan(sw2, "fa0/2", 20).unwrap();

    net.link(pc_a, "eth0", sw1, "fa0/0", 1).unwrap();
    net.link(sw1, "fa0/2", sw2, "fa0/0", 1).unwrap();
    net.link(pc_c, "eth0", sw2, "fa0/1", 1).unwrap();
    net.link(pc_d, "eth0", sw2, "fa0/2", 1).unwrap();

    let at_c = any_frame_counter(&net, pc_c);
    let at_d = any_frame_counter(&net, pc_d);

    broadcast_data(&mut net, pc_a);
    net.run_for(secs(1));

    assert_eq!(at_c.get(), 1, "VLAN 10 host behind the trunk must receive");
    assert_eq!(at_d.get(), 0, "VLAN 20 host must not receive");
}

/// A learned source is forwarded, not flooded: after the first frame
/// from A, traffic towards A leaves only through A's port.
#[test]
fn test_mac_learning_stops_flooding() {
    let mut net = network();

    let a = host(&mut net, "a", ip(10, 0, 0, 1), 24);
    let b = host(&mut net, "b", ip(10, 0, 0, 2), 24);
    let c = host(&mut net, "c", ip(10, 0, 0, 3), 24);
    let sw = switch(&mut net, "sw", 3);
    net.link(a, "eth0", sw, "fa0/0", 1).unwrap();
    net.link(b, "eth0", sw, "fa0/1", 1).unwrap();
    net.link(c, "eth0", sw, "fa0/2", 1).unwrap();

    // Teach the switch where A lives.
    broadcast_data(&mut net, a);
    net.run_for(secs(1));

    let at_a = any_frame_counter(&net, a);
    let at_c = any_frame_counter(&net, c);

    // Unicast from B to A's MAC.
    let a_mac = mac_of(&net, a, 0);
    let b_mac = mac_of(&net, b, 0);
    let frame = Message::ethernet(b_mac, a_mac, EtherPayload::Data(vec![1]));
    net.transmit(b, 0, frame).unwrap();
    net.run_for(secs(1));

    assert_eq!(at_a.get(), 1);
    assert_eq!(at_c.get(), 0, "no flooding once the destination is known");
}

/// An unknown destination floods within the VLAN.
#[test]
fn test_unknown_unicast_floods() {
    let mut net = network();

    let a = host(&mut net, "a", ip(10, 0, 0, 1), 24);
    let b = host(&mut net, "b", ip(10, 0, 0, 2), 24);
    let c = host(&mut net, "c", ip(10, 0, 0, 3), 24);
    let sw = switch(&mut net, "sw", 3);
    net.link(a, "eth0", sw, "fa0/0", 1).unwrap();
    net.link(b, "eth0", sw, "fa0/1", 1).unwrap();
    net.link(c, "eth0", sw, "fa0/2", 1).unwrap();

    let at_b = any_frame_counter(&net, b);
    let at_c = any_frame_counter(&net, c);

    let a_mac = mac_of(&net, a, 0);
    let unknown = Mac::new(0x0E, 0, 0, 0, 0, 0x42);
    let frame = Message::ethernet(a_mac, unknown, EtherPayload::Data(vec![1]));
    net.transmit(a, 0, frame).unwrap();
    net.run_for(secs(1));

    assert_eq!(at_b.get(), 1);
    assert_eq!(at_c.get(), 1);
}

/// Property: interfaces with disjoint allowed-VLAN sets never exchange
/// frames.
#[test]
fn test_vlan_isolation_on_one_switch() {
    let mut net = network();

    let a = host(&mut net, "a", ip(10, 0, 10, 1), 24);
    let b = host(&mut net, "b", ip(10, 0, 20, 1), 24);
    let sw = switch(&mut net, "sw", 2);
    net.add_vlan(sw, "fa0/0", 10).unwrap();
    net.add_vlan(sw, "fa0/1", 20).unwrap();
    net.link(a, "eth0", sw, "fa0/0", 1).unwrap();
    net.link(b, "eth0", sw, "fa0/1", 1).unwrap();

    let at_b = any_frame_counter(&net, b);

    broadcast_data(&mut net, a);
    net.run_for(secs(1));

    assert_eq!(at_b.get(), 0);
}

/// MAC-table aging: entries older than 300 s are swept, and traffic to
/// the aged-out address floods again.
#[test]
fn test_mac_aging_restores_flooding() {
    let mut net = network();

    let a = host(&mut net, "a", ip(10, 0, 0, 1), 24);
    let b = host(&mut net, "b", ip(10, 0, 0, 2), 24);
    let c = host(&mut net, "c", ip(10, 0, 0, 3), 24);
    let sw = switch(&mut net, "sw", 3);
    net.link(a, "eth0", sw, "fa0/0", 1).unwrap();
    net.link(b, "eth0", sw, "fa0/1", 1).unwrap();
    net.link(c, "eth0", sw, "fa0/2", 1).unwrap();

    broadcast_data(&mut net, a);
    net.run_for(secs(1));
    assert!(net.mac_table_len(sw).unwrap() >= 1);

    // Nothing refreshes A for over five minutes.
    net.run_for(secs(320));
    assert_eq!(net.mac_table_len(sw).unwrap(), 0);

    let at_c = any_frame_counter(&net, c);
    let a_mac = mac_of(&net, a, 0);
    let b_mac = mac_of(&net, b, 0);
    let frame = Message::ethernet(b_mac, a_mac, EtherPayload::Data(vec![1]));
    net.transmit(b, 0, frame).unwrap();
    net.run_for(secs(1));

    assert_eq!(at_c.get(), 1, "aged-out destination floods again");
}
