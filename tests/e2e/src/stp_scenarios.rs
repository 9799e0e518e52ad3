//! Spanning tree scenarios: triangle convergence, RSTP rapid
//! transitions, PVST per-VLAN instances.

use netlab_clock::secs;
use netlab_network::iface::VlanMode;
use netlab_network::stp::{PortRole, PortState, StpProtocol};
use netlab_network::{Network, NetworkError, NodeId};

use crate::topo::{host, ip, network, switch};

fn roles(net: &Network, node: NodeId) -> (PortRole, PortRole) {
    (
        net.stp_port_role(node, "fa0/0", None).unwrap(),
        net.stp_port_role(node, "fa0/1", None).unwrap(),
    )
}

fn states(net: &Network, node: NodeId) -> (PortState, PortState) {
    (
        net.stp_port_state(node, "fa0/0", None).unwrap(),
        net.stp_port_state(node, "fa0/1", None).unwrap(),
    )
}

/// Scenario S2: fully meshed triangle. The switch with the lowest MAC
/// wins the election; its ports are Designated and Forwarding; the
/// highest-MAC switch blocks its port on the redundant segment, so the
/// forwarding subgraph is a tree.
#[test]
fn test_triangle_converges_loop_free() {
    let mut net = network();

    // Creation order fixes MAC ordering: a < b < c.
    let a = switch(&mut net, "sw-a", 2);
    let b = switch(&mut net, "sw-b", 2);
    let c = switch(&mut net, "sw-c", 2);

    net.link(a, "fa0/0", b, "fa0/0", 1).unwrap();
    net.link(a, "fa0/1", c, "fa0/0", 1).unwrap();
    net.link(b, "fa0/1", c, "fa0/1", 1).unwrap();

    for s in [a, b, c] {
        net.set_stp_protocol(s, StpProtocol::Stp).unwrap();
    }
    net.run_for(secs(60));

    // Single root: exactly the lowest bridge, and it agrees with itself.
    assert!(net.stp_is_root(a).unwrap());
    assert!(!net.stp_is_root(b).unwrap());
    assert!(!net.stp_is_root(c).unwrap());
    let root = net.stp_bridge_id(a).unwrap();
    assert_eq!(net.stp_root(a, None).unwrap(), root);
    assert_eq!(net.stp_root(b, None).unwrap(), root);
    assert_eq!(net.stp_root(c, None).unwrap(), root);

    // Root bridge: only Designated, all Forwarding.
    assert_eq!(roles(&net, a), (PortRole::Designated, PortRole::Designated));
    assert_eq!(states(&net, a), (PortState::Forwarding, PortState::Forwarding));

    // b: root port towards a, designated on the b—c segment (lower id).
    assert_eq!(roles(&net, b), (PortRole::Root, PortRole::Designated));

    // c: root port towards a, blocked on the redundant segment.
    assert_eq!(roles(&net, c), (PortRole::Root, PortRole::Blocked));
    assert_eq!(net.stp_port_state(c, "fa0/1", None).unwrap(), PortState::Blocking);

    // Loop freedom: the redundant segment contributes no forwarding
    // edge, leaving a tree of two links over three bridges.
    let blocking = [a, b, c]
        .iter()
        .flat_map(|&s| ["fa0/0", "fa0/1"].map(|p| net.stp_port_state(s, p, None).unwrap()))
        .filter(|st| *st == PortState::Blocking)
        .count();
    assert_eq!(blocking, 1);

    // Costs: one hop from the root on both root ports.
    assert_eq!(net.stp_port_cost(b, "fa0/0", None).unwrap(), 10);
    assert_eq!(net.stp_port_cost(c, "fa0/0", None).unwrap(), 10);
}

/// Losing the root uplink forces a re-election: the survivor declares
/// itself root once the cached information ages out.
#[test]
fn test_root_loss_triggers_reelection() {
    let mut net = network();
    let a = switch(&mut net, "sw-a", 1);
    let b = switch(&mut net, "sw-b", 1);
    net.link(a, "fa0/0", b, "fa0/0", 1).unwrap();
    net.set_stp_protocol(a, StpProtocol::Stp).unwrap();
    net.set_stp_protocol(b, StpProtocol::Stp).unwrap();

    net.run_for(secs(40));
    assert!(net.stp_is_root(a).unwrap());
    assert!(!net.stp_is_root(b).unwrap());

    // Root disappears; b's BPDU age timer (20 s) expires and b claims
    // the role. The port role change flows from the link loss, the
    // timer covers the silent-root case as well.
    net.remove_node(a).unwrap();
    net.run_for(secs(25));
    assert!(net.stp_is_root(b).unwrap());
}

/// RSTP: proposal/agreement on a point-to-point link reaches Forwarding
/// without waiting out two forward delays.
#[test]
fn test_rstp_rapid_transition() {
    let mut net = network();
    let a = switch(&mut net, "sw-a", 1);
    let b = switch(&mut net, "sw-b", 1);
    net.link(a, "fa0/0", b, "fa0/0", 1).unwrap();
    net.set_stp_protocol(a, StpProtocol::Rstp).unwrap();
    net.set_stp_protocol(b, StpProtocol::Rstp).unwrap();

    // Well under the 30 s ladder.
    net.run_for(secs(10));
    assert_eq!(net.stp_port_state(a, "fa0/0", None).unwrap(), PortState::Forwarding);
    assert_eq!(net.stp_port_state(b, "fa0/0", None).unwrap(), PortState::Forwarding);
    assert_eq!(net.stp_port_role(b, "fa0/0", None).unwrap(), PortRole::Root);
}

/// RSTP: a port that never hears a BPDU becomes an edge port and
/// forwards immediately.
#[test]
fn test_rstp_edge_port() {
    let mut net = network();
    let sw = switch(&mut net, "sw", 1);
    let pc = host(&mut net, "pc", ip(10, 0, 0, 1), 24);
    net.link(pc, "eth0", sw, "fa0/0", 1).unwrap();
    net.set_stp_protocol(sw, StpProtocol::Rstp).unwrap();

    net.run_for(secs(5));
    assert_eq!(net.stp_port_state(sw, "fa0/0", None).unwrap(), PortState::Forwarding);
}

/// PVST: one instance per VLAN, shared bridge id, per-VLAN queries.
#[test]
fn test_pvst_runs_per_vlan() {
    let mut net = network();
    let a = switch(&mut net, "sw-a", 1);
    let b = switch(&mut net, "sw-b", 1);

    for s in [a, b] {
        net.set_vlan_mode(s, "fa0/0", VlanMode::Trunk).unwrap();
        net.add_vlan(s, "fa0/0", 10).unwrap();
        net.add_vlan(s, "fa0/0", 20).unwrap();
    }
    net.link(a, "fa0/0", b, "fa0/0", 1).unwrap();
    net.set_stp_protocol(a, StpProtocol::Pvst).unwrap();
    net.set_stp_protocol(b, StpProtocol::Pvst).unwrap();

    net.run_for(secs(60));

    // Same root in both VLANs: a has the lower MACs.
    let bridge_a = net.stp_bridge_id(a).unwrap();
    for vlan in [10, 20] {
        assert_eq!(net.stp_root(a, Some(vlan)).unwrap(), bridge_a);
        assert_eq!(net.stp_root(b, Some(vlan)).unwrap(), bridge_a);
        assert_eq!(
            net.stp_port_role(b, "fa0/0", Some(vlan)).unwrap(),
            PortRole::Root
        );
        assert_eq!(
            net.stp_port_state(b, "fa0/0", Some(vlan)).unwrap(),
            PortState::Forwarding
        );
    }
    assert!(net.stp_is_root(a).unwrap());
}

/// A Listening port learns the source MAC but does not forward: the
/// data frame dies at the port, yet once the ladder reaches Forwarding
/// the destination is already known.
#[test]
fn test_listening_port_learns_without_forwarding() {
    let mut net = network();

    let a = host(&mut net, "a", ip(10, 0, 0, 1), 24);
    let b = host(&mut net, "b", ip(10, 0, 0, 2), 24);
    let sw = switch(&mut net, "sw", 2);
    net.link(a, "eth0", sw, "fa0/0", 1).unwrap();
    net.link(b, "eth0", sw, "fa0/1", 1).unwrap();
    net.set_stp_protocol(sw, StpProtocol::Stp).unwrap();

    let at_b = crate::topo::any_frame_counter(&net, b);

    // Both ports are one second into the 15 s Listening phase.
    net.run_for(secs(1));
    assert_eq!(net.stp_port_state(sw, "fa0/0", None).unwrap(), PortState::Listening);
    assert_eq!(net.mac_table_len(sw).unwrap(), 0);

    let a_mac = net.node(a).unwrap().iface(0).unwrap().mac;
    let frame = netlab_network::Message::ethernet(
        a_mac,
        netlab_network::Mac::BROADCAST,
        netlab_network::message::EtherPayload::Data(alloc::vec![1]),
    );
    net.transmit(a, 0, frame).unwrap();
    net.run_for(secs(1));

    // The source was learned, the frame was not forwarded.
    assert_eq!(net.stp_port_state(sw, "fa0/0", None).unwrap(), PortState::Listening);
    assert_eq!(net.mac_table_len(sw).unwrap(), 1);
    assert_eq!(at_b.get(), 0);

    // After the ladder completes, traffic towards A forwards out
    // fa0/0 only — the Listening-phase learning already placed it.
    net.run_for(secs(35));
    assert_eq!(net.stp_port_state(sw, "fa0/1", None).unwrap(), PortState::Forwarding);
    let b_mac = net.node(b).unwrap().iface(0).unwrap().mac;
    let reply = netlab_network::Message::ethernet(
        b_mac,
        a_mac,
        netlab_network::message::EtherPayload::Data(alloc::vec![2]),
    );
    let at_a = crate::topo::any_frame_counter(&net, a);
    net.transmit(b, 0, reply).unwrap();
    net.run_for(secs(1));
    assert_eq!(at_a.get(), 1);
}

/// The unimplemented dialects are rejected up front.
#[test]
fn test_unimplemented_variants() {
    let mut net = network();
    let sw = switch(&mut net, "sw", 1);
    assert!(matches!(
        net.set_stp_protocol(sw, StpProtocol::Mstp),
        Err(NetworkError::NotImplemented(_))
    ));
    assert!(matches!(
        net.set_stp_protocol(sw, StpProtocol::RPvst),
        Err(NetworkError::NotImplemented(_))
    ));
}
