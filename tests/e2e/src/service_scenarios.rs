//! Support-service scenarios: DHCP lease acquisition, HSRP election and
//! failover, OSPF adjacency, BGP session establishment.

use netlab_clock::secs;
use netlab_network::bgp::BgpSessionState;
use netlab_network::dhcp::{DhcpClientState, DhcpServerConfig};
use netlab_network::hsrp::{HsrpConfig, HsrpState};
use netlab_network::ospf::{OspfConfig, OspfNeighborState};
use netlab_network::{Ipv4Addr, Network, NodeId};

use crate::topo::{echo_reply_counter, host, ip, mask, network, switch};

fn router(net: &mut Network, name: &str, addrs: &[(&str, Ipv4Addr, u8)]) -> NodeId {
    let id = net.add_router(name);
    for (iface, addr, prefix) in addrs {
        net.add_interface(id, iface).unwrap();
        net.set_ip(id, iface, *addr).unwrap();
        net.set_mask(id, iface, mask(*prefix)).unwrap();
    }
    id
}

/// Discover → offer → request → ack, applied to the interface.
#[test]
fn test_dhcp_lease_acquisition() {
    let mut net = network();

    let server = net.add_server("dhcp-server");
    net.add_interface(server, "eth0").unwrap();
    net.set_ip(server, "eth0", ip(192, 168, 0, 1)).unwrap();
    net.set_mask(server, "eth0", mask(24)).unwrap();
    net.dhcp_server_enable(
        server,
        DhcpServerConfig {
            pool_start: ip(192, 168, 0, 100),
            pool_end: ip(192, 168, 0, 110),
            mask: mask(24),
            gateway: Some(ip(192, 168, 0, 1)),
            dns: Some(ip(192, 168, 0, 1)),
            lease_secs: 3600,
        },
    )
    .unwrap();

    let client = net.add_host("pc");
    net.add_interface(client, "eth0").unwrap();
    net.link(client, "eth0", server, "eth0", 1).unwrap();

    net.dhcp_client_start(client, "eth0").unwrap();
    net.run_for(secs(1));

    assert_eq!(
        net.dhcp_client_state(client).unwrap(),
        DhcpClientState::Bound
    );
    assert_eq!(net.dhcp_lease_count(server).unwrap(), 1);

    let iface = net.node(client).unwrap().iface(0).unwrap();
    assert_eq!(iface.net.ip, Some(ip(192, 168, 0, 100)));
    assert_eq!(iface.net.mask, Some(mask(24)));
    assert_eq!(iface.net.gateway, Some(ip(192, 168, 0, 1)));
}

/// Two clients share one pool without colliding.
#[test]
fn test_dhcp_two_clients_distinct_leases() {
    let mut net = network();

    let server = net.add_server("dhcp-server");
    net.add_interface(server, "eth0").unwrap();
    net.set_ip(server, "eth0", ip(192, 168, 0, 1)).unwrap();
    net.set_mask(server, "eth0", mask(24)).unwrap();
    net.dhcp_server_enable(
        server,
        DhcpServerConfig {
            pool_start: ip(192, 168, 0, 100),
            pool_end: ip(192, 168, 0, 110),
            mask: mask(24),
            gateway: None,
            dns: None,
            lease_secs: 3600,
        },
    )
    .unwrap();

    let sw = switch(&mut net, "sw", 3);
    let pc1 = net.add_host("pc1");
    let pc2 = net.add_host("pc2");
    net.add_interface(pc1, "eth0").unwrap();
    net.add_interface(pc2, "eth0").unwrap();
    net.link(server, "eth0", sw, "fa0/0", 1).unwrap();
    net.link(pc1, "eth0", sw, "fa0/1", 1).unwrap();
    net.link(pc2, "eth0", sw, "fa0/2", 1).unwrap();

    net.dhcp_client_start(pc1, "eth0").unwrap();
    net.dhcp_client_start(pc2, "eth0").unwrap();
    net.run_for(secs(2));

    assert_eq!(net.dhcp_lease_count(server).unwrap(), 2);
    let ip1 = net.node(pc1).unwrap().iface(0).unwrap().net.ip.unwrap();
    let ip2 = net.node(pc2).unwrap().iface(0).unwrap().net.ip.unwrap();
    assert_ne!(ip1, ip2);
}

/// Election by (priority, address), virtual-address ownership, and
/// failover when the active router dies.
#[test]
fn test_hsrp_election_and_failover() {
    let mut net = network();

    let r1 = router(&mut net, "r1", &[("eth0", ip(192, 168, 0, 2), 24)]);
    let r2 = router(&mut net, "r2", &[("eth0", ip(192, 168, 0, 3), 24)]);
    let pc = host(&mut net, "pc", ip(192, 168, 0, 10), 24);
    let sw = switch(&mut net, "sw", 3);
    net.link(r1, "eth0", sw, "fa0/0", 1).unwrap();
    net.link(r2, "eth0", sw, "fa0/1", 1).unwrap();
    net.link(pc, "eth0", sw, "fa0/2", 1).unwrap();

    let virtual_ip = ip(192, 168, 0, 1);
    let mut high = HsrpConfig::new(1, virtual_ip);
    high.priority = 110;
    let low = HsrpConfig::new(1, virtual_ip);

    net.hsrp_enable(r1, "eth0", high).unwrap();
    net.hsrp_enable(r2, "eth0", low).unwrap();
    net.run_for(secs(15));

    assert_eq!(net.hsrp_state(r1).unwrap(), HsrpState::Active);
    assert_eq!(net.hsrp_state(r2).unwrap(), HsrpState::Standby);

    // The virtual address answers ping while r1 is active.
    let replies = echo_reply_counter(&net, pc);
    net.ping(pc, virtual_ip).unwrap();
    net.run_for(secs(1));
    assert_eq!(replies.get(), 1);

    // Active dies; the standby claims the role after the hold time.
    net.iface_down(r1, "eth0").unwrap();
    net.run_for(secs(15));
    assert_eq!(net.hsrp_state(r2).unwrap(), HsrpState::Active);
}

/// Two OSPF routers reach Full and exchange their connected networks.
#[test]
fn test_ospf_adjacency_reaches_full() {
    let mut net = network();

    let r1 = router(
        &mut net,
        "r1",
        &[
            ("eth0", ip(10, 0, 12, 1), 24),
            ("eth1", ip(192, 168, 1, 1), 24),
        ],
    );
    let r2 = router(
        &mut net,
        "r2",
        &[
            ("eth0", ip(10, 0, 12, 2), 24),
            ("eth1", ip(192, 168, 2, 1), 24),
        ],
    );
    net.link(r1, "eth0", r2, "eth0", 1).unwrap();

    for r in [r1, r2] {
        net.ospf_enable(r, OspfConfig::default()).unwrap();
        net.ospf_enable_on_interface(r, "eth0").unwrap();
    }
    net.run_for(secs(15));

    let nbrs = net.ospf_neighbors(r1).unwrap();
    assert_eq!(nbrs.len(), 1);
    assert_eq!(nbrs[0].0, ip(192, 168, 2, 1)); // r2's router id: highest IP
    assert_eq!(nbrs[0].1, OspfNeighborState::Full);

    let nbrs = net.ospf_neighbors(r2).unwrap();
    assert_eq!(nbrs[0].1, OspfNeighborState::Full);

    // The advertised tables carry the neighbor's networks.
    let routes = net.ospf_routes(r1).unwrap();
    assert!(routes.iter().any(|r| r.network == ip(192, 168, 2, 0)));
    let routes = net.ospf_routes(r2).unwrap();
    assert!(routes.iter().any(|r| r.network == ip(192, 168, 1, 0)));
}

/// A dead OSPF neighbor is flushed after the dead interval.
#[test]
fn test_ospf_neighbor_death() {
    let mut net = network();
    let r1 = router(&mut net, "r1", &[("eth0", ip(10, 0, 12, 1), 24)]);
    let r2 = router(&mut net, "r2", &[("eth0", ip(10, 0, 12, 2), 24)]);
    net.link(r1, "eth0", r2, "eth0", 1).unwrap();
    for r in [r1, r2] {
        net.ospf_enable(r, OspfConfig::default()).unwrap();
        net.ospf_enable_on_interface(r, "eth0").unwrap();
    }
    net.run_for(secs(15));
    assert_eq!(net.ospf_neighbors(r1).unwrap().len(), 1);

    net.iface_down(r2, "eth0").unwrap();
    net.run_for(secs(45)); // past the 40 s dead interval
    assert!(net.ospf_neighbors(r1).unwrap().is_empty());
}

/// Two BGP speakers establish and exchange advertised prefixes.
#[test]
fn test_bgp_session_establishment() {
    let mut net = network();

    let r1 = router(&mut net, "r1", &[("eth0", ip(10, 0, 12, 1), 24)]);
    let r2 = router(&mut net, "r2", &[("eth0", ip(10, 0, 12, 2), 24)]);
    net.link(r1, "eth0", r2, "eth0", 1).unwrap();

    net.bgp_enable(r1, 65_001).unwrap();
    net.bgp_enable(r2, 65_002).unwrap();
    net.bgp_advertise(r1, ip(192, 168, 1, 0), mask(24)).unwrap();
    net.bgp_advertise(r2, ip(192, 168, 2, 0), mask(24)).unwrap();
    net.bgp_add_peer(r1, ip(10, 0, 12, 2), 65_002).unwrap();
    net.bgp_add_peer(r2, ip(10, 0, 12, 1), 65_001).unwrap();

    net.run_for(secs(5));

    let peers = net.bgp_peers(r1).unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].1, BgpSessionState::Established);
    let peers = net.bgp_peers(r2).unwrap();
    assert_eq!(peers[0].1, BgpSessionState::Established);

    let rib = net.bgp_rib(r1).unwrap();
    assert!(rib.iter().any(|r| r.network == ip(192, 168, 2, 0)));
    let rib = net.bgp_rib(r2).unwrap();
    assert!(rib.iter().any(|r| r.network == ip(192, 168, 1, 0)));
}
