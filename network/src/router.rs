//! Router data plane
//!
//! Longest-prefix routing table, TTL handling with ICMP Time Exceeded,
//! and per-interface egress selection. No-route packets are dropped
//! silently — loss is the correct model; only TTL exhaustion answers
//! back.

use alloc::vec::Vec;

use crate::bgp::BgpService;
use crate::hsrp::HsrpService;
use crate::listener::Disposition;
use crate::message::{IcmpPacket, Ipv4Packet, Ipv4Payload};
use crate::network::{Network, NodeId};
use crate::ospf::OspfService;
use crate::rip::RipService;
use crate::{Ipv4Addr, Mac, NetworkError, SubnetMask};

/// One installed route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub network: Ipv4Addr,
    pub mask: SubnetMask,
    pub gateway: Ipv4Addr,
}

/// Unordered route set with longest-prefix lookup.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: Vec<RouteEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable::default()
    }

    /// Install a route; the exact `(network, mask, gateway)` triple may
    /// exist only once.
    pub fn add_route(
        &mut self,
        network: Ipv4Addr,
        mask: SubnetMask,
        gateway: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        let entry = RouteEntry {
            network,
            mask,
            gateway,
        };
        if self.routes.contains(&entry) {
            return Err(NetworkError::RouteExists);
        }
        self.routes.push(entry);
        Ok(())
    }

    pub fn delete_route(
        &mut self,
        network: Ipv4Addr,
        mask: SubnetMask,
        gateway: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        let entry = RouteEntry {
            network,
            mask,
            gateway,
        };
        match self.routes.iter().position(|r| *r == entry) {
            Some(index) => {
                self.routes.remove(index);
                Ok(())
            }
            None => Err(NetworkError::RouteNotFound),
        }
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Longest-prefix match over the installed routes only.
    pub fn next_hop_via_table(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        self.routes
            .iter()
            .filter(|r| r.network.same_network(r.mask, dst))
            .max_by_key(|r| r.mask.cidr())
            .map(|r| r.gateway)
    }
}

/// Per-router state: static table plus routing/support services.
#[derive(Debug, Default)]
pub struct RouterState {
    pub table: RoutingTable,
    pub rip: Option<RipService>,
    pub ospf: Option<OspfService>,
    pub bgp: Option<BgpService>,
    pub hsrp: Option<HsrpService>,
}

/// Cancel every outstanding subscription the router's services own.
pub(crate) fn teardown(router: &mut RouterState) {
    if let Some(rip) = router.rip.as_mut() {
        rip.cancel_timers();
    }
    if let Some(ospf) = router.ospf.as_mut() {
        ospf.cancel_timers();
    }
    if let Some(bgp) = router.bgp.as_mut() {
        bgp.cancel_timers();
    }
    if let Some(hsrp) = router.hsrp.as_mut() {
        hsrp.cancel_timers();
    }
}

// ── Forwarding ──────────────────────────────────────────────

/// Forward a transit packet. Called for IPv4 destinations that are not
/// local to this router.
pub(crate) fn forward(
    net: &mut Network,
    node: NodeId,
    in_iface: usize,
    src_mac: Mac,
    mut packet: Ipv4Packet,
) -> Disposition {
    // Link-local broadcasts are never forwarded.
    if packet.dst.is_broadcast() {
        return Disposition::Continue;
    }

    if packet.ttl <= 1 {
        // Time Exceeded, sourced from the ingress interface, straight
        // back to the previous hop's MAC. The original dies here.
        let src_ip = match net.iface(node, in_iface) {
            Ok(i) => i.net.ip,
            Err(_) => None,
        };
        if let Some(src_ip) = src_ip {
            let reply = Ipv4Packet::new(
                src_ip,
                packet.src,
                Ipv4Payload::Icmp(IcmpPacket::time_exceeded()),
            );
            net.frame_to(node, in_iface, src_mac, reply);
        }
        log::trace!("router: TTL exhausted for {}", packet.dst);
        return Disposition::Handled;
    }
    packet.ttl -= 1;

    let Some((egress, next_hop)) = next_hop(net, node, packet.dst) else {
        log::trace!("router: no route to {}", packet.dst);
        return Disposition::Continue;
    };
    net.resolve_and_send(node, egress, next_hop, packet);
    Disposition::Handled
}

/// Longest-prefix next-hop resolution: installed routes first, then
/// directly connected subnets. Returns the egress interface and the
/// next-hop address.
pub(crate) fn next_hop(net: &Network, node: NodeId, dst: Ipv4Addr) -> Option<(usize, Ipv4Addr)> {
    let n = net.node(node).ok()?;
    let router = n.as_router()?;

    if let Some(gw) = router.table.next_hop_via_table(dst) {
        // Egress: the interface whose subnet contains the gateway.
        for (index, ifr) in n.ifaces.iter().enumerate() {
            if ifr.up && ifr.on_link(gw) {
                return Some((index, gw));
            }
        }
        return None;
    }

    // Directly connected, longest prefix wins.
    n.ifaces
        .iter()
        .enumerate()
        .filter(|(_, ifr)| ifr.up && ifr.on_link(dst))
        .max_by_key(|(_, ifr)| ifr.subnet().map(|(_, m)| m.cidr()).unwrap_or(0))
        .map(|(index, _)| (index, dst))
}

// ── Public routing-table surface ────────────────────────────

impl Network {
    fn router_mut(&mut self, node: NodeId) -> Result<&mut RouterState, NetworkError> {
        self.node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)
    }

    fn router_of(&self, node: NodeId) -> Result<&RouterState, NetworkError> {
        self.node(node)?.as_router().ok_or(NetworkError::NotARouter)
    }

    pub fn add_route(
        &mut self,
        node: NodeId,
        network: Ipv4Addr,
        mask: SubnetMask,
        gateway: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        self.router_mut(node)?.table.add_route(network, mask, gateway)
    }

    pub fn delete_route(
        &mut self,
        node: NodeId,
        network: Ipv4Addr,
        mask: SubnetMask,
        gateway: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        self.router_mut(node)?
            .table
            .delete_route(network, mask, gateway)
    }

    /// Snapshot of the static routing table.
    pub fn routing_table(&self, node: NodeId) -> Result<Vec<RouteEntry>, NetworkError> {
        Ok(self.router_of(node)?.table.routes().to_vec())
    }

    /// Longest-prefix next-hop for a destination, `None` when unroutable.
    pub fn next_hop(&self, node: NodeId, dst: Ipv4Addr) -> Result<Option<Ipv4Addr>, NetworkError> {
        self.router_of(node)?;
        Ok(next_hop(self, node, dst).map(|(_, gw)| gw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(cidr: u8) -> SubnetMask {
        SubnetMask::from_cidr(cidr).unwrap()
    }

    #[test]
    fn test_add_delete_round_trip() {
        let mut table = RoutingTable::new();
        let net_ = Ipv4Addr::new(10, 1, 0, 0);
        let gw = Ipv4Addr::new(192, 168, 0, 1);

        table.add_route(net_, mask(16), gw).unwrap();
        assert_eq!(
            table.add_route(net_, mask(16), gw),
            Err(NetworkError::RouteExists)
        );
        table.delete_route(net_, mask(16), gw).unwrap();
        assert!(table.is_empty());
        assert_eq!(
            table.delete_route(net_, mask(16), gw),
            Err(NetworkError::RouteNotFound)
        );
    }

    #[test]
    fn test_same_network_different_gateway_is_distinct() {
        let mut table = RoutingTable::new();
        let net_ = Ipv4Addr::new(10, 1, 0, 0);
        table
            .add_route(net_, mask(16), Ipv4Addr::new(192, 168, 0, 1))
            .unwrap();
        table
            .add_route(net_, mask(16), Ipv4Addr::new(192, 168, 0, 2))
            .unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut table = RoutingTable::new();
        let gw_wide = Ipv4Addr::new(10, 0, 0, 1);
        let gw_narrow = Ipv4Addr::new(10, 0, 0, 2);
        table
            .add_route(Ipv4Addr::new(172, 16, 0, 0), mask(12), gw_wide)
            .unwrap();
        table
            .add_route(Ipv4Addr::new(172, 16, 4, 0), mask(24), gw_narrow)
            .unwrap();

        assert_eq!(
            table.next_hop_via_table(Ipv4Addr::new(172, 16, 4, 77)),
            Some(gw_narrow)
        );
        assert_eq!(
            table.next_hop_via_table(Ipv4Addr::new(172, 16, 9, 1)),
            Some(gw_wide)
        );
        assert_eq!(table.next_hop_via_table(Ipv4Addr::new(8, 8, 8, 8)), None);
    }
}
