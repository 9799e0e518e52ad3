//! Network arena and physical transit
//!
//! `Network` exclusively owns every node and link, keyed by stable
//! handles; all cross-references (link endpoints, MAC-table entries,
//! service back-references) are handle lookups, never direct ownership.
//! Frame transit across a link is a scheduled clock event: transmitting
//! schedules delivery on the peer after the link's propagation delay.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use netlab_clock::{millis, Scheduler, Subscription, Ticks};

use crate::dhcp;
use crate::iface::{Interface, VlanMode};
use crate::listener::{Disposition, ListenerId, NodeEvent};
use crate::message::{
    ArpOp, ArpPacket, EtherPayload, IcmpPacket, Ipv4Packet, Ipv4Payload, Message,
};
use crate::node::{HostState, Node, NodeKind, ServerState};
use crate::router::{self, RouterState};
use crate::stp;
use crate::switch::{self, SwitchState};
use crate::{arp, hsrp, Ipv4Addr, Mac, NetworkError, SubnetMask, VlanId};

/// Scheduler driving a `Network`.
pub type Clock = Scheduler<Network>;
/// Cancellation handle for a timer owned by a service.
pub type ClockSub = Subscription<Network>;

/// Stable handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

/// Stable handle to a link in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub(crate) u32);

/// One side of a link: node handle plus interface index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub node: NodeId,
    pub iface: usize,
}

/// Unordered pair of interfaces plus propagation delay.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
    pub delay: Ticks,
}

impl Link {
    /// The endpoint opposite `(node, iface)`.
    pub fn peer_of(&self, node: NodeId, iface: usize) -> Option<Endpoint> {
        if self.a.node == node && self.a.iface == iface {
            Some(self.b)
        } else if self.b.node == node && self.b.iface == iface {
            Some(self.a)
        } else {
            None
        }
    }
}

pub struct Network {
    pub(crate) clock: Clock,
    nodes: Vec<Option<Node>>,
    links: Vec<Option<Link>>,
    next_mac: u64,
}

impl core::fmt::Debug for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Network")
            .field("nodes", &self.nodes.iter().flatten().count())
            .field("links", &self.links.iter().flatten().count())
            .finish()
    }
}

impl Network {
    pub fn new(clock: Clock) -> Self {
        Network {
            clock,
            nodes: Vec::new(),
            links: Vec::new(),
            next_mac: 1,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn now(&self) -> Ticks {
        self.clock.now()
    }

    /// Pump the simulation forward by `dt` virtual ticks.
    pub fn run_for(&mut self, dt: Ticks) {
        let clock = self.clock.clone();
        clock.advance(dt, self);
    }

    // ── Node lifecycle ──────────────────────────────────────

    fn insert(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    pub fn add_host(&mut self, name: &str) -> NodeId {
        self.insert(Node::new(
            name.to_string(),
            NodeKind::Host(HostState::default()),
        ))
    }

    pub fn add_server(&mut self, name: &str) -> NodeId {
        self.insert(Node::new(
            name.to_string(),
            NodeKind::Server(ServerState::default()),
        ))
    }

    pub fn add_router(&mut self, name: &str) -> NodeId {
        self.insert(Node::new(
            name.to_string(),
            NodeKind::Router(RouterState::default()),
        ))
    }

    pub fn add_switch(&mut self, name: &str) -> NodeId {
        let id = self.insert(Node::new(
            name.to_string(),
            NodeKind::Switch(SwitchState::default()),
        ));
        switch::start_aging(self, id);
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, NetworkError> {
        self.nodes
            .get(id.0 as usize)
            .and_then(|n| n.as_ref())
            .ok_or(NetworkError::NoSuchNode)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, NetworkError> {
        self.nodes
            .get_mut(id.0 as usize)
            .and_then(|n| n.as_mut())
            .ok_or(NetworkError::NoSuchNode)
    }

    /// Remove a node: detach every link touching it and cancel all
    /// outstanding service subscriptions.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), NetworkError> {
        self.node(id)?;

        let touching: Vec<LinkId> = self
            .links
            .iter()
            .enumerate()
            .filter_map(|(i, l)| {
                l.filter(|l| l.a.node == id || l.b.node == id)
                    .map(|_| LinkId(i as u32))
            })
            .collect();
        for link in touching {
            let _ = self.unlink(link);
        }

        stp::teardown(self, id);
        let node = self.node_mut(id)?;
        match &mut node.kind {
            NodeKind::Switch(sw) => {
                if let Some(sub) = sw.aging.take() {
                    sub.cancel();
                }
            }
            NodeKind::Router(r) => router::teardown(r),
            NodeKind::Host(h) => {
                if let Some(client) = h.dhcp.as_mut() {
                    client.teardown();
                }
            }
            NodeKind::Server(s) => {
                if let Some(server) = s.dhcp.as_mut() {
                    server.teardown();
                }
            }
        }

        self.nodes[id.0 as usize] = None;
        Ok(())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|_| NodeId(i as u32)))
            .collect()
    }

    // ── Interfaces ──────────────────────────────────────────

    /// Add an interface with an auto-assigned MAC. Returns its index.
    pub fn add_interface(&mut self, node: NodeId, name: &str) -> Result<usize, NetworkError> {
        let mac = self.alloc_mac();
        self.add_interface_with_mac(node, name, mac)
    }

    pub fn add_interface_with_mac(
        &mut self,
        node: NodeId,
        name: &str,
        mac: Mac,
    ) -> Result<usize, NetworkError> {
        let n = self.node_mut(node)?;
        let index = n.ifaces.len();
        n.ifaces.push(Interface::new(name.to_string(), mac));
        self.emit(node, &NodeEvent::InterfaceAdded { iface: name });
        stp::port_refresh(self, node, index);
        Ok(index)
    }

    fn alloc_mac(&mut self) -> Mac {
        let v = self.next_mac;
        self.next_mac += 1;
        // Locally administered block 02:xx:...
        let b = v.to_be_bytes();
        Mac([0x02, b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn iface_index(&self, node: NodeId, name: &str) -> Result<usize, NetworkError> {
        self.node(node)?
            .iface_index(name)
            .ok_or_else(|| NetworkError::NoSuchInterface(name.to_string()))
    }

    pub(crate) fn iface(&self, node: NodeId, index: usize) -> Result<&Interface, NetworkError> {
        self.node(node)?
            .iface(index)
            .ok_or_else(|| NetworkError::NoSuchInterface(format!("#{}", index)))
    }

    pub(crate) fn iface_mut(
        &mut self,
        node: NodeId,
        index: usize,
    ) -> Result<&mut Interface, NetworkError> {
        self.node_mut(node)?
            .iface_mut(index)
            .ok_or_else(|| NetworkError::NoSuchInterface(format!("#{}", index)))
    }

    // ── Links ───────────────────────────────────────────────

    /// Connect two interfaces with the given propagation delay (ms).
    ///
    /// Endpoints must be distinct interfaces; connecting two interfaces
    /// of the same node builds the intentional loopback self-link.
    pub fn link(
        &mut self,
        a_node: NodeId,
        a_iface: &str,
        b_node: NodeId,
        b_iface: &str,
        delay_ms: u64,
    ) -> Result<LinkId, NetworkError> {
        let a = Endpoint {
            node: a_node,
            iface: self.iface_index(a_node, a_iface)?,
        };
        let b = Endpoint {
            node: b_node,
            iface: self.iface_index(b_node, b_iface)?,
        };
        if a == b {
            return Err(NetworkError::SameInterfaceLink);
        }
        if self.iface(a.node, a.iface)?.is_connected() || self.iface(b.node, b.iface)?.is_connected()
        {
            return Err(NetworkError::DuplicateLink);
        }

        let id = LinkId(self.links.len() as u32);
        self.links.push(Some(Link {
            a,
            b,
            delay: millis(delay_ms),
        }));
        self.iface_mut(a.node, a.iface)?.link = Some(id);
        self.iface_mut(b.node, b.iface)?.link = Some(id);

        stp::port_refresh(self, a.node, a.iface);
        stp::port_refresh(self, b.node, b.iface);
        Ok(id)
    }

    pub fn unlink(&mut self, id: LinkId) -> Result<(), NetworkError> {
        let link = self
            .links
            .get(id.0 as usize)
            .and_then(|l| *l)
            .ok_or(NetworkError::NoSuchLink)?;
        self.links[id.0 as usize] = None;
        for ep in [link.a, link.b] {
            if let Ok(iface) = self.iface_mut(ep.node, ep.iface) {
                iface.link = None;
            }
            stp::port_refresh(self, ep.node, ep.iface);
        }
        Ok(())
    }

    pub(crate) fn link_of(&self, id: LinkId) -> Option<Link> {
        self.links.get(id.0 as usize).and_then(|l| *l)
    }

    // ── Interface control ───────────────────────────────────

    pub fn iface_up(&mut self, node: NodeId, name: &str) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.up = true;
        self.emit(node, &NodeEvent::InterfaceUp { iface: name });
        stp::port_refresh(self, node, index);
        Ok(())
    }

    pub fn iface_down(&mut self, node: NodeId, name: &str) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.up = false;
        self.emit(node, &NodeEvent::InterfaceDown { iface: name });
        stp::port_refresh(self, node, index);
        switch::flush_iface(self, node, index);
        Ok(())
    }

    pub fn set_speed(&mut self, node: NodeId, name: &str, speed: u32) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.set_speed(speed)?;
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        Ok(())
    }

    pub fn set_full_duplex(
        &mut self,
        node: NodeId,
        name: &str,
        full: bool,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.set_full_duplex(full)?;
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        Ok(())
    }

    pub fn set_mac(&mut self, node: NodeId, name: &str, mac: Mac) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.mac = mac;
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        Ok(())
    }

    pub fn set_ip(&mut self, node: NodeId, name: &str, ip: Ipv4Addr) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.set_ip(ip);
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        Ok(())
    }

    pub fn set_mask(
        &mut self,
        node: NodeId,
        name: &str,
        mask: SubnetMask,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.set_mask(mask);
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        Ok(())
    }

    pub fn set_gateway(
        &mut self,
        node: NodeId,
        name: &str,
        gateway: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.net.gateway = Some(gateway);
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        Ok(())
    }

    pub fn add_vlan(&mut self, node: NodeId, name: &str, vlan: VlanId) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.vlan.add(vlan)?;
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        stp::vlans_changed(self, node);
        Ok(())
    }

    pub fn remove_vlan(
        &mut self,
        node: NodeId,
        name: &str,
        vlan: VlanId,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.vlan.remove(vlan)?;
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        Ok(())
    }

    pub fn set_vlan_mode(
        &mut self,
        node: NodeId,
        name: &str,
        mode: VlanMode,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.vlan.mode = mode;
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        Ok(())
    }

    pub fn set_native_vlan(
        &mut self,
        node: NodeId,
        name: &str,
        vlan: VlanId,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, name)?;
        self.iface_mut(node, index)?.vlan.set_native(vlan)?;
        self.emit(node, &NodeEvent::InterfaceChange { iface: name });
        stp::vlans_changed(self, node);
        Ok(())
    }

    // ── Listeners ───────────────────────────────────────────

    pub fn add_listener(
        &self,
        node: NodeId,
        listener: impl FnMut(&NodeEvent<'_>) -> Disposition + 'static,
    ) -> Result<ListenerId, NetworkError> {
        Ok(self.node(node)?.listeners.add(listener))
    }

    pub fn remove_listener(&self, node: NodeId, id: ListenerId) -> Result<(), NetworkError> {
        self.node(node)?.listeners.remove(id);
        Ok(())
    }

    pub(crate) fn emit(&self, node: NodeId, event: &NodeEvent<'_>) {
        if let Ok(n) = self.node(node) {
            n.listeners.dispatch(event);
        }
    }

    // ── Physical transit ────────────────────────────────────

    /// Send a frame out an interface. Arrival on the peer is scheduled
    /// after the link's propagation delay. Fails with `LinkDown` when the
    /// interface is administratively down or not connected; a down
    /// receiver drops silently.
    pub fn transmit(
        &mut self,
        node: NodeId,
        iface: usize,
        message: Message,
    ) -> Result<(), NetworkError> {
        let ifr = self.iface(node, iface)?;
        if !ifr.up {
            return Err(NetworkError::LinkDown);
        }
        let own_mac = ifr.mac;
        let link_id = ifr.link.ok_or(NetworkError::LinkDown)?;
        let link = self.link_of(link_id).ok_or(NetworkError::LinkDown)?;

        // Loopback: a frame addressed to the sender's own MAC comes back
        // to the sender after the propagation delay.
        let target = if message.dst() == own_mac {
            Endpoint { node, iface }
        } else {
            link.peer_of(node, iface).ok_or(NetworkError::LinkDown)?
        };

        let clock = self.clock.clone();
        clock.once(link.delay, move |net: &mut Network, _| {
            net.deliver(target.node, target.iface, message.clone());
        });
        Ok(())
    }

    /// Frame arrival: run the built-in pipeline for the node variant,
    /// then let external listeners observe the event unless the pipeline
    /// stopped the chain.
    pub(crate) fn deliver(&mut self, node: NodeId, iface: usize, message: Message) {
        let (up, name) = match self.iface(node, iface) {
            Ok(i) => (i.up, i.name.clone()),
            Err(_) => return, // endpoint destroyed mid-flight
        };
        if !up {
            log::trace!("frame dropped: receiving interface {} is down", name);
            return;
        }

        let is_switch = match self.node(node) {
            Ok(n) => n.is_switch(),
            Err(_) => return,
        };
        let disposition = if is_switch {
            switch::receive_frame(self, node, iface, &message)
        } else {
            self.receive_host_frame(node, iface, &message)
        };

        if disposition != Disposition::Stop {
            self.emit(
                node,
                &NodeEvent::Frame {
                    iface: &name,
                    message: &message,
                },
            );
        }
    }

    // ── Host/router receive path ────────────────────────────

    fn receive_host_frame(
        &mut self,
        node: NodeId,
        iface: usize,
        message: &Message,
    ) -> Disposition {
        let ifr = match self.iface(node, iface) {
            Ok(i) => i,
            Err(_) => return Disposition::Continue,
        };
        let own_mac = ifr.mac;
        let dst = message.dst();

        // NIC filter: accept broadcast, our MAC, or an HSRP virtual MAC
        // this router currently answers for.
        let virtual_ok = hsrp::accepts_mac(self, node, dst);
        if !dst.is_broadcast() && dst != own_mac && !virtual_ok {
            return Disposition::Continue;
        }

        match message.payload().clone() {
            EtherPayload::Arp(packet) => self.receive_arp(node, iface, &packet),
            EtherPayload::Ipv4(packet) => {
                self.receive_ipv4(node, iface, message.src(), packet)
            }
            // End stations ignore bridge traffic.
            EtherPayload::Bpdu(_) => Disposition::Continue,
            EtherPayload::Data(_) => Disposition::Handled,
        }
    }

    fn receive_arp(&mut self, node: NodeId, iface: usize, packet: &ArpPacket) -> Disposition {
        let now = self.now();
        let ifr = match self.iface_mut(node, iface) {
            Ok(i) => i,
            Err(_) => return Disposition::Continue,
        };
        ifr.net.arp.learn(packet.sender_ip, packet.sender_mac, now);
        let own_mac = ifr.mac;
        let own_ip = ifr.net.ip;

        match packet.op {
            ArpOp::Request => {
                // Answer for our own address, or for an HSRP virtual
                // address this router is active for.
                if own_ip == Some(packet.target_ip) {
                    let reply = arp::reply(own_mac, packet.target_ip, packet);
                    let frame =
                        Message::ethernet(own_mac, packet.sender_mac, EtherPayload::Arp(reply));
                    let _ = self.transmit(node, iface, frame);
                } else if let Some(vmac) = hsrp::virtual_mac_for(self, node, packet.target_ip) {
                    let reply = arp::reply(vmac, packet.target_ip, packet);
                    let frame =
                        Message::ethernet(vmac, packet.sender_mac, EtherPayload::Arp(reply));
                    let _ = self.transmit(node, iface, frame);
                }
                Disposition::Handled
            }
            ArpOp::Reply => {
                // Resolution complete: flush the pending queue.
                let resolved = packet.sender_ip;
                let mac = packet.sender_mac;
                let pending = match self.iface_mut(node, iface) {
                    Ok(i) => i.net.arp.take_pending(resolved),
                    Err(_) => Vec::new(),
                };
                for pkt in pending {
                    self.frame_to(node, iface, mac, pkt);
                }
                Disposition::Handled
            }
        }
    }

    pub(crate) fn receive_ipv4(
        &mut self,
        node: NodeId,
        iface: usize,
        src_mac: Mac,
        packet: Ipv4Packet,
    ) -> Disposition {
        let now = self.now();
        if let Ok(ifr) = self.iface_mut(node, iface) {
            // Opportunistic ARP learning from every on-link source.
            if ifr.on_link(packet.src) {
                ifr.net.arp.learn(packet.src, src_mac, now);
            }
        }

        let local = match self.node(node) {
            Ok(n) => {
                n.has_ip(packet.dst)
                    || packet.dst.is_broadcast()
                    || hsrp::owns_ip(self, node, packet.dst)
            }
            Err(_) => return Disposition::Continue,
        };

        if local {
            self.local_deliver(node, iface, &packet)
        } else if self.node(node).map(|n| n.is_router()).unwrap_or(false) {
            router::forward(self, node, iface, src_mac, packet)
        } else {
            // Not ours and we do not forward: loss is the correct model.
            Disposition::Continue
        }
    }

    fn local_deliver(&mut self, node: NodeId, iface: usize, packet: &Ipv4Packet) -> Disposition {
        match &packet.payload {
            Ipv4Payload::Icmp(icmp) if icmp.icmp_type == IcmpPacket::ECHO_REQUEST => {
                // Answer ping; reply sourced from the address that was hit.
                let reply = Ipv4Packet::new(packet.dst, packet.src, Ipv4Payload::Icmp(
                    IcmpPacket::echo_reply(),
                ));
                let _ = self.send_packet(node, reply);
                Disposition::Handled
            }
            Ipv4Payload::Icmp(_) => Disposition::Handled,
            Ipv4Payload::Rip(update) => {
                crate::rip::receive_update(self, node, iface, packet.src, update.clone());
                Disposition::Handled
            }
            Ipv4Payload::Ospf(pdu) => {
                crate::ospf::receive(self, node, iface, packet.src, pdu.clone());
                Disposition::Handled
            }
            Ipv4Payload::Bgp(pdu) => {
                crate::bgp::receive(self, node, packet.src, pdu.clone());
                Disposition::Handled
            }
            Ipv4Payload::Hsrp(pdu) => {
                hsrp::receive(self, node, iface, packet.src, *pdu);
                Disposition::Handled
            }
            Ipv4Payload::Dhcp(pdu) => dhcp::receive(self, node, iface, pdu.clone()),
            Ipv4Payload::Data(_) => Disposition::Handled,
        }
    }

    // ── IP send path ────────────────────────────────────────

    /// Wrap `packet` in an Ethernet frame to `dst_mac` and transmit.
    pub(crate) fn frame_to(
        &mut self,
        node: NodeId,
        iface: usize,
        dst_mac: Mac,
        packet: Ipv4Packet,
    ) {
        let src_mac = match self.iface(node, iface) {
            Ok(i) => i.mac,
            Err(_) => return,
        };
        let frame = Message::ethernet(src_mac, dst_mac, EtherPayload::Ipv4(packet));
        let _ = self.transmit(node, iface, frame);
    }

    /// Send `packet` out `iface` towards `next_hop`, resolving the MAC
    /// through ARP. A cache miss parks the packet and broadcasts one
    /// request.
    pub(crate) fn resolve_and_send(
        &mut self,
        node: NodeId,
        iface: usize,
        next_hop: Ipv4Addr,
        packet: Ipv4Packet,
    ) {
        if next_hop.is_broadcast() || packet.dst.is_broadcast() {
            self.frame_to(node, iface, Mac::BROADCAST, packet);
            return;
        }

        let (own_mac, own_ip, cached) = match self.iface(node, iface) {
            Ok(i) => (i.mac, i.net.ip, i.net.arp.get(next_hop)),
            Err(_) => return,
        };
        if let Some(mac) = cached {
            self.frame_to(node, iface, mac, packet);
            return;
        }

        let outstanding = match self.iface_mut(node, iface) {
            Ok(i) => i.net.arp.enqueue(next_hop, packet),
            Err(_) => return,
        };
        if !outstanding {
            if let Some(own_ip) = own_ip {
                let request = arp::request(own_mac, own_ip, next_hop);
                let frame =
                    Message::ethernet(own_mac, Mac::BROADCAST, EtherPayload::Arp(request));
                let _ = self.transmit(node, iface, frame);
            }
        }
    }

    /// Egress selection for a locally originated packet: a connected
    /// subnet first, then the router's table, then the host gateway.
    fn select_egress(
        &self,
        node: NodeId,
        dst: Ipv4Addr,
    ) -> Result<(usize, Ipv4Addr), NetworkError> {
        let n = self.node(node)?;
        for (index, ifr) in n.ifaces.iter().enumerate() {
            if ifr.up && ifr.on_link(dst) {
                return Ok((index, dst));
            }
        }
        if let Some(router) = n.as_router() {
            if let Some(gw) = router.table.next_hop_via_table(dst) {
                for (index, ifr) in n.ifaces.iter().enumerate() {
                    if ifr.up && ifr.on_link(gw) {
                        return Ok((index, gw));
                    }
                }
            }
        }
        for (index, ifr) in n.ifaces.iter().enumerate() {
            if let Some(gw) = ifr.net.gateway {
                if ifr.up {
                    return Ok((index, gw));
                }
            }
        }
        Err(NetworkError::NoRoute)
    }

    /// Send an already-built packet from this node.
    pub(crate) fn send_packet(
        &mut self,
        node: NodeId,
        packet: Ipv4Packet,
    ) -> Result<(), NetworkError> {
        let (iface, next_hop) = self.select_egress(node, packet.dst)?;
        self.resolve_and_send(node, iface, next_hop, packet);
        Ok(())
    }

    /// Build and send an IPv4 packet to `dst`, sourcing from the egress
    /// interface.
    pub fn send_ip(
        &mut self,
        node: NodeId,
        dst: Ipv4Addr,
        payload: Ipv4Payload,
    ) -> Result<(), NetworkError> {
        let (iface, next_hop) = self.select_egress(node, dst)?;
        let src = self
            .iface(node, iface)?
            .net
            .ip
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let packet = Ipv4Packet::new(src, dst, payload);
        self.resolve_and_send(node, iface, next_hop, packet);
        Ok(())
    }

    /// Broadcast a payload out one interface (limited broadcast).
    pub fn broadcast_ip(
        &mut self,
        node: NodeId,
        iface: usize,
        payload: Ipv4Payload,
    ) -> Result<(), NetworkError> {
        let src = self
            .iface(node, iface)?
            .net
            .ip
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let packet = Ipv4Packet::new(src, Ipv4Addr::BROADCAST, payload);
        self.frame_to(node, iface, Mac::BROADCAST, packet);
        Ok(())
    }

    /// Send one ICMP echo request to `dst`.
    pub fn ping(&mut self, node: NodeId, dst: Ipv4Addr) -> Result<(), NetworkError> {
        self.send_ip(node, dst, Ipv4Payload::Icmp(IcmpPacket::echo_request()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlab_clock::secs;

    fn two_hosts() -> (Network, NodeId, NodeId) {
        let clock = Clock::new();
        let mut net = Network::new(clock);
        let a = net.add_host("pc-a");
        let b = net.add_host("pc-b");
        net.add_interface(a, "eth0").unwrap();
        net.add_interface(b, "eth0").unwrap();
        (net, a, b)
    }

    #[test]
    fn test_link_validation() {
        let (mut net, a, b) = two_hosts();
        assert_eq!(
            net.link(a, "eth0", a, "eth0", 1).unwrap_err(),
            NetworkError::SameInterfaceLink
        );
        net.link(a, "eth0", b, "eth0", 1).unwrap();
        assert_eq!(
            net.link(a, "eth0", b, "eth0", 1).unwrap_err(),
            NetworkError::DuplicateLink
        );
    }

    #[test]
    fn test_transmit_requires_connected_up_interface() {
        let (mut net, a, b) = two_hosts();
        let mac = net.iface(a, 0).unwrap().mac;
        let frame = Message::ethernet(mac, Mac::BROADCAST, EtherPayload::Data(Vec::new()));

        // Not connected yet.
        assert_eq!(
            net.transmit(a, 0, frame.clone()).unwrap_err(),
            NetworkError::LinkDown
        );

        net.link(a, "eth0", b, "eth0", 1).unwrap();
        net.iface_down(a, "eth0").unwrap();
        assert_eq!(
            net.transmit(a, 0, frame.clone()).unwrap_err(),
            NetworkError::LinkDown
        );

        net.iface_up(a, "eth0").unwrap();
        assert!(net.transmit(a, 0, frame).is_ok());
    }

    #[test]
    fn test_frame_arrives_after_propagation_delay() {
        let (mut net, a, b) = two_hosts();
        net.link(a, "eth0", b, "eth0", 5).unwrap();

        use alloc::rc::Rc;
        use core::cell::Cell;
        let got = Rc::new(Cell::new(false));
        let seen = Rc::clone(&got);
        net.add_listener(b, move |ev| {
            if matches!(ev, NodeEvent::Frame { .. }) {
                seen.set(true);
            }
            Disposition::Continue
        })
        .unwrap();

        let mac = net.iface(a, 0).unwrap().mac;
        let frame = Message::ethernet(mac, Mac::BROADCAST, EtherPayload::Data(Vec::new()));
        net.transmit(a, 0, frame).unwrap();

        net.run_for(millis(4));
        assert!(!got.get());
        net.run_for(millis(1));
        assert!(got.get());
    }

    #[test]
    fn test_down_receiver_drops_silently() {
        let (mut net, a, b) = two_hosts();
        net.link(a, "eth0", b, "eth0", 1).unwrap();
        net.iface_down(b, "eth0").unwrap();

        use alloc::rc::Rc;
        use core::cell::Cell;
        let got = Rc::new(Cell::new(false));
        let seen = Rc::clone(&got);
        net.add_listener(b, move |ev| {
            if matches!(ev, NodeEvent::Frame { .. }) {
                seen.set(true);
            }
            Disposition::Continue
        })
        .unwrap();

        let mac = net.iface(a, 0).unwrap().mac;
        let frame = Message::ethernet(mac, Mac::BROADCAST, EtherPayload::Data(Vec::new()));
        // Sender sees success; the drop happens at the receiver.
        net.transmit(a, 0, frame).unwrap();
        net.run_for(secs(1));
        assert!(!got.get());
    }

    #[test]
    fn test_loopback_to_own_mac() {
        let (mut net, a, b) = two_hosts();
        net.link(a, "eth0", b, "eth0", 2).unwrap();

        use alloc::rc::Rc;
        use core::cell::Cell;
        let got = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&got);
        net.add_listener(a, move |ev| {
            if matches!(ev, NodeEvent::Frame { .. }) {
                seen.set(seen.get() + 1);
            }
            Disposition::Continue
        })
        .unwrap();

        let mac = net.iface(a, 0).unwrap().mac;
        let frame = Message::ethernet(mac, mac, EtherPayload::Data(Vec::new()));
        net.transmit(a, 0, frame).unwrap();
        net.run_for(millis(3));
        assert_eq!(got.get(), 1);
    }

    #[test]
    fn test_remove_node_destroys_links() {
        let (mut net, a, b) = two_hosts();
        let link = net.link(a, "eth0", b, "eth0", 1).unwrap();
        net.remove_node(b).unwrap();

        assert!(net.link_of(link).is_none());
        assert!(!net.iface(a, 0).unwrap().is_connected());
        assert_eq!(net.node(b).unwrap_err(), NetworkError::NoSuchNode);
    }

    #[test]
    fn test_arp_resolution_round_trip() {
        let (mut net, a, b) = two_hosts();
        net.link(a, "eth0", b, "eth0", 1).unwrap();
        net.set_ip(a, "eth0", Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        net.set_mask(a, "eth0", SubnetMask::from_cidr(24).unwrap())
            .unwrap();
        net.set_ip(b, "eth0", Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        net.set_mask(b, "eth0", SubnetMask::from_cidr(24).unwrap())
            .unwrap();

        net.ping(a, Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        net.run_for(secs(1));

        // Request/reply resolved both caches, and the queued ping flowed.
        let b_mac = net.iface(b, 0).unwrap().mac;
        let a_mac = net.iface(a, 0).unwrap().mac;
        assert_eq!(
            net.iface(a, 0).unwrap().net.arp.get(Ipv4Addr::new(10, 0, 0, 2)),
            Some(b_mac)
        );
        assert_eq!(
            net.iface(b, 0).unwrap().net.arp.get(Ipv4Addr::new(10, 0, 0, 1)),
            Some(a_mac)
        );
    }
}
