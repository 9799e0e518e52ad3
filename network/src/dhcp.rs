//! DHCP server and client
//!
//! The server owns an address pool and a MAC-keyed lease map, answering
//! discover/request with offer/ack (or NAK on exhaustion and stale
//! requests). The client walks Idle → Discovering → Requesting → Bound,
//! retransmitting on a 5 s timeout and renewing at half the lease.
//! Exchanges ride the normal pipeline as broadcast IPv4 packets.

use hashbrown::HashMap;
use netlab_clock::{secs, Ticks};

use crate::listener::Disposition;
use crate::message::{DhcpOp, DhcpPdu, Ipv4Packet, Ipv4Payload};
use crate::network::{ClockSub, Network, NodeId};
use crate::{Ipv4Addr, Mac, NetworkError, SubnetMask};

/// Retransmit window for an unanswered discover/request.
const RETRY_DELAY: Ticks = secs(5);

// ── Server ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct DhcpServerConfig {
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub mask: SubnetMask,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub lease_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub expires_at: Ticks,
}

#[derive(Debug)]
pub struct DhcpServer {
    pub config: DhcpServerConfig,
    pub(crate) leases: HashMap<Mac, Lease>,
    sweep: Option<ClockSub>,
}

impl DhcpServer {
    pub fn leases(&self) -> impl Iterator<Item = (&Mac, &Lease)> {
        self.leases.iter()
    }

    pub(crate) fn teardown(&mut self) {
        if let Some(sub) = self.sweep.take() {
            sub.cancel();
        }
    }

    /// Pick an address: an existing lease for the client, else the first
    /// free address of the pool.
    fn allocate(&self, mac: Mac) -> Option<Ipv4Addr> {
        if let Some(lease) = self.leases.get(&mac) {
            return Some(lease.ip);
        }
        let start = self.config.pool_start.to_u32();
        let end = self.config.pool_end.to_u32();
        (start..=end)
            .map(Ipv4Addr::from_u32)
            .find(|ip| !self.leases.values().any(|l| l.ip == *ip))
    }
}

// ── Client ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpClientState {
    Idle,
    Discovering,
    Requesting,
    Bound,
}

#[derive(Debug)]
pub struct DhcpClient {
    pub state: DhcpClientState,
    pub(crate) iface: usize,
    xid: u32,
    offered: Option<(Ipv4Addr, Ipv4Addr)>, // (address, server id)
    retry: Option<ClockSub>,
    renew: Option<ClockSub>,
}

impl DhcpClient {
    pub(crate) fn teardown(&mut self) {
        for sub in [self.retry.take(), self.renew.take()].into_iter().flatten() {
            sub.cancel();
        }
    }
}

// ── Shared receive entry point ──────────────────────────────

/// Dispatch a DHCP PDU to whichever side of the protocol this node runs.
pub(crate) fn receive(
    net: &mut Network,
    node: NodeId,
    iface: usize,
    pdu: DhcpPdu,
) -> Disposition {
    let is_server = net
        .node(node)
        .map(|n| matches!(n.kind, crate::node::NodeKind::Server(_)))
        .unwrap_or(false);
    if is_server {
        server_receive(net, node, iface, pdu);
        return Disposition::Handled;
    }
    let is_client = match net.node(node) {
        Ok(n) => match &n.kind {
            crate::node::NodeKind::Host(h) => h.dhcp.is_some(),
            _ => false,
        },
        Err(_) => false,
    };
    if is_client {
        client_receive(net, node, iface, pdu);
        return Disposition::Handled;
    }
    Disposition::Continue
}

// ── Server side ─────────────────────────────────────────────

fn server_receive(net: &mut Network, node: NodeId, iface: usize, pdu: DhcpPdu) {
    let now = net.now();
    let server_ip = match net.iface(node, iface) {
        Ok(i) => i.net.ip,
        Err(_) => return,
    };
    let Some(server_ip) = server_ip else { return };

    let Ok(n) = net.node_mut(node) else { return };
    let Some(server) = n.as_server_mut().and_then(|s| s.dhcp.as_mut()) else {
        return;
    };
    let config = server.config;

    let reply = match pdu.op {
        DhcpOp::Discover => match server.allocate(pdu.client_mac) {
            Some(ip) => {
                log::debug!("dhcp: offering {} to {}", ip, pdu.client_mac);
                Some(DhcpPdu {
                    op: DhcpOp::Offer,
                    xid: pdu.xid,
                    client_mac: pdu.client_mac,
                    yiaddr: ip,
                    mask: Some(config.mask),
                    gateway: config.gateway,
                    dns: config.dns,
                    server_id: Some(server_ip),
                    requested: None,
                    lease_secs: config.lease_secs,
                })
            }
            None => {
                log::warn!("dhcp: pool exhausted, NAK for {}", pdu.client_mac);
                Some(nak(&pdu, server_ip))
            }
        },
        DhcpOp::Request => {
            let requested = pdu.requested.unwrap_or(pdu.yiaddr);
            let acceptable = server.allocate(pdu.client_mac) == Some(requested);
            if acceptable {
                server.leases.insert(
                    pdu.client_mac,
                    Lease {
                        ip: requested,
                        expires_at: now + secs(config.lease_secs as u64),
                    },
                );
                log::debug!("dhcp: ack {} for {}", requested, pdu.client_mac);
                Some(DhcpPdu {
                    op: DhcpOp::Ack,
                    xid: pdu.xid,
                    client_mac: pdu.client_mac,
                    yiaddr: requested,
                    mask: Some(config.mask),
                    gateway: config.gateway,
                    dns: config.dns,
                    server_id: Some(server_ip),
                    requested: None,
                    lease_secs: config.lease_secs,
                })
            } else {
                Some(nak(&pdu, server_ip))
            }
        }
        DhcpOp::Release => {
            server.leases.remove(&pdu.client_mac);
            None
        }
        _ => None,
    };

    if let Some(reply) = reply {
        // Unicast at layer 2 to the client's MAC; the client has no
        // usable address yet, so layer 3 stays broadcast.
        let client_mac = reply.client_mac;
        let packet = Ipv4Packet::new(server_ip, Ipv4Addr::BROADCAST, Ipv4Payload::Dhcp(reply));
        net.frame_to(node, iface, client_mac, packet);
    }
}

fn nak(pdu: &DhcpPdu, server_ip: Ipv4Addr) -> DhcpPdu {
    DhcpPdu {
        op: DhcpOp::Nak,
        xid: pdu.xid,
        client_mac: pdu.client_mac,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        mask: None,
        gateway: None,
        dns: None,
        server_id: Some(server_ip),
        requested: None,
        lease_secs: 0,
    }
}

/// Expire leases that ran out.
fn server_sweep(net: &mut Network, node: NodeId) {
    let now = net.now();
    if let Ok(n) = net.node_mut(node) {
        if let Some(server) = n.as_server_mut().and_then(|s| s.dhcp.as_mut()) {
            server.leases.retain(|_, lease| lease.expires_at > now);
        }
    }
}

// ── Client side ─────────────────────────────────────────────

fn client_receive(net: &mut Network, node: NodeId, iface: usize, pdu: DhcpPdu) {
    let our_mac = match net.iface(node, iface) {
        Ok(i) => i.mac,
        Err(_) => return,
    };
    if pdu.client_mac != our_mac {
        return; // offer for someone else on the segment
    }

    let (state, xid) = {
        let Ok(n) = net.node_mut(node) else { return };
        let Some(client) = n.as_host_mut().and_then(|h| h.dhcp.as_mut()) else {
            return;
        };
        (client.state, client.xid)
    };
    if pdu.xid != xid {
        return;
    }

    match (state, pdu.op) {
        (DhcpClientState::Discovering, DhcpOp::Offer) => {
            let server_id = pdu.server_id.unwrap_or(Ipv4Addr::UNSPECIFIED);
            if let Ok(n) = net.node_mut(node) {
                if let Some(client) = n.as_host_mut().and_then(|h| h.dhcp.as_mut()) {
                    client.offered = Some((pdu.yiaddr, server_id));
                    client.state = DhcpClientState::Requesting;
                }
            }
            client_send_request(net, node, iface, pdu.yiaddr, server_id);
            client_arm_retry(net, node);
        }
        (DhcpClientState::Requesting, DhcpOp::Ack) => {
            // Bind: apply the lease to the interface.
            let iface_name = match net.iface(node, iface) {
                Ok(i) => i.name.clone(),
                Err(_) => return,
            };
            let _ = net.set_ip(node, &iface_name, pdu.yiaddr);
            if let Some(mask) = pdu.mask {
                let _ = net.set_mask(node, &iface_name, mask);
            }
            if let Some(gw) = pdu.gateway {
                let _ = net.set_gateway(node, &iface_name, gw);
            }
            log::debug!("dhcp: bound {} ({} s lease)", pdu.yiaddr, pdu.lease_secs);

            let clock = net.clock.clone();
            let renew_at = secs(pdu.lease_secs as u64) / 2;
            if let Ok(n) = net.node_mut(node) {
                if let Some(client) = n.as_host_mut().and_then(|h| h.dhcp.as_mut()) {
                    client.state = DhcpClientState::Bound;
                    if let Some(sub) = client.retry.take() {
                        sub.cancel();
                    }
                    if let Some(sub) = client.renew.take() {
                        sub.cancel();
                    }
                    client.renew = Some(clock.once(renew_at, move |net: &mut Network, _| {
                        client_renew(net, node);
                    }));
                }
            }
        }
        (_, DhcpOp::Nak) => {
            // Start over with a fresh transaction.
            if let Ok(n) = net.node_mut(node) {
                if let Some(client) = n.as_host_mut().and_then(|h| h.dhcp.as_mut()) {
                    client.state = DhcpClientState::Idle;
                    client.offered = None;
                    client.xid = client.xid.wrapping_add(1);
                }
            }
            client_send_discover(net, node);
            client_arm_retry(net, node);
        }
        _ => {}
    }
}

fn client_send_discover(net: &mut Network, node: NodeId) {
    let Some((iface, mac, xid)) = client_params(net, node) else {
        return;
    };
    if let Ok(n) = net.node_mut(node) {
        if let Some(client) = n.as_host_mut().and_then(|h| h.dhcp.as_mut()) {
            client.state = DhcpClientState::Discovering;
        }
    }
    let pdu = DhcpPdu {
        op: DhcpOp::Discover,
        xid,
        client_mac: mac,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        mask: None,
        gateway: None,
        dns: None,
        server_id: None,
        requested: None,
        lease_secs: 0,
    };
    let _ = net.broadcast_ip(node, iface, Ipv4Payload::Dhcp(pdu));
}

fn client_send_request(
    net: &mut Network,
    node: NodeId,
    iface: usize,
    requested: Ipv4Addr,
    server_id: Ipv4Addr,
) {
    let Some((_, mac, xid)) = client_params(net, node) else {
        return;
    };
    let pdu = DhcpPdu {
        op: DhcpOp::Request,
        xid,
        client_mac: mac,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        mask: None,
        gateway: None,
        dns: None,
        server_id: Some(server_id),
        requested: Some(requested),
        lease_secs: 0,
    };
    let _ = net.broadcast_ip(node, iface, Ipv4Payload::Dhcp(pdu));
}

fn client_params(net: &Network, node: NodeId) -> Option<(usize, Mac, u32)> {
    let n = net.node(node).ok()?;
    let client = match &n.kind {
        crate::node::NodeKind::Host(h) => h.dhcp.as_ref()?,
        _ => return None,
    };
    let mac = n.iface(client.iface)?.mac;
    Some((client.iface, mac, client.xid))
}

fn client_arm_retry(net: &mut Network, node: NodeId) {
    let clock = net.clock.clone();
    let sub = clock.once(RETRY_DELAY, move |net: &mut Network, _| {
        client_retry(net, node);
    });
    if let Ok(n) = net.node_mut(node) {
        if let Some(client) = n.as_host_mut().and_then(|h| h.dhcp.as_mut()) {
            if let Some(prev) = client.retry.take() {
                prev.cancel();
            }
            client.retry = Some(sub);
        }
    }
}

/// Unanswered for the whole window: resend whatever the state calls for.
fn client_retry(net: &mut Network, node: NodeId) {
    let (state, iface, offered) = {
        let Ok(n) = net.node_mut(node) else { return };
        let Some(client) = n.as_host_mut().and_then(|h| h.dhcp.as_mut()) else {
            return;
        };
        client.retry = None;
        (client.state, client.iface, client.offered)
    };
    match state {
        DhcpClientState::Discovering => {
            client_send_discover(net, node);
            client_arm_retry(net, node);
        }
        DhcpClientState::Requesting => {
            if let Some((ip, server)) = offered {
                client_send_request(net, node, iface, ip, server);
            }
            client_arm_retry(net, node);
        }
        _ => {}
    }
}

/// Half the lease elapsed: re-request the bound address.
fn client_renew(net: &mut Network, node: NodeId) {
    let (iface, bound) = {
        let Ok(n) = net.node_mut(node) else { return };
        let Some(client) = n.as_host_mut().and_then(|h| h.dhcp.as_mut()) else {
            return;
        };
        client.renew = None;
        client.state = DhcpClientState::Requesting;
        (client.iface, client.offered)
    };
    if let Some((ip, server)) = bound {
        client_send_request(net, node, iface, ip, server);
        client_arm_retry(net, node);
    }
}

// ── Public surface ──────────────────────────────────────────

impl Network {
    /// Attach a DHCP server to a server node. It answers on every
    /// interface that carries an address.
    pub fn dhcp_server_enable(
        &mut self,
        node: NodeId,
        config: DhcpServerConfig,
    ) -> Result<(), NetworkError> {
        let clock = self.clock.clone();
        let sweep = clock.repeat(secs(60), move |net: &mut Network, _| {
            server_sweep(net, node);
        });
        let server_state = self
            .node_mut(node)?
            .as_server_mut()
            .ok_or(NetworkError::NoSuchNode)?;
        if let Some(old) = server_state.dhcp.as_mut() {
            old.teardown();
        }
        server_state.dhcp = Some(DhcpServer {
            config,
            leases: HashMap::new(),
            sweep: Some(sweep),
        });
        Ok(())
    }

    /// Start address acquisition on a host interface.
    pub fn dhcp_client_start(&mut self, node: NodeId, iface: &str) -> Result<(), NetworkError> {
        let index = self.iface_index(node, iface)?;
        let mac = self.iface(node, index)?.mac;
        // Transaction ids only need to be unique per client; derive from
        // the MAC so runs stay deterministic.
        let xid = (mac.to_u64() & 0xFFFF_FFFF) as u32 ^ 0x6364_6870;

        let host = self
            .node_mut(node)?
            .as_host_mut()
            .ok_or(NetworkError::NoSuchNode)?;
        if let Some(old) = host.dhcp.as_mut() {
            old.teardown();
        }
        host.dhcp = Some(DhcpClient {
            state: DhcpClientState::Idle,
            iface: index,
            xid,
            offered: None,
            retry: None,
            renew: None,
        });

        client_send_discover(self, node);
        client_arm_retry(self, node);
        Ok(())
    }

    pub fn dhcp_client_state(&self, node: NodeId) -> Result<DhcpClientState, NetworkError> {
        match &self.node(node)?.kind {
            crate::node::NodeKind::Host(h) => Ok(h
                .dhcp
                .as_ref()
                .map(|c| c.state)
                .unwrap_or(DhcpClientState::Idle)),
            _ => Err(NetworkError::NoSuchNode),
        }
    }

    pub fn dhcp_lease_count(&self, node: NodeId) -> Result<usize, NetworkError> {
        match &self.node(node)?.kind {
            crate::node::NodeKind::Server(s) => {
                Ok(s.dhcp.as_ref().map(|d| d.leases.len()).unwrap_or(0))
            }
            _ => Err(NetworkError::NoSuchNode),
        }
    }
}
