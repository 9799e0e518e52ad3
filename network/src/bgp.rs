//! BGP skeleton — session state machine and advertised prefixes
//!
//! Configured peers walk Idle → Connect → OpenSent → OpenConfirm →
//! Established through an open/keepalive handshake; advertised prefixes
//! are pushed in one update on establishment and collected in a per-peer
//! RIB. Keepalives run every 60 s; a 180 s hold-timer expiry tears the
//! session down to Idle and flushes what the peer sent.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use netlab_clock::{millis, secs, Ticks};

use crate::message::{BgpPdu, Ipv4Payload};
use crate::network::{ClockSub, Network, NodeId};
use crate::{Ipv4Addr, NetworkError, SubnetMask};

pub const BGP_KEEPALIVE: Ticks = secs(60);
pub const BGP_HOLD_TIME: Ticks = secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgpSessionState {
    Idle,
    Connect,
    OpenSent,
    OpenConfirm,
    Established,
}

#[derive(Debug, Clone, Copy)]
pub struct BgpPeer {
    pub addr: Ipv4Addr,
    pub remote_as: u32,
    pub state: BgpSessionState,
    pub(crate) last_heard: Ticks,
}

/// A prefix learned from an established peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BgpRoute {
    pub network: Ipv4Addr,
    pub mask: SubnetMask,
    pub peer: Ipv4Addr,
}

#[derive(Debug)]
pub struct BgpService {
    pub as_number: u32,
    pub router_id: Ipv4Addr,
    pub(crate) peers: BTreeMap<Ipv4Addr, BgpPeer>,
    /// Prefixes this router originates.
    pub(crate) networks: Vec<(Ipv4Addr, SubnetMask)>,
    pub(crate) rib_in: BTreeMap<(u32, u8), BgpRoute>,
    keepalive_sub: Option<ClockSub>,
    sweep_sub: Option<ClockSub>,
}

impl BgpService {
    pub(crate) fn cancel_timers(&mut self) {
        for sub in [self.keepalive_sub.take(), self.sweep_sub.take()]
            .into_iter()
            .flatten()
        {
            sub.cancel();
        }
    }
}

// ── Timer bodies ────────────────────────────────────────────

fn keepalive_tick(net: &mut Network, node: NodeId) {
    let targets: Vec<Ipv4Addr> = match net.node(node) {
        Ok(n) => n
            .as_router()
            .and_then(|r| r.bgp.as_ref())
            .map(|s| {
                s.peers
                    .values()
                    .filter(|p| {
                        matches!(
                            p.state,
                            BgpSessionState::OpenConfirm | BgpSessionState::Established
                        )
                    })
                    .map(|p| p.addr)
                    .collect()
            })
            .unwrap_or_default(),
        Err(_) => return,
    };
    for peer in targets {
        let _ = net.send_ip(node, peer, Ipv4Payload::Bgp(BgpPdu::Keepalive));
    }
}

fn sweep(net: &mut Network, node: NodeId) {
    let now = net.now();
    let Ok(n) = net.node_mut(node) else { return };
    let Some(s) = n.as_router_mut().and_then(|r| r.bgp.as_mut()) else {
        return;
    };
    let expired: Vec<Ipv4Addr> = s
        .peers
        .values()
        .filter(|p| {
            p.state != BgpSessionState::Idle
                && now.saturating_sub(p.last_heard) >= BGP_HOLD_TIME
        })
        .map(|p| p.addr)
        .collect();
    for addr in expired {
        log::debug!("bgp: hold timer expired for {}", addr);
        if let Some(peer) = s.peers.get_mut(&addr) {
            peer.state = BgpSessionState::Idle;
        }
        s.rib_in.retain(|_, r| r.peer != addr);
    }
}

fn send_open(net: &mut Network, node: NodeId, peer: Ipv4Addr) {
    let open = {
        let Ok(n) = net.node(node) else { return };
        let Some(s) = n.as_router().and_then(|r| r.bgp.as_ref()) else {
            return;
        };
        BgpPdu::Open {
            as_number: s.as_number,
            router_id: s.router_id,
            hold_time: (BGP_HOLD_TIME / 1000) as u16,
        }
    };
    let _ = net.send_ip(node, peer, Ipv4Payload::Bgp(open));
    if let Ok(n) = net.node_mut(node) {
        if let Some(s) = n.as_router_mut().and_then(|r| r.bgp.as_mut()) {
            if let Some(p) = s.peers.get_mut(&peer) {
                if p.state == BgpSessionState::Connect {
                    p.state = BgpSessionState::OpenSent;
                }
            }
        }
    }
}

// ── Reception ───────────────────────────────────────────────

pub(crate) fn receive(net: &mut Network, node: NodeId, src_ip: Ipv4Addr, pdu: BgpPdu) {
    let now = net.now();

    enum Action {
        None,
        Reply(Vec<BgpPdu>),
    }

    let action = {
        let Ok(n) = net.node_mut(node) else { return };
        let Some(s) = n.as_router_mut().and_then(|r| r.bgp.as_mut()) else {
            return;
        };
        let networks = s.networks.clone();
        let Some(peer) = s.peers.get_mut(&src_ip) else {
            return; // not a configured peer
        };
        peer.last_heard = now;

        match pdu {
            BgpPdu::Open { .. } => match peer.state {
                BgpSessionState::Idle | BgpSessionState::Connect => {
                    peer.state = BgpSessionState::OpenConfirm;
                    Action::Reply(alloc::vec![
                        BgpPdu::Open {
                            as_number: s.as_number,
                            router_id: s.router_id,
                            hold_time: (BGP_HOLD_TIME / 1000) as u16,
                        },
                        BgpPdu::Keepalive,
                    ])
                }
                BgpSessionState::OpenSent => {
                    peer.state = BgpSessionState::OpenConfirm;
                    Action::Reply(alloc::vec![BgpPdu::Keepalive])
                }
                _ => Action::None,
            },
            BgpPdu::Keepalive => match peer.state {
                BgpSessionState::OpenSent => {
                    peer.state = BgpSessionState::OpenConfirm;
                    Action::None
                }
                BgpSessionState::OpenConfirm => {
                    peer.state = BgpSessionState::Established;
                    log::debug!("bgp: session with {} established", src_ip);
                    Action::Reply(alloc::vec![BgpPdu::Update {
                        prefixes: networks,
                    }])
                }
                _ => Action::None,
            },
            BgpPdu::Update { prefixes } => {
                if peer.state == BgpSessionState::Established {
                    for (network, mask) in prefixes {
                        s.rib_in.insert(
                            (network.to_u32(), mask.cidr()),
                            BgpRoute {
                                network,
                                mask,
                                peer: src_ip,
                            },
                        );
                    }
                }
                Action::None
            }
            BgpPdu::Notification => {
                peer.state = BgpSessionState::Idle;
                s.rib_in.retain(|_, r| r.peer != src_ip);
                Action::None
            }
        }
    };

    if let Action::Reply(replies) = action {
        for reply in replies {
            let _ = net.send_ip(node, src_ip, Ipv4Payload::Bgp(reply));
        }
    }
}

// ── Public surface ──────────────────────────────────────────

impl Network {
    fn bgp_mut(&mut self, node: NodeId) -> Result<&mut BgpService, NetworkError> {
        self.node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?
            .bgp
            .as_mut()
            .ok_or(NetworkError::NotARouter)
    }

    /// Enable BGP with a local AS number.
    pub fn bgp_enable(&mut self, node: NodeId, as_number: u32) -> Result<(), NetworkError> {
        let router_id = self
            .node(node)?
            .interfaces()
            .filter_map(|f| f.net.ip)
            .max()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let clock = self.clock.clone();
        let keepalive = clock.repeat(BGP_KEEPALIVE, move |net: &mut Network, _| {
            keepalive_tick(net, node);
        });
        let sweeper = clock.repeat(secs(1), move |net: &mut Network, _| {
            sweep(net, node);
        });

        let router = self
            .node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?;
        if let Some(old) = router.bgp.as_mut() {
            old.cancel_timers();
        }
        router.bgp = Some(BgpService {
            as_number,
            router_id,
            peers: BTreeMap::new(),
            networks: Vec::new(),
            rib_in: BTreeMap::new(),
            keepalive_sub: Some(keepalive),
            sweep_sub: Some(sweeper),
        });
        Ok(())
    }

    pub fn bgp_disable(&mut self, node: NodeId) -> Result<(), NetworkError> {
        let router = self
            .node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?;
        if let Some(service) = router.bgp.as_mut() {
            service.cancel_timers();
        }
        router.bgp = None;
        Ok(())
    }

    /// Configure a peer and start the session.
    pub fn bgp_add_peer(
        &mut self,
        node: NodeId,
        addr: Ipv4Addr,
        remote_as: u32,
    ) -> Result<(), NetworkError> {
        let now = self.now();
        {
            let service = self.bgp_mut(node)?;
            service.peers.insert(
                addr,
                BgpPeer {
                    addr,
                    remote_as,
                    state: BgpSessionState::Connect,
                    last_heard: now,
                },
            );
        }
        let clock = self.clock.clone();
        clock.once(millis(100), move |net: &mut Network, _| {
            send_open(net, node, addr);
        });
        Ok(())
    }

    /// Originate a prefix towards established peers (sent with the next
    /// establishment update).
    pub fn bgp_advertise(
        &mut self,
        node: NodeId,
        network: Ipv4Addr,
        mask: SubnetMask,
    ) -> Result<(), NetworkError> {
        let service = self.bgp_mut(node)?;
        if !service.networks.contains(&(network, mask)) {
            service.networks.push((network, mask));
        }
        Ok(())
    }

    pub fn bgp_peers(
        &self,
        node: NodeId,
    ) -> Result<Vec<(Ipv4Addr, BgpSessionState)>, NetworkError> {
        let service = self
            .node(node)?
            .as_router()
            .ok_or(NetworkError::NotARouter)?
            .bgp
            .as_ref()
            .ok_or(NetworkError::NotARouter)?;
        Ok(service
            .peers
            .values()
            .map(|p| (p.addr, p.state))
            .collect())
    }

    pub fn bgp_rib(&self, node: NodeId) -> Result<Vec<BgpRoute>, NetworkError> {
        let service = self
            .node(node)?
            .as_router()
            .ok_or(NetworkError::NotARouter)?
            .bgp
            .as_ref()
            .ok_or(NetworkError::NotARouter)?;
        Ok(service.rib_in.values().copied().collect())
    }
}
