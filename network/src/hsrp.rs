//! HSRP — first-hop redundancy
//!
//! Routers in a group share a virtual IP and the well-known virtual MAC
//! `00:00:0c:07:ac:{group}`. Every member sends hellos; the best ranked
//! router — highest (priority, interface IP) — claims Active once the
//! hold time passes without a better claimant, answers ARP for the
//! virtual address and forwards traffic sent to the virtual MAC. With
//! preemption enabled a better router coups a worse Active.

use alloc::collections::BTreeMap;

use netlab_clock::{secs, Ticks};

use crate::message::{HsrpOp, HsrpPdu, Ipv4Payload};
use crate::network::{ClockSub, Network, NodeId};
use crate::{Ipv4Addr, Mac, NetworkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsrpState {
    Initial,
    Listen,
    Speak,
    Standby,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsrpConfig {
    pub group: u8,
    pub virtual_ip: Ipv4Addr,
    pub priority: u8,
    pub preempt: bool,
    pub hello_interval: Ticks,
    pub hold_time: Ticks,
}

impl HsrpConfig {
    pub fn new(group: u8, virtual_ip: Ipv4Addr) -> Self {
        HsrpConfig {
            group,
            virtual_ip,
            priority: 100,
            preempt: false,
            hello_interval: secs(3),
            hold_time: secs(10),
        }
    }
}

/// The well-known HSRP v1 virtual MAC for a group.
pub fn virtual_mac(group: u8) -> Mac {
    Mac([0x00, 0x00, 0x0C, 0x07, 0xAC, group])
}

#[derive(Debug, Clone, Copy)]
struct Peer {
    priority: u8,
    active: bool,
    last_heard: Ticks,
}

#[derive(Debug)]
pub struct HsrpService {
    pub config: HsrpConfig,
    pub state: HsrpState,
    pub(crate) iface: usize,
    /// Member routers heard on the segment, keyed by interface IP.
    peers: BTreeMap<Ipv4Addr, Peer>,
    enabled_at: Ticks,
    hello_sub: Option<ClockSub>,
}

impl HsrpService {
    pub(crate) fn cancel_timers(&mut self) {
        if let Some(sub) = self.hello_sub.take() {
            sub.cancel();
        }
    }
}

// ── Acceptance predicates used by the receive path ──────────

/// Does this node currently answer for `mac` (the group's virtual MAC)?
pub(crate) fn accepts_mac(net: &Network, node: NodeId, mac: Mac) -> bool {
    service_of(net, node)
        .map(|s| s.state == HsrpState::Active && mac == virtual_mac(s.config.group))
        .unwrap_or(false)
}

/// Does this node currently own `ip` as the group's virtual address?
pub(crate) fn owns_ip(net: &Network, node: NodeId, ip: Ipv4Addr) -> bool {
    service_of(net, node)
        .map(|s| s.state == HsrpState::Active && ip == s.config.virtual_ip)
        .unwrap_or(false)
}

/// The virtual MAC to answer an ARP request for `ip` with, when Active.
pub(crate) fn virtual_mac_for(net: &Network, node: NodeId, ip: Ipv4Addr) -> Option<Mac> {
    let s = service_of(net, node)?;
    if s.state == HsrpState::Active && ip == s.config.virtual_ip {
        Some(virtual_mac(s.config.group))
    } else {
        None
    }
}

fn service_of(net: &Network, node: NodeId) -> Option<&HsrpService> {
    net.node(node).ok()?.as_router()?.hsrp.as_ref()
}

// ── Protocol machinery ──────────────────────────────────────

fn our_rank(net: &Network, node: NodeId) -> Option<(u8, Ipv4Addr)> {
    let n = net.node(node).ok()?;
    let s = n.as_router()?.hsrp.as_ref()?;
    let ip = n.iface(s.iface)?.net.ip?;
    Some((s.config.priority, ip))
}

fn hello_tick(net: &mut Network, node: NodeId) {
    let now = net.now();
    let Some((our_priority, our_ip)) = our_rank(net, node) else {
        return;
    };

    // Election bookkeeping under one borrow.
    let (iface, pdu, became) = {
        let Ok(n) = net.node_mut(node) else { return };
        let Some(s) = n.as_router_mut().and_then(|r| r.hsrp.as_mut()) else {
            return;
        };
        let hold = s.config.hold_time;
        s.peers.retain(|_, p| now.saturating_sub(p.last_heard) < hold);

        let us = (our_priority, our_ip);
        let better_exists = s
            .peers
            .iter()
            .any(|(ip, p)| (p.priority, *ip) > us);
        let better_active = s
            .peers
            .iter()
            .any(|(ip, p)| p.active && (p.priority, *ip) > us);
        let any_active = s.peers.values().any(|p| p.active);

        let mut became = None;
        match s.state {
            HsrpState::Active => {
                if better_active {
                    // A better router claimed the role; yield.
                    s.state = HsrpState::Speak;
                    became = Some(HsrpState::Speak);
                }
            }
            _ => {
                let waited = now.saturating_sub(s.enabled_at) >= hold;
                let may_claim = if any_active {
                    // Someone worse holds Active: only preemption takes it.
                    !better_active && s.config.preempt
                } else {
                    waited && !better_exists
                };
                if may_claim {
                    s.state = HsrpState::Active;
                    became = Some(HsrpState::Active);
                } else if !better_exists {
                    s.state = HsrpState::Speak;
                } else {
                    // Best of the losers stands by.
                    let second = s
                        .peers
                        .iter()
                        .filter(|(_, p)| !p.active)
                        .map(|(ip, p)| (p.priority, *ip))
                        .max();
                    s.state = if second.map(|r| us >= r).unwrap_or(true) {
                        HsrpState::Standby
                    } else {
                        HsrpState::Listen
                    };
                }
            }
        }

        let op = match became {
            Some(HsrpState::Active) if any_active => HsrpOp::Coup,
            _ => HsrpOp::Hello,
        };
        let pdu = HsrpPdu {
            op,
            group: s.config.group,
            priority: s.config.priority,
            virtual_ip: s.config.virtual_ip,
            active: s.state == HsrpState::Active,
        };
        (s.iface, pdu, became)
    };

    if let Some(state) = became {
        log::debug!("hsrp: group {} -> {:?}", pdu.group, state);
    }
    let _ = net.broadcast_ip(node, iface, Ipv4Payload::Hsrp(pdu));
}

/// Process a group message from a peer router.
pub(crate) fn receive(
    net: &mut Network,
    node: NodeId,
    iface: usize,
    src_ip: Ipv4Addr,
    pdu: HsrpPdu,
) {
    let now = net.now();
    let Some((our_priority, our_ip)) = our_rank(net, node) else {
        return;
    };

    let Ok(n) = net.node_mut(node) else { return };
    let Some(s) = n.as_router_mut().and_then(|r| r.hsrp.as_mut()) else {
        return;
    };
    if pdu.group != s.config.group || s.iface != iface || src_ip == our_ip {
        return;
    }

    match pdu.op {
        HsrpOp::Hello | HsrpOp::Coup => {
            s.peers.insert(
                src_ip,
                Peer {
                    priority: pdu.priority,
                    active: pdu.active || pdu.op == HsrpOp::Coup,
                    last_heard: now,
                },
            );
            // Yield Active immediately to a better claimant.
            if s.state == HsrpState::Active
                && (pdu.active || pdu.op == HsrpOp::Coup)
                && (pdu.priority, src_ip) > (our_priority, our_ip)
            {
                log::debug!("hsrp: group {} yielding to {}", pdu.group, src_ip);
                s.state = HsrpState::Speak;
            }
        }
        HsrpOp::Resign => {
            if let Some(peer) = s.peers.get_mut(&src_ip) {
                peer.active = false;
            }
        }
    }
}

// ── Public surface ──────────────────────────────────────────

impl Network {
    /// Join an HSRP group on a router interface.
    pub fn hsrp_enable(
        &mut self,
        node: NodeId,
        iface: &str,
        config: HsrpConfig,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, iface)?;
        let now = self.now();
        let clock = self.clock.clone();
        let hello = clock.repeat(config.hello_interval, move |net: &mut Network, _| {
            hello_tick(net, node);
        });

        let router = self
            .node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?;
        if let Some(old) = router.hsrp.as_mut() {
            old.cancel_timers();
        }
        router.hsrp = Some(HsrpService {
            config,
            state: HsrpState::Initial,
            iface: index,
            peers: BTreeMap::new(),
            enabled_at: now,
            hello_sub: Some(hello),
        });
        Ok(())
    }

    /// Leave the group, announcing the resignation.
    pub fn hsrp_disable(&mut self, node: NodeId) -> Result<(), NetworkError> {
        let resign = {
            let router = self
                .node_mut(node)?
                .as_router_mut()
                .ok_or(NetworkError::NotARouter)?;
            match router.hsrp.take() {
                Some(mut s) => {
                    s.cancel_timers();
                    Some((
                        s.iface,
                        HsrpPdu {
                            op: HsrpOp::Resign,
                            group: s.config.group,
                            priority: s.config.priority,
                            virtual_ip: s.config.virtual_ip,
                            active: s.state == HsrpState::Active,
                        },
                    ))
                }
                None => None,
            }
        };
        if let Some((iface, pdu)) = resign {
            let _ = self.broadcast_ip(node, iface, Ipv4Payload::Hsrp(pdu));
        }
        Ok(())
    }

    pub fn hsrp_state(&self, node: NodeId) -> Result<HsrpState, NetworkError> {
        Ok(self
            .node(node)?
            .as_router()
            .ok_or(NetworkError::NotARouter)?
            .hsrp
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(HsrpState::Initial))
    }
}
