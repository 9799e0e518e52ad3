//! OSPF skeleton — neighbor state machine and advertised table
//!
//! Hellos every 10 s discover neighbors; two-way visibility drives the
//! adjacency ladder Down → Init → TwoWay → ExStart → Exchange → Loading
//! → Full, modelled as a database-description exchange of each router's
//! connected networks. No SPF runs; the advertised table is the
//! deliverable. Neighbors silent past the dead interval are flushed.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use netlab_clock::{secs, Ticks};

use crate::message::{Ipv4Payload, OspfPdu};
use crate::network::{ClockSub, Network, NodeId};
use crate::{Ipv4Addr, NetworkError, SubnetMask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OspfNeighborState {
    Down,
    Init,
    TwoWay,
    ExStart,
    Exchange,
    Loading,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OspfConfig {
    pub hello_interval: Ticks,
    pub dead_interval: Ticks,
    pub router_id: Option<Ipv4Addr>,
}

impl Default for OspfConfig {
    fn default() -> Self {
        OspfConfig {
            hello_interval: secs(10),
            dead_interval: secs(40),
            router_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OspfNeighbor {
    pub router_id: Ipv4Addr,
    pub addr: Ipv4Addr,
    pub iface: usize,
    pub state: OspfNeighborState,
    pub last_hello: Ticks,
    /// We already described our database to this neighbor.
    dd_sent: bool,
}

/// A network learned from a neighbor's database description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OspfRoute {
    pub network: Ipv4Addr,
    pub mask: SubnetMask,
    pub via: Ipv4Addr,
    pub from: Ipv4Addr,
}

#[derive(Debug)]
pub struct OspfService {
    pub config: OspfConfig,
    pub router_id: Ipv4Addr,
    pub(crate) ifaces: BTreeSet<usize>,
    pub(crate) neighbors: BTreeMap<Ipv4Addr, OspfNeighbor>,
    pub(crate) routes: BTreeMap<(u32, u8), OspfRoute>,
    hello_sub: Option<ClockSub>,
    sweep_sub: Option<ClockSub>,
}

impl OspfService {
    pub(crate) fn cancel_timers(&mut self) {
        for sub in [self.hello_sub.take(), self.sweep_sub.take()]
            .into_iter()
            .flatten()
        {
            sub.cancel();
        }
    }
}

// ── Timer bodies ────────────────────────────────────────────

fn hello_tick(net: &mut Network, node: NodeId) {
    let mut outgoing: Vec<(usize, OspfPdu)> = Vec::new();
    {
        let Ok(n) = net.node(node) else { return };
        let Some(s) = n.as_router().and_then(|r| r.ospf.as_ref()) else {
            return;
        };
        let neighbors: Vec<Ipv4Addr> = s.neighbors.keys().copied().collect();
        for &iface in s.ifaces.iter() {
            if n.iface(iface).map(|f| f.up && f.is_connected()).unwrap_or(false) {
                outgoing.push((
                    iface,
                    OspfPdu::Hello {
                        router_id: s.router_id,
                        neighbors: neighbors.clone(),
                    },
                ));
            }
        }
    }
    for (iface, pdu) in outgoing {
        let _ = net.broadcast_ip(node, iface, Ipv4Payload::Ospf(pdu));
    }
}

fn sweep(net: &mut Network, node: NodeId) {
    let now = net.now();
    let Ok(n) = net.node_mut(node) else { return };
    let Some(s) = n.as_router_mut().and_then(|r| r.ospf.as_mut()) else {
        return;
    };
    let dead = s.config.dead_interval;
    let expired: Vec<Ipv4Addr> = s
        .neighbors
        .iter()
        .filter(|(_, nbr)| now.saturating_sub(nbr.last_hello) >= dead)
        .map(|(id, _)| *id)
        .collect();
    for id in expired {
        log::debug!("ospf: neighbor {} dead", id);
        s.neighbors.remove(&id);
        s.routes.retain(|_, r| r.from != id);
    }
}

// ── Reception ───────────────────────────────────────────────

pub(crate) fn receive(
    net: &mut Network,
    node: NodeId,
    iface: usize,
    src_ip: Ipv4Addr,
    pdu: OspfPdu,
) {
    let now = net.now();

    // Our connected networks, for the database exchange.
    let connected: Vec<(Ipv4Addr, SubnetMask)> = match net.node(node) {
        Ok(n) => n
            .interfaces()
            .filter_map(|f| f.subnet())
            .map(|(ip, mask)| (ip.network(mask), mask))
            .collect(),
        Err(_) => return,
    };

    let mut reply: Option<OspfPdu> = None;
    {
        let Ok(n) = net.node_mut(node) else { return };
        let Some(s) = n.as_router_mut().and_then(|r| r.ospf.as_mut()) else {
            return;
        };
        if !s.ifaces.contains(&iface) {
            return;
        }
        let our_id = s.router_id;

        match pdu {
            OspfPdu::Hello {
                router_id,
                neighbors,
            } => {
                if router_id == our_id {
                    return;
                }
                let nbr = s.neighbors.entry(router_id).or_insert(OspfNeighbor {
                    router_id,
                    addr: src_ip,
                    iface,
                    state: OspfNeighborState::Down,
                    last_hello: now,
                    dd_sent: false,
                });
                nbr.last_hello = now;
                nbr.addr = src_ip;
                if nbr.state == OspfNeighborState::Down {
                    nbr.state = OspfNeighborState::Init;
                    log::debug!("ospf: neighbor {} init", router_id);
                }
                // Two-way: the neighbor lists us in its hello.
                if neighbors.contains(&our_id) && nbr.state < OspfNeighborState::ExStart {
                    nbr.state = OspfNeighborState::ExStart;
                    nbr.dd_sent = true;
                    log::debug!("ospf: neighbor {} exstart", router_id);
                    reply = Some(OspfPdu::DatabaseDescription {
                        router_id: our_id,
                        networks: connected.clone(),
                    });
                }
            }
            OspfPdu::DatabaseDescription {
                router_id,
                networks,
            } => {
                if router_id == our_id {
                    return;
                }
                let Some(nbr) = s.neighbors.get_mut(&router_id) else {
                    return;
                };
                nbr.last_hello = now;
                for (network, mask) in &networks {
                    s.routes.insert(
                        (network.to_u32(), mask.cidr()),
                        OspfRoute {
                            network: *network,
                            mask: *mask,
                            via: src_ip,
                            from: router_id,
                        },
                    );
                }
                let nbr = s.neighbors.get_mut(&router_id).expect("just looked up");
                if !nbr.dd_sent {
                    nbr.dd_sent = true;
                    reply = Some(OspfPdu::DatabaseDescription {
                        router_id: our_id,
                        networks: connected.clone(),
                    });
                }
                if nbr.state < OspfNeighborState::Full {
                    nbr.state = OspfNeighborState::Full;
                    log::debug!("ospf: neighbor {} full", router_id);
                }
            }
        }
    }

    if let Some(pdu) = reply {
        let _ = net.send_ip(node, src_ip, Ipv4Payload::Ospf(pdu));
    }
}

// ── Public surface ──────────────────────────────────────────

impl Network {
    fn ospf_mut(&mut self, node: NodeId) -> Result<&mut OspfService, NetworkError> {
        self.node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?
            .ospf
            .as_mut()
            .ok_or(NetworkError::NotARouter)
    }

    /// Enable OSPF. The router id defaults to the highest interface IP.
    pub fn ospf_enable(&mut self, node: NodeId, config: OspfConfig) -> Result<(), NetworkError> {
        let router_id = match config.router_id {
            Some(id) => id,
            None => self
                .node(node)?
                .interfaces()
                .filter_map(|f| f.net.ip)
                .max()
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
        };

        let clock = self.clock.clone();
        let hello = clock.repeat(config.hello_interval, move |net: &mut Network, _| {
            hello_tick(net, node);
        });
        let sweeper = clock.repeat(secs(1), move |net: &mut Network, _| {
            sweep(net, node);
        });
        // Prompt first hello instead of waiting a whole interval.
        clock.once(netlab_clock::millis(100), move |net: &mut Network, _| {
            hello_tick(net, node);
        });

        let router = self
            .node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?;
        if let Some(old) = router.ospf.as_mut() {
            old.cancel_timers();
        }
        router.ospf = Some(OspfService {
            config,
            router_id,
            ifaces: BTreeSet::new(),
            neighbors: BTreeMap::new(),
            routes: BTreeMap::new(),
            hello_sub: Some(hello),
            sweep_sub: Some(sweeper),
        });
        Ok(())
    }

    pub fn ospf_disable(&mut self, node: NodeId) -> Result<(), NetworkError> {
        let router = self
            .node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?;
        if let Some(service) = router.ospf.as_mut() {
            service.cancel_timers();
        }
        router.ospf = None;
        Ok(())
    }

    pub fn ospf_enable_on_interface(
        &mut self,
        node: NodeId,
        iface: &str,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, iface)?;
        self.ospf_mut(node)?.ifaces.insert(index);
        Ok(())
    }

    pub fn ospf_neighbors(
        &self,
        node: NodeId,
    ) -> Result<Vec<(Ipv4Addr, OspfNeighborState)>, NetworkError> {
        let service = self
            .node(node)?
            .as_router()
            .ok_or(NetworkError::NotARouter)?
            .ospf
            .as_ref()
            .ok_or(NetworkError::NotARouter)?;
        Ok(service
            .neighbors
            .iter()
            .map(|(id, n)| (*id, n.state))
            .collect())
    }

    /// The advertised-network table learned from adjacencies.
    pub fn ospf_routes(&self, node: NodeId) -> Result<Vec<OspfRoute>, NetworkError> {
        let service = self
            .node(node)?
            .as_router()
            .ok_or(NetworkError::NotARouter)?
            .ospf
            .as_ref()
            .ok_or(NetworkError::NotARouter)?;
        Ok(service.routes.values().copied().collect())
    }
}
