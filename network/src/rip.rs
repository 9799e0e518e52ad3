//! RIP — distance-vector routing service
//!
//! Periodic full-table broadcasts per enabled interface with
//! split-horizon / poison-reverse, +1 metric on reception, triggered
//! updates on change, and invalid/flush aging. Metric 16 is infinity.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use netlab_clock::{millis, secs, Ticks};

use crate::message::{Ipv4Payload, RipEntry, RipUpdate};
use crate::network::{ClockSub, Network, NodeId};
use crate::{Ipv4Addr, NetworkError, SubnetMask};

/// Unreachable metric.
pub const RIP_INFINITY: u8 = 16;

/// Delay before a triggered update goes out, coalescing bursts.
const TRIGGERED_DELAY: Ticks = millis(500);

/// Delay before the initial full update after enabling.
const INITIAL_DELAY: Ticks = millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipConfig {
    pub update_interval: Ticks,
    pub invalid_after: Ticks,
    pub flush_after: Ticks,
    pub default_metric: u8,
    pub split_horizon: bool,
    pub poison_reverse: bool,
}

impl Default for RipConfig {
    fn default() -> Self {
        RipConfig {
            update_interval: secs(30),
            invalid_after: secs(180),
            flush_after: secs(240),
            default_metric: 1,
            split_horizon: true,
            poison_reverse: true,
        }
    }
}

/// One learned route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipRoute {
    pub network: Ipv4Addr,
    pub mask: SubnetMask,
    pub next_hop: Ipv4Addr,
    pub metric: u8,
    pub iface: usize,
    pub last_update: Ticks,
    pub route_tag: u16,
}

#[derive(Debug, Default)]
pub struct RipService {
    pub config: RipConfig,
    pub(crate) ifaces: BTreeSet<usize>,
    /// Keyed by `(network, prefix-length)`.
    pub(crate) routes: BTreeMap<(u32, u8), RipRoute>,
    update_sub: Option<ClockSub>,
    sweep_sub: Option<ClockSub>,
    initial_sub: Option<ClockSub>,
    triggered_sub: Option<ClockSub>,
}

impl RipService {
    pub fn routes(&self) -> Vec<RipRoute> {
        self.routes.values().copied().collect()
    }

    pub(crate) fn cancel_timers(&mut self) {
        for sub in [
            self.update_sub.take(),
            self.sweep_sub.take(),
            self.initial_sub.take(),
            self.triggered_sub.take(),
        ]
        .into_iter()
        .flatten()
        {
            sub.cancel();
        }
    }
}

// ── Timer bodies ────────────────────────────────────────────

/// Periodic (or triggered) advertisement on every enabled interface.
pub(crate) fn send_updates(net: &mut Network, node: NodeId) {
    // Read phase: build one update per enabled interface.
    let mut outgoing: Vec<(usize, RipUpdate)> = Vec::new();
    {
        let Ok(n) = net.node(node) else { return };
        let Some(service) = n.as_router().and_then(|r| r.rip.as_ref()) else {
            return;
        };
        let cfg = service.config;

        // Directly connected networks of every enabled interface are
        // redistributed at the default metric.
        let connected: Vec<(Ipv4Addr, SubnetMask, usize)> = service
            .ifaces
            .iter()
            .filter_map(|&i| {
                let ifr = n.iface(i)?;
                let (ip, mask) = ifr.subnet()?;
                Some((ip.network(mask), mask, i))
            })
            .collect();

        for &out in service.ifaces.iter() {
            if n.iface(out).map(|f| !f.up || !f.is_connected()).unwrap_or(true) {
                continue;
            }
            let mut entries: Vec<RipEntry> = Vec::new();

            for &(network, mask, learned_on) in &connected {
                if learned_on == out {
                    if cfg.poison_reverse {
                        entries.push(RipEntry {
                            network,
                            mask,
                            metric: RIP_INFINITY,
                            route_tag: 0,
                        });
                    } else if !cfg.split_horizon {
                        entries.push(RipEntry {
                            network,
                            mask,
                            metric: cfg.default_metric,
                            route_tag: 0,
                        });
                    }
                } else {
                    entries.push(RipEntry {
                        network,
                        mask,
                        metric: cfg.default_metric,
                        route_tag: 0,
                    });
                }
            }

            for route in service.routes.values() {
                if route.iface == out {
                    if cfg.poison_reverse {
                        entries.push(RipEntry {
                            network: route.network,
                            mask: route.mask,
                            metric: RIP_INFINITY,
                            route_tag: route.route_tag,
                        });
                    } else if !cfg.split_horizon {
                        entries.push(RipEntry {
                            network: route.network,
                            mask: route.mask,
                            metric: route.metric,
                            route_tag: route.route_tag,
                        });
                    }
                } else {
                    entries.push(RipEntry {
                        network: route.network,
                        mask: route.mask,
                        metric: route.metric,
                        route_tag: route.route_tag,
                    });
                }
            }

            if !entries.is_empty() {
                outgoing.push((out, RipUpdate { entries }));
            }
        }
    }

    for (iface, update) in outgoing {
        let _ = net.broadcast_ip(node, iface, Ipv4Payload::Rip(update));
    }
}

/// Process one received update: +1 every metric, install if better,
/// refresh if from the same next hop.
pub(crate) fn receive_update(
    net: &mut Network,
    node: NodeId,
    iface: usize,
    src_ip: Ipv4Addr,
    update: RipUpdate,
) {
    let now = net.now();

    // Networks we are directly attached to are never learned.
    let connected: Vec<(u32, u8)> = match net.node(node) {
        Ok(n) => n
            .interfaces()
            .filter_map(|f| f.subnet())
            .map(|(ip, mask)| (ip.network(mask).to_u32(), mask.cidr()))
            .collect(),
        Err(_) => return,
    };

    let need_trigger = {
        let Ok(n) = net.node_mut(node) else { return };
        let Some(service) = n.as_router_mut().and_then(|r| r.rip.as_mut()) else {
            return;
        };
        if !service.ifaces.contains(&iface) {
            return;
        }

        let mut changed = false;
        for entry in &update.entries {
            let metric = entry.metric.saturating_add(1).min(RIP_INFINITY);
            let network = entry.network.network(entry.mask);
            let key = (network.to_u32(), entry.mask.cidr());
            if connected.contains(&key) {
                continue;
            }

            match service.routes.get_mut(&key) {
                Some(route) => {
                    if route.next_hop == src_ip {
                        // Same source refreshes unconditionally.
                        if route.metric != metric {
                            changed = true;
                        }
                        route.metric = metric;
                        route.iface = iface;
                        route.last_update = now;
                    } else if metric < route.metric {
                        *route = RipRoute {
                            network,
                            mask: entry.mask,
                            next_hop: src_ip,
                            metric,
                            iface,
                            last_update: now,
                            route_tag: entry.route_tag,
                        };
                        changed = true;
                    }
                }
                None => {
                    if metric < RIP_INFINITY {
                        service.routes.insert(
                            key,
                            RipRoute {
                                network,
                                mask: entry.mask,
                                next_hop: src_ip,
                                metric,
                                iface,
                                last_update: now,
                                route_tag: entry.route_tag,
                            },
                        );
                        changed = true;
                    }
                }
            }
        }
        changed && service.triggered_sub.is_none()
    };

    if need_trigger {
        let clock = net.clock.clone();
        let sub = clock.once(TRIGGERED_DELAY, move |net: &mut Network, _| {
            if let Ok(n) = net.node_mut(node) {
                if let Some(s) = n.as_router_mut().and_then(|r| r.rip.as_mut()) {
                    s.triggered_sub = None;
                }
            }
            send_updates(net, node);
        });
        if let Ok(n) = net.node_mut(node) {
            if let Some(s) = n.as_router_mut().and_then(|r| r.rip.as_mut()) {
                s.triggered_sub = Some(sub);
            }
        }
    }
}

/// Invalid/flush aging. Runs every virtual second.
fn sweep(net: &mut Network, node: NodeId) {
    let now = net.now();
    let Ok(n) = net.node_mut(node) else { return };
    let Some(service) = n.as_router_mut().and_then(|r| r.rip.as_mut()) else {
        return;
    };
    let cfg = service.config;
    service
        .routes
        .retain(|_, r| now.saturating_sub(r.last_update) < cfg.flush_after);
    for route in service.routes.values_mut() {
        if now.saturating_sub(route.last_update) >= cfg.invalid_after {
            route.metric = RIP_INFINITY;
        }
    }
}

// ── Public surface ──────────────────────────────────────────

impl Network {
    fn rip_mut(&mut self, node: NodeId) -> Result<&mut RipService, NetworkError> {
        self.node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?
            .rip
            .as_mut()
            .ok_or(NetworkError::NotARouter)
    }

    /// Enable RIP on a router, arming the periodic update, the aging
    /// sweep, and a prompt initial update.
    pub fn rip_enable(&mut self, node: NodeId) -> Result<(), NetworkError> {
        let router = self
            .node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?;
        if router.rip.is_none() {
            router.rip = Some(RipService::default());
        }
        self.rip_arm_timers(node)
    }

    fn rip_arm_timers(&mut self, node: NodeId) -> Result<(), NetworkError> {
        let clock = self.clock.clone();
        let service = self.rip_mut(node)?;
        service.cancel_timers();
        let interval = service.config.update_interval;

        service.update_sub = Some(clock.repeat(interval, move |net: &mut Network, _| {
            send_updates(net, node);
        }));
        service.sweep_sub = Some(clock.repeat(secs(1), move |net: &mut Network, _| {
            sweep(net, node);
        }));
        service.initial_sub = Some(clock.once(INITIAL_DELAY, move |net: &mut Network, _| {
            if let Ok(n) = net.node_mut(node) {
                if let Some(s) = n.as_router_mut().and_then(|r| r.rip.as_mut()) {
                    s.initial_sub = None;
                }
            }
            send_updates(net, node);
        }));
        Ok(())
    }

    /// Disable the service, dropping every learned route.
    pub fn rip_disable(&mut self, node: NodeId) -> Result<(), NetworkError> {
        let router = self
            .node_mut(node)?
            .as_router_mut()
            .ok_or(NetworkError::NotARouter)?;
        if let Some(service) = router.rip.as_mut() {
            service.cancel_timers();
        }
        router.rip = None;
        Ok(())
    }

    pub fn rip_enable_on_interface(
        &mut self,
        node: NodeId,
        iface: &str,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, iface)?;
        let service = self.rip_mut(node)?;
        service.ifaces.insert(index);
        // Toggling interface participation invalidates learned state.
        service.routes.clear();
        Ok(())
    }

    pub fn rip_disable_on_interface(
        &mut self,
        node: NodeId,
        iface: &str,
    ) -> Result<(), NetworkError> {
        let index = self.iface_index(node, iface)?;
        let service = self.rip_mut(node)?;
        service.ifaces.remove(&index);
        service.routes.clear();
        Ok(())
    }

    pub fn rip_routes(&self, node: NodeId) -> Result<Vec<RipRoute>, NetworkError> {
        Ok(self
            .node(node)?
            .as_router()
            .ok_or(NetworkError::NotARouter)?
            .rip
            .as_ref()
            .ok_or(NetworkError::NotARouter)?
            .routes())
    }

    pub fn rip_clear_routes(&mut self, node: NodeId) -> Result<(), NetworkError> {
        self.rip_mut(node)?.routes.clear();
        Ok(())
    }

    pub fn rip_set_split_horizon(&mut self, node: NodeId, on: bool) -> Result<(), NetworkError> {
        self.rip_mut(node)?.config.split_horizon = on;
        Ok(())
    }

    pub fn rip_set_poison_reverse(&mut self, node: NodeId, on: bool) -> Result<(), NetworkError> {
        self.rip_mut(node)?.config.poison_reverse = on;
        Ok(())
    }

    pub fn rip_set_update_interval(
        &mut self,
        node: NodeId,
        seconds: u64,
    ) -> Result<(), NetworkError> {
        self.rip_mut(node)?.config.update_interval = secs(seconds);
        self.rip_arm_timers(node)
    }

    pub fn rip_set_invalid_after(
        &mut self,
        node: NodeId,
        seconds: u64,
    ) -> Result<(), NetworkError> {
        self.rip_mut(node)?.config.invalid_after = secs(seconds);
        Ok(())
    }

    pub fn rip_set_flush_after(&mut self, node: NodeId, seconds: u64) -> Result<(), NetworkError> {
        self.rip_mut(node)?.config.flush_after = secs(seconds);
        Ok(())
    }

    pub fn rip_set_default_metric(
        &mut self,
        node: NodeId,
        metric: u8,
    ) -> Result<(), NetworkError> {
        self.rip_mut(node)?.config.default_metric = metric;
        Ok(())
    }
}
