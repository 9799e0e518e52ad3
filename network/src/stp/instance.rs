//! Per-instance spanning tree state machine
//!
//! Root election, root-port selection with the four-level tie-break,
//! designated/blocked decisions, BPDU aging and the Listening → Learning
//! → Forwarding ladder. One instance per VLAN under PVST, a single
//! instance otherwise.

use alloc::collections::BTreeMap;

use netlab_clock::secs;

use crate::iface::Interface;
use crate::message::{Bpdu, BpduFlags, BridgeId};
use crate::network::{Clock, ClockSub, Network, NodeId};
use crate::stp::{self, rstp, StpTimers, COST_NONE, LINK_COST};
use crate::VlanId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Disabled,
    Root,
    Designated,
    Blocked,
    Alternate,
    Backup,
}

impl PortRole {
    pub fn is_forwarding_role(self) -> bool {
        matches!(self, PortRole::Root | PortRole::Designated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Disabled,
    Blocking,
    Listening,
    Learning,
    Forwarding,
}

/// The sender-side fields of the best BPDU seen on a port, kept for
/// tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortBpdu {
    pub root_id: BridgeId,
    pub root_path_cost: u32,
    pub bridge_id: BridgeId,
    pub port_id: u16,
}

#[derive(Debug)]
pub struct StpPort {
    pub role: PortRole,
    pub state: PortState,
    /// Path cost to the root via this port; `COST_NONE` until a BPDU
    /// arrives.
    pub cost: u32,
    pub(crate) best: Option<PortBpdu>,
    pub(crate) age_sub: Option<ClockSub>,
    pub(crate) transition_sub: Option<ClockSub>,
    // RSTP extensions.
    pub is_edge: bool,
    pub(crate) edge_sub: Option<ClockSub>,
    /// A proposal went out and no agreement has come back yet.
    pub proposed: bool,
    /// The neighbor talks plain 802.1D.
    pub neighbor_is_stp: bool,
}

impl Default for StpPort {
    fn default() -> Self {
        StpPort {
            role: PortRole::Disabled,
            state: PortState::Disabled,
            cost: COST_NONE,
            best: None,
            age_sub: None,
            transition_sub: None,
            is_edge: false,
            edge_sub: None,
            proposed: false,
            neighbor_is_stp: false,
        }
    }
}

impl StpPort {
    pub(crate) fn cancel_timers(&mut self) {
        for sub in [
            self.age_sub.take(),
            self.transition_sub.take(),
            self.edge_sub.take(),
        ]
        .into_iter()
        .flatten()
        {
            sub.cancel();
        }
    }
}

#[derive(Debug)]
pub struct StpInstance {
    pub vlan: VlanId,
    pub root_id: BridgeId,
    /// Cost via the root port; 0 while this bridge is root.
    pub root_path_cost: u32,
    pub root_port: Option<usize>,
    pub(crate) ports: BTreeMap<usize, StpPort>,
}

impl StpInstance {
    pub(crate) fn new(vlan: VlanId, bridge_id: BridgeId) -> Self {
        StpInstance {
            vlan,
            root_id: bridge_id,
            root_path_cost: 0,
            root_port: None,
            ports: BTreeMap::new(),
        }
    }

    pub(crate) fn init_port(
        &mut self,
        clock: &Clock,
        timers: &StpTimers,
        rapid: bool,
        node: NodeId,
        index: usize,
        ifr: &Interface,
        bridge_id: BridgeId,
    ) {
        self.ports.insert(index, StpPort::default());
        self.refresh_port(clock, timers, rapid, node, index, ifr, bridge_id);
    }

    /// Bring a port's role in line with its hardware state: a down or
    /// unconnected port is Disabled, a usable port (re-)starts life as
    /// Designated.
    pub(crate) fn refresh_port(
        &mut self,
        clock: &Clock,
        timers: &StpTimers,
        rapid: bool,
        node: NodeId,
        index: usize,
        ifr: &Interface,
        bridge_id: BridgeId,
    ) {
        let usable = ifr.up && ifr.is_connected();
        let vlan = self.vlan;

        if !usable {
            let was_root_port = self.root_port == Some(index);
            if let Some(port) = self.ports.get_mut(&index) {
                port.cancel_timers();
                port.role = PortRole::Disabled;
                port.state = PortState::Disabled;
                port.cost = COST_NONE;
                port.best = None;
                port.is_edge = false;
                port.proposed = false;
            }
            if was_root_port {
                // The path to the root died with the port.
                self.become_root(clock, timers, rapid, node, bridge_id);
            }
            return;
        }

        if let Some(port) = self.ports.get_mut(&index) {
            if port.role == PortRole::Disabled {
                port.cost = COST_NONE;
                port.best = None;
                port.role = PortRole::Designated;
                port.state = PortState::Blocking;
                start_ladder(clock, timers, node, vlan, index, port);
                if rapid {
                    rstp::arm_edge_timer(clock, node, vlan, index, port);
                }
            }
        }
    }

    /// Declare this bridge root: every usable port becomes Designated
    /// with cost 0. The bridge id to claim is the instance's own.
    pub(crate) fn become_root(
        &mut self,
        clock: &Clock,
        timers: &StpTimers,
        rapid: bool,
        node: NodeId,
        bridge_id: BridgeId,
    ) {
        self.root_id = bridge_id;
        self.become_root_with(clock, timers, rapid, node);
    }

    fn become_root_with(&mut self, clock: &Clock, timers: &StpTimers, rapid: bool, node: NodeId) {
        self.root_port = None;
        self.root_path_cost = 0;
        let vlan = self.vlan;
        for (&index, port) in self.ports.iter_mut() {
            if port.role == PortRole::Disabled {
                continue;
            }
            port.cost = 0;
            port.best = None;
            apply_role(clock, timers, rapid, port, node, vlan, index, PortRole::Designated);
        }
    }

    /// Assign a role, honoring the root-bridge invariant: a root bridge
    /// only carries Designated or Disabled ports; other requests are
    /// silently rejected.
    pub(crate) fn set_role(
        &mut self,
        clock: &Clock,
        timers: &StpTimers,
        rapid: bool,
        i_am_root: bool,
        node: NodeId,
        index: usize,
        role: PortRole,
    ) {
        if i_am_root && !matches!(role, PortRole::Designated | PortRole::Disabled) {
            return;
        }
        let vlan = self.vlan;
        if let Some(port) = self.ports.get_mut(&index) {
            apply_role(clock, timers, rapid, port, node, vlan, index, role);
        }
    }
}

/// Role assignment drives state: non-forwarding roles block immediately,
/// forwarding roles walk Listening → Learning → Forwarding unless RSTP
/// lets them skip.
fn apply_role(
    clock: &Clock,
    timers: &StpTimers,
    rapid: bool,
    port: &mut StpPort,
    node: NodeId,
    vlan: VlanId,
    index: usize,
    role: PortRole,
) {
    if port.role == role {
        return;
    }
    log::debug!(
        "stp: vlan {} port {} role {:?} -> {:?}",
        vlan,
        index,
        port.role,
        role
    );
    port.role = role;
    if let Some(sub) = port.transition_sub.take() {
        sub.cancel();
    }

    match role {
        PortRole::Disabled => port.state = PortState::Disabled,
        PortRole::Blocked | PortRole::Alternate | PortRole::Backup => {
            port.state = PortState::Blocking;
            port.proposed = false;
        }
        PortRole::Root | PortRole::Designated => {
            if port.state == PortState::Forwarding {
                return;
            }
            if rapid && port.is_edge && role == PortRole::Designated {
                // An edge port has no loop to create.
                port.state = PortState::Forwarding;
                return;
            }
            port.state = PortState::Listening;
            start_ladder(clock, timers, node, vlan, index, port);
        }
    }
}

pub(crate) fn start_ladder(
    clock: &Clock,
    timers: &StpTimers,
    node: NodeId,
    vlan: VlanId,
    index: usize,
    port: &mut StpPort,
) {
    if let Some(sub) = port.transition_sub.take() {
        sub.cancel();
    }
    port.state = PortState::Listening;
    let delay = secs(timers.forward_delay as u64);
    port.transition_sub = Some(clock.once(delay, move |net: &mut Network, _| {
        transition_tick(net, node, vlan, index);
    }));
}

/// Walk one step of the forward-delay ladder.
fn transition_tick(net: &mut Network, node: NodeId, vlan: VlanId, index: usize) {
    let clock = net.clock.clone();
    let Some((_, sw)) = stp::switch_parts(net, node) else {
        return;
    };
    let timers = sw.timers;
    let Some(port) = sw.instances.get_mut(&vlan).and_then(|i| i.ports.get_mut(&index)) else {
        return;
    };
    port.transition_sub = None;
    match port.state {
        PortState::Listening => {
            port.state = PortState::Learning;
            let delay = secs(timers.forward_delay as u64);
            port.transition_sub = Some(clock.once(delay, move |net: &mut Network, _| {
                transition_tick(net, node, vlan, index);
            }));
        }
        PortState::Learning => {
            port.state = PortState::Forwarding;
            log::debug!("stp: vlan {} port {} forwarding", vlan, index);
        }
        _ => {}
    }
}

/// The BPDU-age timer ran out: the information on the port is dead.
pub(crate) fn age_expired(net: &mut Network, node: NodeId, vlan: VlanId, index: usize) {
    let clock = net.clock.clone();
    let Some((_, sw)) = stp::switch_parts(net, node) else {
        return;
    };
    let bridge_id = sw.bridge_id();
    let timers = sw.timers;
    let rapid = sw.is_rapid();
    let Some(inst) = sw.instances.get_mut(&vlan) else {
        return;
    };
    let Some(port) = inst.ports.get_mut(&index) else {
        return;
    };
    port.age_sub = None;
    port.cost = COST_NONE;
    port.best = None;

    if inst.root_port == Some(index) {
        // The root vanished: claim the root role ourselves. Fresh BPDUs
        // from a surviving root re-run the election.
        log::debug!("stp: vlan {} root information aged out, claiming root", vlan);
        inst.become_root(&clock, &timers, rapid, node, bridge_id);
    } else if matches!(
        port.role,
        PortRole::Blocked | PortRole::Alternate | PortRole::Backup
    ) {
        // The competitor on the segment went quiet.
        let i_am_root = inst.root_id == bridge_id;
        inst.set_role(
            &clock,
            &timers,
            rapid,
            i_am_root,
            node,
            index,
            PortRole::Designated,
        );
    }
}

/// §802.1D reception pipeline for one configuration BPDU.
pub(crate) fn process_bpdu(
    net: &mut Network,
    node: NodeId,
    vlan: VlanId,
    index: usize,
    bpdu: &Bpdu,
) {
    // 1. Stale or self-originated BPDUs are discarded.
    if bpdu.message_age >= bpdu.max_age {
        return;
    }

    let clock = net.clock.clone();
    let mut agreement_send = None;

    {
        let Some((ifaces, sw)) = stp::switch_parts(net, node) else {
            return;
        };
        let my_bridge = sw.bridge_id();
        if bpdu.bridge_id == my_bridge {
            return;
        }
        let timers = sw.timers;
        let rapid = sw.is_rapid();
        let Some(inst) = sw.instances.get_mut(&vlan) else {
            return;
        };
        if !inst.ports.contains_key(&index) {
            return;
        }

        // 2. Restart the aging timer on this port.
        {
            let port = inst.ports.get_mut(&index).expect("port exists");
            if let Some(sub) = port.age_sub.take() {
                sub.cancel();
            }
            let max_age = secs(timers.max_age as u64);
            port.age_sub = Some(clock.once(max_age, move |net: &mut Network, _| {
                age_expired(net, node, vlan, index);
            }));

            port.neighbor_is_stp = !bpdu.is_rstp();
            if rapid {
                // Any BPDU disproves edge status and restarts detection.
                port.is_edge = false;
                rstp::arm_edge_timer(&clock, node, vlan, index, port);
            }
        }

        // 3. Root election: adopt a lower root id, clearing stale costs
        // and the received-BPDU cache.
        if bpdu.root_id < inst.root_id {
            log::debug!(
                "stp: vlan {} adopting root {} (was {})",
                vlan,
                bpdu.root_id,
                inst.root_id
            );
            inst.root_id = bpdu.root_id;
            inst.root_port = None;
            inst.root_path_cost = 0;
            for port in inst.ports.values_mut() {
                port.cost = COST_NONE;
                port.best = None;
            }
        }

        let i_am_root = inst.root_id == my_bridge;
        if bpdu.root_id == inst.root_id && !i_am_root {
            // 4. Same root: refresh this port's cost and cache the BPDU.
            {
                let port = inst.ports.get_mut(&index).expect("port exists");
                port.cost = bpdu.root_path_cost.saturating_add(LINK_COST);
                port.best = Some(PortBpdu {
                    root_id: bpdu.root_id,
                    root_path_cost: bpdu.root_path_cost,
                    bridge_id: bpdu.bridge_id,
                    port_id: bpdu.port_id,
                });
            }

            // 5. Root-port selection: minimum cost, ties broken by
            // (sender priority, sender MAC, sender port, own port).
            let mut best: Option<((u32, BridgeId, u16, u16), usize)> = None;
            for (&i, port) in inst.ports.iter() {
                if port.cost == COST_NONE || port.role == PortRole::Disabled {
                    continue;
                }
                let Some(cache) = port.best.as_ref() else {
                    continue;
                };
                let own_port_id = ifaces
                    .get(i)
                    .map(|f| stp::port_id_of(&f.name))
                    .unwrap_or(u16::MAX);
                let key = (port.cost, cache.bridge_id, cache.port_id, own_port_id);
                if best.map(|(k, _)| key < k).unwrap_or(true) {
                    best = Some((key, i));
                }
            }
            if let Some((_, new_root)) = best {
                if inst.root_port != Some(new_root) {
                    if let Some(old) = inst.root_port {
                        inst.set_role(&clock, &timers, rapid, false, node, old, PortRole::Designated);
                    }
                    inst.root_port = Some(new_root);
                }
                inst.root_path_cost = inst.ports[&new_root].cost;
                inst.set_role(&clock, &timers, rapid, false, node, new_root, PortRole::Root);
            }

            // 6. Designated-or-blocked decision for a non-root port:
            // compare the received BPDU with what we would advertise.
            if inst.root_port != Some(index) {
                let own_port_id = ifaces
                    .get(index)
                    .map(|f| stp::port_id_of(&f.name))
                    .unwrap_or(u16::MAX);
                let ours = (inst.root_id, inst.root_path_cost, my_bridge, own_port_id);
                let theirs = (
                    bpdu.root_id,
                    bpdu.root_path_cost,
                    bpdu.bridge_id,
                    bpdu.port_id,
                );
                let role = if theirs < ours {
                    PortRole::Blocked
                } else {
                    PortRole::Designated
                };
                inst.set_role(&clock, &timers, rapid, false, node, index, role);
            }
        } else if inst.root_port != Some(index) {
            // Inferior information (or we are the root): our own
            // advertisement wins the segment.
            inst.set_role(&clock, &timers, rapid, i_am_root, node, index, PortRole::Designated);
        }

        // RSTP proposal/agreement handling.
        if rapid && bpdu.is_rstp() {
            if bpdu.flags.contains(BpduFlags::PROPOSAL) && inst.root_port == Some(index) {
                agreement_send = rstp::synchronize(
                    &clock, &timers, inst, ifaces, my_bridge, node, index,
                );
            }
            if bpdu.flags.contains(BpduFlags::AGREEMENT) {
                let port = inst.ports.get_mut(&index).expect("port exists");
                if port.proposed && port.role == PortRole::Designated {
                    // Rapid transition: the peer has synchronized.
                    port.proposed = false;
                    if let Some(sub) = port.transition_sub.take() {
                        sub.cancel();
                    }
                    port.state = PortState::Forwarding;
                    log::debug!("rstp: vlan {} port {} rapid forwarding", vlan, index);
                }
            }
        }
    }

    if let Some((out_iface, frame)) = agreement_send {
        let _ = net.transmit(node, out_iface, frame);
    }
}
