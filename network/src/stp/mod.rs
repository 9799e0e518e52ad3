//! Spanning Tree Protocol service
//!
//! One service per switch, carrying one instance for the common spanning
//! tree (STP/RSTP) or one per discovered VLAN (PVST). The bridge id
//! `(priority, lowest-own-MAC)` is shared across instances; root state is
//! per-instance.
//!
//! Every timed transition is a stored clock subscription: replacing a
//! timer cancels the previous handle first, or aging semantics break.

mod instance;
mod rstp;

pub use instance::{PortRole, PortState, StpInstance, StpPort};

use alloc::collections::BTreeMap;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use netlab_clock::secs;

use crate::iface::Interface;
use crate::message::{Bpdu, BridgeId, Message};
use crate::network::{ClockSub, Network, NodeId};
use crate::node::NodeKind;
use crate::{Mac, NetworkError, VlanId};

/// Cost of one hop towards the root. The simulation does not scale cost
/// by link speed.
pub const LINK_COST: u32 = 10;

/// Sentinel: no BPDU has been seen on the port.
pub const COST_NONE: u32 = u32::MAX;

/// Seconds a port stays quiet before RSTP declares it an edge port.
pub const EDGE_DELAY_SECS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StpProtocol {
    None,
    Stp,
    Rstp,
    Pvst,
    RPvst,
    Mstp,
}

/// 802.1D timer constants, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StpTimers {
    pub hello: u16,
    pub forward_delay: u16,
    pub max_age: u16,
}

impl Default for StpTimers {
    fn default() -> Self {
        StpTimers {
            hello: 2,
            forward_delay: 15,
            max_age: 20,
        }
    }
}

/// Per-switch spanning tree state.
#[derive(Debug)]
pub struct SpanningTree {
    pub protocol: StpProtocol,
    pub priority: u16,
    pub timers: StpTimers,
    /// Lowest interface MAC at enable time; half of the bridge id.
    pub(crate) bridge_mac: Mac,
    pub(crate) instances: BTreeMap<VlanId, StpInstance>,
    pub(crate) hello: Option<ClockSub>,
}

impl Default for SpanningTree {
    fn default() -> Self {
        SpanningTree {
            protocol: StpProtocol::None,
            priority: 32_768,
            timers: StpTimers::default(),
            bridge_mac: Mac::ZERO,
            instances: BTreeMap::new(),
            hello: None,
        }
    }
}

impl SpanningTree {
    pub fn bridge_id(&self) -> BridgeId {
        BridgeId::new(self.priority, self.bridge_mac)
    }

    pub fn is_enabled(&self) -> bool {
        self.protocol != StpProtocol::None
    }

    pub(crate) fn is_rapid(&self) -> bool {
        self.protocol == StpProtocol::Rstp
    }

    /// The instance for an explicit VLAN, or the first instance.
    pub(crate) fn instance(&self, vlan: Option<VlanId>) -> Option<&StpInstance> {
        match vlan {
            Some(v) => self.instances.get(&v),
            None => self.instances.values().next(),
        }
    }

    /// True iff this bridge is root of at least one instance.
    pub fn is_root(&self) -> bool {
        let id = self.bridge_id();
        self.instances.values().any(|i| i.root_id == id)
    }
}

/// 16-bit FNV-1a over the port name; the spec's `hash(port-name)`.
pub(crate) fn port_id_of(name: &str) -> u16 {
    let mut hash: u32 = 0x811C_9DC5;
    for byte in name.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    ((hash >> 16) ^ (hash & 0xFFFF)) as u16
}

/// Split a switch node into its interface list and spanning tree state,
/// so STP can read port hardware while mutating protocol state.
pub(crate) fn switch_parts(
    net: &mut Network,
    node: NodeId,
) -> Option<(&mut Vec<Interface>, &mut SpanningTree)> {
    let n = net.node_mut(node).ok()?;
    match &mut n.kind {
        NodeKind::Switch(sw) => Some((&mut n.ifaces, &mut sw.stp)),
        _ => None,
    }
}

// ── Protocol control ────────────────────────────────────────

/// Select the spanning tree protocol for a switch. `None` disables the
/// service; MSTP and rapid PVST are recognized but unimplemented.
pub fn set_protocol(
    net: &mut Network,
    node: NodeId,
    protocol: StpProtocol,
) -> Result<(), NetworkError> {
    if !net.node(node)?.is_switch() {
        return Err(NetworkError::NotASwitch);
    }
    match protocol {
        StpProtocol::RPvst => return Err(NetworkError::NotImplemented("rapid PVST")),
        StpProtocol::Mstp => return Err(NetworkError::NotImplemented("MSTP")),
        _ => {}
    }

    teardown(net, node);
    if protocol == StpProtocol::None {
        return Ok(());
    }

    let clock = net.clock.clone();
    let lowest = net.node(node)?.lowest_mac().unwrap_or(Mac::ZERO);
    let vlans = discovered_vlans(net, node, protocol);

    let (ifaces, sw) = switch_parts(net, node).ok_or(NetworkError::NotASwitch)?;
    sw.protocol = protocol;
    sw.bridge_mac = lowest;
    let bridge_id = sw.bridge_id();
    let timers = sw.timers;
    let rapid = sw.protocol == StpProtocol::Rstp;

    for vlan in vlans {
        let mut inst = StpInstance::new(vlan, bridge_id);
        for (index, ifr) in ifaces.iter().enumerate() {
            inst.init_port(&clock, &timers, rapid, node, index, ifr, bridge_id);
        }
        sw.instances.insert(vlan, inst);
    }

    let hello = secs(timers.hello as u64);
    sw.hello = Some(clock.repeat(hello, move |net: &mut Network, _| {
        hello_tick(net, node);
    }));

    log::debug!("stp: enabled {:?} with bridge id {}", protocol, bridge_id);
    Ok(())
}

fn discovered_vlans(net: &Network, node: NodeId, protocol: StpProtocol) -> BTreeSet<VlanId> {
    let mut vlans = BTreeSet::new();
    if protocol == StpProtocol::Pvst {
        if let Ok(n) = net.node(node) {
            if let Some(sw) = n.as_switch() {
                vlans.extend(sw.known_vlans.keys().copied());
            }
            for ifr in n.interfaces() {
                vlans.extend(ifr.vlan.allowed_vlans());
                vlans.insert(ifr.vlan.native);
            }
        }
    } else {
        vlans.insert(1);
    }
    vlans
}

/// Cancel every subscription and forget all instances.
pub fn teardown(net: &mut Network, node: NodeId) {
    let Some((_, sw)) = switch_parts(net, node) else {
        return;
    };
    if let Some(sub) = sw.hello.take() {
        sub.cancel();
    }
    for inst in sw.instances.values_mut() {
        for port in inst.ports.values_mut() {
            port.cancel_timers();
        }
    }
    sw.instances.clear();
    sw.protocol = StpProtocol::None;
}

// ── Periodic hello ──────────────────────────────────────────

/// Send a BPDU on every active, connected Root or Designated port of
/// every instance.
pub(crate) fn hello_tick(net: &mut Network, node: NodeId) {
    let Some((ifaces, sw)) = switch_parts(net, node) else {
        return;
    };
    let protocol = sw.protocol;
    let bridge_id = sw.bridge_id();
    let timers = sw.timers;
    let rapid = protocol == StpProtocol::Rstp;

    let mut sends: Vec<(usize, Message)> = Vec::new();
    for inst in sw.instances.values_mut() {
        let is_root = inst.root_id == bridge_id;
        let cost = if is_root { 0 } else { inst.root_path_cost };
        let root_id = inst.root_id;
        let vlan = inst.vlan;
        for (&index, port) in inst.ports.iter_mut() {
            let Some(ifr) = ifaces.get(index) else {
                continue;
            };
            if !ifr.up || !ifr.is_connected() {
                continue;
            }
            if port.role != PortRole::Root && port.role != PortRole::Designated {
                continue;
            }
            let bpdu = rstp::build_bpdu(
                protocol,
                &timers,
                root_id,
                cost,
                bridge_id,
                port_id_of(&ifr.name),
                vlan,
                port,
                ifr.full_duplex,
            );
            sends.push((
                index,
                Message::ethernet(
                    ifr.mac,
                    crate::message::STP_MULTICAST,
                    crate::message::EtherPayload::Bpdu(bpdu),
                ),
            ));
        }
    }

    for (index, frame) in sends {
        let _ = net.transmit(node, index, frame);
    }
}

// ── BPDU reception ──────────────────────────────────────────

/// Dispatch a received BPDU to the matching instance.
pub(crate) fn receive_bpdu(
    net: &mut Network,
    node: NodeId,
    iface: usize,
    bpdu: &Bpdu,
    ingress_vlan: VlanId,
) {
    let protocol = match net.node(node).ok().and_then(|n| n.as_switch()) {
        Some(sw) => sw.stp.protocol,
        None => return,
    };
    let vlan = match protocol {
        StpProtocol::Pvst => {
            let vlan = bpdu.vlan.unwrap_or(ingress_vlan);
            let known = net
                .node(node)
                .ok()
                .and_then(|n| n.as_switch())
                .map(|sw| sw.stp.instances.contains_key(&vlan))
                .unwrap_or(false);
            if !known {
                log::trace!("pvst: dropping BPDU for unconfigured VLAN {}", vlan);
                return;
            }
            vlan
        }
        _ => match net
            .node(node)
            .ok()
            .and_then(|n| n.as_switch())
            .and_then(|sw| sw.stp.instances.keys().next().copied())
        {
            Some(v) => v,
            None => return,
        },
    };
    instance::process_bpdu(net, node, vlan, iface, bpdu);
}

// ── Data-plane gates ────────────────────────────────────────

/// What the switch data plane may do with a data frame entering a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Forward,
    Learn,
    Listen,
    Drop,
}

pub(crate) fn ingress_gate(net: &Network, node: NodeId, iface: usize, vlan: VlanId) -> Gate {
    let Some(sw) = net.node(node).ok().and_then(|n| n.as_switch()) else {
        return Gate::Forward;
    };
    if !sw.is_enabled() {
        return Gate::Forward;
    }
    let key = if sw.stp.protocol == StpProtocol::Pvst {
        Some(vlan)
    } else {
        None
    };
    let Some(port) = sw.stp.instance(key).and_then(|i| i.ports.get(&iface)) else {
        return Gate::Forward;
    };
    match (port.role, port.state) {
        (PortRole::Disabled, _) | (_, PortState::Disabled) => Gate::Drop,
        (_, PortState::Blocking) => Gate::Drop,
        (PortRole::Blocked, _) | (PortRole::Alternate, _) | (PortRole::Backup, _) => Gate::Drop,
        (_, PortState::Listening) => Gate::Listen,
        (_, PortState::Learning) => Gate::Learn,
        _ => Gate::Forward,
    }
}

pub(crate) fn egress_allowed(net: &Network, node: NodeId, iface: usize, vlan: VlanId) -> bool {
    let Some(sw) = net.node(node).ok().and_then(|n| n.as_switch()) else {
        return true;
    };
    if !sw.is_enabled() {
        return true;
    }
    let key = if sw.stp.protocol == StpProtocol::Pvst {
        Some(vlan)
    } else {
        None
    };
    match sw.stp.instance(key).and_then(|i| i.ports.get(&iface)) {
        Some(port) => {
            port.state == PortState::Forwarding
                && matches!(port.role, PortRole::Root | PortRole::Designated)
        }
        None => true,
    }
}

// ── Topology notifications ──────────────────────────────────

/// Re-evaluate one port after a link or administrative change.
pub(crate) fn port_refresh(net: &mut Network, node: NodeId, iface: usize) {
    let clock = net.clock.clone();
    let Some((ifaces, sw)) = switch_parts(net, node) else {
        return;
    };
    if !sw.is_enabled() {
        return;
    }
    let rapid = sw.protocol == StpProtocol::Rstp;
    let timers = sw.timers;
    let bridge_id = sw.bridge_id();
    let Some(ifr) = ifaces.get(iface) else {
        return;
    };
    for inst in sw.instances.values_mut() {
        if !inst.ports.contains_key(&iface) {
            inst.ports.insert(iface, StpPort::default());
        }
        inst.refresh_port(&clock, &timers, rapid, node, iface, ifr, bridge_id);
    }
}

/// PVST follows VLAN discovery: new VLANs get their own instance.
pub(crate) fn vlans_changed(net: &mut Network, node: NodeId) {
    let enabled_pvst = net
        .node(node)
        .ok()
        .and_then(|n| n.as_switch())
        .map(|sw| sw.stp.protocol == StpProtocol::Pvst)
        .unwrap_or(false);
    if !enabled_pvst {
        return;
    }
    let vlans = discovered_vlans(net, node, StpProtocol::Pvst);
    let clock = net.clock.clone();
    let Some((ifaces, sw)) = switch_parts(net, node) else {
        return;
    };
    let bridge_id = sw.bridge_id();
    let timers = sw.timers;
    for vlan in vlans {
        if sw.instances.contains_key(&vlan) {
            continue;
        }
        let mut inst = StpInstance::new(vlan, bridge_id);
        for (index, ifr) in ifaces.iter().enumerate() {
            inst.init_port(&clock, &timers, false, node, index, ifr, bridge_id);
        }
        sw.instances.insert(vlan, inst);
    }
}

// ── Queries ─────────────────────────────────────────────────

impl Network {
    pub fn set_stp_protocol(
        &mut self,
        node: NodeId,
        protocol: StpProtocol,
    ) -> Result<(), NetworkError> {
        set_protocol(self, node, protocol)
    }

    pub fn set_bridge_priority(
        &mut self,
        node: NodeId,
        priority: u16,
    ) -> Result<(), NetworkError> {
        let sw = self
            .node_mut(node)?
            .as_switch_mut()
            .ok_or(NetworkError::NotASwitch)?;
        sw.stp.priority = priority;
        Ok(())
    }

    fn stp_of(&self, node: NodeId) -> Result<&SpanningTree, NetworkError> {
        Ok(&self
            .node(node)?
            .as_switch()
            .ok_or(NetworkError::NotASwitch)?
            .stp)
    }

    pub fn stp_bridge_id(&self, node: NodeId) -> Result<BridgeId, NetworkError> {
        Ok(self.stp_of(node)?.bridge_id())
    }

    /// The root bridge id as this switch currently believes it.
    pub fn stp_root(&self, node: NodeId, vlan: Option<VlanId>) -> Result<BridgeId, NetworkError> {
        let stp = self.stp_of(node)?;
        stp.instance(vlan)
            .map(|i| i.root_id)
            .ok_or(NetworkError::NotASwitch)
    }

    pub fn stp_is_root(&self, node: NodeId) -> Result<bool, NetworkError> {
        Ok(self.stp_of(node)?.is_root())
    }

    pub fn stp_port_role(
        &self,
        node: NodeId,
        iface: &str,
        vlan: Option<VlanId>,
    ) -> Result<PortRole, NetworkError> {
        let index = self.iface_index(node, iface)?;
        let stp = self.stp_of(node)?;
        Ok(stp
            .instance(vlan)
            .and_then(|i| i.ports.get(&index))
            .map(|p| p.role)
            .unwrap_or(PortRole::Disabled))
    }

    pub fn stp_port_state(
        &self,
        node: NodeId,
        iface: &str,
        vlan: Option<VlanId>,
    ) -> Result<PortState, NetworkError> {
        let index = self.iface_index(node, iface)?;
        let stp = self.stp_of(node)?;
        Ok(stp
            .instance(vlan)
            .and_then(|i| i.ports.get(&index))
            .map(|p| p.state)
            .unwrap_or(PortState::Disabled))
    }

    /// Path cost to root via the port; `COST_NONE` until a BPDU arrives.
    pub fn stp_port_cost(
        &self,
        node: NodeId,
        iface: &str,
        vlan: Option<VlanId>,
    ) -> Result<u32, NetworkError> {
        let index = self.iface_index(node, iface)?;
        let stp = self.stp_of(node)?;
        Ok(stp
            .instance(vlan)
            .and_then(|i| i.ports.get(&index))
            .map(|p| p.cost)
            .unwrap_or(COST_NONE))
    }
}
