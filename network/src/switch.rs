//! Switch data plane
//!
//! MAC learning with aging, VLAN-aware flooding and forwarding, and the
//! STP gates on both ingress and egress. BPDUs are handed to the
//! spanning tree service and never learned or forwarded; with STP
//! disabled they flood like any other multicast.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use hashbrown::HashMap;
use netlab_clock::{secs, Ticks};

use crate::iface::VlanMode;
use crate::listener::Disposition;
use crate::message::{EtherPayload, Message};
use crate::network::{ClockSub, Network, NodeId};
use crate::stp::{self, Gate, SpanningTree};
use crate::{Mac, NetworkError, VlanId};

/// Entries older than this are evicted by the sweep.
pub const MAC_MAX_AGE: Ticks = secs(300);
/// Sweep period.
pub const MAC_SWEEP_INTERVAL: Ticks = secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacEntry {
    pub iface: usize,
    pub last_seen: Ticks,
}

/// Forwarding table: MAC → interfaces it was seen on.
#[derive(Debug, Default)]
pub struct MacTable {
    entries: HashMap<Mac, Vec<MacEntry>>,
}

impl MacTable {
    pub fn new() -> Self {
        MacTable::default()
    }

    /// Replace-or-insert the entry for `(mac, iface)`, stamped with `now`.
    pub fn learn(&mut self, mac: Mac, iface: usize, now: Ticks) {
        let list = self.entries.entry(mac).or_default();
        match list.iter_mut().find(|e| e.iface == iface) {
            Some(entry) => entry.last_seen = now,
            None => list.push(MacEntry {
                iface,
                last_seen: now,
            }),
        }
    }

    pub fn lookup(&self, mac: Mac) -> Option<&[MacEntry]> {
        self.entries.get(&mac).map(|v| v.as_slice())
    }

    /// Evict entries not refreshed within `max_age`.
    pub fn sweep(&mut self, now: Ticks, max_age: Ticks) {
        for list in self.entries.values_mut() {
            list.retain(|e| now.saturating_sub(e.last_seen) < max_age);
        }
        self.entries.retain(|_, list| !list.is_empty());
    }

    /// Forget everything learned on one interface.
    pub fn flush_iface(&mut self, iface: usize) {
        for list in self.entries.values_mut() {
            list.retain(|e| e.iface != iface);
        }
        self.entries.retain(|_, list| !list.is_empty());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-switch state: VLAN names, forwarding table, spanning tree.
#[derive(Debug, Default)]
pub struct SwitchState {
    pub known_vlans: BTreeMap<VlanId, String>,
    pub mac_table: MacTable,
    pub stp: SpanningTree,
    pub(crate) aging: Option<ClockSub>,
}

impl SwitchState {
    pub fn is_enabled(&self) -> bool {
        self.stp.is_enabled()
    }
}

// ── Aging ───────────────────────────────────────────────────

/// Arm the periodic MAC-table sweep for a new switch.
pub(crate) fn start_aging(net: &mut Network, node: NodeId) {
    let clock = net.clock.clone();
    let sub = clock.repeat(MAC_SWEEP_INTERVAL, move |net: &mut Network, _| {
        let now = net.now();
        if let Ok(n) = net.node_mut(node) {
            if let Some(sw) = n.as_switch_mut() {
                sw.mac_table.sweep(now, MAC_MAX_AGE);
            }
        }
    });
    if let Ok(n) = net.node_mut(node) {
        if let Some(sw) = n.as_switch_mut() {
            sw.aging = Some(sub);
        }
    }
}

/// Drop MAC entries for an interface that went down or lost its link.
pub(crate) fn flush_iface(net: &mut Network, node: NodeId, iface: usize) {
    if let Ok(n) = net.node_mut(node) {
        if let Some(sw) = n.as_switch_mut() {
            sw.mac_table.flush_iface(iface);
        }
    }
}

// ── Data plane ──────────────────────────────────────────────

/// Frame reception on a switch port.
pub(crate) fn receive_frame(
    net: &mut Network,
    node: NodeId,
    iface: usize,
    message: &Message,
) -> Disposition {
    let now = net.now();

    // The frame's VLAN: the 802.1Q tag, or the port's untagged VLAN.
    let vlan = {
        let Ok(ifr) = net.iface(node, iface) else {
            return Disposition::Continue;
        };
        match message.vlan() {
            Some(v) => v,
            None => ifr.vlan.untagged_vlan(),
        }
    };

    // Bridge traffic goes to the spanning tree service: no learning, no
    // forwarding. Without STP the BPDU floods like ordinary multicast.
    if let EtherPayload::Bpdu(bpdu) = message.payload() {
        let stp_enabled = net
            .node(node)
            .ok()
            .and_then(|n| n.as_switch())
            .map(|sw| sw.is_enabled())
            .unwrap_or(false);
        if stp_enabled {
            stp::receive_bpdu(net, node, iface, bpdu, vlan);
            return Disposition::Stop;
        }
    }

    let gate = stp::ingress_gate(net, node, iface, vlan);
    if gate == Gate::Drop {
        return Disposition::Stop;
    }

    // Learn the sender. Listening and Learning ports still record the
    // source; they only refuse to forward.
    let src = message.src();
    if !src.is_broadcast() {
        if let Ok(n) = net.node_mut(node) {
            if let Some(sw) = n.as_switch_mut() {
                sw.mac_table.learn(src, iface, now);
            }
        }
    }

    if gate == Gate::Listen || gate == Gate::Learn {
        return Disposition::Handled;
    }

    // Select egress interfaces: known unicast forwards, everything else
    // floods within the VLAN.
    let dst = message.dst();
    let targets: Vec<usize> = {
        let Ok(n) = net.node(node) else {
            return Disposition::Continue;
        };
        let known = n
            .as_switch()
            .and_then(|sw| sw.mac_table.lookup(dst))
            .map(|entries| entries.iter().map(|e| e.iface).collect::<Vec<_>>())
            .unwrap_or_default();

        if dst.is_broadcast() || known.is_empty() {
            n.ifaces
                .iter()
                .enumerate()
                .filter(|(i, f)| {
                    *i != iface && f.up && f.is_connected() && f.vlan.carries(vlan)
                })
                .map(|(i, _)| i)
                .collect()
        } else {
            known
                .into_iter()
                .filter(|&i| {
                    i != iface
                        && n.iface(i)
                            .map(|f| f.up && f.is_connected() && f.vlan.carries(vlan))
                            .unwrap_or(false)
                })
                .collect()
        }
    };

    // Rewrite per egress mode and send; non-forwarding egress ports are
    // skipped.
    let mut sends: Vec<(usize, Message)> = Vec::new();
    for q in targets {
        if !stp::egress_allowed(net, node, q, vlan) {
            continue;
        }
        let Ok(out) = net.iface(node, q) else {
            continue;
        };
        let rewritten = match out.vlan.mode {
            VlanMode::Access => message.clone().untagged(),
            VlanMode::Trunk => message.clone().tagged(vlan),
        };
        sends.push((q, rewritten));
    }
    for (q, frame) in sends {
        let _ = net.transmit(node, q, frame);
    }
    Disposition::Handled
}

// ── Known-VLAN management ───────────────────────────────────

impl Network {
    /// Register a VLAN name on a switch; PVST grows an instance for it.
    pub fn switch_add_vlan(
        &mut self,
        node: NodeId,
        vlan: VlanId,
        name: &str,
    ) -> Result<(), NetworkError> {
        crate::iface::check_vlan_id(vlan)?;
        use alloc::string::ToString;
        let sw = self
            .node_mut(node)?
            .as_switch_mut()
            .ok_or(NetworkError::NotASwitch)?;
        sw.known_vlans.insert(vlan, name.to_string());
        stp::vlans_changed(self, node);
        Ok(())
    }

    pub fn switch_remove_vlan(&mut self, node: NodeId, vlan: VlanId) -> Result<(), NetworkError> {
        let sw = self
            .node_mut(node)?
            .as_switch_mut()
            .ok_or(NetworkError::NotASwitch)?;
        sw.known_vlans.remove(&vlan);
        Ok(())
    }

    pub fn mac_table_len(&self, node: NodeId) -> Result<usize, NetworkError> {
        Ok(self
            .node(node)?
            .as_switch()
            .ok_or(NetworkError::NotASwitch)?
            .mac_table
            .len())
    }
}
