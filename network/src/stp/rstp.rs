//! RSTP extensions: edge detection, proposal/agreement, synchronize
//!
//! A port that hears no BPDU for three seconds is an edge port and may
//! forward immediately. A Designated port on a point-to-point link
//! (full duplex) proposes; the peer synchronizes — blocking its other
//! non-edge Designated ports — and answers with an agreement, letting
//! both sides skip the forward-delay ladder.

use alloc::vec::Vec;

use netlab_clock::secs;

use crate::iface::Interface;
use crate::message::{
    Bpdu, BpduFlags, BpduPortRole, BridgeId, EtherPayload, Message, BPDU_TYPE_CONFIG,
    BPDU_TYPE_RSTP, BPDU_VERSION_RSTP, BPDU_VERSION_STP, STP_MULTICAST,
};
use crate::network::{Clock, Network, NodeId};
use crate::stp::instance::{start_ladder, PortRole, PortState, StpInstance, StpPort};
use crate::stp::{self, StpProtocol, StpTimers, EDGE_DELAY_SECS};
use crate::VlanId;

/// Build the BPDU this port advertises, setting the proposal flag (and
/// remembering it) when a rapid transition is worth asking for.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_bpdu(
    protocol: StpProtocol,
    timers: &StpTimers,
    root_id: BridgeId,
    root_path_cost: u32,
    bridge_id: BridgeId,
    port_id: u16,
    vlan: VlanId,
    port: &mut StpPort,
    full_duplex: bool,
) -> Bpdu {
    let rapid = protocol == StpProtocol::Rstp;
    let (version, bpdu_type) = if rapid {
        (BPDU_VERSION_RSTP, BPDU_TYPE_RSTP)
    } else {
        (BPDU_VERSION_STP, BPDU_TYPE_CONFIG)
    };

    let mut flags = BpduFlags::empty();
    if rapid {
        let role = match port.role {
            PortRole::Root => BpduPortRole::Root,
            PortRole::Designated => BpduPortRole::Designated,
            PortRole::Blocked | PortRole::Alternate | PortRole::Backup => {
                BpduPortRole::AlternateOrBackup
            }
            PortRole::Disabled => BpduPortRole::Unknown,
        };
        flags = flags.with_port_role(role);
        match port.state {
            PortState::Forwarding => flags.insert(BpduFlags::FORWARDING | BpduFlags::LEARNING),
            PortState::Learning => flags.insert(BpduFlags::LEARNING),
            _ => {}
        }

        // Propose on a point-to-point segment towards an RSTP peer while
        // still working towards Forwarding.
        if port.role == PortRole::Designated
            && full_duplex
            && !port.neighbor_is_stp
            && !port.is_edge
            && port.state != PortState::Forwarding
        {
            flags.insert(BpduFlags::PROPOSAL);
            port.proposed = true;
        }
    }

    Bpdu {
        protocol_id: 0,
        version,
        bpdu_type,
        flags,
        root_id,
        root_path_cost,
        bridge_id,
        port_id,
        message_age: 0,
        max_age: timers.max_age,
        hello_time: timers.hello,
        forward_delay: timers.forward_delay,
        vlan: if protocol == StpProtocol::Pvst {
            Some(vlan)
        } else {
            None
        },
    }
}

/// (Re)start the 3 s quiet timer that promotes a port to edge status.
pub(crate) fn arm_edge_timer(
    clock: &Clock,
    node: NodeId,
    vlan: VlanId,
    index: usize,
    port: &mut StpPort,
) {
    if let Some(sub) = port.edge_sub.take() {
        sub.cancel();
    }
    port.edge_sub = Some(clock.once(
        secs(EDGE_DELAY_SECS),
        move |net: &mut Network, _| {
            edge_fired(net, node, vlan, index);
        },
    ));
}

/// No BPDU for the whole detection window: the port faces an end
/// station. A Designated edge port forwards immediately.
fn edge_fired(net: &mut Network, node: NodeId, vlan: VlanId, index: usize) {
    let Some((_, sw)) = stp::switch_parts(net, node) else {
        return;
    };
    let Some(port) = sw
        .instances
        .get_mut(&vlan)
        .and_then(|i| i.ports.get_mut(&index))
    else {
        return;
    };
    port.edge_sub = None;
    port.is_edge = true;
    if port.role == PortRole::Designated && port.state != PortState::Forwarding {
        if let Some(sub) = port.transition_sub.take() {
            sub.cancel();
        }
        port.state = PortState::Forwarding;
        log::debug!("rstp: vlan {} port {} edge, forwarding", vlan, index);
    }
}

/// Handle a proposal that arrived on the root port: block every other
/// non-edge Designated port, rapid-transition the root port, and build
/// the agreement to send back.
pub(crate) fn synchronize(
    clock: &Clock,
    timers: &StpTimers,
    inst: &mut StpInstance,
    ifaces: &[Interface],
    bridge_id: BridgeId,
    node: NodeId,
    index: usize,
) -> Option<(usize, Message)> {
    let vlan = inst.vlan;

    // Sync: pull every non-edge Designated port out of Forwarding. Each
    // will re-propose downstream through its own hellos.
    let others: Vec<usize> = inst
        .ports
        .iter()
        .filter(|(&i, p)| {
            i != index
                && p.role == PortRole::Designated
                && !p.is_edge
                && p.state == PortState::Forwarding
        })
        .map(|(&i, _)| i)
        .collect();
    for i in others {
        if let Some(port) = inst.ports.get_mut(&i) {
            start_ladder(clock, timers, node, vlan, i, port);
        }
    }

    // The root port itself transitions immediately.
    let port = inst.ports.get_mut(&index)?;
    if let Some(sub) = port.transition_sub.take() {
        sub.cancel();
    }
    port.state = PortState::Forwarding;

    let ifr = ifaces.get(index)?;
    let flags = (BpduFlags::AGREEMENT | BpduFlags::FORWARDING | BpduFlags::LEARNING)
        .with_port_role(BpduPortRole::Root);
    let agreement = Bpdu {
        protocol_id: 0,
        version: BPDU_VERSION_RSTP,
        bpdu_type: BPDU_TYPE_RSTP,
        flags,
        root_id: inst.root_id,
        root_path_cost: inst.root_path_cost,
        bridge_id,
        port_id: stp::port_id_of(&ifr.name),
        message_age: 0,
        max_age: timers.max_age,
        hello_time: timers.hello,
        forward_delay: timers.forward_delay,
        vlan: None,
    };
    log::debug!("rstp: vlan {} port {} synchronized, agreeing", vlan, index);
    Some((
        index,
        Message::ethernet(ifr.mac, STP_MULTICAST, EtherPayload::Bpdu(agreement)),
    ))
}
