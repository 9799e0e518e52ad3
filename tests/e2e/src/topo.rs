//! Topology builders and observation helpers shared by the scenarios.

use alloc::rc::Rc;
use core::cell::Cell;

use netlab_network::message::{EtherPayload, IcmpPacket, Ipv4Payload};
use netlab_network::{
    Clock, Disposition, Ipv4Addr, Message, Network, NodeEvent, NodeId, SubnetMask,
};

/// A fresh network on a fresh clock.
pub fn network() -> Network {
    Network::new(Clock::new())
}

pub fn mask(cidr: u8) -> SubnetMask {
    SubnetMask::from_cidr(cidr).unwrap()
}

pub fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

/// Add a host with one addressed interface named `eth0`.
pub fn host(net: &mut Network, name: &str, addr: Ipv4Addr, prefix: u8) -> NodeId {
    let id = net.add_host(name);
    net.add_interface(id, "eth0").unwrap();
    net.set_ip(id, "eth0", addr).unwrap();
    net.set_mask(id, "eth0", mask(prefix)).unwrap();
    id
}

/// Add a switch with `ports` interfaces named `fa0/<n>`.
pub fn switch(net: &mut Network, name: &str, ports: usize) -> NodeId {
    let id = net.add_switch(name);
    for p in 0..ports {
        net.add_interface(id, &alloc::format!("fa0/{}", p)).unwrap();
    }
    id
}

/// Count frames delivered to a node that satisfy `pred`.
pub fn frame_counter(
    net: &Network,
    node: NodeId,
    pred: impl Fn(&Message) -> bool + 'static,
) -> Rc<Cell<usize>> {
    let count = Rc::new(Cell::new(0));
    let seen = Rc::clone(&count);
    net.add_listener(node, move |ev| {
        if let NodeEvent::Frame { message, .. } = ev {
            if pred(message) {
                seen.set(seen.get() + 1);
            }
        }
        Disposition::Continue
    })
    .unwrap();
    count
}

/// Count every frame delivered to a node.
pub fn any_frame_counter(net: &Network, node: NodeId) -> Rc<Cell<usize>> {
    frame_counter(net, node, |_| true)
}

/// Count ICMP messages of one type delivered to a node.
pub fn icmp_counter(net: &Network, node: NodeId, icmp_type: u8) -> Rc<Cell<usize>> {
    frame_counter(net, node, move |m| {
        matches!(
            m.payload(),
            EtherPayload::Ipv4(pkt)
                if matches!(&pkt.payload, Ipv4Payload::Icmp(icmp) if icmp.icmp_type == icmp_type)
        )
    })
}

/// Count ICMP echo replies delivered to a node.
pub fn echo_reply_counter(net: &Network, node: NodeId) -> Rc<Cell<usize>> {
    icmp_counter(net, node, IcmpPacket::ECHO_REPLY)
}
