//! ARP — address resolution within a network interface
//!
//! The cache learns opportunistically from every received on-link IPv4
//! packet. A lookup miss broadcasts a request and parks the outbound
//! packet on a pending queue until the reply lands. Entries are refreshed
//! in place and never evicted; `get` always reflects the most recently
//! observed binding.

use alloc::vec::Vec;

use hashbrown::HashMap;
use netlab_clock::Ticks;

use crate::message::{ArpOp, ArpPacket, Ipv4Packet};
use crate::{Ipv4Addr, Mac};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub mac: Mac,
    pub last_seen: Ticks,
}

#[derive(Debug, Default)]
pub struct ArpCache {
    entries: HashMap<Ipv4Addr, ArpEntry>,
    /// Packets awaiting resolution, keyed by next-hop IP.
    pending: HashMap<Ipv4Addr, Vec<Ipv4Packet>>,
}

impl ArpCache {
    pub fn new() -> Self {
        ArpCache::default()
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<Mac> {
        self.entries.get(&ip).map(|e| e.mac)
    }

    pub fn entry(&self, ip: Ipv4Addr) -> Option<&ArpEntry> {
        self.entries.get(&ip)
    }

    /// Insert or refresh a binding.
    pub fn learn(&mut self, ip: Ipv4Addr, mac: Mac, now: Ticks) {
        self.entries.insert(ip, ArpEntry { mac, last_seen: now });
    }

    /// Park a packet until `ip` resolves. Returns true when a request is
    /// already outstanding for this IP (so the caller need not send
    /// another).
    pub fn enqueue(&mut self, ip: Ipv4Addr, packet: Ipv4Packet) -> bool {
        let queue = self.pending.entry(ip).or_default();
        let outstanding = !queue.is_empty();
        queue.push(packet);
        outstanding
    }

    /// Drain the pending queue for a freshly resolved IP.
    pub fn take_pending(&mut self, ip: Ipv4Addr) -> Vec<Ipv4Packet> {
        self.pending.remove(&ip).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the broadcast request asking for `target_ip`.
pub fn request(sender_mac: Mac, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> ArpPacket {
    ArpPacket {
        op: ArpOp::Request,
        sender_mac,
        sender_ip,
        target_mac: Mac::ZERO,
        target_ip,
    }
}

/// Build the unicast reply answering `req`.
pub fn reply(own_mac: Mac, own_ip: Ipv4Addr, req: &ArpPacket) -> ArpPacket {
    ArpPacket {
        op: ArpOp::Reply,
        sender_mac: own_mac,
        sender_ip: own_ip,
        target_mac: req.sender_mac,
        target_ip: req.sender_ip,
    }
}
