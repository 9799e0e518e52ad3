//! Netlab simulation core
//!
//! Discrete-event, packet-level simulator for campus/enterprise IP
//! networks. Frames travel a layered in-memory pipeline:
//!
//!   link transit → Ethernet/802.1Q → switch data plane (MAC learning,
//!   VLAN flooding, STP gating) → IPv4 → ICMP / routing protocols
//!
//! The core is organized into:
//!
//! - `message`: the closed frame/packet hierarchy
//! - `iface`: hardware + network interfaces, VLAN configuration
//! - `arp`: per-interface ARP cache with pending resolution
//! - `listener`: ordered per-node event chain
//! - `network`: node/link arenas, topology lifecycle, physical transit
//! - `switch`: MAC table and the VLAN-aware data plane
//! - `stp`: spanning tree (STP / RSTP / PVST)
//! - `router`: routing table, longest-prefix forwarding, ICMP
//! - `rip`, `ospf`, `bgp`: routing protocol services
//! - `dhcp`, `hsrp`: support services
//!
//! Everything is driven by the `netlab-clock` virtual scheduler; nothing
//! touches a real socket or a real clock.

#![no_std]

extern crate alloc;

pub mod arp;
pub mod bgp;
pub mod dhcp;
pub mod hsrp;
pub mod iface;
pub mod listener;
pub mod message;
pub mod network;
pub mod node;
pub mod ospf;
pub mod rip;
pub mod router;
pub mod stp;
pub mod switch;

use alloc::string::String;
use core::fmt;
use core::str::FromStr;

pub use crate::listener::{Disposition, ListenerId, NodeEvent};
pub use crate::message::Message;
pub use crate::network::{Clock, ClockSub, LinkId, Network, NodeId};

/// 802.1Q VLAN identifier. Valid range is `1..=4094`.
pub type VlanId = u16;

/// Lowest valid VLAN id.
pub const VLAN_MIN: VlanId = 1;
/// Highest valid VLAN id.
pub const VLAN_MAX: VlanId = 4094;

// ── MAC address ─────────────────────────────────────────────

/// 48-bit IEEE 802 MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    /// All-ones broadcast address.
    pub const BROADCAST: Mac = Mac([0xFF; 6]);

    /// All-zero placeholder address.
    pub const ZERO: Mac = Mac([0; 6]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Mac([a, b, c, d, e, f])
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Mac::BROADCAST
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// The address as a 48-bit integer, for ordering and hashing schemes
    /// that want a scalar (bridge ids, virtual MAC construction).
    pub fn to_u64(&self) -> u64 {
        let mut v = 0u64;
        for b in self.0 {
            v = (v << 8) | b as u64;
        }
        v
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for Mac {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetworkError::InvalidAddress(String::from(s)))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| NetworkError::InvalidAddress(String::from(s)))?;
        }
        if parts.next().is_some() {
            return Err(NetworkError::InvalidAddress(String::from(s)));
        }
        Ok(Mac(out))
    }
}

// ── IPv4 address ────────────────────────────────────────────

/// IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr([0, 0, 0, 0]);
    pub const BROADCAST: Ipv4Addr = Ipv4Addr([255, 255, 255, 255]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    pub fn octets(&self) -> [u8; 4] {
        self.0
    }

    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn from_u32(v: u32) -> Self {
        Ipv4Addr(v.to_be_bytes())
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Ipv4Addr::BROADCAST
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    /// True when `self` and `other` fall in the same subnet under `mask`.
    pub fn same_network(&self, mask: SubnetMask, other: Ipv4Addr) -> bool {
        self.to_u32() & mask.to_u32() == other.to_u32() & mask.to_u32()
    }

    /// The network address of `self` under `mask`.
    pub fn network(&self, mask: SubnetMask) -> Ipv4Addr {
        Ipv4Addr::from_u32(self.to_u32() & mask.to_u32())
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl FromStr for Ipv4Addr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 4];
        let mut parts = s.split('.');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetworkError::InvalidAddress(String::from(s)))?;
            *byte = part
                .parse()
                .map_err(|_| NetworkError::InvalidAddress(String::from(s)))?;
        }
        if parts.next().is_some() {
            return Err(NetworkError::InvalidAddress(String::from(s)));
        }
        Ok(Ipv4Addr(out))
    }
}

// ── Subnet mask ─────────────────────────────────────────────

/// Validated IPv4 network mask (contiguous ones).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubnetMask(u32);

impl SubnetMask {
    /// Build from a dotted-quad address; rejects non-contiguous masks.
    pub fn new(addr: Ipv4Addr) -> Result<Self, NetworkError> {
        let bits = addr.to_u32();
        // A valid mask inverted and incremented must be a power of two
        // (or zero for /32).
        let inv = !bits;
        if inv & inv.wrapping_add(1) != 0 {
            return Err(NetworkError::InvalidMask(alloc::format!("{}", addr)));
        }
        Ok(SubnetMask(bits))
    }

    /// Build from a prefix length in `0..=32`.
    pub fn from_cidr(len: u8) -> Result<Self, NetworkError> {
        if len > 32 {
            return Err(NetworkError::InvalidMask(alloc::format!("/{}", len)));
        }
        let bits = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        Ok(SubnetMask(bits))
    }

    /// Prefix length.
    pub fn cidr(&self) -> u8 {
        self.0.count_ones() as u8
    }

    pub fn to_u32(&self) -> u32 {
        self.0
    }

    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from_u32(self.0)
    }
}

impl fmt::Display for SubnetMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

impl FromStr for SubnetMask {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubnetMask::new(s.parse()?)
    }
}

// ── Errors ──────────────────────────────────────────────────

/// Simulation core error.
///
/// Configuration errors fail the offending call immediately; transient
/// runtime conditions (`LinkDown`, `InterfaceDown`, `NoRoute`) surface as
/// status where the caller is the data plane itself, and are otherwise
/// dropped silently — loss is the correct model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Text did not parse as a MAC or IPv4 address.
    InvalidAddress(String),
    /// Mask is not a contiguous prefix.
    InvalidMask(String),
    /// VLAN id outside `1..=4094`.
    InvalidVlanId(u16),
    /// Speed not in {10, 100, 1000} (0 requires auto-negotiation).
    InvalidSpeed(u32),
    /// Route with identical network/mask/gateway already installed.
    RouteExists,
    /// No such route to delete.
    RouteNotFound,
    /// The two interfaces are already linked.
    DuplicateLink,
    /// Both link endpoints name the same interface.
    SameInterfaceLink,
    /// Transmit on an unconnected or down link.
    LinkDown,
    /// Interface administratively down.
    InterfaceDown,
    /// No route to the destination.
    NoRoute,
    /// Unknown node handle.
    NoSuchNode,
    /// Unknown interface name on the node.
    NoSuchInterface(String),
    /// Unknown link handle.
    NoSuchLink,
    /// Operation requires a switch.
    NotASwitch,
    /// Operation requires a router.
    NotARouter,
    /// Protocol variant recognized but not implemented.
    NotImplemented(&'static str),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::InvalidAddress(s) => write!(f, "invalid address: {}", s),
            NetworkError::InvalidMask(s) => write!(f, "invalid subnet mask: {}", s),
            NetworkError::InvalidVlanId(id) => write!(f, "invalid VLAN id: {}", id),
            NetworkError::InvalidSpeed(s) => write!(f, "invalid interface speed: {} Mb/s", s),
            NetworkError::RouteExists => write!(f, "route already exists"),
            NetworkError::RouteNotFound => write!(f, "route not found"),
            NetworkError::DuplicateLink => write!(f, "interfaces are already linked"),
            NetworkError::SameInterfaceLink => write!(f, "cannot link an interface to itself"),
            NetworkError::LinkDown => write!(f, "link is down"),
            NetworkError::InterfaceDown => write!(f, "interface is down"),
            NetworkError::NoRoute => write!(f, "no route to destination"),
            NetworkError::NoSuchNode => write!(f, "no such node"),
            NetworkError::NoSuchInterface(name) => write!(f, "no such interface: {}", name),
            NetworkError::NoSuchLink => write!(f, "no such link"),
            NetworkError::NotASwitch => write!(f, "node is not a switch"),
            NetworkError::NotARouter => write!(f, "node is not a router"),
            NetworkError::NotImplemented(what) => write!(f, "{} is not implemented", what),
        }
    }
}
