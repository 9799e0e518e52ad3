//! Interface management
//!
//! A hardware interface owns its name, MAC, administrative state, the
//! speed/duplex/auto-negotiation knobs and the 802.1Q VLAN configuration.
//! Adding an IP address and mask turns it into a network interface with an
//! ARP cache. Interfaces live inside their node; the link, if any, is a
//! weak handle into the network's link arena.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arp::ArpCache;
use crate::network::LinkId;
use crate::{Ipv4Addr, Mac, NetworkError, SubnetMask, VlanId, VLAN_MAX, VLAN_MIN};

/// Interface speeds accepted by `set_speed`, in Mb/s.
pub const VALID_SPEEDS: [u32; 3] = [10, 100, 1000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanMode {
    Access,
    Trunk,
}

/// 802.1Q configuration of one port.
///
/// The effective allowed list always contains either the native VLAN or at
/// least one explicitly added VLAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanConfig {
    pub mode: VlanMode,
    /// Explicitly allowed VLANs, in configuration order.
    allowed: Vec<VlanId>,
    pub native: VlanId,
}

impl Default for VlanConfig {
    fn default() -> Self {
        VlanConfig {
            mode: VlanMode::Access,
            allowed: Vec::new(),
            native: 1,
        }
    }
}

impl VlanConfig {
    /// Ordered allowed-VLAN list; falls back to the native VLAN when no
    /// VLAN was explicitly added.
    pub fn allowed_vlans(&self) -> Vec<VlanId> {
        if self.allowed.is_empty() {
            let mut v = Vec::with_capacity(1);
            v.push(self.native);
            v
        } else {
            self.allowed.clone()
        }
    }

    /// Whether frames of `vlan` may enter or leave through this port.
    pub fn carries(&self, vlan: VlanId) -> bool {
        if self.allowed.is_empty() {
            self.native == vlan
        } else {
            self.allowed.contains(&vlan)
        }
    }

    /// The VLAN untagged traffic belongs to: the first allowed VLAN on an
    /// access port, the native VLAN on a trunk.
    pub fn untagged_vlan(&self) -> VlanId {
        match self.mode {
            VlanMode::Access => *self.allowed_vlans().first().expect("allowed list nonempty"),
            VlanMode::Trunk => self.native,
        }
    }

    pub fn add(&mut self, vlan: VlanId) -> Result<(), NetworkError> {
        check_vlan_id(vlan)?;
        if !self.allowed.contains(&vlan) {
            self.allowed.push(vlan);
        }
        Ok(())
    }

    pub fn remove(&mut self, vlan: VlanId) -> Result<(), NetworkError> {
        check_vlan_id(vlan)?;
        self.allowed.retain(|v| *v != vlan);
        Ok(())
    }

    pub fn set_native(&mut self, vlan: VlanId) -> Result<(), NetworkError> {
        check_vlan_id(vlan)?;
        self.native = vlan;
        Ok(())
    }
}

pub fn check_vlan_id(vlan: VlanId) -> Result<(), NetworkError> {
    if !(VLAN_MIN..=VLAN_MAX).contains(&vlan) {
        return Err(NetworkError::InvalidVlanId(vlan));
    }
    Ok(())
}

// ── Network layer ───────────────────────────────────────────

/// IP configuration layered on a hardware interface.
#[derive(Debug, Default)]
pub struct NetConfig {
    pub ip: Option<Ipv4Addr>,
    pub mask: Option<SubnetMask>,
    pub gateway: Option<Ipv4Addr>,
    pub arp: ArpCache,
}

// ── Hardware interface ──────────────────────────────────────

#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub mac: Mac,
    /// Administrative state.
    pub up: bool,
    /// Mb/s; one of 10/100/1000, or 0 while auto-negotiating.
    pub speed: u32,
    pub full_duplex: bool,
    pub auto_negotiation: bool,
    /// Hardware capability: some ports cannot run full duplex.
    pub half_duplex_only: bool,
    pub vlan: VlanConfig,
    /// Handle into the link arena, when connected.
    pub link: Option<LinkId>,
    pub net: NetConfig,
}

impl Interface {
    pub fn new(name: String, mac: Mac) -> Self {
        Interface {
            name,
            mac,
            up: true,
            speed: 1000,
            full_duplex: true,
            auto_negotiation: true,
            half_duplex_only: false,
            vlan: VlanConfig::default(),
            link: None,
            net: NetConfig::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// `set_speed(0)` is only valid while auto-negotiation is enabled.
    pub fn set_speed(&mut self, speed: u32) -> Result<(), NetworkError> {
        if speed == 0 {
            if !self.auto_negotiation {
                return Err(NetworkError::InvalidSpeed(0));
            }
        } else if !VALID_SPEEDS.contains(&speed) {
            return Err(NetworkError::InvalidSpeed(speed));
        }
        self.speed = speed;
        Ok(())
    }

    pub fn set_full_duplex(&mut self, full: bool) -> Result<(), NetworkError> {
        if full && self.half_duplex_only {
            return Err(NetworkError::InvalidSpeed(self.speed));
        }
        self.full_duplex = full;
        Ok(())
    }

    pub fn set_ip(&mut self, ip: Ipv4Addr) {
        self.net.ip = Some(ip);
    }

    pub fn set_mask(&mut self, mask: SubnetMask) {
        self.net.mask = Some(mask);
    }

    pub fn has_ip(&self, ip: Ipv4Addr) -> bool {
        self.net.ip == Some(ip)
    }

    /// IP and mask together, when both are configured.
    pub fn subnet(&self) -> Option<(Ipv4Addr, SubnetMask)> {
        match (self.net.ip, self.net.mask) {
            (Some(ip), Some(mask)) => Some((ip, mask)),
            _ => None,
        }
    }

    /// True when `addr` is on this interface's subnet.
    pub fn on_link(&self, addr: Ipv4Addr) -> bool {
        match self.subnet() {
            Some((ip, mask)) => ip.same_network(mask, addr),
            None => false,
        }
    }
}
