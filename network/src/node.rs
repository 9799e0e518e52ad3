//! Node model
//!
//! Hosts, servers, switches and routers share a name, an ordered
//! interface set and a listener chain; everything else is per-variant
//! state. Cross-node references go through the `Network` arenas, never
//! through direct ownership.

use alloc::string::String;
use alloc::vec::Vec;

use crate::dhcp::{DhcpClient, DhcpServer};
use crate::iface::Interface;
use crate::listener::ListenerChain;
use crate::router::RouterState;
use crate::switch::SwitchState;

/// End-station state: optional DHCP client.
#[derive(Debug, Default)]
pub struct HostState {
    pub dhcp: Option<DhcpClient>,
}

/// Server state: optional DHCP server.
#[derive(Debug, Default)]
pub struct ServerState {
    pub dhcp: Option<DhcpServer>,
}

/// Per-variant node state.
#[derive(Debug)]
pub enum NodeKind {
    Host(HostState),
    Server(ServerState),
    Switch(SwitchState),
    Router(RouterState),
}

impl NodeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Host(_) => "host",
            NodeKind::Server(_) => "server",
            NodeKind::Switch(_) => "switch",
            NodeKind::Router(_) => "router",
        }
    }
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub(crate) ifaces: Vec<Interface>,
    pub(crate) listeners: ListenerChain,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn new(name: String, kind: NodeKind) -> Self {
        Node {
            name,
            ifaces: Vec::new(),
            listeners: ListenerChain::new(),
            kind,
        }
    }

    pub fn iface_index(&self, name: &str) -> Option<usize> {
        self.ifaces.iter().position(|i| i.name == name)
    }

    pub fn iface(&self, index: usize) -> Option<&Interface> {
        self.ifaces.get(index)
    }

    pub fn iface_mut(&mut self, index: usize) -> Option<&mut Interface> {
        self.ifaces.get_mut(index)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.ifaces.iter()
    }

    pub fn interface_count(&self) -> usize {
        self.ifaces.len()
    }

    /// Registration endpoint for this node's listener chain.
    pub fn listeners(&self) -> ListenerChain {
        self.listeners.handle()
    }

    /// True when any interface owns `ip`.
    pub fn has_ip(&self, ip: crate::Ipv4Addr) -> bool {
        self.ifaces.iter().any(|i| i.has_ip(ip))
    }

    pub fn is_switch(&self) -> bool {
        matches!(self.kind, NodeKind::Switch(_))
    }

    pub fn is_router(&self) -> bool {
        matches!(self.kind, NodeKind::Router(_))
    }

    pub fn as_switch(&self) -> Option<&SwitchState> {
        match &self.kind {
            NodeKind::Switch(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_switch_mut(&mut self) -> Option<&mut SwitchState> {
        match &mut self.kind {
            NodeKind::Switch(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_router(&self) -> Option<&RouterState> {
        match &self.kind {
            NodeKind::Router(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_router_mut(&mut self) -> Option<&mut RouterState> {
        match &mut self.kind {
            NodeKind::Router(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_host_mut(&mut self) -> Option<&mut HostState> {
        match &mut self.kind {
            NodeKind::Host(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_server_mut(&mut self) -> Option<&mut ServerState> {
        match &mut self.kind {
            NodeKind::Server(s) => Some(s),
            _ => None,
        }
    }

    /// Lowest interface MAC; identifies a bridge in STP.
    pub fn lowest_mac(&self) -> Option<crate::Mac> {
        self.ifaces.iter().map(|i| i.mac).min()
    }
}
