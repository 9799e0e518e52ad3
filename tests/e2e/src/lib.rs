//! Netlab end-to-end scenarios
//!
//! Whole-topology tests driving the public surface only: VLAN trunking
//! across switches, spanning tree convergence, RIP propagation, TTL
//! exhaustion, DHCP leases, HSRP failover and the OSPF/BGP session
//! skeletons. Every scenario builds its own `Network` with its own
//! clock, so tests run independently and deterministically.

#![no_std]

extern crate alloc;

pub mod topo;

#[cfg(test)]
mod routing_scenarios;
#[cfg(test)]
mod service_scenarios;
#[cfg(test)]
mod stp_scenarios;
#[cfg(test)]
mod switching_scenarios;
