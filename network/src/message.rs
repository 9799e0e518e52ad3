//! Frame and packet hierarchy
//!
//! Closed tagged hierarchy carried by the simulated wire, bottom → top:
//!
//!   Ethernet / 802.1Q → ARP | BPDU | IPv4 → ICMP | RIP | OSPF | BGP |
//!   HSRP | DHCP | raw data
//!
//! Frames are in-memory values only; there is no wire-level byte encoding.
//! The Ethernet FCS is still computed (CRC-32, IEEE 802.3 reflected
//! polynomial over dst∥src∥payload digest) because the modelled hardware
//! would carry one; receivers do not validate it.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::{Ipv4Addr, Mac, SubnetMask, VlanId};

// ── CRC-32 (IEEE 802.3) ─────────────────────────────────────

/// Reflected IEEE 802.3 polynomial.
const CRC32_POLY: u32 = 0xEDB8_8320;

/// 256-entry lookup table, built once at first use.
fn crc32_table() -> &'static [u32; 256] {
    use spin::Once;
    static TABLE: Once<[u32; 256]> = Once::new();
    TABLE.call_once(|| {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ CRC32_POLY
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    })
}

/// CRC-32 over `data`, as Ethernet hardware would compute it.
pub fn crc32(data: &[u8]) -> u32 {
    let table = crc32_table();
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ table[idx];
    }
    !crc
}

// ── Bridge id ───────────────────────────────────────────────

/// STP bridge identifier: `(priority, MAC)`, lower wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BridgeId {
    pub priority: u16,
    pub mac: Mac,
}

impl BridgeId {
    pub const fn new(priority: u16, mac: Mac) -> Self {
        BridgeId { priority, mac }
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.priority, self.mac)
    }
}

// ── BPDU ────────────────────────────────────────────────────

bitflags! {
    /// BPDU flags octet. STP uses only `TOPOLOGY_CHANGE` and `TC_ACK`;
    /// RSTP adds proposal/agreement and the port state bits. The 2-bit
    /// port-role field lives in `PORT_ROLE_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BpduFlags: u8 {
        const TOPOLOGY_CHANGE = 0x01;
        const PROPOSAL        = 0x02;
        const PORT_ROLE_LO    = 0x04;
        const PORT_ROLE_HI    = 0x08;
        const LEARNING        = 0x10;
        const FORWARDING      = 0x20;
        const AGREEMENT       = 0x40;
        const TC_ACK          = 0x80;
    }
}

/// Port role as encoded in the RSTP flags octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpduPortRole {
    Unknown,
    AlternateOrBackup,
    Root,
    Designated,
}

impl BpduFlags {
    pub fn with_port_role(mut self, role: BpduPortRole) -> Self {
        self.remove(BpduFlags::PORT_ROLE_LO | BpduFlags::PORT_ROLE_HI);
        match role {
            BpduPortRole::Unknown => {}
            BpduPortRole::AlternateOrBackup => self.insert(BpduFlags::PORT_ROLE_LO),
            BpduPortRole::Root => self.insert(BpduFlags::PORT_ROLE_HI),
            BpduPortRole::Designated => {
                self.insert(BpduFlags::PORT_ROLE_LO | BpduFlags::PORT_ROLE_HI)
            }
        }
        self
    }

    pub fn port_role(&self) -> BpduPortRole {
        match (
            self.contains(BpduFlags::PORT_ROLE_HI),
            self.contains(BpduFlags::PORT_ROLE_LO),
        ) {
            (false, false) => BpduPortRole::Unknown,
            (false, true) => BpduPortRole::AlternateOrBackup,
            (true, false) => BpduPortRole::Root,
            (true, true) => BpduPortRole::Designated,
        }
    }
}

/// STP protocol version octet.
pub const BPDU_VERSION_STP: u8 = 0;
/// RSTP protocol version octet.
pub const BPDU_VERSION_RSTP: u8 = 2;

/// Configuration BPDU type octet.
pub const BPDU_TYPE_CONFIG: u8 = 0x00;
/// RSTP configuration BPDU type octet.
pub const BPDU_TYPE_RSTP: u8 = 0x02;

/// Destination MAC for bridge group traffic.
pub const STP_MULTICAST: Mac = Mac([0x01, 0x80, 0xC2, 0x00, 0x00, 0x00]);

/// Bridge Protocol Data Unit.
///
/// One struct covers all three dialects: plain 802.1D config BPDUs
/// (`version = 0`), RSTP BPDUs (`version = 2`, richer flags), and PVST
/// BPDUs (`vlan = Some(id)`). Timer fields are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bpdu {
    pub protocol_id: u16,
    pub version: u8,
    pub bpdu_type: u8,
    pub flags: BpduFlags,
    pub root_id: BridgeId,
    pub root_path_cost: u32,
    pub bridge_id: BridgeId,
    pub port_id: u16,
    pub message_age: u16,
    pub max_age: u16,
    pub hello_time: u16,
    pub forward_delay: u16,
    /// Set on PVST BPDUs; `None` for the common spanning tree.
    pub vlan: Option<VlanId>,
}

impl Bpdu {
    pub fn is_rstp(&self) -> bool {
        self.version >= BPDU_VERSION_RSTP
    }
}

// ── ARP ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
}

/// ARP packet for Ethernet + IPv4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: Mac,
    pub sender_ip: Ipv4Addr,
    pub target_mac: Mac,
    pub target_ip: Ipv4Addr,
}

// ── ICMP ────────────────────────────────────────────────────

/// ICMP message: type and code only; the quoted payload is not modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpPacket {
    pub icmp_type: u8,
    pub code: u8,
}

impl IcmpPacket {
    pub const ECHO_REPLY: u8 = 0;
    pub const DEST_UNREACHABLE: u8 = 3;
    pub const ECHO_REQUEST: u8 = 8;
    pub const TIME_EXCEEDED: u8 = 11;

    pub fn echo_request() -> Self {
        IcmpPacket {
            icmp_type: Self::ECHO_REQUEST,
            code: 0,
        }
    }

    pub fn echo_reply() -> Self {
        IcmpPacket {
            icmp_type: Self::ECHO_REPLY,
            code: 0,
        }
    }

    pub fn time_exceeded() -> Self {
        IcmpPacket {
            icmp_type: Self::TIME_EXCEEDED,
            code: 0,
        }
    }
}

// ── RIP ─────────────────────────────────────────────────────

/// One advertised RIP route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipEntry {
    pub network: Ipv4Addr,
    pub mask: SubnetMask,
    pub metric: u8,
    pub route_tag: u16,
}

/// Periodic or triggered RIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RipUpdate {
    pub entries: Vec<RipEntry>,
}

// ── OSPF ────────────────────────────────────────────────────

/// OSPF control packets, reduced to what the neighbor skeleton needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OspfPdu {
    Hello {
        router_id: Ipv4Addr,
        /// Router ids this sender has heard hellos from.
        neighbors: Vec<Ipv4Addr>,
    },
    DatabaseDescription {
        router_id: Ipv4Addr,
        networks: Vec<(Ipv4Addr, SubnetMask)>,
    },
}

// ── BGP ─────────────────────────────────────────────────────

/// BGP session messages, reduced to what the session skeleton needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgpPdu {
    Open {
        as_number: u32,
        router_id: Ipv4Addr,
        hold_time: u16,
    },
    Keepalive,
    Update {
        prefixes: Vec<(Ipv4Addr, SubnetMask)>,
    },
    Notification,
}

// ── HSRP ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsrpOp {
    Hello,
    Coup,
    Resign,
}

/// HSRP v1 hello/coup/resign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsrpPdu {
    pub op: HsrpOp,
    pub group: u8,
    pub priority: u8,
    pub virtual_ip: Ipv4Addr,
    /// Sender currently holds the Active role.
    pub active: bool,
}

// ── DHCP ────────────────────────────────────────────────────

/// DHCP message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpOp {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
}

/// DHCP exchange, reduced to the lease-shaping fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPdu {
    pub op: DhcpOp,
    pub xid: u32,
    pub client_mac: Mac,
    /// "Your address" — the offered or acknowledged lease.
    pub yiaddr: Ipv4Addr,
    pub mask: Option<SubnetMask>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    pub requested: Option<Ipv4Addr>,
    pub lease_secs: u32,
}

// ── IPv4 ────────────────────────────────────────────────────

/// Payload carried inside an IPv4 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ipv4Payload {
    Icmp(IcmpPacket),
    Rip(RipUpdate),
    Ospf(OspfPdu),
    Bgp(BgpPdu),
    Hsrp(HsrpPdu),
    Dhcp(DhcpPdu),
    Data(Vec<u8>),
}

/// Default TTL for locally originated packets.
pub const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub payload: Ipv4Payload,
}

impl Ipv4Packet {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, payload: Ipv4Payload) -> Self {
        Ipv4Packet {
            src,
            dst,
            ttl: DEFAULT_TTL,
            payload,
        }
    }
}

// ── Ethernet payload ────────────────────────────────────────

/// Payload carried inside a data-link frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtherPayload {
    Ipv4(Ipv4Packet),
    Bpdu(Bpdu),
    Arp(ArpPacket),
    Data(Vec<u8>),
}

impl EtherPayload {
    /// Canonical byte projection used for the FCS. Not a wire format —
    /// just a stable digest of the fields.
    fn digest(&self, out: &mut Vec<u8>) {
        match self {
            EtherPayload::Ipv4(pkt) => {
                out.push(0x01);
                out.extend_from_slice(&pkt.src.octets());
                out.extend_from_slice(&pkt.dst.octets());
                out.push(pkt.ttl);
                match &pkt.payload {
                    Ipv4Payload::Icmp(icmp) => {
                        out.push(icmp.icmp_type);
                        out.push(icmp.code);
                    }
                    Ipv4Payload::Rip(update) => {
                        out.push(0x11);
                        out.push(update.entries.len() as u8);
                    }
                    Ipv4Payload::Ospf(_) => out.push(0x59),
                    Ipv4Payload::Bgp(_) => out.push(0xB3),
                    Ipv4Payload::Hsrp(h) => {
                        out.push(0x70);
                        out.push(h.group);
                    }
                    Ipv4Payload::Dhcp(d) => {
                        out.push(0x43);
                        out.extend_from_slice(&d.xid.to_be_bytes());
                    }
                    Ipv4Payload::Data(bytes) => out.extend_from_slice(bytes),
                }
            }
            EtherPayload::Bpdu(bpdu) => {
                out.push(0x02);
                out.push(bpdu.version);
                out.push(bpdu.flags.bits());
                out.extend_from_slice(&bpdu.root_id.priority.to_be_bytes());
                out.extend_from_slice(&bpdu.root_id.mac.bytes());
                out.extend_from_slice(&bpdu.root_path_cost.to_be_bytes());
                out.extend_from_slice(&bpdu.bridge_id.priority.to_be_bytes());
                out.extend_from_slice(&bpdu.bridge_id.mac.bytes());
                out.extend_from_slice(&bpdu.port_id.to_be_bytes());
            }
            EtherPayload::Arp(arp) => {
                out.push(0x03);
                out.push(match arp.op {
                    ArpOp::Request => 1,
                    ArpOp::Reply => 2,
                });
                out.extend_from_slice(&arp.sender_mac.bytes());
                out.extend_from_slice(&arp.sender_ip.octets());
                out.extend_from_slice(&arp.target_mac.bytes());
                out.extend_from_slice(&arp.target_ip.octets());
            }
            EtherPayload::Data(bytes) => {
                out.push(0x00);
                out.extend_from_slice(bytes);
            }
        }
    }
}

// ── Frames ──────────────────────────────────────────────────

/// Plain Ethernet II frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub src: Mac,
    pub dst: Mac,
    pub payload: EtherPayload,
    /// FCS precomputed at construction; receivers do not check it.
    pub fcs: u32,
}

impl EthernetFrame {
    pub fn new(src: Mac, dst: Mac, payload: EtherPayload) -> Self {
        let mut digest = Vec::new();
        digest.extend_from_slice(&dst.bytes());
        digest.extend_from_slice(&src.bytes());
        payload.digest(&mut digest);
        let fcs = crc32(&digest);
        EthernetFrame {
            src,
            dst,
            payload,
            fcs,
        }
    }
}

/// 802.1Q tagged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dot1qFrame {
    pub src: Mac,
    pub dst: Mac,
    pub vlan: VlanId,
    pub payload: EtherPayload,
}

/// Every message the simulated wire can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ethernet(EthernetFrame),
    Dot1q(Dot1qFrame),
}

impl Message {
    pub fn ethernet(src: Mac, dst: Mac, payload: EtherPayload) -> Self {
        Message::Ethernet(EthernetFrame::new(src, dst, payload))
    }

    pub fn dot1q(src: Mac, dst: Mac, vlan: VlanId, payload: EtherPayload) -> Self {
        Message::Dot1q(Dot1qFrame {
            src,
            dst,
            vlan,
            payload,
        })
    }

    pub fn src(&self) -> Mac {
        match self {
            Message::Ethernet(f) => f.src,
            Message::Dot1q(f) => f.src,
        }
    }

    pub fn dst(&self) -> Mac {
        match self {
            Message::Ethernet(f) => f.dst,
            Message::Dot1q(f) => f.dst,
        }
    }

    /// The 802.1Q tag, if the frame carries one.
    pub fn vlan(&self) -> Option<VlanId> {
        match self {
            Message::Ethernet(_) => None,
            Message::Dot1q(f) => Some(f.vlan),
        }
    }

    pub fn payload(&self) -> &EtherPayload {
        match self {
            Message::Ethernet(f) => &f.payload,
            Message::Dot1q(f) => &f.payload,
        }
    }

    pub fn is_bpdu(&self) -> bool {
        matches!(self.payload(), EtherPayload::Bpdu(_))
    }

    /// Rewrite for an access-port egress: strip any tag.
    pub fn untagged(self) -> Message {
        match self {
            Message::Ethernet(_) => self,
            Message::Dot1q(f) => Message::ethernet(f.src, f.dst, f.payload),
        }
    }

    /// Rewrite for a trunk-port egress: ensure an 802.1Q tag.
    pub fn tagged(self, vlan: VlanId) -> Message {
        match self {
            Message::Ethernet(f) => Message::dot1q(f.src, f.dst, vlan, f.payload),
            Message::Dot1q(_) => self,
        }
    }
}
