//! NAPT (network address and port translation)
//!
//! Port/identifier-overload NAT between an inside and an outside interface.
//! Flows live in fixed per-protocol slot arrays; a slot's index determines
//! its global port (UDP/TCP) or identifier (ICMP), so reverse lookup on the
//! inbound path is a direct index. Rewrites patch the packet in place with
//! incremental one's-complement checksum updates.

use crate::protocol::checksum::IncrementalChecksum;
use crate::protocol::icmp::IcmpType;
use crate::protocol::ipv4;
use std::net::Ipv4Addr;
use tracing::debug;

/// First global port handed out for UDP/TCP flows
pub const NAT_GLOBAL_PORT_MIN: u16 = 20000;
/// Last global port handed out for UDP/TCP flows
pub const NAT_GLOBAL_PORT_MAX: u16 = 59999;

const PORT_SLOTS: usize = (NAT_GLOBAL_PORT_MAX - NAT_GLOBAL_PORT_MIN + 1) as usize;
const ICMP_SLOTS: usize = 0xFFFF;

/// Protocols the translator understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatProtocol {
    Icmp,
    Tcp,
    Udp,
}

impl NatProtocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(NatProtocol::Icmp),
            6 => Some(NatProtocol::Tcp),
            17 => Some(NatProtocol::Udp),
            _ => None,
        }
    }
}

/// Which side of the inside/outside boundary a packet is crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatDirection {
    /// Inside to outside: rewrite the source
    Outgoing,
    /// Outside to inside: rewrite the destination
    Incoming,
}

/// One translated flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatEntry {
    pub global_addr: Ipv4Addr,
    pub local_addr: Ipv4Addr,
    pub global_port: u16,
    pub local_port: u16,
}

/// Per-protocol flow tables
pub struct NatEntries {
    icmp: Vec<Option<NatEntry>>,
    udp: Vec<Option<NatEntry>>,
    tcp: Vec<Option<NatEntry>>,
}

impl NatEntries {
    pub fn new() -> Self {
        Self {
            icmp: vec![None; ICMP_SLOTS],
            udp: vec![None; PORT_SLOTS],
            tcp: vec![None; PORT_SLOTS],
        }
    }

    fn slots(&self, proto: NatProtocol) -> &[Option<NatEntry>] {
        match proto {
            NatProtocol::Icmp => &self.icmp,
            NatProtocol::Udp => &self.udp,
            NatProtocol::Tcp => &self.tcp,
        }
    }

    fn slots_mut(&mut self, proto: NatProtocol) -> &mut [Option<NatEntry>] {
        match proto {
            NatProtocol::Icmp => &mut self.icmp,
            NatProtocol::Udp => &mut self.udp,
            NatProtocol::Tcp => &mut self.tcp,
        }
    }

    /// Slot index owning a global port/identifier, when it is in range
    fn slot_of_global(proto: NatProtocol, port: u16) -> Option<usize> {
        match proto {
            NatProtocol::Icmp => {
                let index = port as usize;
                (index < ICMP_SLOTS).then_some(index)
            }
            NatProtocol::Udp | NatProtocol::Tcp => {
                (NAT_GLOBAL_PORT_MIN..=NAT_GLOBAL_PORT_MAX)
                    .contains(&port)
                    .then(|| (port - NAT_GLOBAL_PORT_MIN) as usize)
            }
        }
    }

    /// Reverse lookup by global address and port/identifier. O(1): the port
    /// names its slot.
    pub fn lookup_global(&self, proto: NatProtocol, addr: Ipv4Addr, port: u16) -> Option<NatEntry> {
        let slot = Self::slot_of_global(proto, port)?;
        self.slots(proto)[slot]
            .filter(|entry| entry.global_addr == addr && entry.global_port == port)
    }

    /// Forward lookup by local address and port/identifier, linear over
    /// live slots
    pub fn lookup_local(&self, proto: NatProtocol, addr: Ipv4Addr, port: u16) -> Option<NatEntry> {
        self.slots(proto)
            .iter()
            .flatten()
            .find(|entry| entry.local_addr == addr && entry.local_port == port)
            .copied()
    }

    /// Claim the first free slot for a new flow. The assigned global port is
    /// derived from the slot index.
    pub fn allocate(
        &mut self,
        proto: NatProtocol,
        global_addr: Ipv4Addr,
        local_addr: Ipv4Addr,
        local_port: u16,
    ) -> Option<NatEntry> {
        let slots = self.slots_mut(proto);
        let index = slots.iter().position(Option::is_none)?;

        let global_port = match proto {
            NatProtocol::Icmp => index as u16,
            NatProtocol::Udp | NatProtocol::Tcp => NAT_GLOBAL_PORT_MIN + index as u16,
        };

        let entry = NatEntry {
            global_addr,
            local_addr,
            global_port,
            local_port,
        };
        slots[index] = Some(entry);
        Some(entry)
    }

    /// Iterate live flows of one protocol
    pub fn live(&self, proto: NatProtocol) -> impl Iterator<Item = &NatEntry> {
        self.slots(proto).iter().flatten()
    }

    /// Total number of live flows
    pub fn len(&self) -> usize {
        [NatProtocol::Icmp, NatProtocol::Udp, NatProtocol::Tcp]
            .iter()
            .map(|p| self.live(*p).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NatEntries {
    fn default() -> Self {
        Self::new()
    }
}

/// NAPT attachment carried by the inside interface
pub struct NaptDevice {
    /// Global-side address, the outside interface's address
    pub outside_addr: Ipv4Addr,
    pub entries: NatEntries,
}

impl NaptDevice {
    pub fn new(outside_addr: Ipv4Addr) -> Self {
        Self {
            outside_addr,
            entries: NatEntries::new(),
        }
    }
}

/// Outcome of a translation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatResult {
    /// Packet was rewritten in place
    Translated,
    /// Not a translatable packet (non-query ICMP); propagate unchanged
    PassThrough,
    /// No flow matches; the caller drops
    NoMapping,
    /// No free slot for a new flow; the caller drops
    TableFull,
}

// L4 field offsets within an option-less IPv4 packet
const SRC_PORT: usize = 20;
const DST_PORT: usize = 22;
const UDP_CHECKSUM: usize = 26;
const TCP_CHECKSUM: usize = 36;
const ICMP_TYPE: usize = 20;
const ICMP_CHECKSUM: usize = 22;
const ICMP_IDENT: usize = 24;

fn get_u16(packet: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([packet[offset], packet[offset + 1]])
}

fn put_u16(packet: &mut [u8], offset: usize, value: u16) {
    packet[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn get_addr(packet: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        packet[offset],
        packet[offset + 1],
        packet[offset + 2],
        packet[offset + 3],
    )
}

/// Translate one IPv4 packet in place.
///
/// The caller has already validated the IP header (version 4, no options).
/// On `Translated` the L4 checksum has been patched incrementally and the IP
/// header checksum recomputed.
pub fn nat_exec(
    packet: &mut [u8],
    nat: &mut NaptDevice,
    proto: NatProtocol,
    direction: NatDirection,
) -> NatResult {
    let min_len = match proto {
        NatProtocol::Icmp | NatProtocol::Udp => ipv4::HEADER_SIZE + 8,
        NatProtocol::Tcp => ipv4::HEADER_SIZE + 20,
    };
    if packet.len() < min_len {
        debug!("napt: packet too short for {:?}", proto);
        return NatResult::NoMapping;
    }

    // Only query packets are translated for ICMP; errors propagate unchanged
    if proto == NatProtocol::Icmp {
        let icmp_type = packet[ICMP_TYPE];
        if icmp_type != IcmpType::EchoRequest as u8 && icmp_type != IcmpType::EchoReply as u8 {
            return NatResult::PassThrough;
        }
    }

    let entry = match direction {
        NatDirection::Incoming => {
            let global_addr = get_addr(packet, 16);
            let global_port = match proto {
                NatProtocol::Icmp => get_u16(packet, ICMP_IDENT),
                _ => get_u16(packet, DST_PORT),
            };
            match nat.entries.lookup_global(proto, global_addr, global_port) {
                Some(entry) => entry,
                None => return NatResult::NoMapping,
            }
        }
        NatDirection::Outgoing => {
            let local_addr = get_addr(packet, 12);
            let local_port = match proto {
                NatProtocol::Icmp => get_u16(packet, ICMP_IDENT),
                _ => get_u16(packet, SRC_PORT),
            };
            match nat.entries.lookup_local(proto, local_addr, local_port) {
                Some(entry) => entry,
                None => {
                    let Some(entry) =
                        nat.entries
                            .allocate(proto, nat.outside_addr, local_addr, local_port)
                    else {
                        return NatResult::TableFull;
                    };
                    debug!(
                        "napt: new {:?} flow {}:{} -> global port {}",
                        proto, local_addr, local_port, entry.global_port
                    );
                    entry
                }
            }
        }
    };

    match proto {
        NatProtocol::Icmp => {
            let new_ident = match direction {
                NatDirection::Incoming => entry.local_port,
                NatDirection::Outgoing => entry.global_port,
            };
            let mut fixup = IncrementalChecksum::new(get_u16(packet, ICMP_CHECKSUM));
            fixup
                .remove_u16(get_u16(packet, ICMP_IDENT))
                .add_u16(new_ident);
            put_u16(packet, ICMP_CHECKSUM, fixup.finish());
        }
        NatProtocol::Udp | NatProtocol::Tcp => {
            let checksum_offset = if proto == NatProtocol::Udp {
                UDP_CHECKSUM
            } else {
                TCP_CHECKSUM
            };
            let old_checksum = get_u16(packet, checksum_offset);

            // A zero UDP checksum means "not computed" and stays zero
            if !(proto == NatProtocol::Udp && old_checksum == 0) {
                // The L4 checksum covers the pseudo-header, so the address
                // rewrite participates alongside the port
                let mut fixup = IncrementalChecksum::new(old_checksum);
                match direction {
                    NatDirection::Incoming => {
                        fixup
                            .remove_addr(get_addr(packet, 16))
                            .remove_u16(get_u16(packet, DST_PORT))
                            .add_addr(entry.local_addr)
                            .add_u16(entry.local_port);
                    }
                    NatDirection::Outgoing => {
                        fixup
                            .remove_addr(get_addr(packet, 12))
                            .remove_u16(get_u16(packet, SRC_PORT))
                            .add_addr(entry.global_addr)
                            .add_u16(entry.global_port);
                    }
                }
                put_u16(packet, checksum_offset, fixup.finish());
            }
        }
    }

    // Rewrite the address and port/identifier fields
    match direction {
        NatDirection::Incoming => {
            packet[16..20].copy_from_slice(&entry.local_addr.octets());
            match proto {
                NatProtocol::Icmp => put_u16(packet, ICMP_IDENT, entry.local_port),
                _ => put_u16(packet, DST_PORT, entry.local_port),
            }
        }
        NatDirection::Outgoing => {
            packet[12..16].copy_from_slice(&nat.outside_addr.octets());
            match proto {
                NatProtocol::Icmp => put_u16(packet, ICMP_IDENT, entry.global_port),
                _ => put_u16(packet, SRC_PORT, entry.global_port),
            }
        }
    }

    ipv4::refresh_checksum(packet);
    NatResult::Translated
}
