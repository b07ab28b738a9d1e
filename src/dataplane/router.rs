//! The packet processing pipeline
//!
//! `Router` owns the device registry, the FIB, the ARP table, and any NAPT
//! state, and carries a received frame from Ethernet demux through ARP or
//! IPv4 processing to the transmitting interface. Each frame is processed
//! to completion before the next poll; nothing here blocks.

use crate::capture::Transport;
use crate::dataplane::{
    nat_exec, ArpTable, BufChain, DeviceId, Fib, IpDevice, NaptDevice, NatDirection, NatProtocol,
    NatResult, NetDevice, RouteEntry,
};
use crate::protocol::arp::{ArpOp, ArpPacket};
use crate::protocol::ethernet::{self, Frame, MAX_FRAME_SIZE};
use crate::protocol::icmp::{self, IcmpMessage, IcmpType};
use crate::protocol::ipv4::{self, Ipv4Header, Protocol};
use crate::protocol::{EtherType, MacAddr};
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// The router context: devices, tables, and counters
pub struct Router {
    devices: Vec<NetDevice>,
    fib: Fib,
    arp_table: ArpTable,
    /// IPv4 identification counter for generated packets
    next_ip_id: u16,
    metrics: Arc<MetricsRegistry>,
}

impl Router {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            devices: Vec::new(),
            fib: Fib::new(),
            arp_table: ArpTable::new(),
            next_ip_id: 0,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn arp_table(&self) -> &ArpTable {
        &self.arp_table
    }

    // --- registry and configuration -------------------------------------

    /// Register an interface. Devices are registered once at startup and
    /// never removed.
    pub fn register_device(
        &mut self,
        name: String,
        mac: MacAddr,
        transport: Box<dyn Transport>,
    ) -> DeviceId {
        self.metrics.register_interface(&name);
        self.devices.push(NetDevice {
            name,
            mac,
            transport,
            ip: None,
        });
        self.devices.len() - 1
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_name(&self, dev: DeviceId) -> &str {
        &self.devices[dev].name
    }

    pub fn find_device(&self, name: &str) -> Option<DeviceId> {
        self.devices.iter().position(|d| d.name == name)
    }

    /// Attach an IP configuration and install the connected route for the
    /// interface's subnet
    pub fn set_address(&mut self, dev: DeviceId, address: Ipv4Addr, netmask: Ipv4Addr) {
        let prefix_len = u32::from(netmask).leading_ones() as u8;
        let prefix = Ipv4Addr::from(u32::from(address) & u32::from(netmask));

        self.devices[dev].ip = Some(IpDevice::new(address, netmask));
        self.fib
            .insert(prefix, prefix_len, RouteEntry::Connected { dev });
        self.metrics.set_route_count(self.fib.route_count());

        info!(
            "{}: address {}/{}, connected route {}/{}",
            self.devices[dev].name, address, prefix_len, prefix, prefix_len
        );
    }

    /// Install a static route
    pub fn add_route(&mut self, prefix: Ipv4Addr, prefix_len: u8, next_hop: Ipv4Addr) {
        let mask = if prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - prefix_len)
        };
        let prefix = Ipv4Addr::from(u32::from(prefix) & mask);

        self.fib
            .insert(prefix, prefix_len, RouteEntry::Network { next_hop });
        self.metrics.set_route_count(self.fib.route_count());

        info!("route {}/{} via {}", prefix, prefix_len, next_hop);
    }

    /// Attach NAPT to `inside`, translating to `outside`'s address.
    /// Both interfaces must already have addresses.
    pub fn enable_napt(&mut self, inside: DeviceId, outside: DeviceId) -> Result<()> {
        let outside_addr = self.devices[outside]
            .ip
            .as_ref()
            .map(|ip| ip.address)
            .ok_or_else(|| {
                Error::Config(format!(
                    "napt: {} has no address",
                    self.devices[outside].name
                ))
            })?;

        let inside_name = self.devices[inside].name.clone();
        let inside_ip = self.devices[inside]
            .ip
            .as_mut()
            .ok_or_else(|| Error::Config(format!("napt: {} has no address", inside_name)))?;

        inside_ip.napt = Some(NaptDevice::new(outside_addr));
        info!(
            "napt enabled: inside {}, outside address {}",
            inside_name, outside_addr
        );
        Ok(())
    }

    // --- receive path ---------------------------------------------------

    /// One non-blocking receive on a device; processes the frame fully.
    /// Returns whether a frame was delivered.
    pub fn poll_device(&mut self, dev: DeviceId) -> Result<bool> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = match self.devices[dev].transport.poll(&mut buf)? {
            Some(len) => len,
            None => return Ok(false),
        };

        self.metrics.record_rx(&self.devices[dev].name, len);
        self.ethernet_input(dev, &buf[..len]);
        Ok(true)
    }

    /// Ethernet demux
    pub fn ethernet_input(&mut self, dev: DeviceId, frame: &[u8]) {
        let parsed = match Frame::parse(frame) {
            Ok(f) => f,
            Err(e) => {
                trace!("{}: dropping frame: {}", self.devices[dev].name, e);
                return;
            }
        };

        let dst = parsed.dst_mac();
        if dst != self.devices[dev].mac && !dst.is_broadcast() {
            trace!("{}: frame for {}, not us", self.devices[dev].name, dst);
            return;
        }

        match parsed.ethertype() {
            t if t == EtherType::Arp as u16 => self.arp_input(dev, parsed.payload()),
            t if t == EtherType::Ipv4 as u16 => self.ip_input(dev, parsed.payload()),
            t => trace!("{}: unhandled ethertype {:04x}", self.devices[dev].name, t),
        }
    }

    /// Prepend the Ethernet header, flatten, and hand the frame to the
    /// device transport. Oversized frames are dropped.
    fn ethernet_output(
        &mut self,
        dev: DeviceId,
        dst_mac: MacAddr,
        mut chain: BufChain,
        ethertype: u16,
    ) {
        trace!(
            "{}: sending frame type {:04x} to {}",
            self.devices[dev].name,
            ethertype,
            dst_mac
        );
        chain.push_header(
            ethernet::build_header(dst_mac, self.devices[dev].mac, ethertype).to_vec(),
        );

        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = match chain.flatten_into(&mut buf) {
            Ok(len) => len,
            Err(e) => {
                warn!("{}: {}, dropping", self.devices[dev].name, e);
                self.metrics.packets_dropped.inc();
                return;
            }
        };

        if let Err(e) = self.devices[dev].transport.transmit(&buf[..len]) {
            warn!("{}: transmit failed: {}", self.devices[dev].name, e);
            self.metrics.record_tx_error(&self.devices[dev].name);
            return;
        }
        self.metrics.record_tx(&self.devices[dev].name, len);
    }

    // --- ARP ------------------------------------------------------------

    fn arp_input(&mut self, dev: DeviceId, payload: &[u8]) {
        let packet = match ArpPacket::parse(payload) {
            Ok(p) => p,
            Err(e) => {
                trace!("{}: dropping arp: {}", self.devices[dev].name, e);
                return;
            }
        };

        match packet.operation {
            ArpOp::Request => {
                let Some(address) = self.devices[dev].ip.as_ref().map(|ip| ip.address) else {
                    return;
                };
                if address != packet.target_ip {
                    return;
                }

                debug!(
                    "{}: arp reply {} is-at {}",
                    self.devices[dev].name, address, self.devices[dev].mac
                );
                let reply = ArpPacket::reply(
                    self.devices[dev].mac,
                    address,
                    packet.sender_mac,
                    packet.sender_ip,
                );
                self.metrics.arp_replies_sent.inc();
                self.ethernet_output(
                    dev,
                    packet.sender_mac,
                    BufChain::from_payload(reply.to_bytes().to_vec()),
                    EtherType::Arp as u16,
                );
                self.arp_learn(dev, packet.sender_mac, packet.sender_ip);
            }
            ArpOp::Reply => {
                if self.devices[dev].ip.is_some() {
                    debug!(
                        "{}: learned {} -> {} from arp reply",
                        self.devices[dev].name, packet.sender_ip, packet.sender_mac
                    );
                }
                self.arp_learn(dev, packet.sender_mac, packet.sender_ip);
            }
        }
    }

    fn arp_learn(&mut self, dev: DeviceId, mac: MacAddr, ip: Ipv4Addr) {
        self.arp_table.add_or_update(dev, mac, ip);
        self.metrics.set_arp_table_size(self.arp_table.len());
    }

    /// Broadcast an ARP request for `target_ip`
    fn send_arp_request(&mut self, dev: DeviceId, target_ip: Ipv4Addr) {
        let Some(sender_ip) = self.devices[dev].ip.as_ref().map(|ip| ip.address) else {
            return;
        };

        debug!(
            "{}: arp request who-has {}",
            self.devices[dev].name, target_ip
        );
        let request = ArpPacket::request(self.devices[dev].mac, sender_ip, target_ip);
        self.metrics.arp_requests_sent.inc();
        self.ethernet_output(
            dev,
            MacAddr::BROADCAST,
            BufChain::from_payload(request.to_bytes().to_vec()),
            EtherType::Arp as u16,
        );
    }

    // --- IPv4 input -----------------------------------------------------

    fn ip_input(&mut self, dev: DeviceId, packet: &[u8]) {
        // Interfaces without an address do not terminate or forward
        if self.devices[dev].ip.is_none() {
            return;
        }

        let header = match Ipv4Header::parse(packet) {
            Ok(h) => h,
            Err(e) => {
                trace!("{}: dropping ip packet: {}", self.devices[dev].name, e);
                return;
            }
        };
        let src = header.src_addr();
        let dst = header.dst_addr();
        let protocol = header.protocol();
        let total_len = header.total_length() as usize;
        trace!(
            "{}: ip proto {} {} -> {}",
            self.devices[dev].name,
            protocol,
            src,
            dst
        );

        // Frames may carry link-layer padding past the IP packet
        if total_len < ipv4::HEADER_SIZE || total_len > packet.len() {
            trace!("{}: bad total length {}", self.devices[dev].name, total_len);
            return;
        }
        let packet = &packet[..total_len];

        if dst == ipv4::LIMITED_BROADCAST {
            return self.deliver_local(dev, packet);
        }

        // Does the router own the destination (address or directed
        // broadcast on any interface)?
        let owner = self.devices.iter().position(|d| {
            d.ip.as_ref()
                .is_some_and(|ip| ip.address == dst || ip.broadcast == dst)
        });

        if let Some(owner) = owner {
            // A destination matching a NAPT global address is a returning
            // flow, not local traffic
            let nat_holder = self.devices.iter().position(|d| {
                d.ip.as_ref()
                    .and_then(|ip| ip.napt.as_ref())
                    .is_some_and(|nat| nat.outside_addr == dst)
            });

            if let (Some(holder), Some(proto)) = (nat_holder, NatProtocol::from_u8(protocol)) {
                if let Some(nat) = self.devices[holder].ip.as_mut().and_then(|ip| ip.napt.as_mut())
                {
                    let mut owned = packet.to_vec();
                    match nat_exec(&mut owned, nat, proto, NatDirection::Incoming) {
                        NatResult::Translated => {
                            self.metrics.napt_translations.inc();
                            // Destination is rewritten; classify again
                            return self.ip_input(dev, &owned);
                        }
                        NatResult::PassThrough => {}
                        NatResult::NoMapping | NatResult::TableFull => {
                            debug!("napt: no flow for {} -> {}, dropping", src, dst);
                            self.metrics.packets_dropped.inc();
                            return;
                        }
                    }
                }
            }

            return self.deliver_local(owner, packet);
        }

        let mut owned = packet.to_vec();

        // Transit traffic entering on the NAPT inside interface gets its
        // source rewritten before the route lookup
        if let Some(nat) = self.devices[dev].ip.as_mut().and_then(|ip| ip.napt.as_mut()) {
            let Some(proto) = NatProtocol::from_u8(protocol) else {
                debug!("napt: untranslatable protocol {}, dropping", protocol);
                self.metrics.packets_dropped.inc();
                return;
            };

            match nat_exec(&mut owned, nat, proto, NatDirection::Outgoing) {
                NatResult::Translated => self.metrics.napt_translations.inc(),
                NatResult::PassThrough => {}
                NatResult::NoMapping | NatResult::TableFull => {
                    warn!("napt: cannot translate {}:{}, dropping", src, protocol);
                    self.metrics.packets_dropped.inc();
                    return;
                }
            }
        }

        self.forward(dev, owned);
    }

    /// Forward a transit packet per the FIB
    fn forward(&mut self, input_dev: DeviceId, mut packet: Vec<u8>) {
        let (src, dst) = {
            let Ok(header) = Ipv4Header::parse(&packet) else {
                return;
            };
            (header.src_addr(), header.dst_addr())
        };

        let Some(route) = self.fib.lookup(dst) else {
            debug!("no route to {}, dropping", dst);
            self.metrics.packets_dropped.inc();
            return;
        };

        if !ipv4::decrement_ttl(&mut packet) {
            debug!("ttl expired {} -> {}", src, dst);
            self.metrics.packets_dropped.inc();
            if let Some(origin) = self.devices[input_dev].ip.as_ref().map(|ip| ip.address) {
                self.send_time_exceeded(origin, src, &packet);
            }
            return;
        }

        self.metrics.packets_forwarded.inc();
        let chain = BufChain::from_payload(packet);
        match route {
            RouteEntry::Connected { dev } => self.output_to_host(dev, dst, chain),
            RouteEntry::Network { next_hop } => self.output_to_next_hop(next_hop, chain),
        }
    }

    /// Dispatch a packet addressed to the router itself
    fn deliver_local(&mut self, dev: DeviceId, packet: &[u8]) {
        let Ok(header) = Ipv4Header::parse(packet) else {
            return;
        };
        let src = header.src_addr();
        let dst = header.dst_addr();

        match header.protocol() {
            p if p == Protocol::Icmp as u8 => self.icmp_input(src, dst, header.payload()),
            p if p == Protocol::Udp as u8 => {
                debug!("udp {} -> {}: port unreachable", src, dst);
                if let Some(origin) = self.devices[dev].ip.as_ref().map(|ip| ip.address) {
                    self.send_destination_unreachable(origin, src, packet);
                }
            }
            p if p == Protocol::Tcp as u8 => {
                // Nothing listens; RST generation is not our business
            }
            p => trace!("unhandled ip protocol {}", p),
        }
    }

    // --- ICMP -----------------------------------------------------------

    fn icmp_input(&mut self, src: Ipv4Addr, dst: Ipv4Addr, message: &[u8]) {
        let parsed = match IcmpMessage::parse(message) {
            Ok(m) => m,
            Err(e) => {
                trace!("dropping icmp: {}", e);
                return;
            }
        };

        match parsed.icmp_type() {
            t if t == IcmpType::EchoReply as u8 => {
                debug!(
                    "echo reply from {} id {:04x} seq {}",
                    src,
                    parsed.identifier(),
                    parsed.sequence()
                );
            }
            t if t == IcmpType::EchoRequest as u8 => {
                debug!(
                    "echo request from {} id {:04x} seq {}",
                    src,
                    parsed.identifier(),
                    parsed.sequence()
                );
                let Ok(reply) = icmp::build_echo_reply(message) else {
                    return;
                };
                self.metrics.icmp_echo_replies.inc();
                // Reply source is the address the request was sent to
                self.ip_encapsulate_output(
                    src,
                    dst,
                    BufChain::from_payload(reply),
                    Protocol::Icmp as u8,
                );
            }
            t => trace!("unhandled icmp type {}", t),
        }
    }

    fn send_time_exceeded(&mut self, origin: Ipv4Addr, dst: Ipv4Addr, original: &[u8]) {
        let message = icmp::build_error(IcmpType::TimeExceeded, icmp::CODE_TTL_EXPIRED, original);
        self.metrics.icmp_errors_sent.inc();
        self.ip_encapsulate_output(
            dst,
            origin,
            BufChain::from_payload(message),
            Protocol::Icmp as u8,
        );
    }

    fn send_destination_unreachable(&mut self, origin: Ipv4Addr, dst: Ipv4Addr, original: &[u8]) {
        let message = icmp::build_error(
            IcmpType::DestinationUnreachable,
            icmp::CODE_PORT_UNREACHABLE,
            original,
        );
        self.metrics.icmp_errors_sent.inc();
        self.ip_encapsulate_output(
            dst,
            origin,
            BufChain::from_payload(message),
            Protocol::Icmp as u8,
        );
    }

    // --- IPv4 output ----------------------------------------------------

    /// Wrap a generated payload in an IPv4 header and emit it on the first
    /// interface whose subnet contains the destination
    fn ip_encapsulate_output(
        &mut self,
        dst: Ipv4Addr,
        src: Ipv4Addr,
        mut chain: BufChain,
        protocol: u8,
    ) {
        let payload_len = chain.total_len();
        let id = self.next_ip_id;
        self.next_ip_id = self.next_ip_id.wrapping_add(1);
        chain.push_header(ipv4::build_header(src, dst, protocol, id, 255, payload_len).to_vec());

        let Some(dev) = self
            .devices
            .iter()
            .position(|d| d.ip.as_ref().is_some_and(|ip| ip.contains(dst)))
        else {
            debug!("no connected subnet for {}, dropping", dst);
            self.metrics.packets_dropped.inc();
            return;
        };

        match self.arp_table.lookup(dst).map(|e| e.mac) {
            Some(mac) => self.ethernet_output(dev, mac, chain, EtherType::Ipv4 as u16),
            None => {
                debug!("no arp entry for {}, requesting", dst);
                self.send_arp_request(dev, dst);
                self.metrics.packets_dropped.inc();
            }
        }
    }

    /// Emit a forwarded packet to a host on a connected network
    fn output_to_host(&mut self, dev: DeviceId, dst: Ipv4Addr, chain: BufChain) {
        match self.arp_table.lookup(dst).map(|e| e.mac) {
            Some(mac) => self.ethernet_output(dev, mac, chain, EtherType::Ipv4 as u16),
            None => {
                debug!("no arp entry for {}, requesting", dst);
                self.send_arp_request(dev, dst);
                self.metrics.packets_dropped.inc();
            }
        }
    }

    /// Emit a forwarded packet towards a next-hop router
    fn output_to_next_hop(&mut self, next_hop: Ipv4Addr, chain: BufChain) {
        match self.arp_table.lookup(next_hop).map(|e| (e.dev, e.mac)) {
            Some((dev, mac)) => self.ethernet_output(dev, mac, chain, EtherType::Ipv4 as u16),
            None => {
                debug!("no arp entry for next hop {}, requesting", next_hop);
                if let Some(RouteEntry::Connected { dev }) = self.fib.lookup(next_hop) {
                    self.send_arp_request(dev, next_hop);
                }
                self.metrics.packets_dropped.inc();
            }
        }
    }

    // --- operator dumps -------------------------------------------------

    pub fn dump_arp_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "|------------IP------------|----------MAC----------|-DEV-|");
        for entry in self.arp_table.iter() {
            let _ = writeln!(
                out,
                "| {:>24} | {:>21} | {:>3} |",
                entry.ip.to_string(),
                entry.mac.to_string(),
                self.devices[entry.dev].name
            );
        }
        out
    }

    pub fn dump_nat_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "|-PROTO-|--------LOCAL--------|--------GLOBAL--------|");
        for device in &self.devices {
            let Some(nat) = device.ip.as_ref().and_then(|ip| ip.napt.as_ref()) else {
                continue;
            };
            for (label, proto) in [
                ("TCP", NatProtocol::Tcp),
                ("UDP", NatProtocol::Udp),
                ("ICMP", NatProtocol::Icmp),
            ] {
                for entry in nat.entries.live(proto) {
                    let _ = writeln!(
                        out,
                        "| {:>5} | {:>15}:{:05} | {:>15}:{:05} |",
                        label,
                        entry.local_addr.to_string(),
                        entry.local_port,
                        entry.global_addr.to_string(),
                        entry.global_port
                    );
                }
            }
        }
        out
    }
}
