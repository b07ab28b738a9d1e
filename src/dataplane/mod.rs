//! Data plane components
//!
//! The tables and the per-frame processing pipeline: Ethernet demux, ARP
//! resolution, IPv4 input/forwarding/output, ICMP responses, and NAPT.

mod arp_table;
mod chain;
mod device;
mod fib;
mod napt;
mod router;

pub use arp_table::{ArpEntry, ArpTable, ARP_TABLE_BUCKETS};
pub use chain::BufChain;
pub use device::{DeviceId, IpDevice, NetDevice};
pub use fib::{Fib, RouteEntry};
pub use napt::{
    nat_exec, NaptDevice, NatDirection, NatEntries, NatEntry, NatProtocol, NatResult,
    NAT_GLOBAL_PORT_MIN,
};
pub use router::Router;
