//! ARP table (IP to MAC mapping)
//!
//! 256 hash buckets keyed by `ip % 256`; colliding addresses chain through
//! arena-allocated entries linked by index. Entries record the interface
//! the binding was learned on and are never aged out.

use crate::dataplane::DeviceId;
use crate::protocol::MacAddr;
use std::net::Ipv4Addr;

/// Number of hash buckets
pub const ARP_TABLE_BUCKETS: usize = 256;

/// A resolved IP/MAC binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub dev: DeviceId,
}

#[derive(Debug)]
struct ChainNode {
    entry: ArpEntry,
    next: Option<usize>,
}

/// ARP resolution table
#[derive(Debug)]
pub struct ArpTable {
    buckets: Vec<Option<usize>>,
    arena: Vec<ChainNode>,
}

impl ArpTable {
    pub fn new() -> Self {
        Self {
            buckets: vec![None; ARP_TABLE_BUCKETS],
            arena: Vec::new(),
        }
    }

    fn bucket_of(ip: Ipv4Addr) -> usize {
        (u32::from(ip) % ARP_TABLE_BUCKETS as u32) as usize
    }

    /// Insert a binding, overwriting the MAC and interface when the IP is
    /// already present in its chain
    pub fn add_or_update(&mut self, dev: DeviceId, mac: MacAddr, ip: Ipv4Addr) {
        let bucket = Self::bucket_of(ip);
        let entry = ArpEntry { mac, ip, dev };

        let mut index = match self.buckets[bucket] {
            Some(head) => head,
            None => {
                self.arena.push(ChainNode { entry, next: None });
                self.buckets[bucket] = Some(self.arena.len() - 1);
                return;
            }
        };

        loop {
            if self.arena[index].entry.ip == ip {
                self.arena[index].entry = entry;
                return;
            }
            match self.arena[index].next {
                Some(next) => index = next,
                None => break,
            }
        }

        // Append a new node at the end of the chain
        self.arena.push(ChainNode { entry, next: None });
        self.arena[index].next = Some(self.arena.len() - 1);
    }

    /// Look up the binding for an IP
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<&ArpEntry> {
        let mut index = self.buckets[Self::bucket_of(ip)];
        while let Some(i) = index {
            if self.arena[i].entry.ip == ip {
                return Some(&self.arena[i].entry);
            }
            index = self.arena[i].next;
        }
        None
    }

    /// Iterate all entries in bucket order
    pub fn iter(&self) -> impl Iterator<Item = &ArpEntry> {
        self.buckets.iter().flat_map(move |head| {
            let mut index = *head;
            std::iter::from_fn(move || {
                let i = index?;
                index = self.arena[i].next;
                Some(&self.arena[i].entry)
            })
        })
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const MAC_B: MacAddr = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

    #[test]
    fn test_add_and_lookup() {
        let mut table = ArpTable::new();
        let ip = Ipv4Addr::new(192, 168, 1, 2);

        table.add_or_update(0, MAC_A, ip);

        let entry = table.lookup(ip).unwrap();
        assert_eq!(entry.mac, MAC_A);
        assert_eq!(entry.dev, 0);
        assert!(table.lookup(Ipv4Addr::new(192, 168, 1, 3)).is_none());
    }

    #[test]
    fn test_update_overwrites() {
        let mut table = ArpTable::new();
        let ip = Ipv4Addr::new(192, 168, 1, 2);

        table.add_or_update(0, MAC_A, ip);
        table.add_or_update(1, MAC_B, ip);

        assert_eq!(table.len(), 1);
        let entry = table.lookup(ip).unwrap();
        assert_eq!(entry.mac, MAC_B);
        assert_eq!(entry.dev, 1);
    }

    #[test]
    fn test_collision_chain() {
        let mut table = ArpTable::new();
        // Both hash to bucket 1 (same low byte after mod 256)
        let ip1 = Ipv4Addr::new(192, 168, 1, 1);
        let ip2 = Ipv4Addr::new(192, 168, 2, 1);
        assert_eq!(ArpTable::bucket_of(ip1), ArpTable::bucket_of(ip2));

        table.add_or_update(0, MAC_A, ip1);
        table.add_or_update(1, MAC_B, ip2);

        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(ip1).unwrap().mac, MAC_A);
        assert_eq!(table.lookup(ip2).unwrap().mac, MAC_B);

        // Updating a chained entry does not grow the chain
        table.add_or_update(1, MAC_A, ip2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(ip2).unwrap().mac, MAC_A);
    }

    #[test]
    fn test_bucket_invariant() {
        let mut table = ArpTable::new();
        for i in 0..64u8 {
            table.add_or_update(0, MAC_A, Ipv4Addr::new(10, 0, i % 3, i));
        }

        // Every entry hashes to the bucket that owns its chain, and every
        // chain holds distinct IPs
        for bucket in 0..ARP_TABLE_BUCKETS {
            let mut seen = Vec::new();
            let mut index = table.buckets[bucket];
            while let Some(i) = index {
                let entry = table.arena[i].entry;
                assert_eq!(ArpTable::bucket_of(entry.ip), bucket);
                assert!(!seen.contains(&entry.ip));
                seen.push(entry.ip);
                index = table.arena[i].next;
            }
        }
    }

    #[test]
    fn test_iter_covers_all() {
        let mut table = ArpTable::new();
        table.add_or_update(0, MAC_A, Ipv4Addr::new(192, 168, 1, 1));
        table.add_or_update(0, MAC_B, Ipv4Addr::new(192, 168, 2, 1));
        table.add_or_update(1, MAC_A, Ipv4Addr::new(10, 0, 0, 7));

        let ips: Vec<Ipv4Addr> = table.iter().map(|e| e.ip).collect();
        assert_eq!(ips.len(), 3);
        assert!(ips.contains(&Ipv4Addr::new(10, 0, 0, 7)));
    }
}
