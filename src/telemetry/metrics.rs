//! Metrics collection for packet statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Atomic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-interface statistics.
#[derive(Debug, Default)]
pub struct InterfaceStats {
    pub rx_packets: Counter,
    pub rx_bytes: Counter,
    pub tx_packets: Counter,
    pub tx_bytes: Counter,
    pub tx_errors: Counter,
}

impl InterfaceStats {
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }
}

/// Global metrics registry for the router.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    interfaces: RwLock<HashMap<String, InterfaceStats>>,

    /// ARP requests sent
    pub arp_requests_sent: Counter,
    /// ARP replies sent
    pub arp_replies_sent: Counter,

    /// Packets forwarded between interfaces
    pub packets_forwarded: Counter,
    /// Packets dropped (no route, TTL expired, resolution miss, NAPT miss)
    pub packets_dropped: Counter,

    /// ICMP echo replies sent
    pub icmp_echo_replies: Counter,
    /// ICMP errors emitted (time exceeded, destination unreachable)
    pub icmp_errors_sent: Counter,

    /// Successful NAPT rewrites
    pub napt_translations: Counter,

    /// Current number of ARP table entries
    pub arp_table_size: AtomicU64,
    /// Current number of installed routes
    pub route_count: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_interface(&self, name: &str) {
        let mut interfaces = self.interfaces.write().unwrap();
        interfaces.entry(name.to_string()).or_default();
    }

    pub fn record_rx(&self, interface: &str, bytes: usize) {
        if let Some(stats) = self.interfaces.read().unwrap().get(interface) {
            stats.record_rx(bytes);
        }
    }

    pub fn record_tx(&self, interface: &str, bytes: usize) {
        if let Some(stats) = self.interfaces.read().unwrap().get(interface) {
            stats.record_tx(bytes);
        }
    }

    pub fn record_tx_error(&self, interface: &str) {
        if let Some(stats) = self.interfaces.read().unwrap().get(interface) {
            stats.tx_errors.inc();
        }
    }

    pub fn set_arp_table_size(&self, size: usize) {
        self.arp_table_size.store(size as u64, Ordering::Relaxed);
    }

    pub fn set_route_count(&self, count: usize) {
        self.route_count.store(count as u64, Ordering::Relaxed);
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("arp_requests_sent".into(), self.arp_requests_sent.get()),
            ("arp_replies_sent".into(), self.arp_replies_sent.get()),
            ("packets_forwarded".into(), self.packets_forwarded.get()),
            ("packets_dropped".into(), self.packets_dropped.get()),
            ("icmp_echo_replies".into(), self.icmp_echo_replies.get()),
            ("icmp_errors_sent".into(), self.icmp_errors_sent.get()),
            ("napt_translations".into(), self.napt_translations.get()),
            (
                "arp_table_size".into(),
                self.arp_table_size.load(Ordering::Relaxed),
            ),
            (
                "route_count".into(),
                self.route_count.load(Ordering::Relaxed),
            ),
        ];

        let interfaces = self.interfaces.read().unwrap();
        for (name, stats) in interfaces.iter() {
            result.extend([
                (format!("{}_rx_packets", name), stats.rx_packets.get()),
                (format!("{}_rx_bytes", name), stats.rx_bytes.get()),
                (format!("{}_tx_packets", name), stats.tx_packets.get()),
                (format!("{}_tx_bytes", name), stats.tx_bytes.get()),
                (format!("{}_tx_errors", name), stats.tx_errors.get()),
            ]);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(10);
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();

        registry.register_interface("eth0");
        registry.record_rx("eth0", 100);
        registry.record_tx("eth0", 200);
        registry.packets_forwarded.inc();

        let metrics = registry.export();
        assert!(metrics.contains(&("packets_forwarded".into(), 1)));
        assert!(metrics.contains(&("eth0_rx_packets".into(), 1)));
        assert!(metrics.contains(&("eth0_rx_bytes".into(), 100)));
        assert!(metrics.contains(&("eth0_tx_bytes".into(), 200)));
    }

    #[test]
    fn test_unregistered_interface_ignored() {
        let registry = MetricsRegistry::new();
        registry.record_rx("missing", 100);
        assert!(!registry
            .export()
            .iter()
            .any(|(k, _)| k.starts_with("missing")));
    }
}
