//! Reverse NAT table for reply delivery.
//!
//! Maps each source IP to the link-layer address and capture handle its
//! traffic was last observed on, so tunneled replies can be reframed and
//! injected on the right interface. Entries never expire; they die with the
//! process.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;

use crate::packet::HardwareAddr;

/// A NAT entry: where replies for a source IP must be delivered.
#[derive(Debug, Clone)]
pub struct NatEntry<H> {
    /// Hardware address the source was last seen with.
    pub hardware_addr: HardwareAddr,
    /// Capture handle a frame from the source was observed on.
    pub handle: H,
}

/// Reverse NAT table, writer-exclusive / reader-shared.
///
/// Generic over the capture handle type; the pipeline instantiates it with
/// `Arc<RawConn>`.
pub struct NatTable<H> {
    entries: RwLock<HashMap<IpAddr, NatEntry<H>>>,
}

impl<H: Clone> NatTable<H> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record the observed (source IP, hardware address, handle).
    ///
    /// A no-op when the stored hardware address already matches; otherwise
    /// the whole entry is replaced atomically so readers never see a torn
    /// (address, handle) pair. Returns whether the table changed.
    pub fn upsert(&self, ip: IpAddr, hardware_addr: HardwareAddr, handle: H) -> bool {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&ip) {
                if entry.hardware_addr == hardware_addr {
                    return false;
                }
            }
        }

        let mut entries = self.entries.write();
        entries.insert(
            ip,
            NatEntry {
                hardware_addr,
                handle,
            },
        );
        true
    }

    /// Look up the delivery entry for a destination IP.
    pub fn lookup(&self, ip: IpAddr) -> Option<NatEntry<H>> {
        self.entries.read().get(&ip).cloned()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<H: Clone> Default for NatTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_upsert_and_lookup() {
        let table: NatTable<u32> = NatTable::new();
        let mac = HardwareAddr([0xaa; 6]);

        assert!(table.upsert(ip("10.0.0.2"), mac, 0));

        let entry = table.lookup(ip("10.0.0.2")).unwrap();
        assert_eq!(entry.hardware_addr, mac);
        assert_eq!(entry.handle, 0);

        assert!(table.lookup(ip("10.0.0.3")).is_none());
    }

    #[test]
    fn test_upsert_idempotent() {
        let table: NatTable<u32> = NatTable::new();
        let mac = HardwareAddr([0xaa; 6]);

        assert!(table.upsert(ip("10.0.0.2"), mac, 0));
        assert!(!table.upsert(ip("10.0.0.2"), mac, 0));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_upsert_replaces_on_mac_change() {
        let table: NatTable<u32> = NatTable::new();

        table.upsert(ip("10.0.0.2"), HardwareAddr([0xaa; 6]), 0);
        assert!(table.upsert(ip("10.0.0.2"), HardwareAddr([0xbb; 6]), 1));

        let entry = table.lookup(ip("10.0.0.2")).unwrap();
        assert_eq!(entry.hardware_addr, HardwareAddr([0xbb; 6]));
        assert_eq!(entry.handle, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_entries_per_source() {
        let table: NatTable<u32> = NatTable::new();

        table.upsert(ip("10.0.0.2"), HardwareAddr([0xaa; 6]), 0);
        table.upsert(ip("10.0.0.3"), HardwareAddr([0xbb; 6]), 1);

        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(ip("10.0.0.3")).unwrap().handle, 1);
    }
}
