//! Traffic accounting, DNS record log, and liveness state.
//!
//! All three are fed by the pipeline and read only by the status endpoint;
//! none of them gates traffic.

mod http_server;

pub use http_server::{StatusServer, StatusState};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// RTT sentinel before the first echo reply.
pub const PING_NOT_MEASURED: i64 = -1;

/// RTT sentinel after the liveness deadline fired.
pub const PING_DOWN: i64 = -2;

/// Direction of a tunneled frame relative to the LAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Byte and packet counters in both directions.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TrafficIndicator {
    pub out_packets: u64,
    pub out_bytes: u64,
    pub in_packets: u64,
    pub in_bytes: u64,
}

impl TrafficIndicator {
    fn bump(&mut self, direction: Direction, size: usize) {
        match direction {
            Direction::Out => {
                self.out_packets += 1;
                self.out_bytes += size as u64;
            }
            Direction::In => {
                self.in_packets += 1;
                self.in_bytes += size as u64;
            }
        }
    }
}

/// Counters for one LAN node: totals plus a per-peer breakdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeTraffic {
    #[serde(flatten)]
    pub total: TrafficIndicator,
    pub peers: HashMap<String, TrafficIndicator>,
}

/// Internally synchronized per-source traffic counters.
#[derive(Default)]
pub struct TrafficMonitor {
    nodes: RwLock<HashMap<String, NodeTraffic>>,
}

impl TrafficMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one frame. `node` is the LAN-side address of the flow
    /// regardless of direction, `peer` the Internet-side one.
    pub fn add(&self, node: &str, peer: &str, direction: Direction, size: usize) {
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(node.to_string()).or_default();
        entry.total.bump(direction, size);
        entry
            .peers
            .entry(peer.to_string())
            .or_default()
            .bump(direction, size);
    }

    /// A point-in-time copy for serialization.
    pub fn snapshot(&self) -> HashMap<String, NodeTraffic> {
        self.nodes.read().clone()
    }
}

/// An (address, name) pair served by `GET /dns`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IpName {
    pub ip: String,
    pub name: String,
}

/// Process-wide log of names seen in tunneled DNS responses.
///
/// One writer (the inbound worker), many readers.
#[derive(Default)]
pub struct DnsLog {
    records: RwLock<HashMap<String, String>>,
}

impl DnsLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `ip` resolved from `name`. Later responses win.
    pub fn record(&self, ip: IpAddr, name: &str) {
        self.records
            .write()
            .insert(ip.to_string(), name.to_string());
    }

    /// All known pairs, ordered by address for stable output.
    pub fn snapshot(&self) -> Vec<IpName> {
        let mut pairs: Vec<IpName> = self
            .records
            .read()
            .iter()
            .map(|(ip, name)| IpName {
                ip: ip.clone(),
                name: name.clone(),
            })
            .collect();
        pairs.sort_by(|a, b| a.ip.cmp(&b.ip));
        pairs
    }
}

/// Advisory liveness state fed by the ICMP prober.
pub struct LivenessState {
    rtt_ms: AtomicI64,
    seq: AtomicU64,
}

impl LivenessState {
    pub fn new() -> Self {
        Self {
            rtt_ms: AtomicI64::new(PING_NOT_MEASURED),
            seq: AtomicU64::new(0),
        }
    }

    /// Record an echo reply.
    pub fn record_reply(&self, rtt_ms: i64, seq: u64) {
        self.rtt_ms.store(rtt_ms, Ordering::SeqCst);
        self.seq.store(seq, Ordering::SeqCst);
    }

    /// Mark the server unreachable.
    pub fn mark_down(&self) {
        self.rtt_ms.store(PING_DOWN, Ordering::SeqCst);
    }

    pub fn last_rtt_ms(&self) -> i64 {
        self.rtt_ms.load(Ordering::SeqCst)
    }

    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}
