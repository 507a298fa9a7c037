//! # Veles
//!
//! Client half of a bidirectional packet proxy. Veles captures IP traffic of
//! configured source hosts at the link layer, tunnels every captured datagram
//! through an encrypted connection-oriented channel to a remote server, and
//! injects replies back onto the LAN with correct link-layer framing.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │     Capture readers (one per listen device, BPF-filtered)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   Outbound worker: ARP publish / NAT upsert / link-layer strip  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Cipher framing (length prefix + AEAD per datagram)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │     Transport (kernel TCP / FakeTCP / FakeTCP + KCP session)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Inbound worker: NAT lookup / DNS rewrite / reframe / inject    │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)] // Wire fields are sized by the formats
#![allow(clippy::too_many_lines)]

pub mod capture;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod nat;
pub mod packet;
pub mod probe;
pub mod rule;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};

/// Client name reported by the status endpoint.
pub const NAME: &str = "veles-client";

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest IP datagram the tunnel will carry.
pub const IPV4_MAX_SIZE: usize = 65535;

/// Upper bound for the FakeTCP egress MTU.
pub const MAX_MTU: usize = 1500;

/// Capacity of the capture fan-in queue. Producers block when it is full;
/// this is a load-shedding threshold, not a correctness parameter.
pub const QUEUE_CAPACITY: usize = 1000;
