//! Host-level side effects behind the `rule` option.
//!
//! FakeTCP segments are invisible to the host kernel's TCP stack, which
//! would otherwise answer the server's segments with RSTs and tear the flow
//! down at every middlebox on the path. When `rule` is enabled the client
//! suppresses those RSTs with a firewall rule, turns off IP forwarding, and
//! disables GRO so captured frames are not coalesced past the MTU.
//!
//! Every failure here is logged and tolerated; the tunnel can run without
//! these knobs on a correctly pre-configured host.

use std::net::SocketAddrV4;
use std::process::Command;

use crate::error::{Error, Result};

/// Turn off IPv4 forwarding so captured frames are not also routed.
#[cfg(target_os = "linux")]
pub fn disable_ip_forwarding() -> Result<()> {
    run(Command::new("sysctl").args(["-w", "net.ipv4.ip_forward=0"]))
}

/// Drop kernel-originated RSTs toward the server endpoint.
#[cfg(target_os = "linux")]
pub fn add_firewall_rule(server: SocketAddrV4) -> Result<()> {
    run(Command::new("iptables").args([
        "-I",
        "OUTPUT",
        "-p",
        "tcp",
        "--tcp-flags",
        "RST",
        "RST",
        "-d",
        &server.ip().to_string(),
        "--dport",
        &server.port().to_string(),
        "-j",
        "DROP",
    ]))
}

/// Disable generic receive offload on a device.
#[cfg(target_os = "linux")]
pub fn disable_gro(device: &str) -> Result<()> {
    run(Command::new("ethtool").args(["-K", device, "gro", "off"]))
}

#[cfg(target_os = "linux")]
fn run(command: &mut Command) -> Result<()> {
    let output = command.output()?;
    if output.status.success() {
        return Ok(());
    }
    Err(Error::Config(format!(
        "{:?} failed: {}",
        command.get_program(),
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

#[cfg(not(target_os = "linux"))]
pub fn disable_ip_forwarding() -> Result<()> {
    Err(Error::Config("rule is only supported on linux".into()))
}

#[cfg(not(target_os = "linux"))]
pub fn add_firewall_rule(_server: SocketAddrV4) -> Result<()> {
    Err(Error::Config("rule is only supported on linux".into()))
}

#[cfg(not(target_os = "linux"))]
pub fn disable_gro(_device: &str) -> Result<()> {
    Err(Error::Config("rule is only supported on linux".into()))
}
