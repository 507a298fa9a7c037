//! Command-line interface for the Veles client.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;
use crate::error::{Error, Result};

/// Veles - tunnel LAN hosts through an encrypted TCP or FakeTCP channel
#[derive(Parser, Debug)]
#[command(
    name = "veles",
    author,
    version,
    about = "Raw-capture packet tunnel client",
    long_about = r#"
Veles captures the traffic of designated source hosts at the link layer,
tunnels it through an encrypted channel to a remote server, and injects the
replies back onto the LAN. The channel can be a kernel TCP connection or a
FakeTCP flow synthesized at the capture layer, optionally carrying a KCP
session for loss recovery.

QUICK START:
  veles --list-devices
  veles -r 10.0.0.2 -s server.example.net:4433 --mode tcp
  veles -c config.json
"#
)]
pub struct Cli {
    /// List all valid capture devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Devices for listening (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub listen_devices: Vec<String>,

    /// Device for routing upstream to
    #[arg(long)]
    pub upstream_device: Option<String>,

    /// Gateway address
    #[arg(long)]
    pub gateway: Option<String>,

    /// Mode: faketcp or tcp
    #[arg(long)]
    pub mode: Option<String>,

    /// Method of encryption
    #[arg(long)]
    pub method: Option<String>,

    /// Password of encryption
    #[arg(long)]
    pub password: Option<String>,

    /// Add firewall rule and disable GRO / IP forwarding
    #[arg(long)]
    pub rule: bool,

    /// Print verbose messages
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Log file
    #[arg(long)]
    pub log: Option<String>,

    /// Port for monitoring; 0 disables
    #[arg(long)]
    pub monitor: Option<u16>,

    /// Egress IP MTU cap for FakeTCP; 0 means maximum
    #[arg(long)]
    pub mtu: Option<usize>,

    /// Enable the KCP carrier
    #[arg(long)]
    pub kcp: bool,

    /// KCP tuning option mtu
    #[arg(long = "kcp-mtu")]
    pub kcp_mtu: Option<usize>,

    /// KCP tuning option sndwnd
    #[arg(long = "kcp-sndwnd")]
    pub kcp_sndwnd: Option<u16>,

    /// KCP tuning option rcvwnd
    #[arg(long = "kcp-rcvwnd")]
    pub kcp_rcvwnd: Option<u16>,

    /// KCP tuning option datashard
    #[arg(long = "kcp-datashard")]
    pub kcp_datashard: Option<u32>,

    /// KCP tuning option parityshard
    #[arg(long = "kcp-parityshard")]
    pub kcp_parityshard: Option<u32>,

    /// KCP tuning option acknodelay
    #[arg(long = "kcp-acknodelay")]
    pub kcp_acknodelay: bool,

    /// KCP tuning option nodelay
    #[arg(long = "kcp-nodelay")]
    pub kcp_nodelay: bool,

    /// KCP tuning option interval
    #[arg(long = "kcp-interval")]
    pub kcp_interval: Option<i32>,

    /// KCP tuning option resend
    #[arg(long = "kcp-resend")]
    pub kcp_resend: Option<i32>,

    /// KCP tuning option nc
    #[arg(long = "kcp-nc")]
    pub kcp_nc: Option<i32>,

    /// ARP publishing address
    #[arg(long)]
    pub publish: Option<String>,

    /// Local port for routing upstream; 0 randomizes
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Source addresses whose traffic is tunneled (comma separated)
    #[arg(short = 'r', long = "sources", value_delimiter = ',')]
    pub sources: Vec<String>,

    /// Server address as host:port
    #[arg(short = 's', long)]
    pub server: Option<String>,

    /// DNS rewrite rule as hostname=ipv4 (repeatable)
    #[arg(long = "rewrite")]
    pub rewrite: Vec<String>,
}

impl Cli {
    /// Overlay command-line flags onto a configuration.
    pub fn merge_into(&self, config: &mut Config) -> Result<()> {
        if !self.listen_devices.is_empty() {
            config.listen_devices = self.listen_devices.clone();
        }
        if let Some(ref dev) = self.upstream_device {
            config.upstream_device = dev.clone();
        }
        if let Some(ref gateway) = self.gateway {
            config.gateway = gateway.clone();
        }
        if let Some(ref mode) = self.mode {
            config.mode = mode.clone();
        }
        if let Some(ref method) = self.method {
            config.method = method.clone();
        }
        if let Some(ref password) = self.password {
            config.password = password.clone();
        }
        if self.rule {
            config.rule = true;
        }
        if self.verbose {
            config.verbose = true;
        }
        if let Some(ref log) = self.log {
            config.log = log.clone();
        }
        if let Some(monitor) = self.monitor {
            config.monitor = monitor;
        }
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if self.kcp {
            config.kcp = true;
        }
        if let Some(mtu) = self.kcp_mtu {
            config.kcp_tuning.mtu = mtu;
        }
        if let Some(wnd) = self.kcp_sndwnd {
            config.kcp_tuning.sndwnd = wnd;
        }
        if let Some(wnd) = self.kcp_rcvwnd {
            config.kcp_tuning.rcvwnd = wnd;
        }
        if let Some(shard) = self.kcp_datashard {
            config.kcp_tuning.datashard = shard;
        }
        if let Some(shard) = self.kcp_parityshard {
            config.kcp_tuning.parityshard = shard;
        }
        if self.kcp_acknodelay {
            config.kcp_tuning.acknodelay = true;
        }
        if self.kcp_nodelay {
            config.kcp_tuning.nodelay = true;
        }
        if let Some(interval) = self.kcp_interval {
            config.kcp_tuning.interval = interval;
        }
        if let Some(resend) = self.kcp_resend {
            config.kcp_tuning.resend = resend;
        }
        if let Some(nc) = self.kcp_nc {
            config.kcp_tuning.nc = nc;
        }
        if let Some(ref publish) = self.publish {
            config.publish = publish.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.sources.is_empty() {
            config.sources = self.sources.clone();
        }
        if let Some(ref server) = self.server {
            config.server = server.clone();
        }

        for rule in &self.rewrite {
            let (name, ip) = rule
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid rewrite rule {rule}")))?;
            let ip: Ipv4Addr = ip
                .parse()
                .map_err(|_| Error::Config(format!("invalid rewrite address in {rule}")))?;
            config.rewrite.insert(name.to_string(), ip);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overlays_config() {
        let cli = Cli::parse_from([
            "veles",
            "-r",
            "10.0.0.2,10.0.0.3",
            "-s",
            "203.0.113.9:4433",
            "--mode",
            "tcp",
            "--monitor",
            "8080",
            "--rewrite",
            "api.example.com=192.168.123.164",
        ]);

        let mut config = Config::default();
        cli.merge_into(&mut config).unwrap();

        assert_eq!(config.sources, vec!["10.0.0.2", "10.0.0.3"]);
        assert_eq!(config.server, "203.0.113.9:4433");
        assert_eq!(config.mode, "tcp");
        assert_eq!(config.monitor, 8080);
        assert_eq!(
            config.rewrite["api.example.com"],
            Ipv4Addr::new(192, 168, 123, 164)
        );
    }

    #[test]
    fn test_merge_keeps_file_values() {
        let cli = Cli::parse_from(["veles"]);

        let mut config = Config {
            mode: "tcp".into(),
            monitor: 9000,
            ..Default::default()
        };
        cli.merge_into(&mut config).unwrap();

        assert_eq!(config.mode, "tcp");
        assert_eq!(config.monitor, 9000);
    }

    #[test]
    fn test_bad_rewrite_rule() {
        let cli = Cli::parse_from(["veles", "--rewrite", "api.example.com"]);
        let mut config = Config::default();
        assert!(cli.merge_into(&mut config).is_err());
    }
}
