//! Configuration for the Veles client.
//!
//! Configuration files are JSON with two conveniences carried over from the
//! original deployment format: lines whose first non-blank character is `#`
//! are comments, and `$VAR` / `${VAR}` references expand from the
//! environment before parsing.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::MAX_MTU;

/// Tunnel carrier mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    FakeTcp,
    Tcp,
}

impl std::str::FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "faketcp" => Ok(Mode::FakeTcp),
            "tcp" => Ok(Mode::Tcp),
            other => Err(Error::Config(format!("mode {other} not supported"))),
        }
    }
}

/// KCP tuning options, mirrored from the server's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KcpConfig {
    pub mtu: usize,
    pub sndwnd: u16,
    pub rcvwnd: u16,
    pub datashard: u32,
    pub parityshard: u32,
    pub acknodelay: bool,
    pub nodelay: bool,
    pub interval: i32,
    pub resend: i32,
    pub nc: i32,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            sndwnd: 32,
            rcvwnd: 128,
            datashard: 10,
            parityshard: 3,
            acknodelay: false,
            nodelay: false,
            interval: 100,
            resend: 0,
            nc: 0,
        }
    }
}

/// Raw configuration as read from the file or assembled from flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub listen_devices: Vec<String>,
    pub upstream_device: String,
    pub gateway: String,
    pub mode: String,
    pub method: String,
    pub password: String,
    pub rule: bool,
    pub verbose: bool,
    pub log: String,
    pub monitor: u16,
    pub mtu: usize,
    pub kcp: bool,
    pub kcp_tuning: KcpConfig,
    pub publish: String,
    pub port: u16,
    pub sources: Vec<String>,
    pub server: String,
    pub rewrite: HashMap<String, Ipv4Addr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_devices: Vec::new(),
            upstream_device: String::new(),
            gateway: String::new(),
            mode: "faketcp".into(),
            method: "plain".into(),
            password: String::new(),
            rule: false,
            verbose: false,
            log: String::new(),
            monitor: 0,
            mtu: 0,
            kcp: false,
            kcp_tuning: KcpConfig::default(),
            publish: String::new(),
            port: 0,
            sources: Vec::new(),
            server: String::new(),
            rewrite: HashMap::new(),
        }
    }
}

impl Config {
    /// Load a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("read config: {e}")))?;
        if content.is_empty() {
            return Err(Error::Config("empty config file".into()));
        }

        let trimmed = trim_comments(&content);
        let expanded = expand_env(&trimmed, |name| std::env::var(name).ok());

        serde_json::from_str(&expanded).map_err(|e| Error::Config(format!("parse config: {e}")))
    }

    /// Validate and resolve into typed settings.
    pub fn build_settings(&self) -> Result<Settings> {
        if self.sources.is_empty() {
            return Err(Error::Config("no sources given".into()));
        }
        let mut sources = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let ip: IpAddr = source
                .parse()
                .map_err(|_| Error::Config(format!("invalid source {source}")))?;
            sources.push(ip);
        }

        if self.server.is_empty() {
            return Err(Error::Config("no server given".into()));
        }
        let server = resolve_server(&self.server)?;

        let gateway = if self.gateway.is_empty() {
            None
        } else {
            Some(
                self.gateway
                    .parse::<Ipv4Addr>()
                    .map_err(|_| Error::Config(format!("invalid gateway {}", self.gateway)))?,
            )
        };

        let publish = if self.publish.is_empty() {
            None
        } else {
            Some(
                self.publish
                    .parse::<Ipv4Addr>()
                    .map_err(|_| Error::Config(format!("invalid publish {}", self.publish)))?,
            )
        };

        let mode: Mode = self.mode.parse()?;
        let cipher = Cipher::parse(&self.method, &self.password)?;

        let mtu = match self.mtu {
            0 => MAX_MTU,
            mtu if (576..=MAX_MTU).contains(&mtu) => mtu,
            mtu => return Err(Error::Config(format!("mtu {mtu} out of range"))),
        };

        let tuning = &self.kcp_tuning;
        if !(50..=1500).contains(&tuning.mtu) {
            return Err(Error::Config(format!("kcp mtu {} out of range", tuning.mtu)));
        }
        if tuning.sndwnd == 0 {
            return Err(Error::Config("kcp send window out of range".into()));
        }
        if tuning.rcvwnd == 0 {
            return Err(Error::Config("kcp receive window out of range".into()));
        }
        if tuning.interval < 0 {
            return Err(Error::Config(format!(
                "kcp interval {} out of range",
                tuning.interval
            )));
        }
        if tuning.resend < 0 {
            return Err(Error::Config(format!(
                "kcp resend {} out of range",
                tuning.resend
            )));
        }
        if tuning.nc < 0 {
            return Err(Error::Config(format!("kcp nc {} out of range", tuning.nc)));
        }

        if self.port != 0 && self.monitor != 0 && self.port == self.monitor {
            return Err(Error::Config(
                "upstream port and monitor port are the same".into(),
            ));
        }
        let port = if self.port == 0 {
            randomize_port(self.monitor)
        } else {
            self.port
        };

        Ok(Settings {
            listen_devices: self.listen_devices.clone(),
            upstream_device: if self.upstream_device.is_empty() {
                None
            } else {
                Some(self.upstream_device.clone())
            },
            gateway,
            mode,
            cipher,
            rule: self.rule,
            monitor: self.monitor,
            mtu,
            kcp: self.kcp,
            kcp_tuning: self.kcp_tuning.clone(),
            publish,
            port,
            sources,
            server,
            rewrite: self.rewrite.clone(),
        })
    }
}

/// Validated, typed settings the tunnel runs with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_devices: Vec<String>,
    pub upstream_device: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub mode: Mode,
    pub cipher: Cipher,
    pub rule: bool,
    pub monitor: u16,
    pub mtu: usize,
    pub kcp: bool,
    pub kcp_tuning: KcpConfig,
    pub publish: Option<Ipv4Addr>,
    pub port: u16,
    pub sources: Vec<IpAddr>,
    pub server: SocketAddrV4,
    pub rewrite: HashMap<String, Ipv4Addr>,
}

/// Resolve `host:port` to an IPv4 endpoint.
fn resolve_server(server: &str) -> Result<SocketAddrV4> {
    let addrs = server
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("invalid server {server}: {e}")))?;

    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            if v4.port() == 0 {
                return Err(Error::Config(format!("server port 0 in {server}")));
            }
            return Ok(v4);
        }
    }
    Err(Error::Config(format!("server {server} has no IPv4 address")))
}

/// Pick a random upstream port in the dynamic range, distinct from the
/// monitor port.
fn randomize_port(monitor: u16) -> u16 {
    let mut rng = rand::thread_rng();
    loop {
        let port: u16 = rng.gen_range(49152..=65535);
        if port != monitor {
            return port;
        }
    }
}

/// Strip carriage returns and `#`-comment lines.
fn trim_comments(content: &str) -> String {
    let content = content.replace('\r', "");
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Expand `$VAR` and `${VAR}` references.
fn expand_env<F: Fn(&str) -> Option<String>>(content: &str, lookup: F) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&(_, c)) = chars.peek() {
            let part_of_name = if braced {
                c != '}'
            } else {
                c.is_ascii_alphanumeric() || c == '_'
            };
            if !part_of_name {
                break;
            }
            name.push(c);
            chars.next();
        }
        if braced {
            chars.next(); // closing brace
        }

        if name.is_empty() {
            out.push('$');
            continue;
        }
        if let Some(value) = lookup(&name) {
            out.push_str(&value);
        }
    }

    out
}

/// Initialize tracing to stdout and optionally to a log file.
pub fn init_logging(verbose: bool, log_file: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());

    if log_file.is_empty() {
        registry
            .try_init()
            .map_err(|e| Error::Config(format!("init logging: {e}")))?;
    } else {
        let file = std::fs::File::create(log_file)
            .map_err(|e| Error::Config(format!("log {log_file}: {e}")))?;
        registry
            .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
            .try_init()
            .map_err(|e| Error::Config(format!("init logging: {e}")))?;
    }

    Ok(())
}
