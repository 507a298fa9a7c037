//! Veles client binary.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tracing::{error, info, warn};

use veles::capture;
use veles::cli::Cli;
use veles::config::{self, Config, Mode};
use veles::crypto::Method;
use veles::error::Result;
use veles::metrics::{DnsLog, LivenessState, StatusServer, StatusState, TrafficMonitor};
use veles::probe::Prober;
use veles::rule;
use veles::tunnel::Tunnel;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load the config file; bare invocations pick up ./config.json the way
    // deployments expect.
    let mut loaded_from = None;
    let mut config = if let Some(ref path) = cli.config {
        loaded_from = Some(path.display().to_string());
        Config::load(path)?
    } else if std::env::args().len() <= 1 && Path::new("config.json").exists() {
        loaded_from = Some("config.json".to_string());
        Config::load("config.json")?
    } else {
        Config::default()
    };
    cli.merge_into(&mut config)?;

    config::init_logging(config.verbose, &config.log)?;
    info!("{} {}", veles::NAME, veles::VERSION);
    if let Some(path) = loaded_from {
        info!(path = %path, "Load configuration");
    }
    if !config.log.is_empty() {
        info!(file = %config.log, "Save log to file");
    }

    if cli.list_devices {
        info!("Available devices are listed below, use --listen-devices or --upstream-device to designate device:");
        for device in capture::list_devices()? {
            info!("  {device}");
        }
        return Ok(());
    }

    if !running_as_root() {
        info!("You are running veles as non-root, if it does not work, grant it raw capture rights:");
        info!("  sudo setcap cap_net_raw+ep $(which veles)");
    }

    let settings = config.build_settings()?;

    if let Some(publish) = settings.publish {
        info!(ip = %publish, "Publish");
    }
    match settings.mode {
        Mode::FakeTcp => {
            info!("Use FakeTCP");
            if settings.mtu != veles::MAX_MTU {
                info!(mtu = settings.mtu, "Set MTU");
            }
            if settings.kcp {
                info!("Enable KCP");
            }
        }
        Mode::Tcp => info!("Use standard TCP"),
    }
    if settings.cipher.method() != Method::Plain {
        info!(method = %settings.cipher.method(), "Encrypt");
    }
    for source in &settings.sources {
        info!(
            source = %source,
            port = settings.port,
            server = %settings.server,
            "Proxy"
        );
    }

    if settings.rule {
        install_rules(&settings);
    }

    // Shared state read by the status endpoint.
    let closed = Arc::new(AtomicBool::new(false));
    let dns_log = Arc::new(DnsLog::new());
    let liveness = Arc::new(LivenessState::new());
    let monitor = (settings.monitor != 0).then(|| Arc::new(TrafficMonitor::new()));

    let mut status_server = None;
    if let Some(ref monitor) = monitor {
        let server = Arc::new(StatusServer::new(
            settings.monitor,
            StatusState {
                monitor: Arc::clone(monitor),
                dns_log: Arc::clone(&dns_log),
                liveness: Arc::clone(&liveness),
                started_at: Instant::now(),
            },
        ));
        tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                if let Err(e) = server.start().await {
                    error!(error = %e, "Monitor");
                }
            }
        });
        status_server = Some(server);
        info!(port = settings.monitor, "Monitor on");

        // Liveness probing rides along with the monitor.
        match Prober::new(
            *settings.server.ip(),
            Arc::clone(&liveness),
            Arc::clone(&closed),
        ) {
            Ok(prober) => {
                tokio::task::spawn_blocking(move || prober.run());
            }
            Err(e) => warn!(error = %e, "Ping disabled"),
        }
    }

    let tunnel = Arc::new(Tunnel::new(
        settings,
        monitor,
        dns_log,
        Arc::clone(&closed),
    ));

    // Orderly shutdown on SIGINT/SIGTERM.
    let signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    let signal_task = tokio::spawn({
        let tunnel = Arc::clone(&tunnel);
        async move {
            let mut signals = signals.fuse();
            if let Some(signal) = signals.next().await {
                info!(signal, "Received signal, shutting down");
                tunnel.close();
            }
        }
    });

    let result = tunnel.run().await;

    if let Some(server) = status_server {
        server.stop();
    }
    signals_handle.close();
    let _ = signal_task.await;

    result
}

/// Apply the host-level side effects behind `rule`; each failure is logged
/// and tolerated.
fn install_rules(settings: &veles::config::Settings) {
    match rule::disable_ip_forwarding() {
        Ok(()) => info!("Disable IP forwarding"),
        Err(e) => error!(error = %e, "Disable IP forwarding"),
    }

    if settings.mode == Mode::FakeTcp {
        match rule::add_firewall_rule(settings.server) {
            Ok(()) => info!("Add firewall rule"),
            Err(e) => error!(error = %e, "Add firewall rule"),
        }
    }

    // GRO coalesces captured frames past the MTU; turn it off on every
    // device the client touches.
    let mut devices: Vec<String> = settings.listen_devices.clone();
    if devices.is_empty() {
        match capture::find_listen_devices(&[]) {
            Ok(all) => devices.extend(all.into_iter().filter(|d| !d.is_loopback).map(|d| d.name)),
            Err(e) => error!(error = %e, "Find listen devices"),
        }
    }
    match capture::find_upstream_device(settings.upstream_device.as_deref()) {
        Ok(upstream) => devices.push(upstream.name),
        Err(e) => error!(error = %e, "Find upstream device"),
    }
    devices.sort();
    devices.dedup();

    let mut ok = true;
    for device in &devices {
        if let Err(e) = rule::disable_gro(device) {
            error!(device = %device, error = %e, "Disable GRO");
            ok = false;
        }
    }
    if ok && !devices.is_empty() {
        info!("Disable GRO");
    }
}

#[cfg(target_os = "linux")]
fn running_as_root() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("Uid:"))
                .and_then(|line| line.split_whitespace().nth(1).map(|uid| uid == "0"))
        })
        .unwrap_or(true)
}

#[cfg(not(target_os = "linux"))]
fn running_as_root() -> bool {
    true
}
