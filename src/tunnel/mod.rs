//! The capture → tunnel → reinject pipeline.
//!
//! One reader task per listen device feeds captured frames into a bounded
//! queue. A single outbound worker drains it: ARP requests go to the
//! publisher, everything else updates the NAT table, loses its link layer,
//! and rides the transport. A single inbound worker reads delivered
//! datagrams, finds their NAT entry, applies the DNS rewrite when one
//! matches, rebuilds link-layer framing, and injects.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::capture::{self, Gateway, RawConn};
use crate::config::{Mode, Settings};
use crate::error::{Error, Result};
use crate::metrics::{Direction, DnsLog, TrafficMonitor};
use crate::nat::NatTable;
use crate::packet::dns::DnsMessage;
use crate::packet::{
    build_arp_reply, build_ethernet_frame, build_loopback_frame, rewrite_transport_payload,
    HardwareAddr, LinkType, PacketIndicator, ETHERTYPE_IPV4, ETHERTYPE_IPV6,
};
use crate::transport::{FakeTcpTransport, KcpTransport, TcpTransport, Transport};

/// The running tunnel client.
pub struct Tunnel {
    settings: Settings,
    nat: Arc<NatTable<Arc<RawConn>>>,
    monitor: Option<Arc<TrafficMonitor>>,
    dns_log: Arc<DnsLog>,
    closed: Arc<AtomicBool>,
    transport: Mutex<Option<Arc<Transport>>>,
    upstream_mac: Mutex<HardwareAddr>,
}

impl Tunnel {
    pub fn new(
        settings: Settings,
        monitor: Option<Arc<TrafficMonitor>>,
        dns_log: Arc<DnsLog>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            nat: Arc::new(NatTable::new()),
            monitor,
            dns_log,
            closed,
            transport: Mutex::new(None),
            upstream_mac: Mutex::new(HardwareAddr::ZERO),
        }
    }

    /// Open capture handles and the transport, then run the pipeline until
    /// shutdown or a fatal transport error.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        let conns = tokio::task::spawn_blocking(move || this.open())
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("open task: {e}")))??;

        let (queue_tx, queue_rx) = mpsc::channel::<(Vec<u8>, Arc<RawConn>)>(crate::QUEUE_CAPACITY);

        // Capture fan-in, one blocking reader per device.
        for conn in &conns {
            let conn = Arc::clone(conn);
            let tx = queue_tx.clone();
            let closed = Arc::clone(&self.closed);
            tokio::task::spawn_blocking(move || capture_loop(&conn, &tx, &closed));
        }
        drop(queue_tx);

        // Sole consumer of the queue, sole writer to the transport.
        let outbound = {
            let this = Arc::clone(self);
            tokio::task::spawn_blocking(move || this.outbound_loop(queue_rx))
        };

        // Sole reader of the transport.
        let inbound = {
            let this = Arc::clone(self);
            tokio::task::spawn_blocking(move || this.inbound_loop())
        };

        let result = inbound
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("inbound task: {e}")))?;

        // Shutdown or fatal error either way: release everything and let
        // the remaining workers observe the flag.
        self.close();
        let _ = outbound.await;

        result
    }

    /// Set the closed flag and shut the transport; capture readers unblock
    /// through their read timeout. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.transport.lock().as_ref() {
            transport.close();
        }
        info!("Tunnel closed");
    }

    /// Resolve devices, open filtered capture handles, dial the transport.
    fn open(&self) -> Result<Vec<Arc<RawConn>>> {
        let settings = &self.settings;

        let mut listen_devices = capture::find_listen_devices(&settings.listen_devices)?;
        if settings.listen_devices.is_empty() {
            listen_devices.retain(|d| !d.is_loopback);
        }
        if listen_devices.is_empty() {
            return Err(Error::Config("cannot determine listen device".into()));
        }

        let upstream = capture::find_upstream_device(settings.upstream_device.as_deref())?;
        let gateway = if upstream.is_loopback {
            Gateway {
                ip: upstream.ipv4().unwrap_or(Ipv4Addr::LOCALHOST),
                hardware_addr: HardwareAddr::ZERO,
            }
        } else {
            capture::find_gateway(&upstream, settings.gateway)?
        };
        *self.upstream_mac.lock() = upstream.hardware_addr.unwrap_or(HardwareAddr::ZERO);

        for device in &listen_devices {
            info!(device = %device, "Listen on");
        }
        if upstream.is_loopback {
            info!(device = %upstream, "Route upstream in");
        } else {
            info!(device = %upstream, gateway = %gateway.ip, "Route upstream from");
        }

        let filter = listen_filter(&settings.sources, settings.server, settings.publish);
        debug!(filter = %filter, "Using capture filter");

        let mut conns = Vec::with_capacity(listen_devices.len());
        for device in &listen_devices {
            conns.push(Arc::new(RawConn::open(device, &filter)?));
        }

        let cipher = settings.cipher.clone();
        let transport = match settings.mode {
            Mode::Tcp => {
                Transport::Tcp(TcpTransport::connect(settings.port, settings.server, cipher)?)
            }
            Mode::FakeTcp if settings.kcp => Transport::FakeTcpKcp(KcpTransport::connect(
                &upstream,
                gateway,
                settings.port,
                settings.server,
                cipher,
                settings.mtu,
                &settings.kcp_tuning,
            )?),
            Mode::FakeTcp => Transport::FakeTcp(FakeTcpTransport::connect(
                &upstream,
                gateway,
                settings.port,
                settings.server,
                cipher,
                settings.mtu,
                false,
            )?),
        };

        info!(
            local = %transport.local_addr(),
            server = %transport.remote_addr(),
            "Tunnel established"
        );
        *self.transport.lock() = Some(Arc::new(transport));

        Ok(conns)
    }

    fn transport(&self) -> Result<Arc<Transport>> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| Error::Config("transport not open".into()))
    }

    fn outbound_loop(&self, mut queue: mpsc::Receiver<(Vec<u8>, Arc<RawConn>)>) {
        while let Some((frame, conn)) = queue.blocking_recv() {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.handle_outbound(&frame, &conn) {
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                error!(device = %conn.device().name, error = %e, "Handle listen");
            }
        }
    }

    fn inbound_loop(&self) -> Result<()> {
        let transport = self.transport()?;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let datagram = match transport.read_frame() {
                Ok(datagram) => datagram,
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    if e.is_eof() {
                        error!(
                            server = %transport.remote_addr(),
                            "Connection to server is closed, is the server or your network down?"
                        );
                        return Err(e);
                    }
                    // Undecryptable or malformed frames die here, alone.
                    error!(error = %e, "Read upstream");
                    continue;
                }
            };

            if let Err(e) = self.handle_inbound(&datagram) {
                error!(error = %e, "Handle upstream");
            }
        }
    }

    /// One captured frame: ARP to the publisher, everything else into the
    /// tunnel.
    fn handle_outbound(&self, frame: &[u8], conn: &Arc<RawConn>) -> Result<()> {
        let indicator = PacketIndicator::parse_frame(frame, conn.link_type())?;

        if indicator.is_arp() {
            return self.publish(&indicator, conn);
        }

        let hardware_addr = indicator
            .src_hardware_addr()
            .unwrap_or(HardwareAddr::ZERO);

        // The entry must be visible before the frame leaves: a fast reply
        // must never race an invisible NAT entry.
        self.nat
            .upsert(indicator.src_ip(), hardware_addr, Arc::clone(conn));

        self.transport()?.write_frame(indicator.network_bytes())?;

        if let Some(monitor) = &self.monitor {
            monitor.add(
                &indicator.src_ip().to_string(),
                &indicator.dst_ip().to_string(),
                Direction::Out,
                indicator.wire_size(),
            );
        }

        debug!(
            src = %indicator.src(),
            dst = %indicator.dst(),
            size = indicator.wire_size(),
            "Redirect an outbound packet"
        );
        Ok(())
    }

    /// Answer an ARP who-has for the published address with the upstream
    /// interface's hardware address, then rebuild the FakeTCP flow so its
    /// cached link-layer state reflects the changed topology.
    fn publish(&self, indicator: &PacketIndicator<'_>, conn: &Arc<RawConn>) -> Result<()> {
        let arp = indicator
            .arp()
            .ok_or_else(|| Error::Parse("not an ARP packet".into()))?;
        if !arp.is_request() {
            return Ok(());
        }

        let Some(publish) = self.settings.publish else {
            return Ok(());
        };
        if arp.target_protocol != publish {
            return Ok(());
        }

        let reply = build_arp_reply(&arp, *self.upstream_mac.lock());
        conn.write_frame(&reply)?;

        let transport = self.transport()?;
        if transport.is_faketcp() {
            transport.reconnect()?;
        }

        info!(
            ip = %arp.sender_protocol,
            hardware_addr = %arp.sender_hardware,
            "Device joined the network"
        );
        Ok(())
    }

    /// One delivered inner datagram: NAT lookup, optional DNS rewrite,
    /// link-layer rebuild, injection.
    fn handle_inbound(&self, datagram: &[u8]) -> Result<()> {
        if datagram.is_empty() {
            return Ok(());
        }

        let indicator = PacketIndicator::parse_datagram(datagram)?;
        let dst_ip = indicator.dst_ip();

        let entry = self.nat.lookup(dst_ip).ok_or(Error::NatMiss(dst_ip))?;

        let frame = build_inbound_frame(
            datagram,
            entry.handle.link_type(),
            entry.handle.local_hardware_addr(),
            entry.hardware_addr,
            &self.settings.rewrite,
            &self.dns_log,
        )?;
        entry.handle.write_frame(&frame)?;

        if let Some(monitor) = &self.monitor {
            monitor.add(
                &dst_ip.to_string(),
                &indicator.src_ip().to_string(),
                Direction::In,
                indicator.wire_size(),
            );
        }

        debug!(
            dst = %indicator.dst(),
            src = %indicator.src(),
            size = indicator.wire_size(),
            "Redirect an inbound packet"
        );
        Ok(())
    }
}

/// Blocking capture loop: read frames, push them onto the queue. Producers
/// block when the queue is full.
fn capture_loop(
    conn: &Arc<RawConn>,
    queue: &mpsc::Sender<(Vec<u8>, Arc<RawConn>)>,
    closed: &AtomicBool,
) {
    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }
        match conn.read_frame() {
            Ok(Some(frame)) => {
                if queue.blocking_send((frame, Arc::clone(conn))).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                error!(device = %conn.device().name, error = %e, "Read listen device");
            }
        }
    }
}

/// The BPF filter installed on every listen device.
///
/// Captures TCP/UDP from the sources except traffic already heading to the
/// server, ICMP and IP fragments from the sources, and, when publishing,
/// ARP who-has requests for the published address.
pub(crate) fn listen_filter(
    sources: &[IpAddr],
    server: SocketAddrV4,
    publish: Option<Ipv4Addr>,
) -> String {
    let sources = sources
        .iter()
        .map(|ip| format!("src host {ip}"))
        .collect::<Vec<_>>()
        .join(" || ");

    let mut filter = format!(
        "ip && (((tcp || udp) && ({sources}) && not (src host {server_ip} && src port {server_port})) || \
         ((icmp || (ip[6:2] & 0x1fff) != 0) && ({sources}) && not src host {server_ip}))",
        server_ip = server.ip(),
        server_port = server.port(),
    );

    if let Some(publish) = publish {
        filter.push_str(&format!(" || (arp[6:2] = 1 && dst host {publish})"));
    }

    filter
}

/// Build the frame to inject for one delivered datagram.
///
/// DNS responses are recorded in the log; when the first answer's name has a
/// rewrite rule, every A record is overwritten and the datagram rebuilt with
/// fresh checksums.
pub(crate) fn build_inbound_frame(
    datagram: &[u8],
    link_type: LinkType,
    local_mac: HardwareAddr,
    dst_mac: HardwareAddr,
    rewrite: &HashMap<String, Ipv4Addr>,
    dns_log: &DnsLog,
) -> Result<Vec<u8>> {
    let indicator = PacketIndicator::parse_datagram(datagram)?;

    let mut rewritten: Option<Vec<u8>> = None;
    if let Some(dns_bytes) = indicator.dns_payload() {
        if let Ok(mut message) = DnsMessage::parse(dns_bytes) {
            if message.is_response() {
                let (name, ips) = message.answers();
                if !name.is_empty() {
                    for ip in &ips {
                        dns_log.record(IpAddr::V4(*ip), &name);
                    }

                    // A records are IPv4; IPv6-carried responses pass through.
                    if matches!(indicator.src_ip(), IpAddr::V4(_)) {
                        if let Some(replacement) = lookup_rewrite(rewrite, &name) {
                            debug!(name = %name, to = %replacement, "Forge DNS answers");
                            message.overwrite_a_records(replacement);
                            rewritten =
                                Some(rewrite_transport_payload(datagram, &message.serialize())?);
                        }
                    }
                }
            }
        }
    }

    let datagram = rewritten.as_deref().unwrap_or(datagram);
    let is_v6 = matches!(indicator.src_ip(), IpAddr::V6(_));

    Ok(match link_type {
        LinkType::Loopback => build_loopback_frame(is_v6, datagram),
        LinkType::Ethernet => {
            let ethertype = if is_v6 { ETHERTYPE_IPV6 } else { ETHERTYPE_IPV4 };
            build_ethernet_frame(local_mac, dst_mac, ethertype, datagram)
        }
    })
}

/// Case-insensitive rewrite lookup; DNS names compare without case.
fn lookup_rewrite(rewrite: &HashMap<String, Ipv4Addr>, name: &str) -> Option<Ipv4Addr> {
    rewrite
        .iter()
        .find(|(host, _)| host.eq_ignore_ascii_case(name))
        .map(|(_, ip)| *ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::testutil::{build_ipv4_tcp, build_ipv4_udp};
    use crate::packet::{checksum, pseudo_header_checksum, LinkLayer};

    #[test]
    fn test_listen_filter_single_source() {
        let filter = listen_filter(
            &["10.0.0.2".parse().unwrap()],
            "203.0.113.9:4433".parse().unwrap(),
            None,
        );

        assert_eq!(
            filter,
            "ip && (((tcp || udp) && (src host 10.0.0.2) && \
             not (src host 203.0.113.9 && src port 4433)) || \
             ((icmp || (ip[6:2] & 0x1fff) != 0) && (src host 10.0.0.2) && \
             not src host 203.0.113.9))"
        );
    }

    #[test]
    fn test_listen_filter_publish_clause() {
        let filter = listen_filter(
            &["10.0.0.2".parse().unwrap(), "10.0.0.3".parse().unwrap()],
            "203.0.113.9:4433".parse().unwrap(),
            Some("10.0.0.1".parse().unwrap()),
        );

        assert!(filter.contains("src host 10.0.0.2 || src host 10.0.0.3"));
        assert!(filter.ends_with("|| (arp[6:2] = 1 && dst host 10.0.0.1)"));
    }

    #[test]
    fn test_build_inbound_frame_ethernet() {
        let datagram = build_ipv4_tcp(
            "8.8.8.8".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            443,
            40000,
            b"Y",
        );
        let local = HardwareAddr([0xcc; 6]);
        let host = HardwareAddr([0xaa; 6]);

        let frame = build_inbound_frame(
            &datagram,
            LinkType::Ethernet,
            local,
            host,
            &HashMap::new(),
            &DnsLog::new(),
        )
        .unwrap();

        let indicator = PacketIndicator::parse_frame(&frame, LinkType::Ethernet).unwrap();
        assert_eq!(
            indicator.link(),
            LinkLayer::Ethernet {
                src: local,
                dst: host,
                ethertype: ETHERTYPE_IPV4
            }
        );
        assert_eq!(indicator.network_bytes(), datagram.as_slice());
    }

    #[test]
    fn test_build_inbound_frame_loopback() {
        let datagram = build_ipv4_tcp(
            "127.0.0.1".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
            443,
            40000,
            b"Y",
        );

        let frame = build_inbound_frame(
            &datagram,
            LinkType::Loopback,
            HardwareAddr::ZERO,
            HardwareAddr::ZERO,
            &HashMap::new(),
            &DnsLog::new(),
        )
        .unwrap();

        let indicator = PacketIndicator::parse_frame(&frame, LinkType::Loopback).unwrap();
        assert_eq!(indicator.network_bytes(), datagram.as_slice());
    }

    #[test]
    fn test_build_inbound_frame_rewrites_dns() {
        let response = crate::packet::dns::sample_response();
        let datagram = build_ipv4_udp(
            "8.8.8.8".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            53,
            40001,
            &response,
        );

        let mut rewrite = HashMap::new();
        let replacement: Ipv4Addr = "192.168.123.164".parse().unwrap();
        rewrite.insert("api.example.com".to_string(), replacement);
        let dns_log = DnsLog::new();

        let frame = build_inbound_frame(
            &datagram,
            LinkType::Ethernet,
            HardwareAddr([0xcc; 6]),
            HardwareAddr([0xaa; 6]),
            &rewrite,
            &dns_log,
        )
        .unwrap();

        let indicator = PacketIndicator::parse_frame(&frame, LinkType::Ethernet).unwrap();
        let message = DnsMessage::parse(indicator.dns_payload().unwrap()).unwrap();
        let (name, ips) = message.answers();
        assert_eq!(name, "api.example.com");
        assert_eq!(ips, vec![replacement; 2]);

        // The rebuilt datagram must carry valid checksums.
        let ip = indicator.network_bytes();
        let header_len = usize::from(ip[0] & 0x0f) * 4;
        assert_eq!(checksum(&ip[..header_len]), 0);
        assert_eq!(
            pseudo_header_checksum(
                "8.8.8.8".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                17,
                &ip[header_len..]
            ),
            0
        );

        // The original addresses land in the record log, not the forged one.
        let pairs = dns_log.snapshot();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.name == "api.example.com"));
    }

    #[test]
    fn test_build_inbound_frame_records_without_rule() {
        let response = crate::packet::dns::sample_response();
        let datagram = build_ipv4_udp(
            "8.8.8.8".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            53,
            40001,
            &response,
        );
        let dns_log = DnsLog::new();

        let frame = build_inbound_frame(
            &datagram,
            LinkType::Ethernet,
            HardwareAddr([0xcc; 6]),
            HardwareAddr([0xaa; 6]),
            &HashMap::new(),
            &dns_log,
        )
        .unwrap();

        // Without a rule the datagram passes through byte-identical.
        let indicator = PacketIndicator::parse_frame(&frame, LinkType::Ethernet).unwrap();
        assert_eq!(indicator.network_bytes(), datagram.as_slice());
        assert_eq!(dns_log.snapshot().len(), 2);
    }

    #[test]
    fn test_lookup_rewrite_ignores_case() {
        let mut rewrite = HashMap::new();
        rewrite.insert("API.Example.Com".to_string(), "192.168.123.164".parse().unwrap());

        assert!(lookup_rewrite(&rewrite, "api.example.com").is_some());
        assert!(lookup_rewrite(&rewrite, "other.example.com").is_none());
    }
}
