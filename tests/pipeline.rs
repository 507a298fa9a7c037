//! End-to-end properties of the capture→tunnel→reinject pipeline that hold
//! without raw capture privileges: framing on the wire, NAT bookkeeping,
//! DNS rewriting with checksum fixup, ARP reply shape, and configuration
//! resolution.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use veles::config::Config;
use veles::crypto::Cipher;
use veles::nat::NatTable;
use veles::packet::dns::DnsMessage;
use veles::packet::{
    build_arp_reply, build_ethernet_frame, checksum, pseudo_header_checksum,
    rewrite_transport_payload, ArpView, HardwareAddr, LinkType, PacketIndicator, ETHERTYPE_ARP,
    ETHERTYPE_IPV4,
};
use veles::transport::TcpTransport;

/// Minimal IPv4+TCP datagram with valid checksums.
fn ipv4_tcp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut tcp = Vec::new();
    tcp.extend_from_slice(&sport.to_be_bytes());
    tcp.extend_from_slice(&dport.to_be_bytes());
    tcp.extend_from_slice(&1u32.to_be_bytes());
    tcp.extend_from_slice(&0u32.to_be_bytes());
    tcp.extend_from_slice(&[0x50, 0x18]); // offset 5, PSH|ACK
    tcp.extend_from_slice(&0xffffu16.to_be_bytes());
    tcp.extend_from_slice(&[0, 0, 0, 0]);
    tcp.extend_from_slice(payload);
    let sum = pseudo_header_checksum(src, dst, 6, &tcp);
    tcp[16..18].copy_from_slice(&sum.to_be_bytes());

    let mut ip = vec![0x45, 0x00, 0x00, 0x00, 0x00, 0x01, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00];
    let total = (20 + tcp.len()) as u16;
    ip[2..4].copy_from_slice(&total.to_be_bytes());
    ip.extend_from_slice(&src.octets());
    ip.extend_from_slice(&dst.octets());
    let ip_sum = checksum(&ip);
    ip[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    ip.extend_from_slice(&tcp);
    ip
}

/// Minimal IPv4+UDP datagram with valid checksums.
fn ipv4_udp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut udp = Vec::new();
    udp.extend_from_slice(&sport.to_be_bytes());
    udp.extend_from_slice(&dport.to_be_bytes());
    udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    let sum = pseudo_header_checksum(src, dst, 17, &udp);
    udp[6..8].copy_from_slice(&sum.to_be_bytes());

    let mut ip = vec![0x45, 0x00, 0x00, 0x00, 0x00, 0x02, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00];
    let total = (20 + udp.len()) as u16;
    ip[2..4].copy_from_slice(&total.to_be_bytes());
    ip.extend_from_slice(&src.octets());
    ip.extend_from_slice(&dst.octets());
    let ip_sum = checksum(&ip);
    ip[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    ip.extend_from_slice(&udp);
    ip
}

/// A DNS A response for one name with one answer.
fn dns_a_response(name_labels: &[&str], answer: Ipv4Addr) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&0x00aau16.to_be_bytes());
    msg.extend_from_slice(&0x8180u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes()); // questions
    msg.extend_from_slice(&1u16.to_be_bytes()); // answers
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());

    for label in name_labels {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&[0, 1, 0, 1]); // A IN

    msg.extend_from_slice(&[0xc0, 0x0c]); // name pointer to the question
    msg.extend_from_slice(&[0, 1, 0, 1]);
    msg.extend_from_slice(&300u32.to_be_bytes());
    msg.extend_from_slice(&4u16.to_be_bytes());
    msg.extend_from_slice(&answer.octets());
    msg
}

// Captured frames reach the transport as `[len16] ++ seal(ip datagram)`,
// in capture order.
#[test]
fn outbound_frames_keep_capture_order_and_framing() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = match listener.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!(),
    };

    let datagrams: Vec<Vec<u8>> = (0..3u8)
        .map(|i| {
            ipv4_tcp(
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(8, 8, 8, 8),
                40000 + u16::from(i),
                443,
                &[b'X', i],
            )
        })
        .collect();

    let expected: Vec<u8> = datagrams
        .iter()
        .flat_map(|d| {
            let mut frame = (d.len() as u16).to_be_bytes().to_vec();
            frame.extend_from_slice(d);
            frame
        })
        .collect();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = vec![0u8; expected.len()];
        stream.read_exact(&mut received).unwrap();
        assert_eq!(received, expected);
    });

    let transport = TcpTransport::connect(0, server_addr, Cipher::plain()).unwrap();
    for (i, datagram) in datagrams.iter().enumerate() {
        // The pipeline strips the link layer through the indicator; mirror
        // that here so what lands on the wire is the parsed view.
        let frame = build_ethernet_frame(
            HardwareAddr([0xaa; 6]),
            HardwareAddr([0xcc; 6]),
            ETHERTYPE_IPV4,
            datagram,
        );
        let indicator = PacketIndicator::parse_frame(&frame, LinkType::Ethernet).unwrap();
        assert_eq!(indicator.transport().unwrap().src_port, 40000 + i as u16);
        transport.write_frame(indicator.network_bytes()).unwrap();
    }

    server.join().unwrap();
    transport.close();
}

// The sealed bytes on the wire are exactly cipher.seal(ip datagram).
#[test]
fn sealed_frame_roundtrip() {
    let cipher = Cipher::parse("chacha20-poly1305", "shared secret").unwrap();
    let datagram = ipv4_tcp(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(8, 8, 8, 8),
        40000,
        443,
        b"X",
    );

    let sealed = cipher.seal(&datagram).unwrap();
    assert_ne!(sealed, datagram);
    assert_eq!(cipher.open(&sealed).unwrap(), datagram);

    // A frame sealed under another password must not open.
    let other = Cipher::parse("chacha20-poly1305", "wrong secret").unwrap();
    assert!(other.open(&sealed).is_err());
}

// NAT: idempotent upsert, replacement on MAC change, miss on unknown IP.
#[test]
fn nat_tracks_last_seen_hardware_addr() {
    let nat: NatTable<&'static str> = NatTable::new();
    let ip = "10.0.0.2".parse().unwrap();

    assert!(nat.upsert(ip, HardwareAddr([0xaa; 6]), "eth0"));
    assert!(!nat.upsert(ip, HardwareAddr([0xaa; 6]), "eth0"));
    assert_eq!(nat.len(), 1);

    // Same IP re-appearing behind a new MAC replaces the entry whole.
    assert!(nat.upsert(ip, HardwareAddr([0xbb; 6]), "eth1"));
    let entry = nat.lookup(ip).unwrap();
    assert_eq!(entry.hardware_addr, HardwareAddr([0xbb; 6]));
    assert_eq!(entry.handle, "eth1");

    // Inbound datagrams without an entry have nowhere to go.
    assert!(nat.lookup("10.0.0.9".parse().unwrap()).is_none());
}

// DNS rewrite: every A answer overwritten, transport checksum valid over
// the new pseudo-header.
#[test]
fn dns_rewrite_produces_valid_checksums() {
    let src = Ipv4Addr::new(8, 8, 8, 8);
    let dst = Ipv4Addr::new(10, 0, 0, 2);
    let response = dns_a_response(&["api", "twitter", "com"], Ipv4Addr::new(104, 244, 42, 1));
    let datagram = ipv4_udp(src, dst, 53, 40001, &response);

    let indicator = PacketIndicator::parse_datagram(&datagram).unwrap();
    let mut message = DnsMessage::parse(indicator.dns_payload().unwrap()).unwrap();
    assert!(message.is_response());

    let (name, ips) = message.answers();
    assert_eq!(name, "api.twitter.com");
    assert_eq!(ips, vec![Ipv4Addr::new(104, 244, 42, 1)]);

    let replacement = Ipv4Addr::new(192, 168, 123, 164);
    message.overwrite_a_records(replacement);
    let rewritten = rewrite_transport_payload(&datagram, &message.serialize()).unwrap();

    // The rewritten datagram parses, carries the forged address, and
    // checksums to zero on verification.
    let indicator = PacketIndicator::parse_datagram(&rewritten).unwrap();
    let reparsed = DnsMessage::parse(indicator.dns_payload().unwrap()).unwrap();
    assert_eq!(reparsed.answers().1, vec![replacement]);

    let header_len = usize::from(rewritten[0] & 0x0f) * 4;
    assert_eq!(checksum(&rewritten[..header_len]), 0);
    assert_eq!(
        pseudo_header_checksum(src, dst, 17, &rewritten[header_len..]),
        0
    );
}

// ARP publish: the reply claims the queried address with the upstream MAC
// and mirrors the requester in the destination fields.
#[test]
fn arp_reply_claims_published_address() {
    let request = ArpView {
        operation: ArpView::OP_REQUEST,
        sender_hardware: HardwareAddr([0xbb; 6]),
        sender_protocol: Ipv4Addr::new(10, 0, 0, 2),
        target_hardware: HardwareAddr::ZERO,
        target_protocol: Ipv4Addr::new(10, 0, 0, 1),
    };
    let upstream_mac = HardwareAddr([0xcc; 6]);

    let reply = build_arp_reply(&request, upstream_mac);
    let indicator = PacketIndicator::parse_frame(&reply, LinkType::Ethernet).unwrap();

    match indicator.link() {
        veles::packet::LinkLayer::Ethernet { src, dst, ethertype } => {
            assert_eq!(src, upstream_mac);
            assert_eq!(dst, request.sender_hardware);
            assert_eq!(ethertype, ETHERTYPE_ARP);
        }
        other => panic!("unexpected link layer {other:?}"),
    }

    let arp = indicator.arp().unwrap();
    assert_eq!(arp.operation, ArpView::OP_REPLY);
    assert_eq!(arp.sender_hardware, upstream_mac);
    assert_eq!(arp.sender_protocol, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(arp.target_hardware, request.sender_hardware);
    assert_eq!(arp.target_protocol, request.sender_protocol);
}

// Configured port 0 randomizes into the dynamic range, never onto the
// monitor port.
#[test]
fn upstream_port_randomization() {
    let config = Config {
        sources: vec!["10.0.0.2".into()],
        server: "203.0.113.9:4433".into(),
        monitor: 8080,
        ..Default::default()
    };

    for _ in 0..128 {
        let settings = config.build_settings().unwrap();
        assert!((49152..=65535).contains(&settings.port));
        assert_ne!(settings.port, 8080);
    }
}

// Fatal configurations are rejected at startup.
#[test]
fn invalid_configurations_rejected() {
    let valid = Config {
        sources: vec!["10.0.0.2".into()],
        server: "203.0.113.9:4433".into(),
        ..Default::default()
    };
    assert!(valid.build_settings().is_ok());

    let mut no_sources = valid.clone();
    no_sources.sources.clear();
    assert!(no_sources.build_settings().is_err());

    let mut bad_method = valid.clone();
    bad_method.method = "xor".into();
    assert!(bad_method.build_settings().is_err());

    let mut bad_mtu = valid.clone();
    bad_mtu.mtu = 100;
    assert!(bad_mtu.build_settings().is_err());

    let mut bad_mode = valid;
    bad_mode.mode = "udp".into();
    assert!(bad_mode.build_settings().is_err());
}
