//! FakeTCP transport.
//!
//! Never opens a kernel socket. The session is a flow of hand-crafted
//! IPv4+TCP segments written and read through a raw handle on the upstream
//! device: a synthetic SYN / SYN-ACK / ACK handshake agrees on sequence
//! numbers, then frames ride inside segment payloads with enough seq/ack
//! maintenance to look like a live flow to stateful middleboxes. A host
//! firewall rule must keep the kernel from RST-ing these segments (see the
//! rule module).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::capture::{self, Device, Gateway, RawConn};
use crate::crypto::Cipher;
use crate::error::{Result, TransportError};
use crate::packet::{
    build_ethernet_frame, build_loopback_frame, checksum, pseudo_header_checksum,
    HardwareAddr, LinkType, PacketIndicator, ETHERTYPE_IPV4,
};
use crate::transport::{encode_frame, FrameBuffer};

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_PSH: u8 = 0x08;
const FLAG_ACK: u8 = 0x10;

const HANDSHAKE_ATTEMPTS: usize = 3;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// IPv4 + TCP header bytes a segment spends before payload.
const SEGMENT_OVERHEAD: usize = 40;

struct FlowState {
    local_hw: HardwareAddr,
    gateway_hw: HardwareAddr,
    /// Next sequence number to send.
    seq: u32,
    /// Next sequence number expected from the server.
    ack: u32,
    established: bool,
}

pub struct FakeTcpTransport {
    conn: RawConn,
    cipher: Cipher,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    gateway_ip: Ipv4Addr,
    mtu: usize,
    /// Carrier mode relaxes ordering: the KCP layer above recovers loss and
    /// reordering itself.
    carrier_mode: bool,
    flow: Mutex<FlowState>,
    recv: Mutex<FrameBuffer>,
    ip_id: AtomicU16,
    closed: AtomicBool,
}

impl FakeTcpTransport {
    /// Open the raw flow and drive the synthetic handshake.
    pub fn connect(
        device: &Device,
        gateway: Gateway,
        local_port: u16,
        server: SocketAddrV4,
        cipher: Cipher,
        mtu: usize,
        carrier_mode: bool,
    ) -> Result<Self> {
        let local_ip = device.ipv4().ok_or_else(|| {
            crate::Error::Config(format!("upstream device {} has no IPv4 address", device.name))
        })?;

        let filter = format!(
            "tcp && src host {} && src port {} && dst host {} && dst port {}",
            server.ip(),
            server.port(),
            local_ip,
            local_port
        );
        let conn = RawConn::open(device, &filter)?;

        let transport = Self {
            cipher,
            local: SocketAddrV4::new(local_ip, local_port),
            remote: server,
            gateway_ip: gateway.ip,
            mtu,
            carrier_mode,
            flow: Mutex::new(FlowState {
                local_hw: conn.local_hardware_addr(),
                gateway_hw: gateway.hardware_addr,
                seq: 0,
                ack: 0,
                established: false,
            }),
            recv: Mutex::new(FrameBuffer::new()),
            ip_id: AtomicU16::new(rand::thread_rng().gen()),
            closed: AtomicBool::new(false),
            conn,
        };

        transport.handshake()?;
        Ok(transport)
    }

    pub fn write_frame(&self, datagram: &[u8]) -> Result<()> {
        let sealed = self.cipher.seal(datagram)?;
        let encoded = encode_frame(&sealed)?;
        self.write_stream(&encoded)
    }

    pub fn read_frame(&self) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.recv.lock().pop_frame() {
                return self.cipher.open(&frame);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed.into());
            }
            if let Some(payload) = self.poll_segment()? {
                self.recv.lock().push(&payload);
            }
        }
    }

    /// Send raw bytes as one data segment, bypassing the stream framing.
    /// The KCP layer uses this for its own segments.
    pub(crate) fn write_payload(&self, bytes: &[u8]) -> Result<()> {
        let (seq, ack) = self.advance_seq(bytes.len());
        self.send_segment(seq, ack, FLAG_PSH | FLAG_ACK, bytes)
    }

    /// Pull one data segment's payload, if one arrives within the poll
    /// interval. Control segments are handled internally.
    pub(crate) fn poll_segment(&self) -> Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed.into());
        }

        let raw = match self.conn.read_frame()? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let indicator = match PacketIndicator::parse_frame(&raw, self.conn.link_type()) {
            Ok(indicator) => indicator,
            Err(_) => return Ok(None),
        };
        let segment = match parse_segment(&indicator) {
            Some(segment) => segment,
            None => return Ok(None),
        };

        if segment.flags & FLAG_RST != 0 {
            return Err(TransportError::Eof.into());
        }

        if segment.flags & FLAG_SYN != 0 && segment.flags & FLAG_ACK != 0 {
            self.complete_handshake(&segment)?;
            return Ok(None);
        }

        if segment.flags & FLAG_FIN != 0 {
            return Err(TransportError::Eof.into());
        }

        if segment.payload.is_empty() {
            return Ok(None);
        }

        let (accept, ack_reply) = {
            let mut flow = self.flow.lock();
            let end = segment.seq.wrapping_add(segment.payload.len() as u32);
            if segment.seq == flow.ack {
                flow.ack = end;
                (true, Some((flow.seq, flow.ack)))
            } else if seq_before(segment.seq, flow.ack) {
                // Retransmission; tell the server where we are.
                (false, Some((flow.seq, flow.ack)))
            } else if self.carrier_mode {
                if seq_before(flow.ack, end) {
                    flow.ack = end;
                }
                (true, Some((flow.seq, flow.ack)))
            } else {
                // A gap in plain mode; the stream cannot use these bytes.
                (false, None)
            }
        };

        if let Some((seq, ack)) = ack_reply {
            self.send_segment(seq, ack, FLAG_ACK, &[])?;
        }

        Ok(if accept { Some(segment.payload) } else { None })
    }

    /// Tear down flow state and redrive the handshake with refreshed
    /// interface state. The cipher and its session survive.
    pub fn reconnect(&self) -> Result<()> {
        let device = capture::find_upstream_device(Some(&self.conn.device().name))?;
        let gateway = capture::find_gateway(&device, Some(self.gateway_ip))?;

        {
            let mut flow = self.flow.lock();
            flow.local_hw = device
                .hardware_addr
                .unwrap_or(flow.local_hw);
            flow.gateway_hw = gateway.hardware_addr;
        }
        self.recv.lock().clear();

        self.handshake()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.local)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.remote)
    }

    fn handshake(&self) -> Result<()> {
        let isn: u32 = rand::thread_rng().gen();
        {
            let mut flow = self.flow.lock();
            flow.seq = isn;
            flow.ack = 0;
            flow.established = false;
        }

        for _ in 0..HANDSHAKE_ATTEMPTS {
            self.send_segment(isn, 0, FLAG_SYN, &[])?;

            let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
            while Instant::now() < deadline {
                if self.flow.lock().established {
                    return Ok(());
                }
                let _ = self.poll_segment()?;
            }
        }

        Err(TransportError::HandshakeFailed(format!(
            "no SYN-ACK from {} after {HANDSHAKE_ATTEMPTS} attempts",
            self.remote
        ))
        .into())
    }

    fn complete_handshake(&self, segment: &Segment) -> Result<()> {
        let reply = {
            let mut flow = self.flow.lock();
            if flow.established || segment.ack != flow.seq.wrapping_add(1) {
                return Ok(());
            }
            flow.seq = flow.seq.wrapping_add(1);
            flow.ack = segment.seq.wrapping_add(1);
            flow.established = true;
            (flow.seq, flow.ack)
        };
        self.send_segment(reply.0, reply.1, FLAG_ACK, &[])
    }

    fn write_stream(&self, bytes: &[u8]) -> Result<()> {
        let chunk_size = self.mtu.saturating_sub(SEGMENT_OVERHEAD).max(1);
        for chunk in bytes.chunks(chunk_size) {
            let (seq, ack) = self.advance_seq(chunk.len());
            self.send_segment(seq, ack, FLAG_PSH | FLAG_ACK, chunk)?;
        }
        Ok(())
    }

    fn advance_seq(&self, len: usize) -> (u32, u32) {
        let mut flow = self.flow.lock();
        let seq = flow.seq;
        flow.seq = flow.seq.wrapping_add(len as u32);
        (seq, flow.ack)
    }

    fn send_segment(&self, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Result<()> {
        let (local_hw, gateway_hw) = {
            let flow = self.flow.lock();
            (flow.local_hw, flow.gateway_hw)
        };

        let datagram = build_raw_segment(
            self.local,
            self.remote,
            self.ip_id.fetch_add(1, Ordering::Relaxed),
            seq,
            ack,
            flags,
            payload,
        );

        let frame = match self.conn.link_type() {
            LinkType::Ethernet => {
                build_ethernet_frame(local_hw, gateway_hw, ETHERTYPE_IPV4, &datagram)
            }
            LinkType::Loopback => build_loopback_frame(false, &datagram),
        };

        self.conn.write_frame(&frame)
    }
}

#[derive(Debug)]
struct Segment {
    seq: u32,
    ack: u32,
    flags: u8,
    payload: Vec<u8>,
}

/// Extract TCP sequencing fields from a parsed flow segment.
fn parse_segment(indicator: &PacketIndicator) -> Option<Segment> {
    let ip = indicator.network_bytes();
    let header_len = usize::from(ip.first()? & 0x0f) * 4;
    let tcp = ip.get(header_len..)?;
    if tcp.len() < 20 {
        return None;
    }

    let data_offset = usize::from(tcp[12] >> 4) * 4;
    Some(Segment {
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        flags: tcp[13],
        payload: tcp.get(data_offset..)?.to_vec(),
    })
}

/// Build the IPv4 datagram of one flow segment.
fn build_raw_segment(
    local: SocketAddrV4,
    remote: SocketAddrV4,
    ip_id: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = Vec::with_capacity(20 + payload.len());
    tcp.extend_from_slice(&local.port().to_be_bytes());
    tcp.extend_from_slice(&remote.port().to_be_bytes());
    tcp.extend_from_slice(&seq.to_be_bytes());
    tcp.extend_from_slice(&ack.to_be_bytes());
    tcp.push(5 << 4); // data offset, no options
    tcp.push(flags);
    tcp.extend_from_slice(&0xffffu16.to_be_bytes()); // window
    tcp.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
    tcp.extend_from_slice(payload);

    let sum = pseudo_header_checksum(*local.ip(), *remote.ip(), 6, &tcp);
    tcp[16..18].copy_from_slice(&sum.to_be_bytes());

    let total_len = (20 + tcp.len()) as u16;
    let mut ip = Vec::with_capacity(20 + tcp.len());
    ip.extend_from_slice(&[0x45, 0x00]);
    ip.extend_from_slice(&total_len.to_be_bytes());
    ip.extend_from_slice(&ip_id.to_be_bytes());
    ip.extend_from_slice(&[0x40, 0x00]); // don't fragment
    ip.extend_from_slice(&[64, 6, 0, 0]); // ttl, protocol, checksum
    ip.extend_from_slice(&local.ip().octets());
    ip.extend_from_slice(&remote.ip().octets());

    let ip_sum = checksum(&ip);
    ip[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    ip.extend_from_slice(&tcp);
    ip
}

/// Whether `a` comes before `b` in 32-bit sequence space.
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
