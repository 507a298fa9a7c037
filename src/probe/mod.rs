//! ICMP echo liveness prober.
//!
//! Sends one echo request per second to the server and records the
//! round-trip time. Every reply arms a deadline: if no later reply lands
//! within two seconds, the liveness state flips to the "down" sentinel.
//! Purely advisory; the prober never gates tunnel traffic.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error};

use crate::error::Result;
use crate::metrics::LivenessState;
use crate::packet::checksum;

/// How long a reply may be the latest one before the server counts as down.
pub const PING_DEADLINE: Duration = Duration::from_secs(2);

const PING_INTERVAL: Duration = Duration::from_secs(1);
const ECHO_PAYLOAD: &[u8] = b"veles liveness\x00\x00";

pub struct Prober {
    socket: Socket,
    server: Ipv4Addr,
    liveness: Arc<LivenessState>,
    closed: Arc<AtomicBool>,
    ident: u16,
    runtime: tokio::runtime::Handle,
}

impl Prober {
    /// Open the raw ICMP socket. Requires CAP_NET_RAW; the caller logs and
    /// skips probing when this fails.
    pub fn new(
        server: Ipv4Addr,
        liveness: Arc<LivenessState>,
        closed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        Ok(Self {
            socket,
            server,
            liveness,
            closed,
            ident: std::process::id() as u16,
            runtime: tokio::runtime::Handle::current(),
        })
    }

    /// Blocking echo loop; returns when the shutdown flag is set.
    pub fn run(mut self) {
        let mut seq: u16 = 0;

        while !self.closed.load(Ordering::SeqCst) {
            seq = seq.wrapping_add(1);

            if let Err(e) = self.send_echo(seq) {
                debug!(error = %e, "Failed to send echo request");
                std::thread::sleep(PING_INTERVAL);
                continue;
            }
            let sent_at = Instant::now();

            match self.wait_reply(seq, sent_at) {
                Some(rtt) => {
                    let rtt_ms = rtt.as_millis() as i64;
                    self.liveness.record_reply(rtt_ms, u64::from(seq));
                    debug!(server = %self.server, rtt_ms, "Receive ICMP echo reply");
                    self.arm_deadline(u64::from(seq));
                }
                None => {
                    // The deadline watchdog decides whether the server is
                    // down; a single missed reply is not conclusive.
                }
            }

            if let Some(remaining) = PING_INTERVAL.checked_sub(sent_at.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
    }

    fn send_echo(&self, seq: u16) -> Result<()> {
        let mut echo = Vec::with_capacity(8 + ECHO_PAYLOAD.len());
        echo.extend_from_slice(&[8, 0, 0, 0]); // echo request, checksum placeholder
        echo.extend_from_slice(&self.ident.to_be_bytes());
        echo.extend_from_slice(&seq.to_be_bytes());
        echo.extend_from_slice(ECHO_PAYLOAD);

        let sum = checksum(&echo);
        echo[2..4].copy_from_slice(&sum.to_be_bytes());

        self.socket
            .send_to(&echo, &SocketAddrV4::new(self.server, 0).into())?;
        Ok(())
    }

    /// Wait for the reply matching `seq`, up to the ping interval.
    fn wait_reply(&mut self, seq: u16, sent_at: Instant) -> Option<Duration> {
        let mut buf = [0u8; 1500];

        while sent_at.elapsed() < PING_INTERVAL {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            let n = match self.socket.read(&mut buf) {
                Ok(n) => n,
                Err(_) => continue, // read timeout
            };

            if let Some(reply_seq) = parse_echo_reply(&buf[..n], self.ident) {
                if reply_seq == seq {
                    return Some(sent_at.elapsed());
                }
            }
        }
        None
    }

    /// If no later reply supersedes this one before the deadline, declare
    /// the server down.
    fn arm_deadline(&self, seq: u64) {
        let liveness = Arc::clone(&self.liveness);
        let closed = Arc::clone(&self.closed);
        let server = self.server;

        self.runtime.spawn(async move {
            tokio::time::sleep(PING_DEADLINE).await;
            if closed.load(Ordering::SeqCst) {
                return;
            }
            if liveness.last_seq() <= seq {
                liveness.mark_down();
                error!(
                    server = %server,
                    "No ICMP echo reply from server, is your network down?"
                );
            }
        });
    }
}

/// Extract the sequence number of an echo reply addressed to `ident`.
///
/// Raw ICMP sockets deliver the IP header along with the message.
fn parse_echo_reply(datagram: &[u8], ident: u16) -> Option<u16> {
    let header_len = usize::from(*datagram.first()? & 0x0f) * 4;
    let icmp = datagram.get(header_len..)?;
    if icmp.len() < 8 {
        return None;
    }

    // Echo reply is type 0, code 0.
    if icmp[0] != 0 || icmp[1] != 0 {
        return None;
    }
    if u16::from_be_bytes([icmp[4], icmp[5]]) != ident {
        return None;
    }
    Some(u16::from_be_bytes([icmp[6], icmp[7]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_reply(ident: u16, seq: u16) -> Vec<u8> {
        let mut ip = vec![0x45u8; 1];
        ip.extend_from_slice(&[0u8; 19]); // rest of a minimal IPv4 header

        let mut icmp = vec![0u8, 0, 0, 0];
        icmp.extend_from_slice(&ident.to_be_bytes());
        icmp.extend_from_slice(&seq.to_be_bytes());
        icmp.extend_from_slice(b"payload");

        ip.extend_from_slice(&icmp);
        ip
    }

    #[test]
    fn test_parse_echo_reply() {
        let reply = echo_reply(0x1234, 7);
        assert_eq!(parse_echo_reply(&reply, 0x1234), Some(7));
        // Another process's reply.
        assert_eq!(parse_echo_reply(&reply, 0x9999), None);
    }

    #[test]
    fn test_parse_rejects_requests() {
        let mut reply = echo_reply(0x1234, 7);
        reply[20] = 8; // echo request, not reply
        assert_eq!(parse_echo_reply(&reply, 0x1234), None);
    }

    #[test]
    fn test_parse_truncated() {
        assert_eq!(parse_echo_reply(&[], 1), None);
        assert_eq!(parse_echo_reply(&[0x45; 22], 1), None);
    }
}
