//! KCP session over the FakeTCP carrier.
//!
//! In this mode the FakeTCP layer provides no reliability at all; it is an
//! obfuscation carrier whose segments hold KCP packets. The KCP session
//! supplies in-order, reliable delivery and maps one sealed tunnel frame to
//! one KCP message, so frame boundaries survive without a length prefix.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kcp::Kcp;
use parking_lot::Mutex;

use crate::capture::{Device, Gateway};
use crate::config::KcpConfig;
use crate::crypto::Cipher;
use crate::error::{Result, TransportError};
use crate::transport::FakeTcpTransport;

/// Writes outgoing KCP packets into FakeTCP segments.
struct SegmentSink {
    carrier: Arc<FakeTcpTransport>,
}

impl Write for SegmentSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.carrier
            .write_payload(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct KcpTransport {
    carrier: Arc<FakeTcpTransport>,
    cipher: Cipher,
    kcp: Arc<Mutex<Kcp<SegmentSink>>>,
    epoch: Instant,
    interval: Duration,
    closed: Arc<AtomicBool>,
}

impl KcpTransport {
    /// Establish the FakeTCP carrier and start the KCP session on it.
    ///
    /// The conversation id is derived from the local port, which the server
    /// learns from the carrier flow.
    pub fn connect(
        device: &Device,
        gateway: Gateway,
        local_port: u16,
        server: std::net::SocketAddrV4,
        cipher: Cipher,
        mtu: usize,
        config: &KcpConfig,
    ) -> Result<Self> {
        // The carrier stays plaintext; sealing happens at the KCP layer.
        let carrier = Arc::new(FakeTcpTransport::connect(
            device,
            gateway,
            local_port,
            server,
            Cipher::plain(),
            mtu,
            true,
        )?);

        let mut kcp = Kcp::new(
            u32::from(local_port),
            SegmentSink {
                carrier: Arc::clone(&carrier),
            },
        );
        kcp.set_mtu(config.mtu)
            .map_err(|e| TransportError::HandshakeFailed(format!("kcp mtu: {e}")))?;
        kcp.set_wndsize(config.sndwnd, config.rcvwnd);
        kcp.set_nodelay(
            config.nodelay,
            config.interval,
            config.resend,
            config.nc != 0,
        );

        let transport = Self {
            carrier,
            cipher,
            kcp: Arc::new(Mutex::new(kcp)),
            epoch: Instant::now(),
            interval: Duration::from_millis(config.interval.max(1) as u64),
            closed: Arc::new(AtomicBool::new(false)),
        };
        transport.spawn_clock();
        Ok(transport)
    }

    /// Drive KCP's retransmission timers from a dedicated clock thread.
    fn spawn_clock(&self) {
        let kcp = Arc::clone(&self.kcp);
        let closed = Arc::clone(&self.closed);
        let epoch = self.epoch;
        let interval = self.interval;

        std::thread::spawn(move || {
            while !closed.load(Ordering::SeqCst) {
                {
                    let mut kcp = kcp.lock();
                    let _ = kcp.update(elapsed_ms(epoch));
                }
                std::thread::sleep(interval);
            }
        });
    }

    pub fn write_frame(&self, datagram: &[u8]) -> Result<()> {
        let sealed = self.cipher.seal(datagram)?;

        let mut kcp = self.kcp.lock();
        kcp.send(&sealed)
            .map_err(|e| TransportError::SendFailed(format!("kcp send: {e}")))?;
        kcp.update(elapsed_ms(self.epoch))
            .map_err(|e| TransportError::SendFailed(format!("kcp update: {e}")))?;
        Ok(())
    }

    pub fn read_frame(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; crate::IPV4_MAX_SIZE + self.cipher.overhead()];

        loop {
            {
                let mut kcp = self.kcp.lock();
                if let Ok(n) = kcp.recv(&mut buf) {
                    return self.cipher.open(&buf[..n]);
                }
            }

            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed.into());
            }

            if let Some(payload) = self.carrier.poll_segment()? {
                let mut kcp = self.kcp.lock();
                if kcp.input(&payload).is_ok() {
                    let _ = kcp.update(elapsed_ms(self.epoch));
                }
            }
        }
    }

    /// Redrive the carrier handshake; the KCP session state survives.
    pub fn reconnect(&self) -> Result<()> {
        self.carrier.reconnect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.carrier.close();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.carrier.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.carrier.remote_addr()
    }
}

fn elapsed_ms(epoch: Instant) -> u32 {
    epoch.elapsed().as_millis() as u32
}
