//! Outbound tunnel transports.
//!
//! The tunnel treats its upstream as a bidirectional frame channel: one call
//! writes one sealed inner IP datagram, one call reads one back. Three
//! realizations exist: a kernel TCP connection, FakeTCP (synthesized TCP
//! segments through raw capture), and a KCP session riding FakeTCP as a pure
//! obfuscation carrier.

use std::net::SocketAddr;

use crate::error::{Result, TransportError};

mod faketcp;
mod kcp;
mod tcp;

pub use faketcp::FakeTcpTransport;
pub use kcp::KcpTransport;
pub use tcp::TcpTransport;

/// Size of the length prefix delimiting frames on the byte stream.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest sealed frame the 16-bit prefix can carry.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// The outbound transport. Single-writer, single-reader.
pub enum Transport {
    Tcp(TcpTransport),
    FakeTcp(FakeTcpTransport),
    FakeTcpKcp(KcpTransport),
}

impl Transport {
    /// Transmit one inner IP datagram as a single logical frame.
    pub fn write_frame(&self, datagram: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(t) => t.write_frame(datagram),
            Transport::FakeTcp(t) => t.write_frame(datagram),
            Transport::FakeTcpKcp(t) => t.write_frame(datagram),
        }
    }

    /// Receive one inner IP datagram; never splits a datagram.
    pub fn read_frame(&self) -> Result<Vec<u8>> {
        match self {
            Transport::Tcp(t) => t.read_frame(),
            Transport::FakeTcp(t) => t.read_frame(),
            Transport::FakeTcpKcp(t) => t.read_frame(),
        }
    }

    /// Redrive the synthetic handshake with refreshed interface state.
    /// A no-op on kernel TCP.
    pub fn reconnect(&self) -> Result<()> {
        match self {
            Transport::Tcp(_) => Ok(()),
            Transport::FakeTcp(t) => t.reconnect(),
            Transport::FakeTcpKcp(t) => t.reconnect(),
        }
    }

    /// Whether this is a FakeTCP-class transport.
    pub fn is_faketcp(&self) -> bool {
        !matches!(self, Transport::Tcp(_))
    }

    /// Idempotent shutdown.
    pub fn close(&self) {
        match self {
            Transport::Tcp(t) => t.close(),
            Transport::FakeTcp(t) => t.close(),
            Transport::FakeTcpKcp(t) => t.close(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Transport::Tcp(t) => t.local_addr(),
            Transport::FakeTcp(t) => t.local_addr(),
            Transport::FakeTcpKcp(t) => t.local_addr(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            Transport::Tcp(t) => t.remote_addr(),
            Transport::FakeTcp(t) => t.remote_addr(),
            Transport::FakeTcpKcp(t) => t.remote_addr(),
        }
    }
}

/// Prefix a sealed frame with its 16-bit big-endian length.
pub(crate) fn encode_frame(sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: sealed.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + sealed.len());
    out.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
    out.extend_from_slice(sealed);
    Ok(out)
}

/// Reassembles length-prefixed frames out of an in-order byte stream.
#[derive(Debug, Default)]
pub(crate) struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append stream bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop one complete sealed frame, if buffered.
    pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([self.buf[0], self.buf[1]]));
        if self.buf.len() < LENGTH_PREFIX_SIZE + len {
            return None;
        }

        let frame = self.buf[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len].to_vec();
        self.buf.drain(..LENGTH_PREFIX_SIZE + len);
        Some(frame)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame() {
        let encoded = encode_frame(b"X").unwrap();
        assert_eq!(encoded, vec![0x00, 0x01, b'X']);
    }

    #[test]
    fn test_encode_frame_too_large() {
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(encode_frame(&big).is_err());
    }

    #[test]
    fn test_frame_buffer_reassembly() {
        let mut buffer = FrameBuffer::new();

        let a = encode_frame(b"first").unwrap();
        let b = encode_frame(b"second").unwrap();
        let stream: Vec<u8> = a.iter().chain(&b).copied().collect();

        // Feed the stream in awkward chunks.
        buffer.push(&stream[..3]);
        assert_eq!(buffer.pop_frame(), None);
        buffer.push(&stream[3..8]);
        assert_eq!(buffer.pop_frame().as_deref(), Some(&b"first"[..]));
        assert_eq!(buffer.pop_frame(), None);
        buffer.push(&stream[8..]);
        assert_eq!(buffer.pop_frame().as_deref(), Some(&b"second"[..]));
        assert_eq!(buffer.pop_frame(), None);
    }

    #[test]
    fn test_frame_buffer_empty_frame() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&encode_frame(b"").unwrap());
        assert_eq!(buffer.pop_frame().as_deref(), Some(&b""[..]));
    }
}
