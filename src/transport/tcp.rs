//! Kernel TCP transport.
//!
//! A conventional TCP connection to the server. Frame boundaries are kept by
//! a 16-bit big-endian length prefix written atomically before each sealed
//! frame.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};

use crate::crypto::Cipher;
use crate::error::{Result, TransportError};
use crate::transport::{encode_frame, LENGTH_PREFIX_SIZE};

pub struct TcpTransport {
    cipher: Cipher,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Connect to the server from the chosen local port.
    pub fn connect(local_port: u16, server: SocketAddrV4, cipher: Cipher) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddrV4::new([0, 0, 0, 0].into(), local_port).into())?;
        socket
            .connect(&SocketAddr::V4(server).into())
            .map_err(|e| TransportError::ConnectFailed {
                addr: server.to_string(),
                reason: e.to_string(),
            })?;

        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;

        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let reader = stream.try_clone()?;

        Ok(Self {
            cipher,
            reader: Mutex::new(reader),
            writer: Mutex::new(stream),
            local_addr,
            remote_addr,
            closed: AtomicBool::new(false),
        })
    }

    pub fn write_frame(&self, datagram: &[u8]) -> Result<()> {
        let sealed = self.cipher.seal(datagram)?;
        let encoded = encode_frame(&sealed)?;

        let mut writer = self.writer.lock();
        writer
            .write_all(&encoded)
            .map_err(|e| self.map_io(e, true))?;
        Ok(())
    }

    pub fn read_frame(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock();

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        reader
            .read_exact(&mut prefix)
            .map_err(|e| self.map_io(e, false))?;

        let len = usize::from(u16::from_be_bytes(prefix));
        let mut sealed = vec![0u8; len];
        reader
            .read_exact(&mut sealed)
            .map_err(|e| self.map_io(e, false))?;

        self.cipher.open(&sealed)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn map_io(&self, e: std::io::Error, sending: bool) -> crate::Error {
        if self.closed.load(Ordering::SeqCst) {
            return TransportError::Closed.into();
        }
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return TransportError::Eof.into();
        }
        if sending {
            TransportError::SendFailed(e.to_string()).into()
        } else {
            TransportError::ReceiveFailed(e.to_string()).into()
        }
    }
}
