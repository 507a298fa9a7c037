//! Error types for Veles.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Result type alias for Veles operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Veles.
#[derive(Error, Debug)]
pub enum Error {
    // Startup errors
    #[error("configuration error: {0}")]
    Config(String),

    // Per-frame errors
    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0} layer not supported")]
    UnsupportedLayer(String),

    #[error("missing nat entry for {0}")]
    NatMiss(IpAddr),

    // Cryptographic errors
    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // Capture errors
    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("method {0} not supported")]
    UnknownMethod(String),

    #[error("method {0} requires a password")]
    MissingPassword(String),

    #[error("seal failed: {0}")]
    SealFailed(String),

    #[error("open failed: {0}")]
    OpenFailed(String),
}

/// Outbound transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connection to server closed")]
    Eof,

    #[error("transport closed")]
    Closed,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

impl Error {
    /// Check if this error is confined to a single frame and the pipeline
    /// should keep running.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::UnsupportedLayer(_)
                | Error::NatMiss(_)
                | Error::Crypto(CryptoError::OpenFailed(_))
        )
    }

    /// Check if this error means the server side is gone and the process
    /// must exit.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Eof))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_frame_classification() {
        assert!(Error::Parse("truncated".into()).is_per_frame());
        assert!(Error::NatMiss("10.0.0.2".parse::<IpAddr>().unwrap()).is_per_frame());
        assert!(!Error::Config("no sources".into()).is_per_frame());
        assert!(!Error::Transport(TransportError::Eof).is_per_frame());
    }

    #[test]
    fn test_eof_classification() {
        assert!(Error::Transport(TransportError::Eof).is_eof());
        assert!(Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")).is_eof());
        assert!(!Error::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")).is_eof());
    }
}
