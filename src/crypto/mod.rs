//! Symmetric per-frame encryption.
//!
//! Every tunneled frame is sealed with an AEAD selected by the `method`
//! configuration option, keyed from the shared password. `plain` disables
//! encryption entirely and passes frames through untouched.

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, Result};

/// Nonce size shared by the supported AEADs.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size shared by the supported AEADs.
pub const TAG_SIZE: usize = 16;

/// Supported encryption methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Plain,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Method {
    /// Key size in bytes; zero for `plain`.
    pub fn key_size(&self) -> usize {
        match self {
            Method::Plain => 0,
            Method::Aes128Gcm => 16,
            Method::Aes256Gcm => 32,
            Method::ChaCha20Poly1305 => 32,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Plain => write!(f, "plain"),
            Method::Aes128Gcm => write!(f, "aes-128-gcm"),
            Method::Aes256Gcm => write!(f, "aes-256-gcm"),
            Method::ChaCha20Poly1305 => write!(f, "chacha20-poly1305"),
        }
    }
}

/// A configured cipher applying `seal`/`open` to tunneled frames.
#[derive(Clone)]
pub struct Cipher {
    method: Method,
    key: Vec<u8>,
}

impl Cipher {
    /// Parse a method name and derive the key from the password.
    pub fn parse(method: &str, password: &str) -> Result<Self> {
        let method = match method {
            "plain" => Method::Plain,
            "aes-128-gcm" => Method::Aes128Gcm,
            "aes-256-gcm" => Method::Aes256Gcm,
            "chacha20-poly1305" => Method::ChaCha20Poly1305,
            other => return Err(CryptoError::UnknownMethod(other.to_string()).into()),
        };

        if method != Method::Plain && password.is_empty() {
            return Err(CryptoError::MissingPassword(method.to_string()).into());
        }

        Ok(Self {
            method,
            key: derive_key(password, method.key_size()),
        })
    }

    /// The cipher that passes frames through untouched.
    pub fn plain() -> Self {
        Self {
            method: Method::Plain,
            key: Vec::new(),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Per-frame overhead added by `seal`.
    pub fn overhead(&self) -> usize {
        match self.method {
            Method::Plain => 0,
            _ => NONCE_SIZE + TAG_SIZE,
        }
    }

    /// Seal a frame: nonce || ciphertext-with-tag. `plain` returns the
    /// input as-is.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.method == Method::Plain {
            return Ok(plaintext.to_vec());
        }

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self.encrypt(&nonce, plaintext).map_err(CryptoError::SealFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed frame. Frames that fail authentication yield a
    /// `CryptoError` the reader drops without dying.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.method == Method::Plain {
            return Ok(data.to_vec());
        }

        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::OpenFailed("sealed frame too short".into()).into());
        }

        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        let plaintext = self.decrypt(nonce, ciphertext).map_err(CryptoError::OpenFailed)?;
        Ok(plaintext)
    }

    fn encrypt(&self, nonce: &[u8], plaintext: &[u8]) -> std::result::Result<Vec<u8>, String> {
        let nonce = Nonce::from_slice(nonce);
        match self.method {
            Method::Plain => Ok(plaintext.to_vec()),
            Method::Aes128Gcm => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|e| format!("cipher init: {e}"))?
                .encrypt(nonce, plaintext)
                .map_err(|e| format!("encrypt: {e}")),
            Method::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| format!("cipher init: {e}"))?
                .encrypt(nonce, plaintext)
                .map_err(|e| format!("encrypt: {e}")),
            Method::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&self.key)
                .map_err(|e| format!("cipher init: {e}"))?
                .encrypt(nonce, plaintext)
                .map_err(|e| format!("encrypt: {e}")),
        }
    }

    fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> std::result::Result<Vec<u8>, String> {
        let nonce = Nonce::from_slice(nonce);
        match self.method {
            Method::Plain => Ok(ciphertext.to_vec()),
            Method::Aes128Gcm => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|e| format!("cipher init: {e}"))?
                .decrypt(nonce, ciphertext)
                .map_err(|_| "authentication failed".to_string()),
            Method::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| format!("cipher init: {e}"))?
                .decrypt(nonce, ciphertext)
                .map_err(|_| "authentication failed".to_string()),
            Method::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&self.key)
                .map_err(|e| format!("cipher init: {e}"))?
                .decrypt(nonce, ciphertext)
                .map_err(|_| "authentication failed".to_string()),
        }
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("method", &self.method).finish()
    }
}

/// Derive a fixed-size key from the shared password.
fn derive_key(password: &str, size: usize) -> Vec<u8> {
    if size == 0 {
        return Vec::new();
    }
    let digest = Sha256::digest(password.as_bytes());
    digest[..size].to_vec()
}
