use crate::{encode_variable, ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Generates a random nonce as a hex string
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let nonce: [u8; 16] = rng.gen();
    hex::encode(nonce)
}

/// Computes raw HMAC-SHA256 bytes
pub fn compute_hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| ProtocolError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derives a 256-bit cipher key from a pre-shared key:
/// key = HMAC(PSK, label)
pub fn derive_key(psk: &[u8], label: &str) -> Result<[u8; 32]> {
    if psk.is_empty() {
        return Err(ProtocolError::InvalidKey);
    }

    let digest = compute_hmac(psk, label.as_bytes())?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Ok(key)
}

/// Cipher applied to packets registered as encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherSuite {
    #[default]
    None,
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub fn name(&self) -> &'static str {
        match self {
            CipherSuite::None => "none",
            CipherSuite::ChaCha20Poly1305 => "chacha20poly1305",
        }
    }

    /// Builds a fresh encryptor for one connection
    pub fn build(&self, psk: &[u8]) -> Result<Arc<dyn Encryptor>> {
        match self {
            CipherSuite::None => Ok(Arc::new(PlainEncryptor)),
            CipherSuite::ChaCha20Poly1305 => {
                let key = derive_key(psk, "gamewire packet key")?;
                Ok(Arc::new(ChaChaEncryptor::new(&key)))
            }
        }
    }
}

/// Per-connection encryption capability.
///
/// `finalize` produces a complete frame whose header carries the frame's own
/// length, since the ciphertext may be longer than the plaintext. `decrypt`
/// receives only the bytes that follow that header.
pub trait Encryptor: Send + Sync {
    fn finalize(&self, packet_id: u8, plaintext: &[u8]) -> Result<Bytes>;

    fn decrypt(&self, blob: &[u8]) -> Result<Bytes>;

    fn suite(&self) -> CipherSuite;
}

/// Leaves payloads readable; frames still carry a length header
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainEncryptor;

impl Encryptor for PlainEncryptor {
    fn finalize(&self, packet_id: u8, plaintext: &[u8]) -> Result<Bytes> {
        encode_variable(packet_id, plaintext)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(blob))
    }

    fn suite(&self) -> CipherSuite {
        CipherSuite::None
    }
}

/// ChaCha20-Poly1305 encryptor.
///
/// Blob layout: nonce (12 bytes) + ciphertext + tag (16 bytes).
#[derive(Clone)]
pub struct ChaChaEncryptor {
    cipher: ChaCha20Poly1305,
}

impl fmt::Debug for ChaChaEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaChaEncryptor")
            .field("cipher", &"<redacted>")
            .finish()
    }
}

impl ChaChaEncryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }
}

impl Encryptor for ChaChaEncryptor {
    fn finalize(&self, packet_id: u8, plaintext: &[u8]) -> Result<Bytes> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

        let mut blob = BytesMut::with_capacity(NONCE_LEN + ciphertext.len());
        blob.put_slice(&nonce_bytes);
        blob.put_slice(&ciphertext);

        encode_variable(packet_id, &blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Bytes> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(ProtocolError::Decryption(format!(
                "blob too short: {} bytes",
                blob.len()
            )));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))?;

        Ok(Bytes::from(plaintext))
    }

    fn suite(&self) -> CipherSuite {
        CipherSuite::ChaCha20Poly1305
    }
}
