//! Key material for attachment envelopes and transfer sessions.
//!
//! A 64-byte secret is split in two halves:
//!   bytes  0..32 — AES-CBC cipher key
//!   bytes 32..64 — HMAC-SHA256 key
//!
//! The secret travels out-of-band (inside attachment reference metadata, or
//! typed in on the receiving device). Nothing in this module persists it.
//! All key bytes derive ZeroizeOnDrop.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the AES-CBC key half.
pub const CIPHER_KEY_LEN: usize = 32;

/// Length of the HMAC-SHA256 key half.
pub const MAC_KEY_LEN: usize = 32;

/// Length of the shareable secret: cipher key followed by MAC key.
pub const SECRET_LEN: usize = CIPHER_KEY_LEN + MAC_KEY_LEN;

// ── OS randomness ─────────────────────────────────────────────────────────────

/// Fill an N-byte buffer from the OS CSPRNG.
///
/// Fails with `RandomGenerationFailed` carrying the OS status code. There is
/// no fallback to a weaker generator.
pub fn random_bytes<const N: usize>() -> Result<Zeroizing<[u8; N]>, KeyError> {
    let mut buf = Zeroizing::new([0u8; N]);
    getrandom::getrandom(&mut buf[..])
        .map_err(|e| KeyError::RandomGenerationFailed(e.code().get()))?;
    Ok(buf)
}

// ── KeyMaterial ───────────────────────────────────────────────────────────────

/// Cipher key and MAC key for one attachment or one transfer session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    cipher_key: [u8; CIPHER_KEY_LEN],
    mac_key: [u8; MAC_KEY_LEN],
}

impl KeyMaterial {
    /// Draw a fresh 64-byte secret from the OS and split it.
    pub fn generate() -> Result<Self, KeyError> {
        let secret = random_bytes::<SECRET_LEN>()?;
        Self::split(&secret[..])
    }

    /// Split a 64-byte secret into cipher key and MAC key.
    pub fn split(secret: &[u8]) -> Result<Self, KeyError> {
        if secret.len() != SECRET_LEN {
            return Err(KeyError::InvalidKeyLength(secret.len()));
        }
        let mut cipher_key = [0u8; CIPHER_KEY_LEN];
        let mut mac_key = [0u8; MAC_KEY_LEN];
        cipher_key.copy_from_slice(&secret[..CIPHER_KEY_LEN]);
        mac_key.copy_from_slice(&secret[CIPHER_KEY_LEN..]);
        Ok(Self {
            cipher_key,
            mac_key,
        })
    }

    pub fn cipher_key(&self) -> &[u8; CIPHER_KEY_LEN] {
        &self.cipher_key
    }

    pub fn mac_key(&self) -> &[u8; MAC_KEY_LEN] {
        &self.mac_key
    }

    /// The shareable 64-byte secret, `cipher_key || mac_key`.
    pub fn to_bytes(&self) -> Zeroizing<[u8; SECRET_LEN]> {
        let mut out = Zeroizing::new([0u8; SECRET_LEN]);
        out[..CIPHER_KEY_LEN].copy_from_slice(&self.cipher_key);
        out[CIPHER_KEY_LEN..].copy_from_slice(&self.mac_key);
        out
    }

    /// Hex form of the secret, for out-of-band exchange.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.to_bytes()[..]))
    }

    /// Parse the hex form produced by [`KeyMaterial::to_hex`].
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let bytes = Zeroizing::new(hex::decode(text.trim()).map_err(|_| KeyError::InvalidHex)?);
        Self::split(&bytes)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("OS random generator failed with status {0}")]
    RandomGenerationFailed(u32),

    #[error("invalid key length: expected {SECRET_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("key is not valid hex")]
    InvalidHex,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
