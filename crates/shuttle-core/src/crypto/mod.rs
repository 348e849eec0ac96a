//! Cryptographic building blocks for attachment envelopes and transfer frames.
//!
//! - `key`       — 64-byte secret split into cipher and MAC halves
//! - `engine`    — incremental AES-CBC with PKCS#7 behind the `CipherEngine` seam
//! - `integrity` — HMAC-SHA256, SHA-256 and CRC32, incremental and one-shot
//! - `codec`     — streaming encrypt-then-MAC envelopes with a content digest

pub mod codec;
pub mod engine;
pub mod integrity;
pub mod key;

pub use codec::{
    envelope_len, open, seal, CodecError, ContentDigest, DecryptingWriter, EncryptingReader,
};
pub use key::{KeyError, KeyMaterial};
