//! Integrity primitives: HMAC-SHA256, SHA-256 digests and CRC32.
//!
//! Every primitive comes in an incremental form (fed chunk by chunk as bytes
//! stream past) and a one-shot form. Both forms produce identical results for
//! the same input regardless of how it is chunked.

use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of an HMAC-SHA256 tag.
pub const TAG_LEN: usize = 32;

/// Length of a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

// ── HMAC-SHA256 ───────────────────────────────────────────────────────────────

/// Incremental HMAC-SHA256.
#[derive(Clone)]
pub struct RunningHmac {
    mac: HmacSha256,
}

impl RunningHmac {
    /// Keys longer than the SHA-256 block are hashed first; shorter keys are
    /// zero-padded to the block (RFC 2104).
    pub fn new(key: &[u8]) -> Self {
        let mut block = Key::<HmacSha256>::default();
        if key.len() > block.len() {
            block[..DIGEST_LEN].copy_from_slice(&Sha256::digest(key));
        } else {
            block[..key.len()].copy_from_slice(key);
        }
        Self {
            mac: <HmacSha256 as KeyInit>::new(&block),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    pub fn finish(self) -> [u8; TAG_LEN] {
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&self.mac.finalize().into_bytes());
        tag
    }
}

/// One-shot HMAC-SHA256.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = RunningHmac::new(key);
    mac.update(data);
    mac.finish()
}

/// Constant-time tag comparison. Slices of different length never match.
pub fn verify_tag(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len() && bool::from(expected.ct_eq(actual))
}

// ── SHA-256 ───────────────────────────────────────────────────────────────────

/// Incremental SHA-256.
#[derive(Clone, Default)]
pub struct RunningDigest {
    hasher: Sha256,
}

impl RunningDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> [u8; DIGEST_LEN] {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&self.hasher.finalize());
        out
    }
}

pub fn sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut d = RunningDigest::new();
    d.update(data);
    d.finish()
}

// ── CRC32 ─────────────────────────────────────────────────────────────────────

/// Incremental CRC32 (IEEE). The value is widened to u64 for callers that
/// store checksums alongside lengths.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> u64 {
        u64::from(self.hasher.finalize())
    }
}

/// One-shot CRC32.
pub fn checksum(data: &[u8]) -> u64 {
    u64::from(crc32fast::hash(data))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..1000u32).map(|i| (i * 31 % 251) as u8).collect()
    }

    // ── CRC32 ──

    #[test]
    fn crc_known_vector() {
        // Standard check value for CRC-32/ISO-HDLC.
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc_incremental_matches_one_shot() {
        let data = sample();
        let expected = checksum(&data);

        for chunks in [1usize, 2, 7, data.len()] {
            let mut crc = Crc32::new();
            for part in data.chunks(data.len().div_ceil(chunks)) {
                crc.update(part);
            }
            assert_eq!(crc.finalize(), expected, "chunks={chunks}");
        }
    }

    #[test]
    fn crc_empty_is_zero() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(Crc32::new().finalize(), 0);
    }

    // ── HMAC ──

    #[test]
    fn hmac_rfc4231_case_2() {
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn hmac_rfc4231_case_6_long_key_is_hashed() {
        let key = [0xaau8; 131];
        let tag = hmac_sha256(&key, b"Test Using Larger Than Block-Size Key - Hash Key First");
        assert_eq!(
            hex::encode(tag),
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
    }

    #[test]
    fn key_block_matches_library_key_handling() {
        let data = sample();
        for len in [0usize, 1, 32, 63, 64, 65, 200] {
            let key: Vec<u8> = (0..len).map(|i| i as u8 ^ 0x5a).collect();
            let mut reference = <HmacSha256 as Mac>::new_from_slice(&key).unwrap();
            reference.update(&data);
            let expected = reference.finalize().into_bytes();
            assert_eq!(&hmac_sha256(&key, &data)[..], &expected[..], "len={len}");
        }
    }

    #[test]
    fn hmac_incremental_matches_one_shot() {
        let key = [0x42u8; 32];
        let data = sample();
        let expected = hmac_sha256(&key, &data);

        for chunks in [1usize, 2, 13, data.len()] {
            let mut mac = RunningHmac::new(&key);
            for part in data.chunks(data.len().div_ceil(chunks)) {
                mac.update(part);
            }
            assert_eq!(mac.finish(), expected, "chunks={chunks}");
        }
    }

    #[test]
    fn verify_tag_rejects_mismatch_and_length() {
        let tag = hmac_sha256(b"k", b"data");
        assert!(verify_tag(&tag, &tag));

        let mut flipped = tag;
        flipped[31] ^= 0x01;
        assert!(!verify_tag(&tag, &flipped));
        assert!(!verify_tag(&tag, &tag[..31]));
    }

    // ── SHA-256 ──

    #[test]
    fn sha256_incremental_matches_one_shot() {
        let data = sample();
        let mut d = RunningDigest::new();
        d.update(&data[..10]);
        d.update(&data[10..]);
        assert_eq!(d.finish(), sha256(&data));
    }

    #[test]
    fn sha256_empty_vector() {
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
