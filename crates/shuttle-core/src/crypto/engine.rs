//! Incremental AES-CBC engines with PKCS#7 padding.
//!
//! `CipherEngine` is the seam between the envelope codec and the block
//! cipher: bytes go in through `update`, whole blocks come out, and
//! `finalize` flushes whatever the padding rule leaves behind. An engine is
//! single-use; after `finalize` every call fails with `Finalized`.
//!
//! The 32-byte cipher key selects AES-256. The block size is 128 bits.

use aes::Aes256;
use cbc::cipher::block_padding::{Pkcs7, RawPadding};
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

/// AES block length.
pub const BLOCK_LEN: usize = 16;

/// IV length for CBC mode (one block).
pub const IV_LEN: usize = BLOCK_LEN;

/// Length of `plain_len` bytes after PKCS#7 padding. Always adds 1..=16 bytes.
pub const fn pkcs7_padded_len(plain_len: u64) -> u64 {
    (plain_len / BLOCK_LEN as u64 + 1) * BLOCK_LEN as u64
}

pub trait CipherEngine {
    /// Feed input; returns the output bytes that are ready (possibly none).
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Flush the final block(s). The engine cannot be used afterwards.
    fn finalize(&mut self) -> Result<Vec<u8>, EngineError>;
}

// ── Encryptor ─────────────────────────────────────────────────────────────────

pub struct AesCbcEncryptor {
    cipher: Option<cbc::Encryptor<Aes256>>,
    pending: Vec<u8>,
}

impl AesCbcEncryptor {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, EngineError> {
        let cipher = cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| EngineError::ContextCreation)?;
        Ok(Self {
            cipher: Some(cipher),
            pending: Vec::with_capacity(BLOCK_LEN),
        })
    }
}

impl CipherEngine for AesCbcEncryptor {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, EngineError> {
        let cipher = self.cipher.as_mut().ok_or(EngineError::Finalized)?;
        self.pending.extend_from_slice(input);

        let whole = self.pending.len() / BLOCK_LEN * BLOCK_LEN;
        let mut out: Vec<u8> = self.pending.drain(..whole).collect();
        for block in out.chunks_exact_mut(BLOCK_LEN) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(out)
    }

    fn finalize(&mut self) -> Result<Vec<u8>, EngineError> {
        let mut cipher = self.cipher.take().ok_or(EngineError::Finalized)?;
        debug_assert!(self.pending.len() < BLOCK_LEN);

        let pos = self.pending.len();
        let mut block = std::mem::take(&mut self.pending);
        block.resize(BLOCK_LEN, 0);
        Pkcs7::raw_pad(&mut block, pos);
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        Ok(block)
    }
}

// ── Decryptor ─────────────────────────────────────────────────────────────────

/// Always holds back the last whole block so `finalize` can strip padding.
pub struct AesCbcDecryptor {
    cipher: Option<cbc::Decryptor<Aes256>>,
    pending: Vec<u8>,
}

impl AesCbcDecryptor {
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, EngineError> {
        let cipher = cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| EngineError::ContextCreation)?;
        Ok(Self {
            cipher: Some(cipher),
            pending: Vec::with_capacity(BLOCK_LEN * 2),
        })
    }
}

impl CipherEngine for AesCbcDecryptor {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, EngineError> {
        let cipher = self.cipher.as_mut().ok_or(EngineError::Finalized)?;
        self.pending.extend_from_slice(input);

        if self.pending.len() <= BLOCK_LEN {
            return Ok(Vec::new());
        }
        let ready = (self.pending.len() - 1) / BLOCK_LEN * BLOCK_LEN;
        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        for block in out.chunks_exact_mut(BLOCK_LEN) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(out)
    }

    fn finalize(&mut self) -> Result<Vec<u8>, EngineError> {
        let mut cipher = self.cipher.take().ok_or(EngineError::Finalized)?;
        if self.pending.len() != BLOCK_LEN {
            return Err(EngineError::IncompleteBlock(self.pending.len()));
        }

        let mut block = std::mem::take(&mut self.pending);
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(&mut block));

        let plain_len = Pkcs7::raw_unpad(&block)
            .map_err(|_| EngineError::BadPadding)?
            .len();
        block.truncate(plain_len);
        Ok(block)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("cipher context creation failed")]
    ContextCreation,

    #[error("cipher engine already finalized")]
    Finalized,

    #[error("ciphertext ends with an incomplete block ({0} bytes pending)")]
    IncompleteBlock(usize),

    #[error("invalid PKCS#7 padding")]
    BadPadding,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x07; 32];
    const IV: [u8; 16] = [0x09; 16];

    fn encrypt_in_chunks(data: &[u8], chunk: usize) -> Vec<u8> {
        let mut enc = AesCbcEncryptor::new(&KEY, &IV).unwrap();
        let mut out = Vec::new();
        for part in data.chunks(chunk.max(1)) {
            out.extend(enc.update(part).unwrap());
        }
        out.extend(enc.finalize().unwrap());
        out
    }

    fn decrypt_in_chunks(data: &[u8], chunk: usize) -> Result<Vec<u8>, EngineError> {
        let mut dec = AesCbcDecryptor::new(&KEY, &IV)?;
        let mut out = Vec::new();
        for part in data.chunks(chunk.max(1)) {
            out.extend(dec.update(part)?);
        }
        out.extend(dec.finalize()?);
        Ok(out)
    }

    #[test]
    fn padded_len_always_adds_padding() {
        assert_eq!(pkcs7_padded_len(0), 16);
        assert_eq!(pkcs7_padded_len(11), 16);
        assert_eq!(pkcs7_padded_len(15), 16);
        assert_eq!(pkcs7_padded_len(16), 32);
        assert_eq!(pkcs7_padded_len(17), 32);
    }

    #[test]
    fn output_length_matches_padding_rule() {
        for len in [0usize, 1, 15, 16, 17, 100] {
            let data = vec![0xaa; len];
            assert_eq!(encrypt_in_chunks(&data, 7).len() as u64, pkcs7_padded_len(len as u64));
        }
    }

    #[test]
    fn chunking_does_not_change_ciphertext() {
        let data: Vec<u8> = (0..200u8).collect();
        let whole = encrypt_in_chunks(&data, data.len());
        assert_eq!(encrypt_in_chunks(&data, 1), whole);
        assert_eq!(encrypt_in_chunks(&data, 16), whole);
        assert_eq!(encrypt_in_chunks(&data, 33), whole);
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let data: Vec<u8> = (0..77u8).collect();
        let ct = encrypt_in_chunks(&data, 10);
        for chunk in [1, 5, 16, 32, ct.len()] {
            assert_eq!(decrypt_in_chunks(&ct, chunk).unwrap(), data, "chunk={chunk}");
        }
    }

    #[test]
    fn decrypt_rejects_partial_block() {
        let ct = encrypt_in_chunks(b"hello", 5);
        assert_eq!(
            decrypt_in_chunks(&ct[..15], 4).unwrap_err(),
            EngineError::IncompleteBlock(15)
        );
    }

    fn encrypt_raw_block(mut block: [u8; BLOCK_LEN]) -> Vec<u8> {
        let mut cipher = cbc::Encryptor::<Aes256>::new_from_slices(&KEY, &IV).unwrap();
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        block.to_vec()
    }

    #[test]
    fn malformed_padding_is_rejected() {
        let mut zero_pad = [0x41; BLOCK_LEN];
        zero_pad[BLOCK_LEN - 1] = 0;
        let mut too_long = [0x41; BLOCK_LEN];
        too_long[BLOCK_LEN - 1] = 17;
        let mut inconsistent = [0x41; BLOCK_LEN];
        inconsistent[BLOCK_LEN - 3..].copy_from_slice(&[3, 2, 3]);

        for block in [zero_pad, too_long, inconsistent] {
            assert_eq!(
                decrypt_in_chunks(&encrypt_raw_block(block), 16).unwrap_err(),
                EngineError::BadPadding,
                "block={block:?}"
            );
        }

        let mut valid = [0x41; BLOCK_LEN];
        valid[BLOCK_LEN - 2..].copy_from_slice(&[2, 2]);
        assert_eq!(
            decrypt_in_chunks(&encrypt_raw_block(valid), 16).unwrap(),
            vec![0x41; BLOCK_LEN - 2]
        );
    }

    #[test]
    fn wrong_key_is_caught_as_bad_padding_or_garbage() {
        let ct = encrypt_in_chunks(b"hello world", 11);
        let mut dec = AesCbcDecryptor::new(&[0x08; 32], &IV).unwrap();
        let _ = dec.update(&ct).unwrap();
        match dec.finalize() {
            Err(EngineError::BadPadding) => {}
            Ok(plain) => assert_ne!(plain, b"hello world"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn finalized_engine_refuses_more_input() {
        let mut enc = AesCbcEncryptor::new(&KEY, &IV).unwrap();
        enc.finalize().unwrap();
        assert_eq!(enc.update(b"x").unwrap_err(), EngineError::Finalized);
        assert_eq!(enc.finalize().unwrap_err(), EngineError::Finalized);
    }

    #[test]
    fn bad_key_length_fails_context_creation() {
        assert_eq!(
            AesCbcEncryptor::new(&[0u8; 31], &IV).err(),
            Some(EngineError::ContextCreation)
        );
        assert_eq!(
            AesCbcDecryptor::new(&KEY, &[0u8; 8]).err(),
            Some(EngineError::ContextCreation)
        );
    }
}
