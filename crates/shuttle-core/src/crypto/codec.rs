//! Streaming encrypt-then-MAC envelope codec.
//!
//! Envelope layout:
//!   iv(16) ∥ AES-CBC ciphertext (PKCS#7 padded) ∥ HMAC-SHA256 tag(32)
//!
//! The tag covers `iv ∥ ciphertext`. The content digest is SHA-256 over the
//! whole envelope including the tag, so a receiver can pin the exact bytes it
//! expects to see before it has seen any of them.
//!
//! Neither direction buffers the payload. `EncryptingReader` pulls plaintext
//! from an inner reader on demand; `DecryptingWriter` pushes plaintext into an
//! inner writer as ciphertext arrives, holding back only the trailing tag.
//! Plaintext written to the sink before `finish` succeeds is unauthenticated
//! and must be discarded on error.

use std::fmt;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use super::engine::{
    pkcs7_padded_len, AesCbcDecryptor, AesCbcEncryptor, CipherEngine, EngineError, IV_LEN,
};
use super::integrity::{verify_tag, RunningDigest, RunningHmac, DIGEST_LEN, TAG_LEN};
use super::key::{random_bytes, KeyError, KeyMaterial};

/// Plaintext pulled from the inner reader per refill.
const READ_CHUNK: usize = 16 * 1024;

/// Total envelope length for a plaintext of `plain_len` bytes.
pub const fn envelope_len(plain_len: u64) -> u64 {
    IV_LEN as u64 + pkcs7_padded_len(plain_len) + TAG_LEN as u64
}

// ── ContentDigest ─────────────────────────────────────────────────────────────

/// SHA-256 over a complete envelope. Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(pub [u8; DIGEST_LEN]);

impl ContentDigest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &ContentDigest) -> bool {
        verify_tag(&self.0, &other.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({self})")
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&text).map_err(|e| format!("invalid digest hex: {e}"))?;
        let arr: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("digest must be {DIGEST_LEN} bytes, got {}", v.len()))?;
        Ok(ContentDigest(arr))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> String {
        d.to_string()
    }
}

// ── Encrypting reader ─────────────────────────────────────────────────────────

enum EncryptState {
    /// Nothing emitted yet. The IV is drawn on the first read.
    Pending(KeyMaterial),
    Streaming {
        engine: Box<dyn CipherEngine + Send>,
        hmac: RunningHmac,
        digest: RunningDigest,
    },
    Done(ContentDigest),
    Failed,
}

/// Wraps a plaintext reader and yields the envelope bytes.
pub struct EncryptingReader<R> {
    inner: R,
    state: EncryptState,
    out: Vec<u8>,
    out_pos: usize,
    scratch: Vec<u8>,
}

impl<R: Read> EncryptingReader<R> {
    pub fn new(key: &KeyMaterial, inner: R) -> Self {
        Self {
            inner,
            state: EncryptState::Pending(key.clone()),
            out: Vec::new(),
            out_pos: 0,
            scratch: vec![0u8; READ_CHUNK],
        }
    }

    /// Digest of the full envelope. `None` until the reader has returned EOF.
    pub fn final_digest(&self) -> Option<ContentDigest> {
        match &self.state {
            EncryptState::Done(d) => Some(*d),
            _ => None,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Refill `out`. Returns false once the envelope is complete.
    fn advance(&mut self) -> Result<bool, CodecError> {
        self.out.clear();
        self.out_pos = 0;

        match &mut self.state {
            EncryptState::Pending(key) => {
                let iv = random_bytes::<IV_LEN>()?;
                let engine = AesCbcEncryptor::new(key.cipher_key(), &iv[..])?;
                let mut hmac = RunningHmac::new(key.mac_key());
                let mut digest = RunningDigest::new();
                hmac.update(&iv[..]);
                digest.update(&iv[..]);
                self.out.extend_from_slice(&iv[..]);
                self.state = EncryptState::Streaming {
                    engine: Box::new(engine),
                    hmac,
                    digest,
                };
                Ok(true)
            }
            EncryptState::Streaming {
                engine,
                hmac,
                digest,
            } => {
                let n = match self.inner.read(&mut self.scratch) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(true),
                    Err(e) => return Err(CodecError::Io(e)),
                };

                if n > 0 {
                    let ct = engine.update(&self.scratch[..n])?;
                    hmac.update(&ct);
                    digest.update(&ct);
                    self.out = ct;
                    return Ok(true);
                }

                let ct = engine.finalize()?;
                hmac.update(&ct);
                digest.update(&ct);
                self.out = ct;

                let EncryptState::Streaming { hmac, digest, .. } =
                    std::mem::replace(&mut self.state, EncryptState::Failed)
                else {
                    return Err(CodecError::Aborted);
                };
                let tag = hmac.finish();
                let mut digest = digest;
                digest.update(&tag);
                self.out.extend_from_slice(&tag);
                self.state = EncryptState::Done(ContentDigest(digest.finish()));
                Ok(true)
            }
            EncryptState::Done(_) => Ok(false),
            EncryptState::Failed => Err(CodecError::Aborted),
        }
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.out_pos == self.out.len() {
            match self.advance() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(e) => {
                    self.state = EncryptState::Failed;
                    return Err(e.into());
                }
            }
        }
        let n = buf.len().min(self.out.len() - self.out_pos);
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

// ── Decrypting writer ─────────────────────────────────────────────────────────

struct DecryptContext {
    engine: Box<dyn CipherEngine + Send>,
    hmac: RunningHmac,
    digest: RunningDigest,
}

/// Accepts envelope bytes in arbitrary slices and writes plaintext to `sink`.
pub struct DecryptingWriter<W> {
    sink: W,
    key: KeyMaterial,
    iv: Vec<u8>,
    ctx: Option<DecryptContext>,
    /// Unprocessed input; the trailing `TAG_LEN` bytes are never fed to the cipher.
    held: Vec<u8>,
    consumed: u64,
    expected: Option<ContentDigest>,
    failed: bool,
}

impl<W: Write> DecryptingWriter<W> {
    pub fn new(key: &KeyMaterial, sink: W) -> Self {
        Self {
            sink,
            key: key.clone(),
            iv: Vec::with_capacity(IV_LEN),
            ctx: None,
            held: Vec::new(),
            consumed: 0,
            expected: None,
            failed: false,
        }
    }

    /// Digest the finished envelope must match. Usually announced by the
    /// sender through an already-authenticated side channel.
    pub fn set_expected_digest(&mut self, digest: ContentDigest) {
        self.expected = Some(digest);
    }

    /// Ciphertext bytes fed to the cipher so far (excluding IV and held tag).
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), CodecError> {
        if self.failed {
            return Err(CodecError::Aborted);
        }
        let result = self.absorb(data);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn absorb(&mut self, mut data: &[u8]) -> Result<(), CodecError> {
        if self.ctx.is_none() {
            let take = (IV_LEN - self.iv.len()).min(data.len());
            self.iv.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.iv.len() < IV_LEN {
                return Ok(());
            }
            let engine = AesCbcDecryptor::new(self.key.cipher_key(), &self.iv)?;
            let mut hmac = RunningHmac::new(self.key.mac_key());
            let mut digest = RunningDigest::new();
            hmac.update(&self.iv);
            digest.update(&self.iv);
            self.ctx = Some(DecryptContext {
                engine: Box::new(engine),
                hmac,
                digest,
            });
        }

        self.held.extend_from_slice(data);
        if self.held.len() <= TAG_LEN {
            return Ok(());
        }

        let feed = self.held.len() - TAG_LEN;
        let ctx = self.ctx.as_mut().ok_or(CodecError::Aborted)?;
        let ct = &self.held[..feed];
        ctx.hmac.update(ct);
        ctx.digest.update(ct);
        let plain = ctx.engine.update(ct)?;
        self.consumed += feed as u64;
        self.held.drain(..feed);
        self.sink.write_all(&plain)?;
        Ok(())
    }

    /// Verify the tag (and digest, if expected) and flush the last block.
    pub fn finish(mut self) -> Result<(W, ContentDigest), CodecError> {
        if self.failed {
            return Err(CodecError::Aborted);
        }
        let Some(ctx) = self.ctx.take() else {
            return Err(CodecError::UnexpectedEnding);
        };
        if self.held.len() != TAG_LEN {
            return Err(CodecError::UnexpectedEnding);
        }

        let DecryptContext {
            mut engine,
            hmac,
            mut digest,
        } = ctx;

        let tag = hmac.finish();
        if !verify_tag(&tag, &self.held) {
            return Err(CodecError::HmacInconsistency);
        }

        // The tag is authentic, so a padding failure means the sender itself
        // produced a malformed envelope. Still an authenticity failure.
        let last = engine.finalize().map_err(|e| match e {
            EngineError::BadPadding | EngineError::IncompleteBlock(_) => {
                CodecError::HmacInconsistency
            }
            other => CodecError::Engine(other),
        })?;
        self.sink.write_all(&last)?;
        self.sink.flush()?;

        digest.update(&self.held);
        let actual = ContentDigest(digest.finish());
        if let Some(expected) = &self.expected {
            if !expected.matches(&actual) {
                return Err(CodecError::DigestInconsistency);
            }
        }
        Ok((self.sink, actual))
    }
}

impl<W: Write> Write for DecryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

// ── One-shot helpers ──────────────────────────────────────────────────────────

/// Encrypt `plaintext` into a complete envelope.
pub fn seal(key: &KeyMaterial, plaintext: &[u8]) -> Result<(Vec<u8>, ContentDigest), CodecError> {
    let mut reader = EncryptingReader::new(key, plaintext);
    let mut envelope = Vec::with_capacity(envelope_len(plaintext.len() as u64) as usize);
    reader
        .read_to_end(&mut envelope)
        .map_err(codec_error_from_io)?;
    let digest = reader.final_digest().ok_or(CodecError::Aborted)?;
    Ok((envelope, digest))
}

/// Decrypt and authenticate a complete envelope.
pub fn open(
    key: &KeyMaterial,
    envelope: &[u8],
    expected: Option<&ContentDigest>,
) -> Result<(Vec<u8>, ContentDigest), CodecError> {
    let capacity = envelope.len().saturating_sub(IV_LEN + TAG_LEN);
    let mut writer = DecryptingWriter::new(key, Vec::with_capacity(capacity));
    if let Some(d) = expected {
        writer.set_expected_digest(*d);
    }
    writer.write_chunk(envelope)?;
    writer.finish()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("envelope ended unexpectedly")]
    UnexpectedEnding,

    #[error("envelope HMAC does not match")]
    HmacInconsistency,

    #[error("envelope digest does not match")]
    DigestInconsistency,

    #[error("codec stream aborted by an earlier error")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    pub fn is_authenticity_failure(&self) -> bool {
        matches!(self, Self::HmacInconsistency | Self::DigestInconsistency)
    }
}

impl From<CodecError> for io::Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Recover a `CodecError` that travelled through an `io::Error`.
pub fn codec_error_from_io(e: io::Error) -> CodecError {
    if e.get_ref().map_or(false, |inner| inner.is::<CodecError>()) {
        if let Some(inner) = e.into_inner() {
            if let Ok(codec) = inner.downcast::<CodecError>() {
                return *codec;
            }
        }
        return CodecError::Aborted;
    }
    CodecError::Io(e)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
