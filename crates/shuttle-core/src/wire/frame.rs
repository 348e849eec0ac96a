//! Frame encoding and incremental decoding.
//!
//! `FrameEncoder` turns a payload into a complete frame. `FrameDecoder`
//! accepts bytes in whatever slices the socket hands over and yields whole,
//! verified frames. Once a decoder reports an error it is poisoned: the
//! stream position is no longer trustworthy, so the connection must close.

use bytes::{Buf, Bytes, BytesMut};
use zerocopy::byteorder::U32;
use zerocopy::{AsBytes, FromBytes};

use super::{FrameError, FrameHeader, FrameKind, FrameTrailer, HEADER_LEN, MAX_PAYLOAD, TRAILER_LEN};
use crate::crypto::integrity::{checksum, hmac_sha256, verify_tag};

/// A verified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

// ── Encoder ───────────────────────────────────────────────────────────────────

pub struct FrameEncoder {
    mac_key: [u8; 32],
}

impl FrameEncoder {
    pub fn new(mac_key: &[u8; 32]) -> Self {
        Self { mac_key: *mac_key }
    }

    pub fn encode(&self, kind: FrameKind, payload: &[u8]) -> Result<Bytes, FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        let header = FrameHeader::new(kind, payload.len() as u32);
        let trailer = FrameTrailer {
            crc32: U32::new(checksum(payload) as u32),
            mac: hmac_sha256(&self.mac_key, payload),
        };

        let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out.extend_from_slice(trailer.as_bytes());
        Ok(out.freeze())
    }
}

impl Drop for FrameEncoder {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.mac_key);
    }
}

// ── Decoder ───────────────────────────────────────────────────────────────────

pub struct FrameDecoder {
    mac_key: [u8; 32],
    buf: BytesMut,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new(mac_key: &[u8; 32]) -> Self {
        Self {
            mac_key: *mac_key,
            buf: BytesMut::new(),
            poisoned: false,
        }
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, or `None` if more input is needed.
    ///
    /// CRC is checked before the HMAC so accidental corruption is reported
    /// as such rather than as tampering.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        match self.decode_one() {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Call at end of stream. Leftover bytes mean the peer stopped mid-frame.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated(self.buf.len()))
        }
    }

    fn decode_one(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(header) = FrameHeader::read_from_prefix(&self.buf[..]) else {
            return Ok(None);
        };
        let kind = FrameKind::try_from(header.kind)?;
        let length = header.length.get() as usize;
        if length > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(length));
        }

        let total = HEADER_LEN + length + TRAILER_LEN;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(length).freeze();
        let trailer_bytes = self.buf.split_to(TRAILER_LEN);
        let trailer = FrameTrailer::read_from(&trailer_bytes[..]).ok_or(FrameError::Truncated(trailer_bytes.len()))?;

        let local = checksum(&payload) as u32;
        let remote = trailer.crc32.get();
        if local != remote {
            return Err(FrameError::ChecksumMismatch { local, remote });
        }
        let mac = hmac_sha256(&self.mac_key, &payload);
        if !verify_tag(&mac, &trailer.mac) {
            return Err(FrameError::HmacMismatch);
        }

        Ok(Some(Frame { kind, payload }))
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.mac_key);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
