//! Shuttle wire format — on-wire types for the device transfer channel.
//!
//! Every frame on the transfer socket has the same shape:
//!
//!   kind(1) ∥ length(4, BE) ∥ payload(length) ∥ crc32(4, BE) ∥ hmac(32)
//!
//! The CRC catches corruption cheaply; the HMAC, keyed with the session MAC
//! key, catches tampering. Both cover the payload only. Headers and trailers
//! are zerocopy structs with explicit big-endian integers, so there is no
//! unsafe code and no manual byte shuffling in this module.
//!
//! Changing anything here is a breaking protocol change.

pub mod command;
pub mod frame;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub use command::{Command, Platform, RecordType, TypedRecord};
pub use frame::{Frame, FrameDecoder, FrameEncoder};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Precedes every payload.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// One of `FrameKind`. Unknown values are a framing error.
    pub kind: u8,

    /// Payload length in bytes. At most `MAX_PAYLOAD`.
    pub length: U32<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 5]);

impl FrameHeader {
    pub fn new(kind: FrameKind, length: u32) -> Self {
        Self {
            kind: kind.into(),
            length: U32::new(length),
        }
    }
}

// ── Frame Trailer ─────────────────────────────────────────────────────────────

/// Follows every payload.
///
/// Wire size: 36 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameTrailer {
    /// CRC32 (IEEE) of the payload.
    pub crc32: U32<BigEndian>,

    /// HMAC-SHA256 of the payload under the session MAC key.
    pub mac: [u8; 32],
}

assert_eq_size!(FrameTrailer, [u8; 36]);

// ── Frame Kind ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Sealed JSON `Command`.
    Command = 0x01,

    /// Sealed JSON `TypedRecord`.
    Record = 0x02,

    /// `file_id(16) ∥ envelope slice` of a streaming attachment.
    File = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Command),
            0x02 => Ok(FrameKind::Record),
            0x03 => Ok(FrameKind::File),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum payload size in bytes (500 KiB).
pub const MAX_PAYLOAD: usize = 500 * 1024;

pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

pub const TRAILER_LEN: usize = std::mem::size_of::<FrameTrailer>();

/// Length of the file id prefix carried by `FrameKind::File` payloads.
pub const FILE_ID_LEN: usize = 16;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("CRC mismatch: local {local:08x}, remote {remote:08x}")]
    ChecksumMismatch { local: u32, remote: u32 },

    #[error("frame HMAC mismatch")]
    HmacMismatch,

    #[error("stream ended inside a frame ({0} bytes buffered)")]
    Truncated(usize),

    #[error("file frame shorter than its id")]
    MissingFileId,

    #[error("decoder poisoned by an earlier error")]
    Poisoned,
}

impl FrameError {
    pub fn is_authenticity_failure(&self) -> bool {
        matches!(self, Self::HmacMismatch)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let header = FrameHeader::new(FrameKind::Record, 0x0102_0304);
        assert_eq!(header.as_bytes(), &[0x02, 0x01, 0x02, 0x03, 0x04]);

        let back = FrameHeader::read_from(header.as_bytes()).unwrap();
        assert_eq!(back.kind, 0x02);
        assert_eq!(back.length.get(), 0x0102_0304);
    }

    #[test]
    fn trailer_round_trip() {
        let trailer = FrameTrailer {
            crc32: U32::new(0xdead_beef),
            mac: [0x5a; 32],
        };
        let bytes = trailer.as_bytes();
        assert_eq!(bytes.len(), TRAILER_LEN);
        assert_eq!(&bytes[..4], &[0xde, 0xad, 0xbe, 0xef]);

        let back = FrameTrailer::read_from(bytes).unwrap();
        assert_eq!(back.crc32.get(), 0xdead_beef);
        assert_eq!(back.mac, [0x5a; 32]);
    }

    #[test]
    fn kind_round_trip() {
        for kind in [FrameKind::Command, FrameKind::Record, FrameKind::File] {
            assert_eq!(FrameKind::try_from(u8::from(kind)).unwrap(), kind);
        }
        assert_eq!(FrameKind::try_from(0x00), Err(FrameError::UnknownKind(0)));
        assert_eq!(FrameKind::try_from(0x04), Err(FrameError::UnknownKind(4)));
    }

    #[test]
    fn unknown_kind_error_message() {
        let err = FrameKind::try_from(0xAB).unwrap_err();
        assert!(err.to_string().contains("0xab"));
    }

    #[test]
    fn only_hmac_mismatch_is_authenticity() {
        assert!(FrameError::HmacMismatch.is_authenticity_failure());
        assert!(!FrameError::ChecksumMismatch { local: 1, remote: 2 }.is_authenticity_failure());
        assert!(!FrameError::Truncated(3).is_authenticity_failure());
    }
}
