//! Framed, sealed messages over the transfer socket.
//!
//! Outbound: commands and records are serialized to JSON, sealed into an
//! envelope under the session key, then framed. File frames carry
//! `file_id ∥ envelope slice` unsealed, since the slice is already part of
//! the attachment's own envelope.
//!
//! Inbound: `FrameReader` pulls bytes off the socket, verifies each frame's
//! CRC and HMAC, opens sealed payloads and yields `Inbound` messages.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use shuttle_core::crypto::{open, seal};
use shuttle_core::wire::{FrameDecoder, FrameEncoder, FILE_ID_LEN};
use shuttle_core::{Command, Frame, FrameError, FrameKind, KeyMaterial, TypedRecord};

use crate::error::TransferError;
use crate::speed::SpeedTester;

const READ_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(Command),
    Record(TypedRecord),
    FileChunk { id: Uuid, data: Bytes },
}

// ── Outbound ──────────────────────────────────────────────────────────────────

pub struct FrameSealer {
    key: KeyMaterial,
    encoder: FrameEncoder,
}

impl FrameSealer {
    pub fn new(key: &KeyMaterial) -> Self {
        Self {
            key: key.clone(),
            encoder: FrameEncoder::new(key.mac_key()),
        }
    }

    pub fn command_frame(&self, command: &Command) -> Result<Bytes, TransferError> {
        let json = serde_json::to_vec(command)?;
        let (sealed, _) = seal(&self.key, &json)?;
        Ok(self.encoder.encode(FrameKind::Command, &sealed)?)
    }

    /// Fails with `FrameError::PayloadTooLarge` if the sealed record does
    /// not fit in one frame.
    pub fn record_frame(&self, record: &TypedRecord) -> Result<Bytes, TransferError> {
        let json = serde_json::to_vec(record)?;
        let (sealed, _) = seal(&self.key, &json)?;
        Ok(self.encoder.encode(FrameKind::Record, &sealed)?)
    }

    pub fn file_frame(&self, id: Uuid, slice: &[u8]) -> Result<Bytes, TransferError> {
        let mut payload = BytesMut::with_capacity(FILE_ID_LEN + slice.len());
        payload.put_slice(id.as_bytes());
        payload.put_slice(slice);
        Ok(self.encoder.encode(FrameKind::File, &payload)?)
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

pub struct FrameOpener {
    key: KeyMaterial,
}

impl FrameOpener {
    pub fn new(key: &KeyMaterial) -> Self {
        Self { key: key.clone() }
    }

    pub fn open(&self, frame: Frame) -> Result<Inbound, TransferError> {
        match frame.kind {
            FrameKind::Command => {
                let (json, _) = open(&self.key, &frame.payload, None)?;
                Ok(Inbound::Command(serde_json::from_slice(&json)?))
            }
            FrameKind::Record => {
                let (json, _) = open(&self.key, &frame.payload, None)?;
                Ok(Inbound::Record(serde_json::from_slice(&json)?))
            }
            FrameKind::File => {
                if frame.payload.len() < FILE_ID_LEN {
                    return Err(FrameError::MissingFileId.into());
                }
                let mut id = [0u8; FILE_ID_LEN];
                id.copy_from_slice(&frame.payload[..FILE_ID_LEN]);
                Ok(Inbound::FileChunk {
                    id: Uuid::from_bytes(id),
                    data: frame.payload.slice(FILE_ID_LEN..),
                })
            }
        }
    }
}

/// Reads and verifies frames from one half of the socket.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    opener: FrameOpener,
    buf: Vec<u8>,
    idle_timeout: Option<Duration>,
    speed: Option<SpeedTester>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, key: &KeyMaterial) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(key.mac_key()),
            opener: FrameOpener::new(key),
            buf: vec![0u8; READ_BUF],
            idle_timeout: None,
            speed: None,
        }
    }

    /// Fail with `Timeout` if the peer sends nothing for this long.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Record received bytes on `speed`.
    pub fn with_speed(mut self, speed: SpeedTester) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Next message, or `None` on a clean end of stream.
    pub async fn next(&mut self) -> Result<Option<Inbound>, TransferError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return self.opener.open(frame).map(Some);
            }

            let read = self.reader.read(&mut self.buf);
            let n = match self.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .map_err(|_| TransferError::Timeout(limit.as_secs()))??,
                None => read.await?,
            };
            if n == 0 {
                self.decoder.finish()?;
                return Ok(None);
            }
            if let Some(speed) = &self.speed {
                speed.record(n as u64);
            }
            self.decoder.push(&self.buf[..n]);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
