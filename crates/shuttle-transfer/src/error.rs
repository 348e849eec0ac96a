//! Errors shared by the transfer server and client.

use std::io;

use shuttle_core::{CodecError, FrameError, KeyError};

use crate::setup::SetupError;
use crate::state::{FailureReason, Fault, StateError};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("payload error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("source failed: {0}")]
    Source(io::Error),

    #[error("import failed: {0}")]
    Import(io::Error),

    #[error("pairing rejected: {0:?}")]
    Rejected(FailureReason),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("local network access denied")]
    LocalNetworkDenied,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("peer cancelled the transfer")]
    RemoteCancelled,

    #[error("no data from peer for {0}s")]
    Timeout(u64),

    #[error(transparent)]
    State(#[from] StateError),
}

impl TransferError {
    pub fn is_authenticity_failure(&self) -> bool {
        match self {
            Self::Frame(e) => e.is_authenticity_failure(),
            Self::Codec(e) => e.is_authenticity_failure(),
            _ => false,
        }
    }

    /// The reason a session that hit this error ends up `failed` with.
    pub fn failure_reason(&self) -> FailureReason {
        let fault = match self {
            Self::Rejected(reason) => return *reason,
            _ if self.is_authenticity_failure() => Fault::Tampered,
            Self::Frame(_) | Self::Codec(_) => Fault::Corrupted,
            Self::Json(_) | Self::Protocol(_) | Self::State(_) => Fault::Protocol,
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout(_) => Fault::ConnectionLost,
            Self::Import(_) => Fault::Import,
            Self::LocalNetworkDenied => Fault::LocalNetworkDenied,
            Self::RemoteCancelled => Fault::Cancelled,
            Self::Setup(_) | Self::Key(_) | Self::Source(_) => Fault::Io,
        };
        FailureReason::Exception(fault)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
