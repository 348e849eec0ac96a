//! Transfer session state machine.
//!
//!   preparing → ready → connected → transporting(processed, total)
//!             → importing(fraction) → finished
//!
//! Any state except `failed` and `closed` may move to `failed(reason)`, and
//! every state may move to `closed`. Nothing leaves `closed`. Progress
//! counters never go backwards.
//!
//! `SessionState` publishes the current state through a `tokio::sync::watch`
//! channel so a UI (or a test) can follow along without polling.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Preparing,
    Ready,
    Connected,
    Transporting { processed: u64, total: u64 },
    Importing { fraction: f64 },
    Finished,
    Failed(FailureReason),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The receiver is signed in to a different account.
    MismatchedUserId,
    /// The receiver presented the wrong connection code.
    MismatchedCode,
    Exception(Fault),
    /// The connection ended after every frame was sent but before the peer
    /// acknowledged the finish.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Frame CRC mismatch or malformed frame.
    Corrupted,
    /// Frame HMAC, envelope HMAC or digest mismatch.
    Tampered,
    ConnectionLost,
    LocalNetworkDenied,
    /// Peer sent something out of order.
    Protocol,
    /// The sink failed to import a record or attachment.
    Import,
    Cancelled,
    Io,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed(_) | Self::Closed)
    }

    pub fn can_transition_to(&self, next: &TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Failed(_), _) => false,
            (_, Failed(_)) => true,

            (Preparing, Ready) => true,
            (Ready, Connected) => true,
            (Connected, Transporting { .. }) => true,
            (
                Transporting { processed: p0, total: t0 },
                Transporting { processed: p1, total: t1 },
            ) => t0 == t1 && p1 >= p0,
            (Transporting { .. }, Importing { fraction }) => (0.0..=1.0).contains(fraction),
            (Transporting { .. }, Finished) => true,
            (Importing { fraction: f0 }, Importing { fraction: f1 }) => {
                f1 >= f0 && (0.0..=1.0).contains(f1)
            }
            (Importing { .. }, Finished) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => f.write_str("preparing"),
            Self::Ready => f.write_str("ready"),
            Self::Connected => f.write_str("connected"),
            Self::Transporting { processed, total } => {
                write!(f, "transporting({processed}/{total})")
            }
            Self::Importing { fraction } => write!(f, "importing({:.0}%)", fraction * 100.0),
            Self::Finished => f.write_str("finished"),
            Self::Failed(reason) => write!(f, "failed({reason:?})"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

// ── SessionState ──────────────────────────────────────────────────────────────

/// Shared, observable state of one transfer session.
#[derive(Clone)]
pub struct SessionState {
    tx: Arc<watch::Sender<TransferState>>,
}

impl SessionState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TransferState::Preparing);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> TransferState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Re-entering the identical state is a no-op.
    pub fn advance(&self, next: TransferState) -> Result<(), StateError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                result = Err(StateError::IllegalTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
                return false;
            }
            tracing::debug!(from = %current, to = %next, "transfer state");
            *current = next.clone();
            true
        });
        result
    }

    /// Record a failure. Returns false if the session had already failed or
    /// closed, in which case the first reason stands.
    pub fn fail(&self, reason: FailureReason) -> bool {
        match self.advance(TransferState::Failed(reason)) {
            Ok(()) => {
                tracing::warn!(reason = ?reason, "transfer failed");
                true
            }
            Err(_) => false,
        }
    }

    pub fn close(&self) {
        let _ = self.advance(TransferState::Closed);
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("illegal state transition {from} → {to}")]
    IllegalTransition { from: String, to: String },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
