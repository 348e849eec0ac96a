//! Transfer commands and typed records.
//!
//! Both travel as JSON, sealed with the session key, inside `Command` and
//! `Record` frames respectively. Record bodies are opaque to the channel;
//! only the `type` discriminator is interpreted, and only by the sink.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::ContentDigest;

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Receiver → sender, first frame on the connection.
    Connect {
        code: u16,
        user_id: String,
        platform: Platform,
    },

    /// Sender → receiver, once the pairing check passed.
    Start { total: u64 },

    /// Receiver → sender, periodic. `fraction` is in `[0, 1]`.
    Progress { fraction: f64 },

    /// Sender → receiver, precedes the `File` frames of one attachment.
    FileBegin { id: Uuid, length: u64 },

    /// Sender → receiver, after the last `File` frame of an attachment.
    FileEnd { id: Uuid, digest: ContentDigest },

    /// Sender → receiver when everything is sent; echoed back once received.
    Finish,

    /// Either side, aborts the session.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Ios,
    Android,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            "windows" => Platform::Windows,
            "ios" => Platform::Ios,
            "android" => Platform::Android,
            _ => Platform::Other,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Conversation,
    Participant,
    User,
    App,
    Asset,
    Snapshot,
    Sticker,
    PinMessage,
    TranscriptMessage,
    Message,
    MessageMention,
    ExpiredMessage,
}

/// One entity of the snapshot, `{"type": ..., "data": ...}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedRecord {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub data: serde_json::Value,
}

impl TypedRecord {
    pub fn new(record_type: RecordType, data: serde_json::Value) -> Self {
        Self { record_type, data }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
