//! Capabilities the transfer endpoints are given instead of reaching into
//! global stores: where the snapshot comes from, where it goes, and who is
//! allowed to connect.
//!
//! Both traits are blocking. The server and client drive them from
//! `spawn_blocking` workers so a slow disk or database never stalls the
//! socket tasks.

use std::io::{self, Read, Write};

use shuttle_core::{ContentDigest, TypedRecord};
use uuid::Uuid;

/// One unit of the snapshot, in sending order.
pub enum TransferItem {
    Record(TypedRecord),
    /// An attachment's plaintext. The server encrypts it on the fly.
    Attachment {
        id: Uuid,
        length: u64,
        reader: Box<dyn Read + Send>,
    },
}

/// Sender side: yields everything that should be transferred.
pub trait TransferSource: Send {
    /// Number of items `next_item` will yield. Used for progress only.
    fn total_count(&self) -> u64;

    fn next_item(&mut self) -> io::Result<Option<TransferItem>>;
}

/// Receiver side: persists what arrives.
pub trait TransferSink: Send {
    fn import_record(&mut self, record: TypedRecord) -> io::Result<()>;

    /// Open a writer for an attachment's plaintext. Nothing written to it is
    /// trustworthy until `commit_attachment` is called.
    fn create_attachment(&mut self, id: Uuid, length: u64) -> io::Result<Box<dyn Write + Send>>;

    /// The attachment decrypted and verified against `digest`.
    fn commit_attachment(&mut self, id: Uuid, digest: &ContentDigest) -> io::Result<()>;

    /// The attachment failed verification or the transfer stopped midway.
    fn discard_attachment(&mut self, id: Uuid);

    /// Called once after the last item, before the session finishes.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// What the sender checks the receiver's `connect` command against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCredentials {
    pub user_id: String,
    /// Short code shown on the sending device, 0..=999.
    pub code: u16,
}

impl PairingCredentials {
    pub fn new(user_id: impl Into<String>, code: u16) -> Self {
        Self {
            user_id: user_id.into(),
            code,
        }
    }

    /// Fresh random code for a new session.
    pub fn generate(user_id: impl Into<String>) -> Self {
        use rand::Rng;
        Self::new(user_id, rand::thread_rng().gen_range(0..=999))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
