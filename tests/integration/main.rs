//! Shuttle integration test harness.
//!
//! Every test runs a real sender and receiver over loopback TCP with an
//! in-memory snapshot on each end. No root, no network namespaces.
//!
//!   cargo test --test integration

use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use uuid::Uuid;

use shuttle_core::config::ShuttleConfig;
use shuttle_core::{ContentDigest, KeyMaterial, TypedRecord};
use shuttle_transfer::{
    PairingCredentials, TransferClient, TransferError, TransferItem, TransferServer, TransferSink,
    TransferSource, TransferState,
};

mod pairing;
mod tampering;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const USER: &str = "alice";
pub const CODE: u16 = 417;

/// Upper bound for any single session in these tests.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Loopback-only config with fast progress reports.
pub fn test_config() -> ShuttleConfig {
    let mut config = ShuttleConfig::default();
    config.identity.user_id = USER.to_string();
    config.network.bind_address = Ipv4Addr::LOCALHOST.into();
    config.network.probe_permission = false;
    config.transfer.progress_interval_ms = 20;
    config.transfer.receive_timeout_secs = 10;
    config.transfer.wait_timeout_secs = 2;
    config
}

pub fn test_key() -> KeyMaterial {
    KeyMaterial::generate().expect("OS randomness")
}

/// Deterministic, non-repeating-ish attachment content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

// ── In-memory snapshot ────────────────────────────────────────────────────────

pub enum Item {
    Record(TypedRecord),
    Attachment(Uuid, Vec<u8>),
}

pub struct MemorySource {
    items: VecDeque<Item>,
    total: u64,
}

impl MemorySource {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            total: items.len() as u64,
            items: items.into(),
        }
    }
}

impl TransferSource for MemorySource {
    fn total_count(&self) -> u64 {
        self.total
    }

    fn next_item(&mut self) -> io::Result<Option<TransferItem>> {
        Ok(self.items.pop_front().map(|item| match item {
            Item::Record(record) => TransferItem::Record(record),
            Item::Attachment(id, data) => TransferItem::Attachment {
                id,
                length: data.len() as u64,
                reader: Box::new(Cursor::new(data)),
            },
        }))
    }
}

#[derive(Default)]
pub struct Received {
    pub records: Vec<TypedRecord>,
    pub attachments: HashMap<Uuid, Vec<u8>>,
    pub committed: Vec<Uuid>,
    pub discarded: Vec<Uuid>,
    pub finished: bool,
}

struct SharedBuf(Arc<Mutex<Received>>, Uuid);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .attachments
            .entry(self.1)
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that keeps everything in memory. Clones share the same store.
#[derive(Clone, Default)]
pub struct MemorySink(pub Arc<Mutex<Received>>);

impl TransferSink for MemorySink {
    fn import_record(&mut self, record: TypedRecord) -> io::Result<()> {
        self.0.lock().records.push(record);
        Ok(())
    }

    fn create_attachment(&mut self, id: Uuid, _length: u64) -> io::Result<Box<dyn Write + Send>> {
        self.0.lock().attachments.insert(id, Vec::new());
        Ok(Box::new(SharedBuf(self.0.clone(), id)))
    }

    fn commit_attachment(&mut self, id: Uuid, _digest: &ContentDigest) -> io::Result<()> {
        self.0.lock().committed.push(id);
        Ok(())
    }

    fn discard_attachment(&mut self, id: Uuid) {
        let mut received = self.0.lock();
        received.attachments.remove(&id);
        received.discarded.push(id);
    }

    fn finish(&mut self) -> io::Result<()> {
        self.0.lock().finished = true;
        Ok(())
    }
}

// ── Session driver ────────────────────────────────────────────────────────────

pub struct Side {
    pub config: ShuttleConfig,
    pub key: KeyMaterial,
    pub credentials: PairingCredentials,
}

impl Side {
    pub fn new(key: &KeyMaterial) -> Self {
        Self {
            config: test_config(),
            key: key.clone(),
            credentials: PairingCredentials::new(USER, CODE),
        }
    }
}

pub struct Outcome {
    pub server: Result<(), TransferError>,
    pub client: Result<(), TransferError>,
    pub server_state: TransferState,
    pub client_state: TransferState,
}

/// Run one sender/receiver session. `route` maps the server's port to the
/// address the client dials, so a test can put a relay in between.
pub async fn run_session_via<F, Fut>(
    sender: Side,
    receiver: Side,
    source: MemorySource,
    sink: MemorySink,
    route: F,
) -> Result<Outcome>
where
    F: FnOnce(SocketAddr) -> Fut,
    Fut: std::future::Future<Output = Result<SocketAddr>>,
{
    let mut server = TransferServer::new(sender.config, sender.key, sender.credentials);
    let port = server.prepare().await.context("prepare")?;
    assert_eq!(server.state().current(), TransferState::Ready);

    let server_state = server.state();
    let server_task = tokio::spawn(server.run(source));

    let addr = route(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
    let client = TransferClient::new(receiver.config, receiver.key, receiver.credentials);
    let client_state = client.state();
    let client = tokio::time::timeout(SESSION_TIMEOUT, client.run(addr, sink))
        .await
        .context("client timed out")?;

    let server = tokio::time::timeout(SESSION_TIMEOUT, server_task)
        .await
        .context("server timed out")?
        .context("server task panicked")?;

    Ok(Outcome {
        server,
        client,
        server_state: server_state.current(),
        client_state: client_state.current(),
    })
}

pub async fn run_session(
    sender: Side,
    receiver: Side,
    source: MemorySource,
    sink: MemorySink,
) -> Result<Outcome> {
    run_session_via(sender, receiver, source, sink, |addr| async move { Ok(addr) }).await
}
