use serde_json::json;
use shuttle_core::RecordType;

use crate::*;

fn record(kind: RecordType, n: u64) -> TypedRecord {
    TypedRecord::new(kind, json!({ "id": n, "body": format!("record {n}") }))
}

/// Records and attachments arrive intact and in order; both ends finish.
#[tokio::test]
async fn test_snapshot_transfer_completes() -> Result<()> {
    let key = test_key();
    let small = Uuid::new_v4();
    let large = Uuid::new_v4();
    let large_body = pattern(300 * 1024 + 7, 3);

    let sent_records = vec![
        record(RecordType::User, 1),
        record(RecordType::Conversation, 2),
        record(RecordType::Message, 3),
    ];
    let mut items: Vec<Item> = sent_records.iter().cloned().map(Item::Record).collect();
    items.push(Item::Attachment(small, b"hello world".to_vec()));
    items.push(Item::Attachment(large, large_body.clone()));

    let sink = MemorySink::default();
    let outcome = run_session(
        Side::new(&key),
        Side::new(&key),
        MemorySource::new(items),
        sink.clone(),
    )
    .await?;

    outcome.server.context("server")?;
    outcome.client.context("client")?;
    assert_eq!(outcome.server_state, TransferState::Finished);
    assert_eq!(outcome.client_state, TransferState::Finished);

    let received = sink.0.lock();
    assert_eq!(received.records, sent_records);
    assert_eq!(received.committed, vec![small, large]);
    assert!(received.discarded.is_empty());
    assert!(received.finished);
    assert_eq!(received.attachments[&small], b"hello world");
    assert_eq!(received.attachments[&large], large_body);
    Ok(())
}

/// A tiny in-flight budget forces the sender to wait on the receiver's
/// socket drain for nearly every frame.
#[tokio::test]
async fn test_backpressure_with_small_budget() -> Result<()> {
    let key = test_key();
    let mut sender = Side::new(&key);
    sender.config.transfer.max_in_flight_bytes = 8 * 1024;
    sender.config.transfer.file_chunk_size = 4 * 1024;

    let mut items = Vec::new();
    let mut expected = HashMap::new();
    for seed in 0..4u8 {
        let id = Uuid::new_v4();
        let body = pattern(64 * 1024 + seed as usize * 1000, seed);
        expected.insert(id, body.clone());
        items.push(Item::Record(record(RecordType::Asset, seed as u64)));
        items.push(Item::Attachment(id, body));
    }

    let sink = MemorySink::default();
    let outcome = run_session(sender, Side::new(&key), MemorySource::new(items), sink.clone()).await?;
    outcome.server.context("server")?;
    outcome.client.context("client")?;

    let received = sink.0.lock();
    assert_eq!(received.records.len(), 4);
    assert_eq!(received.committed.len(), 4);
    for (id, body) in &expected {
        assert_eq!(&received.attachments[id], body, "attachment {id}");
    }
    Ok(())
}

/// Nothing to send still walks the whole state machine.
#[tokio::test]
async fn test_empty_snapshot_finishes() -> Result<()> {
    let key = test_key();
    let sink = MemorySink::default();
    let outcome = run_session(
        Side::new(&key),
        Side::new(&key),
        MemorySource::new(Vec::new()),
        sink.clone(),
    )
    .await?;

    outcome.server.context("server")?;
    outcome.client.context("client")?;
    assert_eq!(outcome.server_state, TransferState::Finished);
    assert_eq!(outcome.client_state, TransferState::Finished);
    assert!(sink.0.lock().finished);
    Ok(())
}

/// Records over the frame limit are skipped, the rest still goes through.
#[tokio::test]
async fn test_oversized_record_is_skipped() -> Result<()> {
    let key = test_key();
    let huge = TypedRecord::new(
        RecordType::TranscriptMessage,
        json!({ "content": "x".repeat(600 * 1024) }),
    );
    let items = vec![
        Item::Record(record(RecordType::User, 1)),
        Item::Record(huge),
        Item::Record(record(RecordType::Message, 2)),
    ];

    let sink = MemorySink::default();
    let outcome = run_session(Side::new(&key), Side::new(&key), MemorySource::new(items), sink.clone()).await?;
    outcome.server.context("server")?;
    outcome.client.context("client")?;

    let received = sink.0.lock();
    assert_eq!(
        received.records,
        vec![record(RecordType::User, 1), record(RecordType::Message, 2)]
    );
    Ok(())
}

/// Sink whose first record import blocks for `stall`.
struct StallingSink {
    inner: MemorySink,
    stall: Option<Duration>,
}

impl TransferSink for StallingSink {
    fn import_record(&mut self, record: TypedRecord) -> io::Result<()> {
        if let Some(stall) = self.stall.take() {
            std::thread::sleep(stall);
        }
        self.inner.import_record(record)
    }

    fn create_attachment(&mut self, id: Uuid, length: u64) -> io::Result<Box<dyn Write + Send>> {
        self.inner.create_attachment(id, length)
    }

    fn commit_attachment(&mut self, id: Uuid, digest: &ContentDigest) -> io::Result<()> {
        self.inner.commit_attachment(id, digest)
    }

    fn discard_attachment(&mut self, id: Uuid) {
        self.inner.discard_attachment(id)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.finish()
    }
}

/// The receiver's import queue fills up behind a stalled sink. Progress
/// reports must keep the sender's idle timeout from firing meanwhile.
#[tokio::test]
async fn test_slow_sink_keeps_session_alive() -> Result<()> {
    let key = test_key();
    let mut sender = Side::new(&key);
    sender.config.transfer.receive_timeout_secs = 1;

    let items: Vec<Item> = (0..200)
        .map(|n| Item::Record(record(RecordType::Message, n)))
        .collect();

    let memory = MemorySink::default();
    let sink = StallingSink {
        inner: memory.clone(),
        stall: Some(Duration::from_millis(2500)),
    };

    let mut server = TransferServer::new(sender.config, sender.key, sender.credentials);
    let port = server.prepare().await.context("prepare")?;
    let server_state = server.state();
    let server_task = tokio::spawn(server.run(MemorySource::new(items)));

    let receiver = Side::new(&key);
    let client = TransferClient::new(receiver.config, receiver.key, receiver.credentials);
    let client_state = client.state();
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    tokio::time::timeout(SESSION_TIMEOUT, client.run(addr, sink))
        .await
        .context("client timed out")?
        .context("client")?;
    tokio::time::timeout(SESSION_TIMEOUT, server_task)
        .await
        .context("server timed out")?
        .context("server task panicked")?
        .context("server")?;

    assert_eq!(server_state.current(), TransferState::Finished);
    assert_eq!(client_state.current(), TransferState::Finished);
    assert_eq!(memory.0.lock().records.len(), 200);
    Ok(())
}
