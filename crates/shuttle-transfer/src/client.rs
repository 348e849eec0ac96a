//! Receiving side of a transfer session.
//!
//! The client connects to the sender, presents its pairing credentials and
//! then hands every record and attachment slice to an import worker running
//! on a blocking thread. The socket loop only decodes frames and reports
//! progress; decryption, verification and persistence all happen in the
//! worker, which owns the sink.
//!
//! After the sender's `finish`, the client echoes `finish` and waits for the
//! worker to drain, publishing `importing(fraction)` as it goes.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use shuttle_core::config::ShuttleConfig;
use shuttle_core::crypto::{CodecError, DecryptingWriter};
use shuttle_core::wire::Platform;
use shuttle_core::{Command, ContentDigest, KeyMaterial, TypedRecord};

use crate::channel::{FrameReader, FrameSealer, Inbound};
use crate::error::TransferError;
use crate::setup::check_permission;
use crate::source::{PairingCredentials, TransferSink};
use crate::speed::SpeedTester;
use crate::state::{SessionState, TransferState};

/// Jobs queued for the import worker before the socket loop blocks.
const IMPORT_QUEUE: usize = 64;

const IMPORT_POLL: Duration = Duration::from_millis(100);

enum Job {
    Record(TypedRecord),
    FileBegin { id: Uuid, length: u64 },
    FileChunk { id: Uuid, data: Bytes },
    FileEnd { id: Uuid, digest: ContentDigest },
    Finish,
}

pub struct TransferClient {
    config: ShuttleConfig,
    key: KeyMaterial,
    credentials: PairingCredentials,
    state: SessionState,
    speed: SpeedTester,
}

impl TransferClient {
    pub fn new(config: ShuttleConfig, key: KeyMaterial, credentials: PairingCredentials) -> Self {
        Self {
            config,
            key,
            credentials,
            state: SessionState::new(),
            speed: SpeedTester::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.clone()
    }

    pub fn speed(&self) -> SpeedTester {
        self.speed.clone()
    }

    /// Receive a full snapshot from `addr` into `sink`.
    pub async fn run<K>(self, addr: SocketAddr, sink: K) -> Result<(), TransferError>
    where
        K: TransferSink + 'static,
    {
        let result = self.receive(addr, sink).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "transfer client stopped");
            self.state.fail(e.failure_reason());
        }
        self.speed.stop();
        result
    }

    async fn receive<K>(&self, addr: SocketAddr, sink: K) -> Result<(), TransferError>
    where
        K: TransferSink + 'static,
    {
        if !check_permission(&self.config.network).await? {
            return Err(TransferError::LocalNetworkDenied);
        }
        self.state.advance(TransferState::Ready)?;

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        self.state.advance(TransferState::Connected)?;
        tracing::info!(addr = %addr, "connected to sender");

        let (read_half, mut write_half) = stream.into_split();
        let sealer = FrameSealer::new(&self.key);
        let mut reader = FrameReader::new(read_half, &self.key)
            .with_idle_timeout(self.config.transfer.receive_timeout())
            .with_speed(self.speed.clone());

        send(
            &mut write_half,
            &sealer,
            &Command::Connect {
                code: self.credentials.code,
                user_id: self.credentials.user_id.clone(),
                platform: Platform::current(),
            },
        )
        .await?;

        let total = match reader.next().await? {
            Some(Inbound::Command(Command::Start { total })) => total,
            Some(Inbound::Command(Command::Cancel)) => return Err(TransferError::RemoteCancelled),
            Some(_) => return Err(TransferError::Protocol("expected start".into())),
            None => return Err(TransferError::ConnectionClosed),
        };
        self.state.advance(TransferState::Transporting {
            processed: 0,
            total,
        })?;
        self.speed.start(self.config.transfer.progress_interval());
        tracing::info!(total, "transfer started");

        let imported = Arc::new(AtomicU64::new(0));
        let (jobs, job_rx) = mpsc::channel(IMPORT_QUEUE);
        let mut worker = {
            let key = self.key.clone();
            let imported = imported.clone();
            tokio::task::spawn_blocking(move || import_worker(sink, key, job_rx, imported))
        };

        let outcome = self
            .transport(&mut reader, &mut write_half, &sealer, &jobs, &mut worker, total)
            .await;

        let queued = match outcome {
            Ok(queued) => queued,
            Err(e) => {
                drop(jobs);
                if !matches!(
                    e,
                    TransferError::RemoteCancelled | TransferError::ConnectionClosed | TransferError::Io(_)
                ) {
                    let _ = send(&mut write_half, &sealer, &Command::Cancel).await;
                }
                return Err(e);
            }
        };

        // Everything is queued, including the worker's `Finish`.
        drop(jobs);
        send(&mut write_half, &sealer, &Command::Finish).await?;
        let _ = write_half.shutdown().await;

        self.state.advance(TransferState::Importing {
            fraction: fraction(imported.load(Ordering::Relaxed), queued),
        })?;
        let mut poll = tokio::time::interval(IMPORT_POLL);
        loop {
            tokio::select! {
                res = &mut worker => {
                    join_worker(res)?;
                    break;
                }
                _ = poll.tick() => {
                    let f = fraction(imported.load(Ordering::Relaxed), queued);
                    let _ = self.state.advance(TransferState::Importing { fraction: f });
                }
            }
        }

        let _ = self.state.advance(TransferState::Importing { fraction: 1.0 });
        self.state.advance(TransferState::Finished)?;
        tracing::info!(items = queued, "transfer finished");
        Ok(())
    }

    /// Socket loop. Returns the number of items queued for import once the
    /// sender's `finish` arrives and has been queued behind them.
    ///
    /// Progress keeps flowing while the loop waits for import queue space, so
    /// a slow sink never looks like a dead peer to the sender.
    async fn transport<R>(
        &self,
        reader: &mut FrameReader<R>,
        write_half: &mut OwnedWriteHalf,
        sealer: &FrameSealer,
        jobs: &mpsc::Sender<Job>,
        worker: &mut JoinHandle<Result<(), TransferError>>,
        total: u64,
    ) -> Result<u64, TransferError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut processed = 0u64;
        let mut progress = tokio::time::interval(self.config.transfer.progress_interval());
        progress.tick().await;

        loop {
            tokio::select! {
                res = &mut *worker => {
                    // The worker only stops early on failure.
                    join_worker(res)?;
                    return Err(TransferError::Protocol("import worker stopped early".into()));
                }
                _ = progress.tick() => self.report(write_half, sealer, processed, total).await?,
                msg = reader.next() => {
                    let (job, counts) = match msg? {
                        Some(Inbound::Record(record)) => (Job::Record(record), true),
                        Some(Inbound::FileChunk { id, data }) => (Job::FileChunk { id, data }, false),
                        Some(Inbound::Command(Command::FileBegin { id, length })) => {
                            (Job::FileBegin { id, length }, false)
                        }
                        Some(Inbound::Command(Command::FileEnd { id, digest })) => {
                            (Job::FileEnd { id, digest }, true)
                        }
                        Some(Inbound::Command(Command::Finish)) => (Job::Finish, false),
                        Some(Inbound::Command(Command::Cancel)) => return Err(TransferError::RemoteCancelled),
                        Some(Inbound::Command(other)) => {
                            return Err(TransferError::Protocol(format!("unexpected command: {other:?}")))
                        }
                        None => return Err(TransferError::ConnectionClosed),
                    };
                    let last = matches!(job, Job::Finish);
                    let permit = loop {
                        tokio::select! {
                            permit = jobs.reserve() => match permit {
                                Ok(permit) => break permit,
                                Err(_) => {
                                    // Worker gone; its result says why.
                                    join_worker((&mut *worker).await)?;
                                    return Err(TransferError::Protocol("import worker stopped early".into()));
                                }
                            },
                            _ = progress.tick() => self.report(write_half, sealer, processed, total).await?,
                        }
                    };
                    permit.send(job);
                    if last {
                        return Ok(processed);
                    }
                    if counts {
                        processed += 1;
                        let _ = self.state.advance(TransferState::Transporting {
                            processed: processed.min(total),
                            total,
                        });
                    }
                }
            }
        }
    }

    async fn report(
        &self,
        write_half: &mut OwnedWriteHalf,
        sealer: &FrameSealer,
        processed: u64,
        total: u64,
    ) -> Result<(), TransferError> {
        let f = fraction(processed, total);
        send(write_half, sealer, &Command::Progress { fraction: f }).await?;
        tracing::debug!(processed, total, speed = %self.speed.current(), "progress");
        Ok(())
    }
}

async fn send(
    socket: &mut OwnedWriteHalf,
    sealer: &FrameSealer,
    command: &Command,
) -> Result<(), TransferError> {
    let frame = sealer.command_frame(command)?;
    socket.write_all(&frame).await?;
    Ok(())
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    }
}

fn join_worker(
    res: Result<Result<(), TransferError>, tokio::task::JoinError>,
) -> Result<(), TransferError> {
    match res {
        Ok(r) => r,
        Err(e) => Err(TransferError::Protocol(format!("import worker failed: {e}"))),
    }
}

// ── Import worker ─────────────────────────────────────────────────────────────

/// Decrypting writer and id of the attachment currently being received.
struct OpenAttachment {
    id: Uuid,
    writer: DecryptingWriter<Box<dyn Write + Send>>,
}

/// Runs on a blocking thread. Owns the sink for the whole session.
fn import_worker<K: TransferSink>(
    sink: K,
    key: KeyMaterial,
    mut jobs: mpsc::Receiver<Job>,
    imported: Arc<AtomicU64>,
) -> Result<(), TransferError> {
    let mut importer = Importer {
        sink,
        key,
        open: None,
        imported,
    };
    let result = importer.drain(&mut jobs);
    if result.is_err() {
        if let Some(att) = importer.open.take() {
            importer.sink.discard_attachment(att.id);
        }
    }
    result
}

struct Importer<K> {
    sink: K,
    key: KeyMaterial,
    open: Option<OpenAttachment>,
    imported: Arc<AtomicU64>,
}

impl<K: TransferSink> Importer<K> {
    fn drain(&mut self, jobs: &mut mpsc::Receiver<Job>) -> Result<(), TransferError> {
        while let Some(job) = jobs.blocking_recv() {
            match job {
                Job::Record(record) => {
                    self.sink.import_record(record).map_err(TransferError::Import)?;
                    self.imported.fetch_add(1, Ordering::Relaxed);
                }
                Job::FileBegin { id, length } => self.begin(id, length)?,
                Job::FileChunk { id, data } => match self.open.as_mut() {
                    Some(att) if att.id == id => {
                        att.writer.write_chunk(&data).map_err(codec_failure)?;
                    }
                    _ => {
                        return Err(TransferError::Protocol(format!(
                            "file data for unknown attachment {id}"
                        )))
                    }
                },
                Job::FileEnd { id, digest } => self.end(id, digest)?,
                Job::Finish => {
                    self.sink.finish().map_err(TransferError::Import)?;
                    return Ok(());
                }
            }
        }
        Err(TransferError::ConnectionClosed)
    }

    fn begin(&mut self, id: Uuid, length: u64) -> Result<(), TransferError> {
        if let Some(prev) = &self.open {
            return Err(TransferError::Protocol(format!(
                "attachment {id} began before {} ended",
                prev.id
            )));
        }
        let writer = self
            .sink
            .create_attachment(id, length)
            .map_err(TransferError::Import)?;
        self.open = Some(OpenAttachment {
            id,
            writer: DecryptingWriter::new(&self.key, writer),
        });
        Ok(())
    }

    fn end(&mut self, id: Uuid, digest: ContentDigest) -> Result<(), TransferError> {
        let Some(mut att) = self.open.take().filter(|a| a.id == id) else {
            return Err(TransferError::Protocol(format!(
                "file end for unknown attachment {id}"
            )));
        };
        att.writer.set_expected_digest(digest);
        match att.writer.finish() {
            Ok((mut plain, actual)) => {
                if let Err(e) = plain.flush() {
                    self.sink.discard_attachment(id);
                    return Err(TransferError::Import(e));
                }
                drop(plain);
                self.sink
                    .commit_attachment(id, &actual)
                    .map_err(TransferError::Import)?;
                self.imported.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id = %id, digest = %actual, "attachment verified");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "attachment rejected");
                self.sink.discard_attachment(id);
                Err(codec_failure(e))
            }
        }
    }
}

fn codec_failure(e: CodecError) -> TransferError {
    match e {
        CodecError::Io(io) => TransferError::Import(io),
        other => TransferError::Codec(other),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
