//! Sending side of a transfer session.
//!
//! The server reserves a port, accepts exactly one receiver, checks its
//! pairing credentials and then streams the snapshot:
//!
//!   start{total}
//!   record …                                   (sealed JSON)
//!   file_begin{id,length} file … file_end{id,digest}   (per attachment)
//!   finish
//!
//! Frames are produced on a blocking worker that reads the source, encrypts
//! attachments and waits on the `SpeedConditioner`; an async writer task
//! drains them to the socket and releases the budget. Meanwhile the main
//! task reads the receiver's progress reports and its final `finish`.

use std::io::{self, Read};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use shuttle_core::config::ShuttleConfig;
use shuttle_core::crypto::codec::codec_error_from_io;
use shuttle_core::crypto::{CodecError, EncryptingReader};
use shuttle_core::wire::{FILE_ID_LEN, MAX_PAYLOAD};
use shuttle_core::{Command, FrameError, KeyMaterial};

use crate::channel::{FrameReader, FrameSealer, Inbound};
use crate::error::TransferError;
use crate::flow::{Admission, SpeedConditioner};
use crate::setup::{check_permission, ReservedPort};
use crate::source::{PairingCredentials, TransferItem, TransferSource};
use crate::speed::SpeedTester;
use crate::state::{FailureReason, SessionState, TransferState};

/// A frame on its way to the socket. Only admitted frames return budget.
struct Outgoing {
    frame: Bytes,
    admitted: bool,
}

pub struct TransferServer {
    config: ShuttleConfig,
    key: KeyMaterial,
    credentials: PairingCredentials,
    state: SessionState,
    speed: SpeedTester,
    listener: Option<TcpListener>,
    port: Option<u16>,
}

impl TransferServer {
    pub fn new(config: ShuttleConfig, key: KeyMaterial, credentials: PairingCredentials) -> Self {
        Self {
            config,
            key,
            credentials,
            state: SessionState::new(),
            speed: SpeedTester::new(),
            listener: None,
            port: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.clone()
    }

    pub fn speed(&self) -> SpeedTester {
        self.speed.clone()
    }

    pub fn credentials(&self) -> &PairingCredentials {
        &self.credentials
    }

    /// Listening port, once `prepare` succeeded.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Check local network permission and reserve the listener.
    /// On success the session is `ready`.
    pub async fn prepare(&mut self) -> Result<u16, TransferError> {
        let result = self.reserve().await;
        if let Err(e) = &result {
            self.state.fail(e.failure_reason());
        }
        result
    }

    async fn reserve(&mut self) -> Result<u16, TransferError> {
        if !check_permission(&self.config.network).await? {
            return Err(TransferError::LocalNetworkDenied);
        }
        let reserved = ReservedPort::from_config(&self.config.network)?;
        let port = reserved.port();
        self.listener = Some(reserved.into_listener()?);
        self.port = Some(port);
        self.state.advance(TransferState::Ready)?;
        tracing::info!(port, code = self.credentials.code, "transfer server ready");
        Ok(port)
    }

    /// Serve one receiver until the transfer finishes or fails.
    pub async fn run<S>(mut self, source: S) -> Result<(), TransferError>
    where
        S: TransferSource + 'static,
    {
        let result = self.serve(source).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "transfer server stopped");
            self.state.fail(e.failure_reason());
        }
        self.speed.stop();
        result
    }

    async fn serve<S>(&mut self, source: S) -> Result<(), TransferError>
    where
        S: TransferSource + 'static,
    {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| TransferError::Protocol("server not prepared".into()))?;
        let (stream, peer) = listener.accept().await?;
        // One connection per session.
        drop(listener);
        stream.set_nodelay(true)?;
        tracing::info!(peer = %peer, "receiver connected");
        self.state.advance(TransferState::Connected)?;

        let (read_half, mut write_half) = stream.into_split();
        let sealer = FrameSealer::new(&self.key);
        let mut reader = FrameReader::new(read_half, &self.key)
            .with_idle_timeout(self.config.transfer.receive_timeout());

        // ── Pairing ──
        match reader.next().await? {
            Some(Inbound::Command(Command::Connect {
                code,
                user_id,
                platform,
            })) => {
                tracing::info!(user_id = %user_id, platform = ?platform, "connect request");
                let rejection = if user_id != self.credentials.user_id {
                    Some(FailureReason::MismatchedUserId)
                } else if code != self.credentials.code {
                    Some(FailureReason::MismatchedCode)
                } else {
                    None
                };
                if let Some(reason) = rejection {
                    let cancel = sealer.command_frame(&Command::Cancel)?;
                    let _ = write_half.write_all(&cancel).await;
                    let _ = write_half.shutdown().await;
                    return Err(TransferError::Rejected(reason));
                }
            }
            Some(Inbound::Command(Command::Cancel)) => return Err(TransferError::RemoteCancelled),
            Some(_) => return Err(TransferError::Protocol("expected connect".into())),
            None => return Err(TransferError::ConnectionClosed),
        }

        // ── Transport ──
        let total = source.total_count();
        write_half
            .write_all(&sealer.command_frame(&Command::Start { total })?)
            .await?;
        self.state.advance(TransferState::Transporting {
            processed: 0,
            total,
        })?;
        self.speed.start(self.config.transfer.progress_interval());
        tracing::info!(total, "transfer started");

        let conditioner = Arc::new(SpeedConditioner::new(self.config.transfer.max_in_flight_bytes));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut writer = tokio::spawn(write_loop(
            write_half,
            rx,
            conditioner.clone(),
            self.speed.clone(),
        ));

        let producer = Producer {
            sealer,
            key: self.key.clone(),
            tx,
            conditioner,
            wait_timeout: self.config.transfer.wait_timeout(),
            chunk_size: self
                .config
                .transfer
                .file_chunk_size
                .clamp(1, MAX_PAYLOAD - FILE_ID_LEN),
        };
        let mut producing = tokio::task::spawn_blocking(move || producer.run(source));

        let mut produced = false;
        let mut written = false;
        let outcome = loop {
            tokio::select! {
                res = &mut producing, if !produced => {
                    produced = true;
                    match res {
                        Ok(Ok(items)) => tracing::debug!(items, "all items queued"),
                        Ok(Err(e)) => break Err(e),
                        Err(e) => break Err(TransferError::Protocol(format!("producer failed: {e}"))),
                    }
                }
                res = &mut writer, if !written => {
                    written = true;
                    match res {
                        Ok(Ok(())) => tracing::debug!("all frames written"),
                        Ok(Err(e)) => break Err(e.into()),
                        Err(e) => break Err(TransferError::Protocol(format!("writer failed: {e}"))),
                    }
                }
                msg = reader.next() => match msg {
                    Ok(Some(Inbound::Command(Command::Progress { fraction }))) => {
                        let processed = (fraction.clamp(0.0, 1.0) * total as f64).round() as u64;
                        if let Err(e) = self.state.advance(TransferState::Transporting { processed, total }) {
                            tracing::debug!(error = %e, "ignoring stale progress report");
                        }
                        tracing::debug!(fraction, speed = %self.speed.current(), "receiver progress");
                    }
                    Ok(Some(Inbound::Command(Command::Finish))) => break Ok(()),
                    Ok(Some(Inbound::Command(Command::Cancel))) => break Err(TransferError::RemoteCancelled),
                    Ok(Some(other)) => {
                        break Err(TransferError::Protocol(format!("unexpected message from receiver: {other:?}")))
                    }
                    Ok(None) if written => break Err(TransferError::Rejected(FailureReason::Completed)),
                    Ok(None) => break Err(TransferError::ConnectionClosed),
                    Err(e) => break Err(e),
                },
            }
        };

        if outcome.is_err() {
            writer.abort();
            return outcome;
        }

        let _ = self.state.advance(TransferState::Transporting {
            processed: total,
            total,
        });
        self.state.advance(TransferState::Finished)?;
        tracing::info!(total, "transfer finished");
        Ok(())
    }
}

// ── Writer task ───────────────────────────────────────────────────────────────

async fn write_loop(
    mut socket: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    conditioner: Arc<SpeedConditioner>,
    speed: SpeedTester,
) -> io::Result<()> {
    while let Some(out) = rx.recv().await {
        let len = out.frame.len() as u64;
        socket.write_all(&out.frame).await?;
        if out.admitted {
            conditioner.signal(len);
        }
        speed.record(len);
    }
    socket.flush().await?;
    Ok(())
}

// ── Producer ──────────────────────────────────────────────────────────────────

struct Producer {
    sealer: FrameSealer,
    key: KeyMaterial,
    tx: mpsc::UnboundedSender<Outgoing>,
    conditioner: Arc<SpeedConditioner>,
    wait_timeout: std::time::Duration,
    chunk_size: usize,
}

impl Producer {
    /// Runs on a blocking thread. Returns the number of items sent.
    fn run<S: TransferSource>(self, mut source: S) -> Result<u64, TransferError> {
        let mut sent = 0u64;
        while let Some(item) = source.next_item().map_err(TransferError::Source)? {
            match item {
                TransferItem::Record(record) => match self.sealer.record_frame(&record) {
                    Ok(frame) => self.push(frame)?,
                    Err(TransferError::Frame(FrameError::PayloadTooLarge(len))) => {
                        tracing::warn!(
                            record_type = ?record.record_type,
                            len,
                            "record too large for one frame, skipped"
                        );
                    }
                    Err(e) => return Err(e),
                },
                TransferItem::Attachment { id, length, reader } => {
                    self.send_attachment(id, length, reader)?;
                }
            }
            sent += 1;
        }
        self.push(self.sealer.command_frame(&Command::Finish)?)?;
        Ok(sent)
    }

    fn send_attachment(
        &self,
        id: Uuid,
        length: u64,
        reader: Box<dyn Read + Send>,
    ) -> Result<(), TransferError> {
        self.push(self.sealer.command_frame(&Command::FileBegin { id, length })?)?;

        let mut envelope = EncryptingReader::new(&self.key, reader);
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = fill(&mut envelope, &mut buf).map_err(|e| match codec_error_from_io(e) {
                CodecError::Io(e) => TransferError::Source(e),
                other => TransferError::Codec(other),
            })?;
            if n == 0 {
                break;
            }
            self.push(self.sealer.file_frame(id, &buf[..n])?)?;
        }

        let digest = envelope
            .final_digest()
            .ok_or(TransferError::Codec(CodecError::Aborted))?;
        tracing::debug!(id = %id, length, digest = %digest, "attachment sent");
        self.push(self.sealer.command_frame(&Command::FileEnd { id, digest })?)
    }

    fn push(&self, frame: Bytes) -> Result<(), TransferError> {
        let len = frame.len() as u64;
        let admitted = match self.conditioner.wait(len, self.wait_timeout) {
            Admission::Admitted => true,
            Admission::TimedOut => {
                tracing::warn!(
                    len,
                    enqueued = self.conditioner.enqueued(),
                    "flow control wait timed out, sending anyway"
                );
                false
            }
        };
        self.tx
            .send(Outgoing { frame, admitted })
            .map_err(|_| TransferError::ConnectionClosed)
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
