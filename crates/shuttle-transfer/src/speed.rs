//! Throughput sampling.
//!
//! `record` is cheap and lock-free, so the socket writer and reader can call
//! it for every frame. A background tick turns the accumulated byte count
//! into a rate once per interval and publishes it on a watch channel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Throughput {
    pub bytes_per_second: f64,
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
        let mut value = self.bytes_per_second;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        write!(f, "{value:.1} {}", UNITS[unit])
    }
}

struct Inner {
    accumulated: AtomicU64,
    ticker: Mutex<Option<JoinHandle<()>>>,
    tx: watch::Sender<Throughput>,
}

#[derive(Clone)]
pub struct SpeedTester {
    inner: Arc<Inner>,
}

impl SpeedTester {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Throughput::default());
        Self {
            inner: Arc::new(Inner {
                accumulated: AtomicU64::new(0),
                ticker: Mutex::new(None),
                tx,
            }),
        }
    }

    pub fn record(&self, count: u64) {
        self.inner.accumulated.fetch_add(count, Ordering::Relaxed);
    }

    /// Start the periodic tick. Must be called inside a tokio runtime.
    /// Calling it while already running does nothing.
    pub fn start(&self, interval: Duration) {
        let mut ticker = self.inner.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        *ticker = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            let mut last = Instant::now();
            loop {
                tick.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                let now = Instant::now();
                let elapsed = now.duration_since(last).as_secs_f64();
                last = now;
                let bytes = inner.accumulated.swap(0, Ordering::Relaxed);
                let rate = if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 };
                inner.tx.send_replace(Throughput {
                    bytes_per_second: rate,
                });
                tracing::trace!(bytes_per_second = rate, "throughput sample");
            }
        }));
    }

    /// Stop ticking and reset. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.ticker.lock().take() {
            handle.abort();
        }
        self.inner.accumulated.store(0, Ordering::Relaxed);
        self.inner.tx.send_replace(Throughput::default());
    }

    pub fn is_running(&self) -> bool {
        self.inner.ticker.lock().is_some()
    }

    /// Most recent sample.
    pub fn current(&self) -> Throughput {
        *self.inner.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Throughput> {
        self.inner.tx.subscribe()
    }

    /// Bytes recorded since the last tick.
    pub fn pending(&self) -> u64 {
        self.inner.accumulated.load(Ordering::Relaxed)
    }
}

impl Default for SpeedTester {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
