//! Flow control — bounded in-flight byte budget between producer and socket.
//!
//! The producer calls `wait(n)` before queueing `n` bytes for the socket; the
//! writer calls `signal(n)` once those bytes are written. When the budget is
//! exhausted the producer blocks, oldest waiter first.
//!
//! Admission rules:
//!   - `enqueued + n <= max_bytes` and nobody is queued ahead → admitted
//!   - `enqueued == 0` → admitted even if `n > max_bytes`, otherwise an
//!     oversized item could never be sent
//!   - otherwise the caller joins the FIFO and blocks until admitted or
//!     until its timeout elapses
//!
//! `wait` is blocking and belongs on a blocking thread. All state sits under
//! one `parking_lot::Mutex`; nothing awaits while holding it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    TimedOut,
}

struct Waiter {
    ticket: u64,
    count: u64,
    admitted: bool,
}

struct Budget {
    enqueued: u64,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl Budget {
    fn fits(&self, count: u64, max_bytes: u64) -> bool {
        self.enqueued == 0 || self.enqueued.saturating_add(count) <= max_bytes
    }

    /// Admit queued waiters from the front while they fit.
    fn admit_front(&mut self, max_bytes: u64) -> bool {
        let mut woke = false;
        let mut i = 0;
        while i < self.queue.len() {
            if self.queue[i].admitted {
                i += 1;
                continue;
            }
            let count = self.queue[i].count;
            if !self.fits(count, max_bytes) {
                break;
            }
            self.enqueued = self.enqueued.saturating_add(count);
            self.queue[i].admitted = true;
            woke = true;
            i += 1;
        }
        woke
    }
}

pub struct SpeedConditioner {
    max_bytes: u64,
    budget: Mutex<Budget>,
    cond: Condvar,
}

impl SpeedConditioner {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            budget: Mutex::new(Budget {
                enqueued: 0,
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes admitted but not yet signalled.
    pub fn enqueued(&self) -> u64 {
        self.budget.lock().enqueued
    }

    /// Block until `count` bytes may be queued, or until `timeout` elapses.
    pub fn wait(&self, count: u64, timeout: Duration) -> Admission {
        let deadline = Instant::now() + timeout;
        let mut budget = self.budget.lock();

        let nobody_waiting = budget.queue.iter().all(|w| w.admitted);
        if nobody_waiting && budget.fits(count, self.max_bytes) {
            budget.enqueued = budget.enqueued.saturating_add(count);
            return Admission::Admitted;
        }

        let ticket = budget.next_ticket;
        budget.next_ticket += 1;
        budget.queue.push_back(Waiter {
            ticket,
            count,
            admitted: false,
        });
        budget.admit_front(self.max_bytes);
        tracing::trace!(count, enqueued = budget.enqueued, "flow control waiting");

        loop {
            let pos = budget.queue.iter().position(|w| w.ticket == ticket);
            if let Some(pos) = pos {
                if budget.queue[pos].admitted {
                    budget.queue.remove(pos);
                    return Admission::Admitted;
                }
            }

            if self.cond.wait_until(&mut budget, deadline).timed_out() {
                let Some(pos) = budget.queue.iter().position(|w| w.ticket == ticket) else {
                    return Admission::TimedOut;
                };
                // Admitted in the same instant the timer fired.
                if budget.queue[pos].admitted {
                    budget.queue.remove(pos);
                    return Admission::Admitted;
                }
                budget.queue.remove(pos);
                // A large waiter leaving may unblock smaller ones behind it.
                if budget.admit_front(self.max_bytes) {
                    self.cond.notify_all();
                }
                return Admission::TimedOut;
            }
        }
    }

    /// Release `count` bytes and admit whoever now fits.
    pub fn signal(&self, count: u64) {
        let mut budget = self.budget.lock();
        budget.enqueued = budget.enqueued.saturating_sub(count);
        if budget.admit_front(self.max_bytes) {
            self.cond.notify_all();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
