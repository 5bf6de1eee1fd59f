//! Byte-range locks
//!
//! A [`RangeLock`] grants mutual exclusion over inclusive byte intervals of a
//! single resource: writers of disjoint ranges proceed concurrently, writers of
//! overlapping ranges are serialized. Blocked requests queue in FIFO order and
//! a request never overtakes an earlier queued request it overlaps, so a stream
//! of large ranges cannot postpone a small one indefinitely.
//!
//! Waiting is cancellable: dropping the `acquire` future (timeouts, client
//! disconnects) removes the request from the queue.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::types::UploadId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeLockError {
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("lock acquisition cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    id: u64,
    start: u64,
    end: u64,
}

impl Interval {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end
    }
}

struct Waiter {
    interval: Interval,
    notify: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    next_id: u64,
    held: Vec<Interval>,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_held(&self, start: u64, end: u64) -> bool {
        self.held.iter().any(|h| h.overlaps(start, end))
    }

    /// Grant every queued request that no longer conflicts with a held
    /// interval or with an earlier request still waiting.
    fn wake(&mut self) {
        let mut still_waiting: VecDeque<Waiter> = VecDeque::with_capacity(self.waiters.len());

        while let Some(waiter) = self.waiters.pop_front() {
            let Interval { start, end, .. } = waiter.interval;
            let blocked = self.is_held(start, end)
                || still_waiting
                    .iter()
                    .any(|w| w.interval.overlaps(start, end));

            if blocked {
                still_waiting.push_back(waiter);
                continue;
            }

            self.held.push(waiter.interval);
            if waiter.notify.send(()).is_err() {
                // Receiver already gone
                self.held.retain(|h| h.id != waiter.interval.id);
            }
        }

        self.waiters = still_waiting;
    }

    fn release(&mut self, id: u64) {
        self.held.retain(|h| h.id != id);
        self.wake();
    }
}

/// Mutual exclusion over byte intervals of one resource
#[derive(Default)]
pub struct RangeLock {
    state: Mutex<LockState>,
}

impl RangeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `[start, end]` overlaps no held interval, then hold it.
    ///
    /// The interval is released when the returned guard is dropped.
    pub async fn acquire(
        self: &Arc<Self>,
        start: u64,
        end: u64,
    ) -> Result<RangeGuard, RangeLockError> {
        if start > end {
            return Err(RangeLockError::InvalidRange { start, end });
        }

        let (id, rx) = {
            let mut state = self.state.lock();
            let id = state.next_id();
            let interval = Interval { id, start, end };

            let queued_conflict = state.waiters.iter().any(|w| w.interval.overlaps(start, end));
            if !state.is_held(start, end) && !queued_conflict {
                state.held.push(interval);
                return Ok(self.guard(interval));
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                interval,
                notify: tx,
            });
            (id, rx)
        };

        let mut pending = PendingRequest {
            lock: self.as_ref(),
            id,
            armed: true,
        };

        match rx.await {
            Ok(()) => {
                pending.armed = false;
                Ok(self.guard(Interval { id, start, end }))
            }
            Err(_) => Err(RangeLockError::Cancelled),
        }
    }

    /// Like [`RangeLock::acquire`] but gives up when `cancel` fires
    pub async fn acquire_until(
        self: &Arc<Self>,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<RangeGuard, RangeLockError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RangeLockError::Cancelled),
            guard = self.acquire(start, end) => guard,
        }
    }

    /// Number of intervals currently held
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Number of requests waiting
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn guard(self: &Arc<Self>, interval: Interval) -> RangeGuard {
        RangeGuard {
            lock: Arc::clone(self),
            id: interval.id,
            start: interval.start,
            end: interval.end,
        }
    }

    fn release(&self, id: u64) {
        self.state.lock().release(id);
    }
}

/// Drop-guard for a request still sitting in the wait queue
struct PendingRequest<'a> {
    lock: &'a RangeLock,
    id: u64,
    armed: bool,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut state = self.lock.state.lock();
        let queued = state.waiters.len();
        state.waiters.retain(|w| w.interval.id != self.id);

        if state.waiters.len() == queued {
            // Granted after the caller stopped waiting
            state.release(self.id);
        } else {
            // Requests queued behind this one may be free now
            state.wake();
        }
    }
}

/// A held byte interval, released on drop
pub struct RangeGuard {
    lock: Arc<RangeLock>,
    id: u64,
    start: u64,
    end: u64,
}

impl RangeGuard {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Release explicitly
    pub fn release(self) {}
}

impl Drop for RangeGuard {
    fn drop(&mut self) {
        self.lock.release(self.id);
    }
}

impl std::fmt::Debug for RangeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeGuard")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Range locks keyed by upload, created lazily on first use
#[derive(Default)]
pub struct RangeLockRegistry {
    locks: DashMap<UploadId, Arc<RangeLock>>,
}

impl RangeLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `id`, inserting one if absent
    pub fn get(&self, id: UploadId) -> Arc<RangeLock> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(RangeLock::new()))
            .clone()
    }

    /// Forget the lock for a discarded upload
    pub fn discard(&self, id: &UploadId) {
        self.locks.remove(id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
