//! Mutation admission control
//!
//! A bounded FIFO gate in front of mutating actions. At most `max_inflight` mutations
//! run at once; up to `max_queue` more wait in arrival order. A waiter that cannot be
//! granted a slot within `queue_wait_timeout` fails with `OVERLOADED`.
//!
//! Slots are handed over directly from a releasing [`MutationPermit`] to the queue
//! head, so a late arrival can never overtake a queued waiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::AdmissionConfig;
use crate::error::{BridgeError, ErrorCode};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct GateState {
    inflight: usize,
    waiters: VecDeque<Waiter>,
    next_id: u64,
    max_depth_seen: usize,
    rejections: u64,
    timeouts: u64,
    admitted: u64,
    total_wait: Duration,
}

impl GateState {
    fn note_depth(&mut self) {
        self.max_depth_seen = self.max_depth_seen.max(self.waiters.len() + self.inflight);
    }

    /// Hand free slots to queued waiters in FIFO order.
    fn grant_next(&mut self, max_inflight: usize) {
        while self.inflight < max_inflight {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.tx.send(()).is_ok() {
                self.inflight += 1;
                self.admitted += 1;
            }
        }
    }
}

struct Shared {
    max_inflight: usize,
    max_queue: usize,
    wait_timeout: Duration,
    state: Mutex<GateState>,
}

impl Shared {
    fn release(&self) {
        let mut state = self.state.lock();
        state.inflight = state.inflight.saturating_sub(1);
        state.grant_next(self.max_inflight);
    }
}

/// Counters exposed through metrics and health snapshots
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GateSnapshot {
    pub inflight: usize,
    pub queued: usize,
    pub max_inflight: usize,
    pub max_queue: usize,
    pub max_depth_seen: usize,
    pub rejections: u64,
    pub timeouts: u64,
    pub admitted: u64,
    pub total_queue_wait_ms: f64,
}

#[derive(Clone)]
pub struct MutationGate {
    shared: Arc<Shared>,
}

/// A granted mutation slot; released on drop
pub struct MutationPermit {
    shared: Arc<Shared>,
    queue_wait: Duration,
}

/// A queued waiter. Dropping it before the grant is consumed cleans up either the
/// queue entry or the slot that was already handed over.
struct WaiterTicket {
    shared: Arc<Shared>,
    id: u64,
    rx: oneshot::Receiver<()>,
    consumed: bool,
}

impl MutationGate {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self::with_limits(
            config.max_inflight,
            config.max_queue,
            config.queue_wait_timeout(),
        )
    }

    pub fn with_limits(max_inflight: usize, max_queue: usize, wait_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_inflight: max_inflight.max(1),
                max_queue: max_queue.max(1),
                wait_timeout,
                state: Mutex::new(GateState::default()),
            }),
        }
    }

    /// Wait for a mutation slot.
    pub async fn acquire(&self) -> Result<MutationPermit, BridgeError> {
        let started = Instant::now();
        let mut ticket = {
            let mut state = self.shared.state.lock();

            if state.inflight < self.shared.max_inflight && state.waiters.is_empty() {
                state.inflight += 1;
                state.admitted += 1;
                state.note_depth();
                return Ok(MutationPermit {
                    shared: self.shared.clone(),
                    queue_wait: Duration::ZERO,
                });
            }

            let queued = state.waiters.len();
            if queued >= self.shared.max_queue {
                state.rejections += 1;
                return Err(BridgeError::new(
                    ErrorCode::Overloaded,
                    "Mutation queue is full. Retry after in-flight patch operations complete.",
                )
                .with_hint("Reduce concurrent mutation requests or raise MAXBRIDGE_MUTATION_MAX_QUEUE.")
                .with_detail("queued", queued)
                .with_detail("inflight", state.inflight)
                .with_detail("max_queue", self.shared.max_queue)
                .with_detail("max_inflight", self.shared.max_inflight));
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            state.note_depth();

            WaiterTicket {
                shared: self.shared.clone(),
                id,
                rx,
                consumed: false,
            }
        };

        let granted = match tokio::time::timeout(self.shared.wait_timeout, &mut ticket.rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                let mut state = self.shared.state.lock();
                match state.waiters.iter().position(|w| w.id == ticket.id) {
                    Some(pos) => {
                        state.waiters.remove(pos);
                        state.timeouts += 1;
                        state.rejections += 1;
                        ticket.consumed = true;
                        let secs = self.shared.wait_timeout.as_secs_f64();
                        return Err(BridgeError::new(
                            ErrorCode::Overloaded,
                            format!("Timed out waiting for mutation queue slot after {secs} seconds."),
                        )
                        .with_hint(
                            "Reduce concurrent mutations or raise MAXBRIDGE_MUTATION_QUEUE_WAIT_TIMEOUT_SECONDS.",
                        )
                        .with_detail("queued", state.waiters.len())
                        .with_detail("inflight", state.inflight)
                        .with_detail("queue_wait_timeout_seconds", secs));
                    }
                    // Granted between the timeout firing and taking the lock
                    None => true,
                }
            }
        };

        if !granted {
            ticket.consumed = true;
            return Err(BridgeError::new(
                ErrorCode::Internal,
                "Mutation gate dropped a queued waiter.",
            ));
        }

        ticket.consumed = true;
        let queue_wait = started.elapsed();
        self.shared.state.lock().total_wait += queue_wait;
        Ok(MutationPermit {
            shared: self.shared.clone(),
            queue_wait,
        })
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.shared.state.lock();
        GateSnapshot {
            inflight: state.inflight,
            queued: state.waiters.len(),
            max_inflight: self.shared.max_inflight,
            max_queue: self.shared.max_queue,
            max_depth_seen: state.max_depth_seen,
            rejections: state.rejections,
            timeouts: state.timeouts,
            admitted: state.admitted,
            total_queue_wait_ms: state.total_wait.as_secs_f64() * 1000.0,
        }
    }

    pub fn max_queue(&self) -> usize {
        self.shared.max_queue
    }
}

impl MutationPermit {
    pub fn queue_wait(&self) -> Duration {
        self.queue_wait
    }
}

impl Drop for MutationPermit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl Drop for WaiterTicket {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        let mut state = self.shared.state.lock();
        match state.waiters.iter().position(|w| w.id == self.id) {
            Some(pos) => {
                state.waiters.remove(pos);
            }
            None => {
                // Slot was handed over but never taken
                state.inflight = state.inflight.saturating_sub(1);
                state.grant_next(self.shared.max_inflight);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_immediate_admit_and_release() {
        let gate = MutationGate::with_limits(2, 4, Duration::from_secs(1));
        let p1 = gate.acquire().await.unwrap();
        let p2 = gate.acquire().await.unwrap();
        assert_eq!(gate.snapshot().inflight, 2);
        drop(p1);
        drop(p2);
        let snap = gate.snapshot();
        assert_eq!(snap.inflight, 0);
        assert_eq!(snap.max_depth_seen, 2);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let gate = MutationGate::with_limits(1, 8, Duration::from_secs(5));
        let first = gate.acquire().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let task_gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let permit = task_gate.acquire().await.unwrap();
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(permit);
            }));
            // Enqueue in a known order
            while gate.snapshot().queued < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert_eq!(gate.snapshot().inflight, 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_enqueue() {
        let gate = MutationGate::with_limits(1, 1, Duration::from_secs(5));
        let held = gate.acquire().await.unwrap();

        let waiting = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        while gate.snapshot().queued < 1 {
            tokio::task::yield_now().await;
        }

        let err = gate.acquire().await.err().unwrap();
        assert_eq!(err.code, ErrorCode::Overloaded);
        assert_eq!(gate.snapshot().queued, 1);
        assert_eq!(gate.snapshot().rejections, 1);

        drop(held);
        waiting.await.unwrap().unwrap();
        assert_eq!(gate.snapshot().inflight, 0);
    }

    #[tokio::test]
    async fn test_queue_timeout_leaves_no_residue() {
        let gate = MutationGate::with_limits(1, 4, Duration::from_millis(30));
        let held = gate.acquire().await.unwrap();

        let err = gate.acquire().await.err().unwrap();
        assert_eq!(err.code, ErrorCode::Overloaded);

        let snap = gate.snapshot();
        assert_eq!(snap.queued, 0);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.inflight, 1);

        drop(held);
        assert_eq!(gate.snapshot().inflight, 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_removed() {
        let gate = MutationGate::with_limits(1, 4, Duration::from_secs(5));
        let held = gate.acquire().await.unwrap();

        let task = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire().await;
            })
        };
        while gate.snapshot().queued < 1 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;

        assert_eq!(gate.snapshot().queued, 0);
        drop(held);
        assert_eq!(gate.snapshot().inflight, 0);
        assert!(gate.acquire().await.is_ok());
    }
}
