//! Serial queue of asynchronous state operations
//!
//! Every model owns one queue. Operations run one at a time, in the order
//! they were enqueued, on a worker task spawned on the current tokio runtime.
//! Progress is published on a watch channel so any number of callers can
//! wait for "everything queued so far" without holding a lock.
//!
//! A failing operation is recorded and logged, then the worker moves on to
//! the next one. A failure is dropped once no pending waiter covers it.

use crate::error::WidgetError;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

/// An operation on model state
pub type StateOp = BoxFuture<'static, Result<(), WidgetError>>;

/// Outcome reported by [`StateQueue::state_change`]
pub type StateChangeResult = Result<(), Arc<WidgetError>>;

#[derive(Debug, Default, Clone)]
struct Progress {
    /// Sequence number of the last finished operation
    completed: u64,
    /// Failures some waiter may still ask about, oldest first
    failures: VecDeque<(u64, Arc<WidgetError>)>,
}

/// Sequence numbering plus the windows of unresolved `state_change` waiters
#[derive(Debug, Default)]
struct Ledger {
    enqueued: u64,
    /// Window start -> number of waiters
    windows: BTreeMap<u64, usize>,
}

type SharedLedger = Arc<Mutex<Ledger>>;

fn lock(ledger: &SharedLedger) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a waiter's window registered until it resolves or is dropped
struct WindowGuard {
    ledger: SharedLedger,
    start: u64,
}

impl Drop for WindowGuard {
    fn drop(&mut self) {
        let mut ledger = lock(&self.ledger);
        if let Some(count) = ledger.windows.get_mut(&self.start) {
            *count -= 1;
            if *count == 0 {
                ledger.windows.remove(&self.start);
            }
        }
    }
}

pub struct StateQueue {
    label: String,
    /// Numbering and channel sends happen under this lock so they stay in step
    ledger: SharedLedger,
    tx: mpsc::UnboundedSender<(u64, StateOp)>,
    progress: watch::Receiver<Progress>,
}

impl StateQueue {
    /// Spawn the worker on the current tokio runtime
    pub fn spawn(label: impl Into<String>) -> Result<Self, WidgetError> {
        let label = label.into();
        let handle = Handle::try_current().map_err(|_| WidgetError::NoRuntime(label.clone()))?;

        let ledger = SharedLedger::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        handle.spawn(run_worker(label.clone(), ledger.clone(), rx, progress_tx));

        Ok(Self {
            label,
            ledger,
            tx,
            progress: progress_rx,
        })
    }

    /// Queue an operation, returning its sequence number
    pub fn enqueue(&self, op: StateOp) -> u64 {
        let mut ledger = lock(&self.ledger);
        ledger.enqueued += 1;
        let seq = ledger.enqueued;
        if self.tx.send((seq, op)).is_err() {
            tracing::error!(model = %self.label, seq, "State queue worker is gone, operation dropped");
        }
        seq
    }

    /// Number of operations queued and not yet finished
    pub fn outstanding(&self) -> u64 {
        let enqueued = lock(&self.ledger).enqueued;
        enqueued.saturating_sub(self.progress.borrow().completed)
    }

    /// Resolves once every operation queued before this call has finished.
    ///
    /// Fails with the first error among the operations that were still
    /// outstanding at call time, or with the error of the most recently
    /// queued operation if it failed. Failures inside the window are kept
    /// for as long as the returned future is alive.
    pub fn state_change(&self) -> impl Future<Output = StateChangeResult> + Send + 'static {
        let mut progress = self.progress.clone();
        let (target, window_start) = {
            let mut ledger = lock(&self.ledger);
            let target = ledger.enqueued;
            let started_at = progress.borrow().completed;
            let window_start = started_at.min(target.saturating_sub(1));
            *ledger.windows.entry(window_start).or_insert(0) += 1;
            (target, window_start)
        };
        let guard = WindowGuard {
            ledger: self.ledger.clone(),
            start: window_start,
        };

        async move {
            let _guard = guard;
            if target == 0 {
                return Ok(());
            }
            let failure = match progress.wait_for(|p| p.completed >= target).await {
                Ok(p) => p
                    .failures
                    .iter()
                    .find(|(seq, _)| *seq > window_start && *seq <= target)
                    .map(|(_, err)| err.clone()),
                Err(_) => None,
            };
            match failure {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }
}

async fn run_worker(
    label: String,
    ledger: SharedLedger,
    mut rx: mpsc::UnboundedReceiver<(u64, StateOp)>,
    progress: watch::Sender<Progress>,
) {
    let mut previous = 0;
    while let Some((seq, op)) = rx.recv().await {
        let result = op.await;
        if let Err(ref err) = result {
            tracing::warn!(model = %label, seq, error = %err, "State operation failed");
        }

        // Waiters registering from here on start at `previous` or later
        let floor = match lock(&ledger).windows.keys().next() {
            Some(&oldest) => oldest.min(previous),
            None => previous,
        };
        progress.send_modify(|p| {
            p.completed = seq;
            p.failures.retain(|(failed, _)| *failed > floor);
            if let Err(err) = result {
                p.failures.push_back((seq, Arc::new(err)));
            }
        });
        previous = seq;
    }
    tracing::trace!(model = %label, "State queue worker stopped");
}
