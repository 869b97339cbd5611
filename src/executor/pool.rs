//! Execution Pool
//!
//! Bounds how many subprocesses run at once. Waiters are admitted in arrival
//! order (the semaphore is FIFO); once `max_queued` callers are already
//! waiting, new callers are turned away instead of queueing without bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::runner::ExecutorError;
use crate::metrics;

/// Bounded pool of execution slots
#[derive(Debug, Clone)]
pub struct ExecutionPool {
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_concurrent: usize,
    max_queued: usize,
}

/// A held slot; released on drop
#[derive(Debug)]
pub struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
}

impl ExecutionSlot {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        metrics::EXECUTIONS_IN_FLIGHT.inc();
        Self { _permit: permit }
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        metrics::EXECUTIONS_IN_FLIGHT.dec();
    }
}

struct WaitGuard(Arc<AtomicUsize>);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        metrics::EXECUTIONS_QUEUED.dec();
    }
}

impl ExecutionPool {
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
            max_queued,
        }
    }

    /// Wait for a slot, giving up on cancellation or a full queue
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<ExecutionSlot, ExecutorError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(ExecutionSlot::new(permit));
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        metrics::EXECUTIONS_QUEUED.inc();
        let _guard = WaitGuard(self.waiting.clone());
        if queued >= self.max_queued {
            debug!(queued, max_queued = self.max_queued, "Execution queue full");
            return Err(ExecutorError::Backpressure {
                max_queued: self.max_queued,
            });
        }

        tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map(ExecutionSlot::new).map_err(|_| ExecutorError::Closed)
            }
            _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
        }
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Callers currently waiting
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_queued(&self) -> usize {
        self.max_queued
    }
}
