//! Application-side request batching.
//!
//! Homogeneous async operations are accumulated per coalescer instance and
//! flushed as one backend round trip when either the batch fills up or a
//! timeout expires after the first entry. Results flow back to the parked
//! requests through the async operation table.

use crate::asyncop::{AsyncHandle, AsyncOperationTable, CompletedOperation, OperationKind};
use crate::status::StatusCode;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone)]
pub struct BatchConfig {
    pub max_batch: usize,
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> BatchConfig {
        BatchConfig {
            max_batch: 10,
            timeout: Duration::from_millis(20),
        }
    }
}

/// One coalescer instance handles one operation kind.
pub struct BatchCoalescer<Op> {
    kind: OperationKind,
    config: BatchConfig,
    pending: Vec<(AsyncHandle, Op)>,
    // Set when the first entry of the current batch arrives
    deadline: Option<Instant>,
}

impl<Op> BatchCoalescer<Op> {
    #[inline]
    pub fn new(kind: OperationKind, config: BatchConfig) -> BatchCoalescer<Op> {
        BatchCoalescer {
            kind,
            config,
            pending: Vec::new(),
            deadline: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Accumulates an operation. Returns true once the batch is full and
    /// should be flushed immediately.
    pub fn submit(&mut self, handle: AsyncHandle, op: Op, now: Instant) -> bool {
        if self.pending.is_empty() {
            self.deadline = Some(now + self.config.timeout);
        }

        self.pending.push((handle, op));
        self.pending.len() >= self.config.max_batch
    }

    /// The instant the current batch times out, if one is pending.
    #[inline]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Takes the batch if it is due, either by count or by timeout.
    pub fn take_due(&mut self, now: Instant) -> Option<Vec<(AsyncHandle, Op)>> {
        let full = self.pending.len() >= self.config.max_batch;
        let timed_out = matches!(self.deadline, Some(deadline) if now >= deadline);

        if self.pending.is_empty() || !(full || timed_out) {
            return None;
        }

        self.deadline = None;
        Some(std::mem::take(&mut self.pending))
    }

    /// Flushes a due batch through the reducer and completes every parked
    /// handle with its per-entry result. Returns the completions for the
    /// dispatcher to encode.
    pub fn flush_with<F>(
        &mut self,
        now: Instant,
        table: &mut AsyncOperationTable,
        reducer: F,
    ) -> Vec<CompletedOperation>
    where
        F: FnOnce(Vec<Op>) -> Vec<Result<Vec<u8>, StatusCode>>,
    {
        let batch = match self.take_due(now) {
            Some(batch) => batch,
            None => return Vec::new(),
        };

        let (handles, ops): (Vec<_>, Vec<_>) = batch.into_iter().unzip();
        let mut results = reducer(ops);

        // A short reducer answer fails the unanswered tail
        results.resize(handles.len(), Err(StatusCode::BadInternalError));

        handles
            .into_iter()
            .zip(results)
            .filter_map(|(handle, result)| table.complete(handle, result))
            .collect()
    }
}
