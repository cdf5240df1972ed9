//! The async operation table.
//!
//! A service handler that cannot answer inline parks its request here and
//! the dispatcher replies later, when a timer or an application thread
//! delivers the completion. Slots carry a generation counter bumped on every
//! free so a stale handle can never complete a recycled slot: completion and
//! cancellation are at-most-once, everything after the first is a no-op.

use crate::status::StatusCode;
use flint::logging;
use std::time::Instant;

/// Weak reference to a parked operation: slot index plus the generation the
/// slot had when the operation was parked.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct AsyncHandle {
    index: usize,
    generation: u64,
}

/// What kind of service operation was parked; used by batching fingerprints.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct OperationKind(pub u32);

/// Identity of the parked request.
#[derive(Debug, Clone)]
pub struct AsyncRequestContext {
    pub channel_id: u32,
    pub request_id: u32,
    pub session_id: u64,
    pub request_handle: u32,
    pub kind: OperationKind,
}

/// A finished operation handed back to the dispatcher for encoding.
#[derive(Debug)]
pub struct CompletedOperation {
    pub ctx: AsyncRequestContext,
    pub result: Result<Vec<u8>, StatusCode>,
}

struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

struct Entry {
    ctx: AsyncRequestContext,
    deadline: Instant,
}

pub struct AsyncOperationTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    outstanding: usize,
    log: logging::Logger,
}

impl AsyncOperationTable {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> AsyncOperationTable {
        AsyncOperationTable {
            slots: Vec::new(),
            free: Vec::new(),
            outstanding: 0,
            log: logging::child(log),
        }
    }

    /// Number of currently parked operations.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Parks an operation until `deadline`.
    pub fn park(&mut self, ctx: AsyncRequestContext, deadline: Instant) -> AsyncHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        debug_assert!(slot.entry.is_none());
        slot.entry = Some(Entry { ctx, deadline });
        self.outstanding += 1;

        logging::trace!(self.log, "operation parked";
                        "context" => "park",
                        "slot" => index,
                        "generation" => slot.generation);

        AsyncHandle {
            index,
            generation: slot.generation,
        }
    }

    /// Completes a parked operation. Returns `None` if the handle is stale
    /// (already completed, cancelled or swept).
    pub fn complete(
        &mut self,
        handle: AsyncHandle,
        result: Result<Vec<u8>, StatusCode>,
    ) -> Option<CompletedOperation> {
        let entry = self.take(handle)?;

        Some(CompletedOperation {
            ctx: entry.ctx,
            result,
        })
    }

    /// Cancels a parked operation with the given reason. Same at-most-once
    /// discipline as `complete`.
    pub fn cancel(&mut self, handle: AsyncHandle, reason: StatusCode) -> Option<CompletedOperation> {
        let entry = self.take(handle)?;

        logging::debug!(self.log, "operation cancelled";
                        "context" => "cancel",
                        "request_id" => entry.ctx.request_id,
                        "reason" => %reason);

        Some(CompletedOperation {
            ctx: entry.ctx,
            result: Err(reason),
        })
    }

    /// Cancels every operation parked on the given channel.
    pub fn cancel_channel(&mut self, channel_id: u32, reason: StatusCode) -> Vec<CompletedOperation> {
        self.cancel_matching(reason, |entry| entry.ctx.channel_id == channel_id)
    }

    /// Cancels every operation owned by the given session.
    pub fn cancel_session(&mut self, session_id: u64, reason: StatusCode) -> Vec<CompletedOperation> {
        self.cancel_matching(reason, |entry| entry.ctx.session_id == session_id)
    }

    /// Cancels all deadline-expired operations with `BadTimeout`. Driven by
    /// the scheduler.
    pub fn sweep(&mut self, now: Instant) -> Vec<CompletedOperation> {
        self.cancel_matching(StatusCode::BadTimeout, |entry| entry.deadline <= now)
    }

    fn cancel_matching<F>(&mut self, reason: StatusCode, predicate: F) -> Vec<CompletedOperation>
    where
        F: Fn(&Entry) -> bool,
    {
        let mut cancelled = Vec::new();

        for index in 0..self.slots.len() {
            let matches = match &self.slots[index].entry {
                Some(entry) => predicate(entry),
                None => false,
            };

            if matches {
                let slot = &mut self.slots[index];
                let entry = slot.entry.take().expect("Checked above");
                slot.generation += 1;
                self.free.push(index);
                self.outstanding -= 1;

                cancelled.push(CompletedOperation {
                    ctx: entry.ctx,
                    result: Err(reason),
                });
            }
        }

        cancelled
    }

    fn take(&mut self, handle: AsyncHandle) -> Option<Entry> {
        let slot = self.slots.get_mut(handle.index)?;

        if slot.generation != handle.generation {
            return None;
        }

        let entry = slot.entry.take()?;
        slot.generation += 1;
        self.free.push(handle.index);
        self.outstanding -= 1;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx(channel_id: u32, request_id: u32, session_id: u64) -> AsyncRequestContext {
        AsyncRequestContext {
            channel_id,
            request_id,
            session_id,
            request_handle: request_id,
            kind: OperationKind(1),
        }
    }

    #[test]
    fn test_park_complete_roundtrip() {
        let mut table = AsyncOperationTable::new(None);
        let deadline = Instant::now() + Duration::from_secs(5);

        let handle = table.park(ctx(1, 10, 100), deadline);
        assert_eq!(table.outstanding(), 1);

        let completed = table.complete(handle, Ok(vec![1, 2, 3])).unwrap();
        assert_eq!(completed.ctx.request_id, 10);
        assert_eq!(completed.result.unwrap(), vec![1, 2, 3]);
        assert_eq!(table.outstanding(), 0);
    }

    #[test]
    fn test_complete_at_most_once() {
        let mut table = AsyncOperationTable::new(None);
        let deadline = Instant::now() + Duration::from_secs(5);

        let handle = table.park(ctx(1, 10, 100), deadline);
        assert!(table.complete(handle, Ok(Vec::new())).is_some());

        // Everything after the first take is observably a no-op
        assert!(table.complete(handle, Ok(Vec::new())).is_none());
        assert!(table.cancel(handle, StatusCode::BadTimeout).is_none());
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut table = AsyncOperationTable::new(None);
        let deadline = Instant::now() + Duration::from_secs(5);

        let old = table.park(ctx(1, 10, 100), deadline);
        table.complete(old, Ok(Vec::new())).unwrap();

        // The slot is recycled with a bumped generation
        let new = table.park(ctx(1, 11, 100), deadline);
        assert!(table.complete(old, Ok(Vec::new())).is_none());
        assert!(table.complete(new, Ok(Vec::new())).is_some());
    }

    #[test]
    fn test_sweep_cancels_expired() {
        let mut table = AsyncOperationTable::new(None);
        let now = Instant::now();

        let expired = table.park(ctx(1, 10, 100), now + Duration::from_millis(10));
        let _alive = table.park(ctx(1, 11, 100), now + Duration::from_secs(60));

        let swept = table.sweep(now + Duration::from_millis(20));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].ctx.request_id, 10);
        assert_eq!(swept[0].result, Err(StatusCode::BadTimeout));
        assert_eq!(table.outstanding(), 1);

        // Sweeping is idempotent; the old handle is stale
        assert!(table.sweep(now + Duration::from_millis(30)).is_empty());
        assert!(table.complete(expired, Ok(Vec::new())).is_none());
    }

    #[test]
    fn test_cancel_channel_and_session() {
        let mut table = AsyncOperationTable::new(None);
        let deadline = Instant::now() + Duration::from_secs(5);

        table.park(ctx(1, 10, 100), deadline);
        table.park(ctx(1, 11, 101), deadline);
        table.park(ctx(2, 12, 100), deadline);

        let cancelled = table.cancel_channel(1, StatusCode::BadSecureChannelClosed);
        assert_eq!(cancelled.len(), 2);
        assert_eq!(table.outstanding(), 1);

        let cancelled = table.cancel_session(100, StatusCode::BadSessionClosed);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].ctx.request_id, 12);
        assert_eq!(table.outstanding(), 0);
    }
}
