//! Monotonic-time scheduler for repeated and one-shot callbacks.
//!
//! Entries are kept sorted by next fire time. Repeated entries with the same
//! interval landing close together are merged onto one fire time so a bursty
//! dispatch runs them in a single pass. Callbacks signal their own removal
//! through their return value; there is no way to mutate the list mid-dispatch.

use flint::logging;
use std::time::{Duration, Instant};

pub type CallbackId = u64;

/// Window within which same-interval entries are batched onto one fire time.
const BATCH_WINDOW: Duration = Duration::from_secs(1);
/// Minimum forward progress when a callback overruns its interval.
const MIN_PROGRESS: Duration = Duration::from_millis(1);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SchedulerOp {
    /// Keep the entry scheduled.
    Continue,
    /// Drop the entry after this dispatch.
    Remove,
}

struct TimerEntry<Ctx> {
    id: CallbackId,
    next_fire: Instant,
    /// None marks a one-shot entry.
    interval: Option<Duration>,
    callback: Box<dyn FnMut(&mut Ctx) -> SchedulerOp>,
}

pub struct Scheduler<Ctx> {
    // Sorted by next_fire ascending
    entries: Vec<TimerEntry<Ctx>>,
    next_id: CallbackId,
    log: logging::Logger,
}

impl<Ctx> Scheduler<Ctx> {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Scheduler<Ctx> {
        Scheduler {
            entries: Vec::new(),
            next_id: 1,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Registers a repeated callback. The first fire lands one interval from
    /// now, possibly aligned onto an existing same-interval entry within the
    /// batching window.
    pub fn add_repeated<F>(&mut self, now: Instant, interval: Duration, callback: F) -> CallbackId
    where
        F: FnMut(&mut Ctx) -> SchedulerOp + 'static,
    {
        let mut next_fire = now + interval;

        // Align onto the latest same-interval entry within the window so
        // bursts dispatch together
        for entry in &self.entries {
            if entry.next_fire >= next_fire {
                break;
            }
            if entry.interval == Some(interval) && entry.next_fire > next_fire - BATCH_WINDOW {
                next_fire = entry.next_fire;
            }
        }

        self.insert(TimerEntry {
            id: self.next_id,
            next_fire,
            interval: Some(interval),
            callback: Box::new(callback),
        })
    }

    /// Registers a one-shot callback firing after `delay`.
    pub fn add_once<F>(&mut self, now: Instant, delay: Duration, callback: F) -> CallbackId
    where
        F: FnMut(&mut Ctx) -> SchedulerOp + 'static,
    {
        self.insert(TimerEntry {
            id: self.next_id,
            next_fire: now + delay,
            interval: None,
            callback: Box::new(callback),
        })
    }

    fn insert(&mut self, entry: TimerEntry<Ctx>) -> CallbackId {
        let id = entry.id;
        self.next_id += 1;

        let position = self
            .entries
            .iter()
            .position(|existing| existing.next_fire > entry.next_fire)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);

        logging::trace!(self.log, "callback scheduled"; "context" => "insert", "id" => id);
        id
    }

    /// Removes a callback by id. O(n).
    pub fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    /// Dispatches all due callbacks and returns the next fire time, if any.
    ///
    /// An overrunning callback is rescheduled at least `MIN_PROGRESS` into
    /// the future so a slow handler cannot busy-loop the dispatcher.
    pub fn process(&mut self, now: Instant, ctx: &mut Ctx) -> Option<Instant> {
        let mut index = 0;

        while index < self.entries.len() {
            if self.entries[index].next_fire > now {
                break;
            }

            let mut entry = self.entries.remove(index);
            let op = (entry.callback)(ctx);

            match (op, entry.interval) {
                (SchedulerOp::Remove, _) | (_, None) => {
                    logging::trace!(self.log, "callback retired"; "context" => "process", "id" => entry.id);
                }
                (SchedulerOp::Continue, Some(interval)) => {
                    let scheduled = entry.next_fire + interval;
                    entry.next_fire = scheduled.max(now + MIN_PROGRESS);
                    self.insert(entry);
                }
            }
            // Restart from the head: the sort position of later entries may
            // have shifted under the re-insert
            index = 0;
        }

        self.entries.first().map(|entry| entry.next_fire)
    }

    /// The next fire time without dispatching.
    #[inline]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|entry| entry.next_fire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    #[test]
    fn test_one_shot_fires_once() {
        let mut scheduler: Scheduler<Log> = Scheduler::new(None);
        let mut ctx: Log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        scheduler.add_once(now, Duration::from_millis(10), |log: &mut Log| {
            log.borrow_mut().push("once");
            SchedulerOp::Continue
        });

        assert_eq!(scheduler.process(now, &mut ctx), Some(now + Duration::from_millis(10)));
        scheduler.process(now + Duration::from_millis(11), &mut ctx);
        scheduler.process(now + Duration::from_millis(50), &mut ctx);

        assert_eq!(&*ctx.borrow(), &["once"]);
        assert_eq!(scheduler.len(), 0);
    }

    #[test]
    fn test_repeated_fires_and_reschedules() {
        let mut scheduler: Scheduler<Log> = Scheduler::new(None);
        let mut ctx: Log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        scheduler.add_repeated(now, Duration::from_millis(10), |log: &mut Log| {
            log.borrow_mut().push("tick");
            SchedulerOp::Continue
        });

        scheduler.process(now + Duration::from_millis(10), &mut ctx);
        scheduler.process(now + Duration::from_millis(20), &mut ctx);
        scheduler.process(now + Duration::from_millis(30), &mut ctx);

        assert_eq!(ctx.borrow().len(), 3);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_callback_self_removal() {
        let mut scheduler: Scheduler<Log> = Scheduler::new(None);
        let mut ctx: Log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        scheduler.add_repeated(now, Duration::from_millis(10), |log: &mut Log| {
            log.borrow_mut().push("guard");
            SchedulerOp::Remove
        });
        scheduler.add_repeated(now, Duration::from_millis(10), |log: &mut Log| {
            log.borrow_mut().push("stays");
            SchedulerOp::Continue
        });

        scheduler.process(now + Duration::from_millis(15), &mut ctx);
        assert_eq!(&*ctx.borrow(), &["guard", "stays"]);
        assert_eq!(scheduler.len(), 1);

        scheduler.process(now + Duration::from_millis(25), &mut ctx);
        assert_eq!(&*ctx.borrow(), &["guard", "stays", "stays"]);
    }

    #[test]
    fn test_remove_by_id() {
        let mut scheduler: Scheduler<Log> = Scheduler::new(None);
        let mut ctx: Log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        let id = scheduler.add_repeated(now, Duration::from_millis(10), |log: &mut Log| {
            log.borrow_mut().push("gone");
            SchedulerOp::Continue
        });

        assert!(scheduler.remove(id));
        assert!(!scheduler.remove(id));

        scheduler.process(now + Duration::from_millis(20), &mut ctx);
        assert!(ctx.borrow().is_empty());
    }

    #[test]
    fn test_same_interval_entries_merge_fire_time() {
        let mut scheduler: Scheduler<Log> = Scheduler::new(None);
        let now = Instant::now();
        let interval = Duration::from_secs(10);

        scheduler.add_repeated(now, interval, |_: &mut Log| SchedulerOp::Continue);
        // Added 300ms later with the same interval: lands on the first
        // entry's fire time (within the batching window)
        scheduler.add_repeated(now + Duration::from_millis(300), interval, |_: &mut Log| {
            SchedulerOp::Continue
        });

        let first = scheduler.entries[0].next_fire;
        let second = scheduler.entries[1].next_fire;
        assert_eq!(first, second);
    }

    #[test]
    fn test_overrun_bounds_drift() {
        let mut scheduler: Scheduler<Log> = Scheduler::new(None);
        let mut ctx: Log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        scheduler.add_repeated(now, Duration::from_millis(10), |log: &mut Log| {
            log.borrow_mut().push("tick");
            SchedulerOp::Continue
        });

        // Process far past several intervals at once: the entry must be
        // rescheduled into the future, not into the past
        let late = now + Duration::from_millis(100);
        scheduler.process(late, &mut ctx);

        assert_eq!(ctx.borrow().len(), 1);
        assert!(scheduler.next_deadline().unwrap() > late);
    }
}
