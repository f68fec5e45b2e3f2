//! Sleep continuation timers
//!
//! A script that executes `sleep n` unwinds with `AMX_ERR_SLEEP` and the
//! delay in PRI. The host itself never resumes sleeping scripts, so the
//! plugin keeps a deadline queue and continues them from `ProcessTick`.

use std::time::{Duration, Instant};

struct Continuation {
    amx: usize,
    deadline: Instant,
}

/// Pending sleep continuations, pumped once per server tick.
#[derive(Default)]
pub struct TimerQueue {
    pending: Vec<Continuation>,
}

impl TimerQueue {
    /// Empty queue.
    pub fn new() -> TimerQueue {
        TimerQueue::default()
    }

    /// Schedule `amx` to be resumed `delay_ms` milliseconds from now. A
    /// sleeping AMX has exactly one continuation; rescheduling replaces it.
    pub fn schedule(&mut self, amx: usize, delay_ms: u32) {
        self.schedule_at(amx, Instant::now() + Duration::from_millis(u64::from(delay_ms)));
    }

    fn schedule_at(&mut self, amx: usize, deadline: Instant) {
        self.cancel(amx);
        self.pending.push(Continuation { amx, deadline });
    }

    /// Drop the continuation for `amx`, if any.
    pub fn cancel(&mut self, amx: usize) {
        self.pending.retain(|c| c.amx != amx);
    }

    /// Drop every continuation.
    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    /// Take every continuation whose deadline has passed, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<usize> {
        let mut due: Vec<&Continuation> =
            self.pending.iter().filter(|c| c.deadline <= now).collect();
        due.sort_by_key(|c| c.deadline);
        let due: Vec<usize> = due.into_iter().map(|c| c.amx).collect();
        self.pending.retain(|c| c.deadline > now);
        due
    }

    /// Number of queued continuations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether anything is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
