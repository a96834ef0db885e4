//! Deferred-work scheduling ("errands") for the driver's dispatch loop.
//!
//! The driver is single-threaded and cooperative: every blocking hardware wait
//! is expressed as a timer-queue entry instead of a busy loop. Two shapes are
//! supported:
//!
//! - [`Scheduler::schedule`]: a one-shot callback that fires no earlier than
//!   `now + delay`.
//! - [`Scheduler::poll`]: a predicate that is retried on an interval until it
//!   returns `true` or the retry budget is exhausted, after which a completion
//!   callback receives the final outcome.
//!
//! Entries fire in deadline order; ties are broken by insertion order. There
//! is no cancellation. A callback that outlives the state it was scheduled
//! for must detect that and ignore itself.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

/// Monotonic time in microseconds, pluggable so tests can step it manually.
pub trait TimeSource {
    fn now_us(&self) -> u64;
}

/// Wall-clock-backed time source for the real server loop.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Manually stepped clock. Clones share the same underlying counter.
#[derive(Clone, Default)]
pub struct ManualClock(Rc<Cell<u64>>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_us(&self, us: u64) {
        self.0.set(self.0.get() + us);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1000);
    }
}

impl TimeSource for ManualClock {
    fn now_us(&self) -> u64 {
        self.0.get()
    }
}

enum Entry {
    Once(Box<dyn FnOnce()>),
    Poll(PollErrand),
}

struct PollErrand {
    retries: u32,
    interval_us: u64,
    pred: Box<dyn FnMut() -> bool>,
    done: Box<dyn FnOnce(bool)>,
}

#[derive(Default)]
struct Queue {
    /// Keyed by (deadline, sequence number); the sequence number keeps
    /// same-deadline entries in insertion order.
    entries: BTreeMap<(u64, u64), Entry>,
    seq: u64,
}

impl Queue {
    fn insert(&mut self, deadline_us: u64, entry: Entry) {
        let key = (deadline_us, self.seq);
        self.seq += 1;
        self.entries.insert(key, entry);
    }

    fn pop_due(&mut self, now_us: u64) -> Option<Entry> {
        let key = *self.entries.keys().next()?;
        if key.0 > now_us {
            return None;
        }
        self.entries.remove(&key)
    }
}

/// Handle to the shared errand queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct Scheduler {
    clock: Rc<dyn TimeSource>,
    queue: Rc<RefCell<Queue>>,
}

impl Scheduler {
    pub fn new(clock: Rc<dyn TimeSource>) -> Self {
        Self {
            clock,
            queue: Rc::new(RefCell::new(Queue::default())),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Enqueue a one-shot callback to fire no earlier than `now + delay_ms`.
    pub fn schedule(&self, delay_ms: u64, cb: impl FnOnce() + 'static) {
        self.schedule_us(delay_ms * 1000, cb);
    }

    pub fn schedule_us(&self, delay_us: u64, cb: impl FnOnce() + 'static) {
        let deadline = self.clock.now_us() + delay_us;
        self.queue
            .borrow_mut()
            .insert(deadline, Entry::Once(Box::new(cb)));
    }

    /// Repeatedly run `pred` until it returns `true` or the budget runs out.
    ///
    /// `pred` is run once synchronously; if it returns `false` it is retried
    /// up to `retries` more times, `interval_us` apart. `done` receives the
    /// last predicate result.
    pub fn poll(
        &self,
        retries: u32,
        interval_us: u64,
        pred: impl FnMut() -> bool + 'static,
        done: impl FnOnce(bool) + 'static,
    ) {
        let mut pred = Box::new(pred);
        if pred() {
            done(true);
            return;
        }
        if retries == 0 {
            done(false);
            return;
        }
        let deadline = self.clock.now_us() + interval_us;
        self.queue.borrow_mut().insert(
            deadline,
            Entry::Poll(PollErrand {
                retries,
                interval_us,
                pred,
                done: Box::new(done),
            }),
        );
    }

    /// Fire every entry whose deadline has passed. Returns the number fired.
    ///
    /// Callbacks may schedule new errands; entries enqueued with a deadline
    /// that is already due run within the same call.
    pub fn run_pending(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.clock.now_us();
            let entry = self.queue.borrow_mut().pop_due(now);
            // The queue borrow is released before the callback runs so that
            // callbacks can re-enter the scheduler.
            match entry {
                None => break,
                Some(Entry::Once(cb)) => {
                    fired += 1;
                    cb();
                }
                Some(Entry::Poll(mut p)) => {
                    fired += 1;
                    if (p.pred)() {
                        (p.done)(true);
                    } else {
                        p.retries -= 1;
                        if p.retries == 0 {
                            tracing::trace!("poll errand exhausted its retries");
                            (p.done)(false);
                        } else {
                            let deadline = now + p.interval_us;
                            self.queue.borrow_mut().insert(deadline, Entry::Poll(p));
                        }
                    }
                }
            }
        }
        fired
    }

    /// Deadline of the next queued entry, if any.
    pub fn next_deadline_us(&self) -> Option<u64> {
        self.queue.borrow().entries.keys().next().map(|k| k.0)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.borrow().entries.is_empty()
    }
}
