//! Netlab virtual clock
//!
//! Discrete-event scheduler for the simulator. All protocol timers, link
//! propagation delays and periodic tasks are driven from one monotonic
//! virtual-time counter, so a run is reproducible from its inputs alone.
//!
//! The scheduler is single-threaded and cooperative: the embedder pumps it
//! with [`Scheduler::advance`], callbacks run to completion in strict
//! `(fire_at, insertion order)` order, and `now()` is frozen for the
//! duration of a callback.
//!
//! There is no global instance. `Scheduler<C>` is a cheap cloneable handle;
//! every service that needs a timer gets its own clone.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use alloc::sync::{Arc, Weak};
use core::cmp::{Ordering, Reverse};
use core::fmt;

use hashbrown::HashMap;
use spin::Mutex;

// ── Time units ──────────────────────────────────────────────

/// Virtual time, in milliseconds since simulation start.
pub type Ticks = u64;

/// Virtual milliseconds per virtual second.
pub const TICKS_PER_SECOND: Ticks = 1_000;

/// Convert whole virtual seconds to ticks.
pub const fn secs(n: u64) -> Ticks {
    n * TICKS_PER_SECOND
}

/// Convert virtual milliseconds to ticks.
pub const fn millis(n: u64) -> Ticks {
    n
}

// ── Speed control ───────────────────────────────────────────

/// Real-time to virtual-time mapping used by [`Scheduler::advance_real`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    /// Virtual time does not move.
    Paused,
    /// 1 real ms = 1 virtual ms.
    Normal,
    /// 1 real ms = 10 virtual ms.
    Fast,
    /// 1 real ms = 100 virtual ms.
    Faster,
}

impl Speed {
    /// Virtual ticks elapsed per real millisecond.
    pub fn factor(self) -> u64 {
        match self {
            Speed::Paused => 0,
            Speed::Normal => 1,
            Speed::Fast => 10,
            Speed::Faster => 100,
        }
    }
}

// ── Queue internals ─────────────────────────────────────────

type Callback<C> = Box<dyn FnMut(&mut C, &Scheduler<C>)>;

/// Heap slot. Min-ordered by `(fire_at, seq)`; `seq` is a monotonic
/// insertion counter, so ties fire in insertion order.
struct Slot {
    fire_at: Ticks,
    seq: u64,
    id: u64,
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Slot {}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.seq.cmp(&other.seq))
    }
}

struct Entry<C> {
    /// Taken out while the callback is executing.
    callback: Option<Callback<C>>,
    /// `Some(period)` for repeating subscriptions.
    period: Option<Ticks>,
    /// Cleared by cancellation.
    active: bool,
}

struct Queue<C> {
    now: Ticks,
    speed: Speed,
    next_id: u64,
    next_seq: u64,
    heap: BinaryHeap<Reverse<Slot>>,
    entries: HashMap<u64, Entry<C>>,
}

impl<C> Queue<C> {
    fn new() -> Self {
        Queue {
            now: 0,
            speed: Speed::Normal,
            next_id: 1,
            next_seq: 0,
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
        }
    }

    fn push_slot(&mut self, fire_at: Ticks, id: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Slot { fire_at, seq, id }));
    }

    fn insert(&mut self, delay: Ticks, period: Option<Ticks>, callback: Callback<C>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                callback: Some(callback),
                period,
                active: true,
            },
        );
        let fire_at = self.now + delay;
        self.push_slot(fire_at, id);
        id
    }

    /// Pop the next slot due at or before `target`, claiming its callback.
    /// Stale slots (cancelled entries) are discarded along the way.
    fn pop_due(&mut self, target: Ticks) -> Option<(u64, Ticks, Callback<C>, Option<Ticks>)> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.fire_at > target {
                return None;
            }
            let slot = self.heap.pop().expect("peeked slot").0;
            match self.entries.get_mut(&slot.id) {
                Some(entry) if entry.active => {
                    let cb = entry.callback.take().expect("idle entry has callback");
                    let period = entry.period;
                    if slot.fire_at > self.now {
                        self.now = slot.fire_at;
                    }
                    return Some((slot.id, slot.fire_at, cb, period));
                }
                _ => {
                    // Cancelled between scheduling and firing.
                    self.entries.remove(&slot.id);
                }
            }
        }
        None
    }
}

// ── Scheduler handle ────────────────────────────────────────

/// Shared handle to a virtual-time event queue.
///
/// `C` is the context threaded into every callback by the pump — the
/// simulator instantiates `Scheduler<Network>`. Cloning the handle is
/// cheap and all clones observe the same queue.
pub struct Scheduler<C> {
    shared: Arc<Mutex<Queue<C>>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Scheduler {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.shared.lock();
        f.debug_struct("Scheduler")
            .field("now", &q.now)
            .field("pending", &q.entries.len())
            .field("speed", &q.speed)
            .finish()
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Scheduler {
            shared: Arc::new(Mutex::new(Queue::new())),
        }
    }

    /// Current virtual time. Frozen while a callback is running.
    pub fn now(&self) -> Ticks {
        self.shared.lock().now
    }

    /// Convert whole virtual seconds to ticks.
    pub fn delay(&self, seconds: u64) -> Ticks {
        secs(seconds)
    }

    /// Schedule `callback` to fire once, `delay` ticks from now.
    ///
    /// A zero delay fires later in the same pump, after everything already
    /// due at the current instant.
    pub fn once(
        &self,
        delay: Ticks,
        callback: impl FnMut(&mut C, &Scheduler<C>) + 'static,
    ) -> Subscription<C> {
        let id = self.shared.lock().insert(delay, None, Box::new(callback));
        self.subscription(id)
    }

    /// Schedule `callback` to fire every `period` ticks until cancelled.
    /// The first firing is one full period from now.
    pub fn repeat(
        &self,
        period: Ticks,
        callback: impl FnMut(&mut C, &Scheduler<C>) + 'static,
    ) -> Subscription<C> {
        let id = self
            .shared
            .lock()
            .insert(period, Some(period), Box::new(callback));
        self.subscription(id)
    }

    pub fn set_speed(&self, speed: Speed) {
        self.shared.lock().speed = speed;
    }

    pub fn speed(&self) -> Speed {
        self.shared.lock().speed
    }

    /// Advance virtual time by `dt`, firing every due callback in order.
    ///
    /// Must not be called from within a callback; callbacks interact with
    /// the queue only through `once`/`repeat`/`cancel`.
    pub fn advance(&self, dt: Ticks, ctx: &mut C) {
        let target = self.shared.lock().now + dt;
        loop {
            let due = self.shared.lock().pop_due(target);
            let (id, fired_at, mut cb, period) = match due {
                Some(d) => d,
                None => break,
            };

            // Lock released: the callback may schedule and cancel freely.
            cb(ctx, self);

            let mut q = self.shared.lock();
            if let Some(entry) = q.entries.get_mut(&id) {
                if entry.active && period.is_some() {
                    entry.callback = Some(cb);
                    let next = fired_at + period.expect("periodic entry");
                    q.push_slot(next, id);
                } else {
                    // One-shot completed, or cancelled while running.
                    q.entries.remove(&id);
                }
            }
        }
        self.shared.lock().now = target;
    }

    /// Advance by a real-time delta, scaled by the configured [`Speed`].
    pub fn advance_real(&self, real_ms: u64, ctx: &mut C) {
        let factor = self.speed().factor();
        if factor > 0 {
            self.advance(real_ms * factor, ctx);
        }
    }

    /// Drop every pending subscription and rewind `now` to zero.
    ///
    /// Handles issued before the reset become inert; cancelling them stays
    /// a no-op.
    pub fn reset(&self) {
        let mut q = self.shared.lock();
        q.heap.clear();
        q.entries.clear();
        q.now = 0;
    }

    /// Number of live (uncancelled, unfired) subscriptions.
    pub fn pending(&self) -> usize {
        self.shared.lock().entries.len()
    }

    fn subscription(&self, id: u64) -> Subscription<C> {
        Subscription {
            id,
            queue: Arc::downgrade(&self.shared),
        }
    }
}

// ── Subscription handle ─────────────────────────────────────

/// Cancellation handle returned by [`Scheduler::once`] and
/// [`Scheduler::repeat`].
///
/// Dropping the handle does not cancel the subscription; timers owned by a
/// service must be cancelled explicitly when replaced or torn down.
pub struct Subscription<C> {
    id: u64,
    queue: Weak<Mutex<Queue<C>>>,
}

impl<C> fmt::Debug for Subscription<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl<C> Subscription<C> {
    /// Cancel the subscription. Idempotent; safe to call from inside any
    /// callback, including the one being cancelled.
    pub fn cancel(&self) {
        if let Some(shared) = self.queue.upgrade() {
            let mut q = shared.lock();
            if let Some(entry) = q.entries.get_mut(&self.id) {
                entry.active = false;
                if entry.callback.is_some() {
                    // Not currently executing: discard immediately. A
                    // running callback is reaped after it returns.
                    q.entries.remove(&self.id);
                }
            }
        }
    }

    /// True while the subscription is still scheduled to fire.
    pub fn is_active(&self) -> bool {
        match self.queue.upgrade() {
            Some(shared) => {
                let q = shared.lock();
                q.entries.get(&self.id).map(|e| e.active).unwrap_or(false)
            }
            None => false,
        }
    }
}
