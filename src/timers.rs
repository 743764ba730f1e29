//! Deadline scheduler: dual heap store, publisher and dispatch thread
//!
//! [`Timers`] lets any thread arm one-shot timeouts ("fire at
//! absolute time T") and repeating intervals ("fire every P starting
//! at T"), cancel or reschedule them in place, and have a single
//! dedicated dispatch thread invoke each callback when it becomes
//! due.
//!
//! All structural mutation happens under one mutex.  The next
//! deadline is additionally published as a tagged atomic value so any
//! thread (most importantly the sleeping dispatch thread) can peek at
//! it without locking.  Two counting semaphores drive the dispatch
//! thread: `work` counts armed entries, and `updates` interrupts a
//! bounded sleep whenever the nearest deadline changes.

use crate::handle::{HandleTable, Loc, TimerKey};
use crate::heap::{Deadline, DueHeap};
use crate::sync::Semaphore;
use crate::time::{self, TIME_IMMEDIATELY, TIME_MAX};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

const POISONED: &str = "timers lock poisoned";

// Published when both heaps are empty.  A real packed deadline can
// never reach this value: due times are capped at TIME_MAX, which
// packs to u64::MAX - 1 at most.
const NO_DUE: u64 = u64::MAX;

/// Boxed callback for a one-shot timeout
pub type TimeoutFn = Box<dyn FnOnce(&Timers) + Send + 'static>;

/// Boxed callback for a repeating interval
pub type IntervalFn = Box<dyn FnMut(&Timers) + Send + 'static>;

/// The next deadline across both heaps, tagged with the owning heap
///
/// Ordered by time; on an exact tie the timeout wins.  Packed into a
/// single word as `(time << 1) | tag` for the atomic publisher, which
/// keeps full nanosecond precision and preserves the ordering.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Due {
    Timeout(u64),
    Interval(u64),
}

impl Due {
    fn time(self) -> u64 {
        match self {
            Due::Timeout(t) | Due::Interval(t) => t,
        }
    }

    fn pack(self) -> u64 {
        debug_assert!(self.time() <= TIME_MAX);
        match self {
            Due::Timeout(t) => t << 1,
            Due::Interval(t) => (t << 1) | 1,
        }
    }

    fn unpack(v: u64) -> Option<Self> {
        if v == NO_DUE {
            None
        } else if v & 1 == 0 {
            Some(Due::Timeout(v >> 1))
        } else {
            Some(Due::Interval(v >> 1))
        }
    }
}

impl Ord for Due {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.pack().cmp(&other.pack())
    }
}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Timeout {
    key: TimerKey,
    due: u64,
    // Taken out while the dispatch thread runs it
    cb: Option<TimeoutFn>,
}

impl Deadline for Timeout {
    fn due(&self) -> u64 {
        self.due
    }
    fn key(&self) -> TimerKey {
        self.key
    }
}

struct Interval {
    key: TimerKey,
    base: u64,
    period: u64,
    count: u64,
    // Lent out while the dispatch thread runs it, restored afterwards
    // unless the interval canceled itself
    cb: Option<IntervalFn>,
}

impl Deadline for Interval {
    // Effective due time advances by one period per fire.  Only the
    // base is range-checked on the way in, so the sum is clamped to
    // the packable ceiling; an interval that far out never comes due
    // within the life of the process anyway.
    fn due(&self) -> u64 {
        self.base
            .saturating_add(self.period.saturating_mul(self.count))
            .min(TIME_MAX)
    }
    fn key(&self) -> TimerKey {
        self.key
    }
}

struct State {
    timeouts: DueHeap<Timeout>,
    intervals: DueHeap<Interval>,
    table: HandleTable,
    // Key being dispatched while the lock is released for its
    // callback; lets a callback recognise and cancel itself
    current: Option<TimerKey>,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    // Counts armed entries the dispatch thread should get to
    work: Semaphore,
    // Interrupts the dispatch thread's bounded sleep early
    updates: Semaphore,
    latest: AtomicU64,
    stop: AtomicBool,
}

impl Shared {
    // Recompute and publish the tagged minimum of both heap roots.
    // Must be called after every structural change, with the state
    // lock held.  Posts `updates` once if the value changed, so a
    // sleeping dispatch thread re-reads its deadline.
    fn publish(&self, state: &State) {
        let mut due = state.timeouts.root().map(|t| Due::Timeout(t.due()));
        if let Some(entry) = state.intervals.root() {
            let interval = Due::Interval(entry.due());
            due = Some(match due {
                Some(timeout) if timeout <= interval => timeout,
                _ => interval,
            });
        }
        let packed = due.map_or(NO_DUE, Due::pack);
        let old = self.latest.swap(packed, Ordering::AcqRel);
        if old != packed {
            self.updates.post();
        }
    }
}

/// Concurrent deadline scheduler
///
/// Create one with [`Timers::new`], which spawns the dispatch thread.
/// `Timers` is a cheap clonable handle; clones address the same
/// scheduler and may be moved freely across threads.  Callbacks
/// receive a `&Timers` for the scheduler that fired them, so they can
/// arm, cancel and query timers without deadlocking.
///
/// Armed entries are addressed through the [`TimerKey`] returned by
/// the add methods.  Canceling, rescheduling and querying through a
/// key that already fired or was canceled is always safe and reports
/// the entry as expired.
///
/// The dispatch thread keeps running until [`Timers::shutdown`] is
/// called; dropping all handles does not stop it.
#[derive(Clone)]
pub struct Timers {
    shared: Arc<Shared>,
}

impl Timers {
    /// Create a scheduler and spawn its dispatch thread
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                timeouts: DueHeap::new(),
                intervals: DueHeap::new(),
                table: HandleTable::new(),
                current: None,
                thread: None,
            }),
            work: Semaphore::new(0),
            updates: Semaphore::new(0),
            latest: AtomicU64::new(NO_DUE),
            stop: AtomicBool::new(false),
        });
        let timers = Self { shared };
        let worker = timers.clone();
        let handle = thread::Builder::new()
            .name("alarum-dispatch".into())
            .spawn(move || worker.dispatch())
            .expect("failed to spawn timer dispatch thread");
        timers.shared.state.lock().expect(POISONED).thread = Some(handle);
        timers
    }

    /// Stop the dispatch thread cooperatively and join it
    ///
    /// Any callback in flight runs to completion first; entries still
    /// armed afterwards never fire.  Idempotent.  Must not be called
    /// from inside a callback, since the dispatch thread cannot join
    /// itself.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.work.post();
        self.shared.updates.post();
        let handle = self.shared.state.lock().expect(POISONED).thread.take();
        if let Some(handle) = handle {
            handle.join().expect("timer dispatch thread panicked");
        }
    }

    /// Take the scheduler lock
    ///
    /// The returned guard exposes the pre-locked variant of every
    /// operation, for composing several of them atomically.  The lock
    /// is not re-entrant: taking it from inside a callback that
    /// already holds a guard will deadlock.
    pub fn lock(&self) -> TimersGuard<'_> {
        TimersGuard {
            shared: &self.shared,
            state: self.shared.state.lock().expect(POISONED),
        }
    }

    /// Arm a one-shot timeout firing at absolute time `due_ns`
    ///
    /// `due_ns` must not exceed [`TIME_MAX`].
    pub fn add_timeout(
        &self,
        due_ns: u64,
        cb: impl FnOnce(&Timers) + Send + 'static,
    ) -> TimerKey {
        self.lock().add_timeout(due_ns, cb)
    }

    /// Arm a repeating interval
    ///
    /// Fires whenever `base_ns + period_ns * count` comes due,
    /// incrementing `count` each time; passing a non-zero starting
    /// `count` skips that many leading fires.  `base_ns` must exceed
    /// [`TIME_IMMEDIATELY`] and not exceed [`TIME_MAX`].  The
    /// interval recurs until canceled.
    pub fn add_interval(
        &self,
        base_ns: u64,
        period_ns: u64,
        count: u64,
        cb: impl FnMut(&Timers) + Send + 'static,
    ) -> TimerKey {
        self.lock().add_interval(base_ns, period_ns, count, cb)
    }

    /// Cancel a timeout.  Returns false if it already fired or was
    /// canceled
    pub fn cancel_timeout(&self, key: TimerKey) -> bool {
        self.lock().cancel_timeout(key)
    }

    /// Cancel an interval.  Returns false if it was already canceled
    pub fn cancel_interval(&self, key: TimerKey) -> bool {
        self.lock().cancel_interval(key)
    }

    /// Due time of an armed timeout, or None if it expired
    pub fn get_timeout(&self, key: TimerKey) -> Option<u64> {
        self.lock().get_timeout(key)
    }

    /// Move an armed timeout to a new due time.  Returns false if it
    /// expired
    pub fn set_timeout(&self, key: TimerKey, due_ns: u64) -> bool {
        self.lock().set_timeout(key, due_ns)
    }

    /// Effective due time of an armed interval, or None if canceled
    pub fn get_interval(&self, key: TimerKey) -> Option<u64> {
        self.lock().get_interval(key)
    }

    /// Replace an armed interval's base, period and count.  Returns
    /// false if it was canceled
    pub fn set_interval(&self, key: TimerKey, base_ns: u64, period_ns: u64, count: u64) -> bool {
        self.lock().set_interval(key, base_ns, period_ns, count)
    }

    /// Whether the entry behind `key` is gone (fired or canceled)
    pub fn is_expired(&self, key: TimerKey) -> bool {
        self.lock().is_expired(key)
    }

    /// Key of the entry currently being dispatched
    ///
    /// Only meaningful when called from inside a firing callback,
    /// where it returns that callback's own key; a callback may use
    /// it to cancel or reschedule itself.
    pub fn current_timer(&self) -> Option<TimerKey> {
        self.lock().current_timer()
    }

    // Dispatch thread: Idle -> Waiting -> Firing -> Waiting
    fn dispatch(&self) {
        let shared = &*self.shared;
        loop {
            // Idle until at least one entry is armed
            shared.work.wait();

            'waiting: loop {
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                let Some(due) = Due::unpack(shared.latest.load(Ordering::Acquire)) else {
                    // Both heaps drained, back to Idle
                    break 'waiting;
                };
                if time::now() < due.time() {
                    // Bounded sleep; an earlier deadline arriving on
                    // another thread posts `updates` and wakes this
                    shared.updates.timed_wait(due.time());
                    continue 'waiting;
                }

                // Re-validate under the lock: the nearest deadline
                // may have been canceled or pushed back meanwhile
                let state = shared.state.lock().expect(POISONED);
                let Some(due) = Due::unpack(shared.latest.load(Ordering::Acquire)) else {
                    drop(state);
                    break 'waiting;
                };
                if time::now() < due.time() {
                    drop(state);
                    continue 'waiting;
                }

                match due {
                    Due::Timeout(_) => self.fire_timeout(state),
                    Due::Interval(_) => self.fire_interval(state),
                }
                // One fire per work permit
                break 'waiting;
            }
        }
    }

    fn fire_timeout(&self, mut state: MutexGuard<'_, State>) {
        let shared = &*self.shared;
        let st = &mut *state;
        let mut entry = st.timeouts.remove(1, &mut st.table);
        st.table.remove(entry.key);
        st.current = Some(entry.key);
        shared.publish(st);
        drop(state);

        if let Some(cb) = entry.cb.take() {
            cb(self);
        }

        shared.state.lock().expect(POISONED).current = None;
    }

    fn fire_interval(&self, mut state: MutexGuard<'_, State>) {
        let shared = &*self.shared;
        let st = &mut *state;
        let root = st.intervals.get_mut(1);
        let key = root.key;
        root.count += 1;
        let cb = root.cb.take();
        st.intervals.resift(1, &mut st.table);
        st.current = Some(key);
        shared.publish(st);
        drop(state);
        // The interval stays armed, so its work permit is replaced
        shared.work.post();

        if let Some(mut cb) = cb {
            cb(self);

            // Give the callback back unless the interval canceled
            // itself while it ran
            let mut state = shared.state.lock().expect(POISONED);
            let st = &mut *state;
            if let Some(Loc::Interval(slot)) = st.table.get(key) {
                st.intervals.get_mut(slot).cb = Some(cb);
            }
            st.current = None;
        } else {
            shared.state.lock().expect(POISONED).current = None;
        }
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler lock guard, giving the pre-locked operation variants
///
/// Obtained from [`Timers::lock`].  Dropping the guard releases the
/// lock.
pub struct TimersGuard<'a> {
    shared: &'a Shared,
    state: MutexGuard<'a, State>,
}

impl<'a> TimersGuard<'a> {
    /// Pre-locked [`Timers::add_timeout`]
    pub fn add_timeout(
        &mut self,
        due_ns: u64,
        cb: impl FnOnce(&Timers) + Send + 'static,
    ) -> TimerKey {
        assert!(due_ns <= TIME_MAX, "timeout due time exceeds TIME_MAX");
        let st = &mut *self.state;
        let key = st.table.insert(Loc::Timeout(st.timeouts.len() + 1));
        st.timeouts.insert(
            Timeout {
                key,
                due: due_ns,
                cb: Some(Box::new(cb)),
            },
            &mut st.table,
        );
        self.shared.publish(st);
        self.shared.work.post();
        key
    }

    /// Pre-locked [`Timers::add_interval`]
    pub fn add_interval(
        &mut self,
        base_ns: u64,
        period_ns: u64,
        count: u64,
        cb: impl FnMut(&Timers) + Send + 'static,
    ) -> TimerKey {
        assert!(
            base_ns > TIME_IMMEDIATELY,
            "interval base time must exceed TIME_IMMEDIATELY"
        );
        assert!(base_ns <= TIME_MAX, "interval base time exceeds TIME_MAX");
        let st = &mut *self.state;
        let key = st.table.insert(Loc::Interval(st.intervals.len() + 1));
        st.intervals.insert(
            Interval {
                key,
                base: base_ns,
                period: period_ns,
                count,
                cb: Some(Box::new(cb)),
            },
            &mut st.table,
        );
        self.shared.publish(st);
        self.shared.work.post();
        key
    }

    /// Pre-locked [`Timers::cancel_timeout`]
    pub fn cancel_timeout(&mut self, key: TimerKey) -> bool {
        let st = &mut *self.state;
        match st.table.get(key) {
            Some(Loc::Timeout(slot)) => {
                st.timeouts.remove(slot, &mut st.table);
                st.table.remove(key);
                self.shared.publish(st);
                true
            }
            _ => false,
        }
    }

    /// Pre-locked [`Timers::cancel_interval`]
    pub fn cancel_interval(&mut self, key: TimerKey) -> bool {
        let st = &mut *self.state;
        match st.table.get(key) {
            Some(Loc::Interval(slot)) => {
                st.intervals.remove(slot, &mut st.table);
                st.table.remove(key);
                self.shared.publish(st);
                true
            }
            _ => false,
        }
    }

    /// Open a timeout for in-place rescheduling
    ///
    /// Returns None if the entry expired.  This is the only sanctioned
    /// way to mutate an armed entry: the returned guard exposes the
    /// due time, and closing it (dropping the guard) re-heapifies and
    /// republishes the nearest deadline.
    pub fn open_timeout<'g>(&'g mut self, key: TimerKey) -> Option<OpenTimeout<'g, 'a>> {
        match self.state.table.get(key) {
            Some(Loc::Timeout(slot)) => Some(OpenTimeout { lock: self, slot }),
            _ => None,
        }
    }

    /// Open an interval for in-place rescheduling
    ///
    /// Same protocol as [`TimersGuard::open_timeout`].
    pub fn open_interval<'g>(&'g mut self, key: TimerKey) -> Option<OpenInterval<'g, 'a>> {
        match self.state.table.get(key) {
            Some(Loc::Interval(slot)) => Some(OpenInterval { lock: self, slot }),
            _ => None,
        }
    }

    /// Pre-locked [`Timers::get_timeout`]
    pub fn get_timeout(&mut self, key: TimerKey) -> Option<u64> {
        self.open_timeout(key).map(|t| t.due())
    }

    /// Pre-locked [`Timers::set_timeout`]
    pub fn set_timeout(&mut self, key: TimerKey, due_ns: u64) -> bool {
        match self.open_timeout(key) {
            Some(mut timeout) => {
                timeout.set_due(due_ns);
                true
            }
            None => false,
        }
    }

    /// Pre-locked [`Timers::get_interval`]
    pub fn get_interval(&mut self, key: TimerKey) -> Option<u64> {
        self.open_interval(key).map(|i| i.due())
    }

    /// Pre-locked [`Timers::set_interval`]
    pub fn set_interval(&mut self, key: TimerKey, base_ns: u64, period_ns: u64, count: u64) -> bool {
        match self.open_interval(key) {
            Some(mut interval) => {
                interval.set(base_ns, period_ns, count);
                true
            }
            None => false,
        }
    }

    /// Pre-locked [`Timers::is_expired`]
    pub fn is_expired(&self, key: TimerKey) -> bool {
        !self.state.table.contains(key)
    }

    /// Pre-locked [`Timers::current_timer`]
    pub fn current_timer(&self) -> Option<TimerKey> {
        self.state.current
    }
}

/// An armed timeout opened for in-place mutation
///
/// Dropping it closes the entry: heap order is restored and the
/// nearest deadline republished.  The scheduler lock is held for the
/// guard's whole lifetime.
pub struct OpenTimeout<'g, 'a> {
    lock: &'g mut TimersGuard<'a>,
    slot: u32,
}

impl OpenTimeout<'_, '_> {
    /// Absolute due time in nanoseconds
    pub fn due(&self) -> u64 {
        self.lock.state.timeouts.get(self.slot).due
    }

    /// Move the due time.  `due_ns` must not exceed [`TIME_MAX`]
    pub fn set_due(&mut self, due_ns: u64) {
        assert!(due_ns <= TIME_MAX, "timeout due time exceeds TIME_MAX");
        self.lock.state.timeouts.get_mut(self.slot).due = due_ns;
    }
}

impl Drop for OpenTimeout<'_, '_> {
    fn drop(&mut self) {
        let st = &mut *self.lock.state;
        st.timeouts.resift(self.slot, &mut st.table);
        self.lock.shared.publish(st);
    }
}

/// An armed interval opened for in-place mutation
///
/// Same closing behaviour as [`OpenTimeout`].
pub struct OpenInterval<'g, 'a> {
    lock: &'g mut TimersGuard<'a>,
    slot: u32,
}

impl OpenInterval<'_, '_> {
    /// Effective due time: `base + period * count`
    pub fn due(&self) -> u64 {
        self.entry().due()
    }

    /// Base time in nanoseconds
    pub fn base(&self) -> u64 {
        self.entry().base
    }

    /// Period in nanoseconds
    pub fn period(&self) -> u64 {
        self.entry().period
    }

    /// Fires so far (plus any starting offset given when armed)
    pub fn count(&self) -> u64 {
        self.entry().count
    }

    /// Replace base, period and count in one go
    ///
    /// `base_ns` must exceed [`TIME_IMMEDIATELY`] and not exceed
    /// [`TIME_MAX`].
    pub fn set(&mut self, base_ns: u64, period_ns: u64, count: u64) {
        assert!(
            base_ns > TIME_IMMEDIATELY,
            "interval base time must exceed TIME_IMMEDIATELY"
        );
        assert!(base_ns <= TIME_MAX, "interval base time exceeds TIME_MAX");
        let entry = self.lock.state.intervals.get_mut(self.slot);
        entry.base = base_ns;
        entry.period = period_ns;
        entry.count = count;
    }

    fn entry(&self) -> &Interval {
        self.lock.state.intervals.get(self.slot)
    }
}

impl Drop for OpenInterval<'_, '_> {
    fn drop(&mut self) {
        let st = &mut *self.lock.state;
        st.intervals.resift(self.slot, &mut st.table);
        self.lock.shared.publish(st);
    }
}
