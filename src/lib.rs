//! **Alarum** is a concurrent deadline timer service.  Any thread can
//! arm one-shot "fire at absolute time T" timeouts and repeating
//! "fire every P starting at T" intervals, cancel or reschedule them
//! in place, and a single dedicated dispatch thread invokes the
//! associated callback exactly when each becomes due.
//!
//! # Overview of types
//!
//! [`Timers`] is the scheduler handle.  Creating one spawns the
//! dispatch thread; the handle is cheap to clone and share across
//! threads, and [`Timers::shutdown`] stops the thread cooperatively.
//!
//! [`TimerKey`] is the caller's reference to an armed entry: plain
//! `Copy` data with a generation, so a key left over from an entry
//! that already fired or was canceled can never alias a newer one;
//! every operation on a stale key simply reports the entry as
//! expired.
//!
//! [`TimersGuard`], returned by [`Timers::lock`], exposes the
//! pre-locked variant of every operation so several can be composed
//! atomically.  [`OpenTimeout`] and [`OpenInterval`] implement the
//! open/close protocol for rescheduling an armed entry in place: open
//! resolves the entry under the lock, mutation happens through the
//! guard, and dropping it re-heapifies and republishes the nearest
//! deadline.
//!
//! The [`time`] module holds the monotonic clock adapter: absolute
//! nanosecond timestamps from [`time::now`], deadline helpers like
//! [`time::now_with_ms`], and unit conversions.
//!
//! # Internals
//!
//! Entries live in two binary min-heaps, one keyed by absolute due
//! time and one by `base + period * count`.  The earliest deadline
//! across both heaps is published as a single tagged atomic word that
//! any thread may read without locking; on an exact tie the timeout
//! fires before the interval.  The dispatch thread sleeps until the
//! published deadline with a bounded semaphore wait, so a
//! newly-armed earlier deadline preempts the sleep without polling.
//! Callbacks run with the lock released, so they may freely call back
//! into the scheduler, including canceling themselves via
//! [`Timers::current_timer`].
//!
//! # Example
//!
//! ```
//! use alarum::{time, Timers};
//! use std::sync::mpsc;
//!
//! let timers = Timers::new();
//! let (tx, rx) = mpsc::channel();
//! timers.add_timeout(time::now_with_ms(20), move |_| {
//!     tx.send("due").unwrap();
//! });
//! assert_eq!("due", rx.recv().unwrap());
//! timers.shutdown();
//! ```

mod handle;
mod heap;
mod sync;
pub mod time;
mod timers;

pub use handle::TimerKey;
pub use timers::{IntervalFn, OpenInterval, OpenTimeout, TimeoutFn, Timers, TimersGuard};

static_assertions::assert_impl_all!(Timers: Send, Sync, Clone);
static_assertions::assert_impl_all!(TimerKey: Send, Sync, Copy);
