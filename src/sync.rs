//! Counting semaphore used by the dispatch thread
//!
//! Built on a `Mutex` plus `Condvar`.  Contention is expected to be
//! very low: posts are quick and only the dispatch thread ever waits,
//! so almost all operations should be handled in userspace without
//! going to the OS.

use crate::time;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub(crate) struct Semaphore {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: u64) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Release one permit, waking a waiter if there is one
    pub fn post(&self) {
        let mut count = self.count.lock().expect("semaphore lock poisoned");
        *count += 1;
        drop(count);
        self.cond.notify_one();
    }

    /// Block until a permit is available, then take it
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore lock poisoned");
        while *count == 0 {
            count = self.cond.wait(count).expect("semaphore lock poisoned");
        }
        *count -= 1;
    }

    /// Wait for a permit until the absolute deadline passes
    ///
    /// The deadline is in nanoseconds against [`time::now`].  Returns
    /// `true` if a permit was taken, `false` if the deadline passed
    /// first.
    pub fn timed_wait(&self, deadline_ns: u64) -> bool {
        let mut count = self.count.lock().expect("semaphore lock poisoned");
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            let now = time::now();
            if now >= deadline_ns {
                return false;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(count, Duration::from_nanos(deadline_ns - now))
                .expect("semaphore lock poisoned");
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn post_then_wait() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();
    }

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let join = std::thread::spawn(move || {
            sem2.wait();
        });
        std::thread::sleep(Duration::from_millis(20));
        sem.post();
        join.join().unwrap();
    }

    #[test]
    fn timed_wait_deadline_passes() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.timed_wait(time::now_with_ms(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn timed_wait_takes_existing_permit() {
        let sem = Semaphore::new(1);
        let start = Instant::now();
        assert!(sem.timed_wait(time::now_with_sec(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn timed_wait_woken_by_post() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let join = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sem2.post();
        });
        assert!(sem.timed_wait(time::now_with_sec(10)));
        join.join().unwrap();
    }

    #[test]
    fn past_deadline_returns_immediately() {
        let sem = Semaphore::new(0);
        assert!(!sem.timed_wait(0));
    }
}
