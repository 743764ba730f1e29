//! Monotonic clock adapter and time-unit conversions
//!
//! All scheduler deadlines are absolute nanosecond values measured
//! against a process-wide monotonic epoch.  The epoch is pinned the
//! first time any thread asks for the time, so values from [`now`]
//! start near zero and only ever increase.  Converting between units
//! is exact for round multiples, which the scheduler relies on when
//! callers mix `now_with_ms` and `now_with_us` style deadlines.

use std::sync::OnceLock;
use std::time::Instant;

/// Reserved floor below which no interval base time may be set
///
/// The first couple of nanoseconds after the epoch are reserved so
/// that a zero or near-zero base time can never be confused with an
/// unset value.  [`Timers::add_interval`] and the interval setters
/// assert that the base time exceeds this constant.
///
/// [`Timers::add_interval`]: crate::Timers::add_interval
pub const TIME_IMMEDIATELY: u64 = 2;

/// Largest acceptable deadline, in nanoseconds since the epoch
///
/// The scheduler packs a deadline and a one-bit heap tag into a
/// single atomic word, so deadlines have slightly less than 63 bits
/// of range, about 292 years of process uptime.  Arming or moving a
/// timer past this ceiling is a fatal programmer error.
pub const TIME_MAX: u64 = (u64::MAX >> 1) - 1;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Current time in nanoseconds since the process-wide monotonic epoch
pub fn now() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// [`now`] plus the given number of seconds
pub fn now_with_sec(sec: u64) -> u64 {
    now() + sec_to_ns(sec)
}

/// [`now`] plus the given number of milliseconds
pub fn now_with_ms(ms: u64) -> u64 {
    now() + ms_to_ns(ms)
}

/// [`now`] plus the given number of microseconds
pub fn now_with_us(us: u64) -> u64 {
    now() + us_to_ns(us)
}

/// [`now`] plus the given number of nanoseconds
pub fn now_with_ns(ns: u64) -> u64 {
    now() + ns
}

/// Seconds to milliseconds
pub fn sec_to_ms(sec: u64) -> u64 {
    sec * 1_000
}

/// Seconds to microseconds
pub fn sec_to_us(sec: u64) -> u64 {
    sec * 1_000_000
}

/// Seconds to nanoseconds
pub fn sec_to_ns(sec: u64) -> u64 {
    sec * 1_000_000_000
}

/// Milliseconds to seconds, rounding down
pub fn ms_to_sec(ms: u64) -> u64 {
    ms / 1_000
}

/// Milliseconds to microseconds
pub fn ms_to_us(ms: u64) -> u64 {
    ms * 1_000
}

/// Milliseconds to nanoseconds
pub fn ms_to_ns(ms: u64) -> u64 {
    ms * 1_000_000
}

/// Microseconds to seconds, rounding down
pub fn us_to_sec(us: u64) -> u64 {
    us / 1_000_000
}

/// Microseconds to milliseconds, rounding down
pub fn us_to_ms(us: u64) -> u64 {
    us / 1_000
}

/// Microseconds to nanoseconds
pub fn us_to_ns(us: u64) -> u64 {
    us * 1_000
}

/// Nanoseconds to seconds, rounding down
pub fn ns_to_sec(ns: u64) -> u64 {
    ns / 1_000_000_000
}

/// Nanoseconds to milliseconds, rounding down
pub fn ns_to_ms(ns: u64) -> u64 {
    ns / 1_000_000
}

/// Nanoseconds to microseconds, rounding down
pub fn ns_to_us(ns: u64) -> u64 {
    ns / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        for v in [0_u64, 1, 7, 1000, 86400, 0xFFFF] {
            assert_eq!(v, ms_to_sec(sec_to_ms(v)));
            assert_eq!(v, us_to_sec(sec_to_us(v)));
            assert_eq!(v, ns_to_sec(sec_to_ns(v)));
            assert_eq!(v, us_to_ms(ms_to_us(v)));
            assert_eq!(v, ns_to_ms(ms_to_ns(v)));
            assert_eq!(v, ns_to_us(us_to_ns(v)));
        }
    }

    #[test]
    fn chained_conversions() {
        assert_eq!(sec_to_ns(3), ms_to_ns(sec_to_ms(3)));
        assert_eq!(sec_to_ns(3), us_to_ns(sec_to_us(3)));
        assert_eq!(ms_to_ns(250), us_to_ns(ms_to_us(250)));
    }

    #[test]
    fn now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
        assert!(now_with_ms(5) >= a + ms_to_ns(5));
    }
}
