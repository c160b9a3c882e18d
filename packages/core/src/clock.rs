//! Monotonic nanosecond write clock for LWW ordering.
//!
//! Every local write attaches a nanosecond timestamp at the write site; replicas
//! resolve conflicting writes for the same key by keeping the entry with the
//! highest timestamp. The [`WriteClock`] guarantees that timestamps handed out
//! by one node are strictly increasing even when the wall clock stalls or steps
//! backwards, so same-node writes are always totally ordered.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a fixed one.
/// The default implementation ([`SystemClock`]) delegates to `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as nanoseconds since Unix epoch.
    fn now_ns(&self) -> i64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ns(&self) -> i64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_nanos();
        // Nanoseconds since 1970 fit in i64 until the year 2262.
        #[allow(clippy::cast_possible_truncation)]
        {
            nanos as i64
        }
    }
}

/// Strictly increasing nanosecond clock shared by all collections of a node.
///
/// Reads the injected [`ClockSource`] and bumps the result past the last
/// handed-out timestamp when the wall clock has not advanced. Lock-free;
/// callers on any task may request timestamps concurrently.
pub struct WriteClock {
    last_ns: AtomicI64,
    source: Box<dyn ClockSource>,
}

impl WriteClock {
    /// Creates a write clock backed by the given source.
    #[must_use]
    pub fn new(source: Box<dyn ClockSource>) -> Self {
        Self {
            last_ns: AtomicI64::new(0),
            source,
        }
    }

    /// Creates a write clock backed by the real system time.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Box::new(SystemClock))
    }

    /// Returns a timestamp strictly greater than every previous return value.
    pub fn now_ns(&self) -> i64 {
        let wall = self.source.now_ns();
        let mut last = self.last_ns.load(Ordering::Relaxed);

        loop {
            let next = wall.max(last + 1);
            match self.last_ns.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}

impl std::fmt::Debug for WriteClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteClock")
            .field("last_ns", &self.last_ns.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use super::*;

    /// A deterministic clock source for testing. Time is controlled explicitly.
    struct FixedClock {
        time: Arc<AtomicI64>,
    }

    impl FixedClock {
        fn new(initial: i64) -> (Self, Arc<AtomicI64>) {
            let time = Arc::new(AtomicI64::new(initial));
            (Self { time: time.clone() }, time)
        }
    }

    impl ClockSource for FixedClock {
        fn now_ns(&self) -> i64 {
            self.time.load(AtomicOrdering::Relaxed)
        }
    }

    #[test]
    fn system_clock_is_plausible() {
        // Anything after 2020-01-01 in nanoseconds.
        assert!(SystemClock.now_ns() > 1_577_836_800_000_000_000);
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let clock = WriteClock::system();
        let mut previous = clock.now_ns();
        for _ in 0..10_000 {
            let next = clock.now_ns();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn stalled_wall_clock_still_advances() {
        let (source, _time) = FixedClock::new(1_000);
        let clock = WriteClock::new(Box::new(source));

        assert_eq!(clock.now_ns(), 1_000);
        assert_eq!(clock.now_ns(), 1_001);
        assert_eq!(clock.now_ns(), 1_002);
    }

    #[test]
    fn backwards_wall_clock_never_reverses() {
        let (source, time) = FixedClock::new(5_000);
        let clock = WriteClock::new(Box::new(source));

        assert_eq!(clock.now_ns(), 5_000);
        time.store(100, AtomicOrdering::Relaxed);
        assert_eq!(clock.now_ns(), 5_001);
    }

    #[test]
    fn advancing_wall_clock_is_used() {
        let (source, time) = FixedClock::new(1_000);
        let clock = WriteClock::new(Box::new(source));

        assert_eq!(clock.now_ns(), 1_000);
        time.store(9_000, AtomicOrdering::Relaxed);
        assert_eq!(clock.now_ns(), 9_000);
    }

    #[test]
    fn concurrent_callers_get_unique_timestamps() {
        let clock = Arc::new(WriteClock::system());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..1_000).map(|_| clock.now_ns()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("clock thread panicked"))
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
