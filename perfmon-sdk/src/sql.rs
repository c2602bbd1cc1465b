//! Thread-local SQL clock.
//!
//! Database access layers report the time they spend with [`record`]. A
//! timer notes the clock when it starts and charges the difference at stop,
//! so each monitor sees the SQL time spent on its thread while it was open.

use std::cell::Cell;
use std::time::Duration;

thread_local! {
    static SQL_TIME: Cell<Duration> = const { Cell::new(Duration::ZERO) };
}

/// Add time spent in SQL on the calling thread.
pub fn record(duration: Duration) {
    let _ = SQL_TIME.try_with(|t| t.set(t.get().saturating_add(duration)));
}

/// Total SQL time recorded on the calling thread so far.
pub fn current() -> Duration {
    SQL_TIME.try_with(Cell::get).unwrap_or_default()
}

/// Run `f`, charging its wall time to the calling thread's SQL clock.
///
/// ```rust
/// let rows = perfmon_sdk::sql::timed(|| 42);
/// assert_eq!(rows, 42);
/// ```
pub fn timed<T>(f: impl FnOnce() -> T) -> T {
    let started = std::time::Instant::now();
    let out = f();
    record(started.elapsed());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn clock_accumulates_per_thread() {
        let before = current();
        record(Duration::from_millis(5));
        record(Duration::from_millis(7));
        assert_eq!(current() - before, Duration::from_millis(12));

        let other = thread::spawn(current).join().unwrap();
        assert_eq!(other, Duration::ZERO);
    }

    #[test]
    fn timed_charges_elapsed_time() {
        let before = current();
        timed(|| thread::sleep(Duration::from_millis(10)));
        assert!(current() - before >= Duration::from_millis(10));
    }
}
