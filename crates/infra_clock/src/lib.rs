use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

/// Epoch-millisecond time source. Feed timestamps are epoch ms, so every
/// component compares against this rather than `Instant`.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    fn utc_now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Wall time sampled once at boot, advanced by `Instant` afterwards so a
/// stepped system clock cannot move the engine backwards.
#[derive(Debug)]
pub struct MonotonicClock {
    boot: Instant,
    boot_epoch_ms: i64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            boot: Instant::now(),
            boot_epoch_ms: Utc::now().timestamp_millis(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> i64 {
        self.boot_epoch_ms + self.boot.elapsed().as_millis() as i64
    }
}

/// Test clock moved by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ts_ms: i64) {
        self.now_ms.store(ts_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, by: Duration) -> i64 {
        let delta = by.as_millis() as i64;
        self.now_ms.fetch_add(delta, Ordering::Relaxed) + delta
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

pub fn secs_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::default();
        let a = clock.now_ms();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now_ms();
        assert!(b > a);
        assert!((clock.utc_now().timestamp_millis() - b).abs() < 1_000);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.advance(Duration::from_millis(250)), 1_250);
        clock.set(5_000);
        assert_eq!(clock.now_ms(), 5_000);
    }

    #[test]
    fn negative_seconds_are_zero() {
        assert_eq!(secs_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(1.5), Duration::from_millis(1_500));
    }
}
