// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wall clock view driven by the tokio monotonic clock.
//!
//! Scheduling in the agent needs both wall time (interval alignment, metric timestamps,
//! aggregation windows) and timers. Deriving wall time from [`tokio::time::Instant`] keeps the
//! two consistent with each other, including under paused time in tests.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin_wall: SystemTime,
    origin: Instant,
}

impl Clock {
    /// Clock anchored at the current system time.
    #[must_use]
    pub fn system() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Clock that reads `wall` right now and advances with the tokio clock.
    #[must_use]
    pub fn starting_at(wall: SystemTime) -> Self {
        Self {
            origin_wall: wall,
            origin: Instant::now(),
        }
    }

    #[must_use]
    pub fn now(&self) -> SystemTime {
        self.origin_wall + self.origin.elapsed()
    }

    /// Time left until `deadline`, zero when it already passed.
    #[must_use]
    pub fn until(&self, deadline: SystemTime) -> Duration {
        deadline
            .duration_since(self.now())
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

fn unix_nanos(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn from_unix_nanos(nanos: u128) -> SystemTime {
    let secs = (nanos / 1_000_000_000) as u64;
    let sub = (nanos % 1_000_000_000) as u32;
    UNIX_EPOCH + Duration::new(secs, sub)
}

/// Returns `t` when it lies on a multiple of `interval` since the epoch, otherwise the next
/// multiple after it.
#[must_use]
pub fn align_time(t: SystemTime, interval: Duration) -> SystemTime {
    let step = interval.as_nanos();
    if step == 0 {
        return t;
    }
    let nanos = unix_nanos(t);
    let truncated = nanos - nanos % step;
    if truncated == nanos {
        t
    } else {
        from_unix_nanos(truncated + step)
    }
}

/// Truncates `t` down to a multiple of `interval` since the epoch.
#[must_use]
pub fn truncate_time(t: SystemTime, interval: Duration) -> SystemTime {
    let step = interval.as_nanos();
    if step == 0 {
        return t;
    }
    let nanos = unix_nanos(t);
    from_unix_nanos(nanos - nanos % step)
}

/// Rounds `t` half-up to the nearest multiple of `precision`.
#[must_use]
pub fn round_time(t: SystemTime, precision: Duration) -> SystemTime {
    let step = precision.as_nanos();
    if step <= 1 {
        return t;
    }
    let nanos = unix_nanos(t);
    from_unix_nanos((nanos + step / 2) / step * step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64, millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_millis(millis)
    }

    #[test]
    fn test_align_time() {
        let interval = Duration::from_secs(10);
        assert_eq!(align_time(at(3, 500), interval), at(10, 0));
        assert_eq!(align_time(at(10, 0), interval), at(10, 0));
        assert_eq!(align_time(at(10, 1), interval), at(20, 0));
    }

    #[test]
    fn test_round_time() {
        assert_eq!(round_time(at(3, 499), Duration::from_secs(1)), at(3, 0));
        assert_eq!(round_time(at(3, 500), Duration::from_secs(1)), at(4, 0));
        assert_eq!(round_time(at(3, 123), Duration::from_nanos(1)), at(3, 123));
        assert_eq!(round_time(at(3, 123), Duration::ZERO), at(3, 123));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::starting_at(at(100, 0));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(clock.now(), at(101, 500));
        assert_eq!(clock.until(at(102, 0)), Duration::from_millis(500));
        assert_eq!(clock.until(at(50, 0)), Duration::ZERO);
    }
}
