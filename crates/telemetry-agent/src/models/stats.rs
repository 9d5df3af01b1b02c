// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic per-plugin statistic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_duration(&self, d: Duration) {
        self.incr(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::default();
        c.incr(2);
        c.add_duration(Duration::from_micros(3));
        assert_eq!(c.get(), 3_002);
    }
}
