// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

use crate::metric::Metric;

/// Bounded FIFO of metrics waiting for an output write.
///
/// When full, the oldest metric is evicted and rejected so that tracked producers learn it
/// was never delivered.
#[derive(Debug)]
pub struct MetricBuffer {
    metrics: VecDeque<Metric>,
    limit: usize,
}

impl MetricBuffer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            metrics: VecDeque::with_capacity(limit.min(1024)),
            limit,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Appends `metric`, returning how many metrics were evicted to make room.
    pub fn add(&mut self, metric: Metric) -> usize {
        self.metrics.push_back(metric);
        self.evict()
    }

    /// Takes up to `max` of the oldest metrics.
    pub fn batch(&mut self, max: usize) -> Vec<Metric> {
        let n = max.min(self.metrics.len());
        self.metrics.drain(..n).collect()
    }

    /// Puts a failed batch back in front, preserving its order. Returns the eviction count.
    pub fn requeue(&mut self, batch: Vec<Metric>) -> usize {
        for metric in batch.into_iter().rev() {
            self.metrics.push_front(metric);
        }
        self.evict()
    }

    fn evict(&mut self) -> usize {
        let mut dropped = 0;
        while self.metrics.len() > self.limit {
            if let Some(oldest) = self.metrics.pop_front() {
                oldest.reject();
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{FieldValue, ValueType, NO_TAGS};
    use crate::tracking::{track, IdSequence};
    use std::sync::{mpsc, Arc};
    use std::time::UNIX_EPOCH;

    fn metric(name: &str) -> Metric {
        Metric::new(
            name,
            NO_TAGS,
            [("v", FieldValue::Int(1))],
            UNIX_EPOCH,
            ValueType::Untyped,
        )
    }

    fn names(metrics: &[Metric]) -> Vec<&str> {
        metrics.iter().map(Metric::name).collect()
    }

    #[test]
    fn test_batches_in_arrival_order() {
        let mut buffer = MetricBuffer::new(10);
        for name in ["a", "b", "c"] {
            assert_eq!(buffer.add(metric(name)), 0);
        }
        assert_eq!(names(&buffer.batch(2)), vec!["a", "b"]);
        assert_eq!(names(&buffer.batch(2)), vec!["c"]);
        assert!(buffer.batch(2).is_empty());
    }

    #[test]
    fn test_overflow_rejects_oldest() {
        let ids = Arc::new(IdSequence::new());
        let (tx, rx) = mpsc::channel();
        let (tracked, _) = track(metric("old"), &ids, move |info| tx.send(info).unwrap());

        let mut buffer = MetricBuffer::new(2);
        buffer.add(tracked);
        buffer.add(metric("b"));
        assert_eq!(buffer.add(metric("c")), 1);
        assert!(!rx.try_recv().unwrap().delivered());
        assert_eq!(names(&buffer.batch(5)), vec!["b", "c"]);
    }

    #[test]
    fn test_requeue_goes_to_front() {
        let mut buffer = MetricBuffer::new(3);
        buffer.add(metric("a"));
        buffer.add(metric("b"));
        let batch = buffer.batch(2);
        buffer.add(metric("c"));
        buffer.add(metric("d"));
        assert_eq!(buffer.requeue(batch), 1);
        assert_eq!(names(&buffer.batch(5)), vec!["b", "c", "d"]);
    }
}
