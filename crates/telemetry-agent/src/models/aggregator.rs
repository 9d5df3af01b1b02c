// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::accumulator::{Accumulator, MetricMaker};
use crate::clock::align_time;
use crate::config::{deserialize_duration, deserialize_optional_duration};
use crate::constants::DEFAULT_AGGREGATOR_PERIOD;
use crate::errors::AgentError;
use crate::filter::{Filter, FilterConfig};
use crate::logger::PluginLogger;
use crate::metric::Metric;
use crate::models::stats::Counter;
use crate::models::MetricNaming;
use crate::plugin::Aggregator;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub name: String,
    pub alias: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub period: Option<Duration>,
    /// How long after the window end metrics are still accepted, and the push is delayed.
    #[serde(deserialize_with = "deserialize_duration")]
    pub delay: Duration,
    /// How long before the window start metrics are still accepted.
    #[serde(deserialize_with = "deserialize_duration")]
    pub grace: Duration,
    /// Remove aggregated originals from the stream.
    pub drop_original: bool,
    #[serde(flatten)]
    pub naming: MetricNaming,
    pub filter: FilterConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            alias: None,
            period: None,
            delay: Duration::ZERO,
            grace: Duration::ZERO,
            drop_original: false,
            naming: MetricNaming::default(),
            filter: FilterConfig::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
            .filter(|p| !p.is_zero())
            .unwrap_or(DEFAULT_AGGREGATOR_PERIOD)
    }
}

/// Returns the `[since, until)` window of length `period` that contains `start`.
///
/// With `round`, `until` is the first multiple of `period` strictly after `start`;
/// otherwise the window simply begins at `start`.
#[must_use]
pub fn window_for(start: SystemTime, round: bool, period: Duration) -> (SystemTime, SystemTime) {
    let until = if round {
        let until = align_time(start, period);
        if until == start {
            align_time(start + Duration::from_nanos(1), period)
        } else {
            until
        }
    } else {
        start + period
    };
    let since = until.checked_sub(period).unwrap_or(SystemTime::UNIX_EPOCH);
    (since, until)
}

struct AggregatorState {
    plugin: Box<dyn Aggregator>,
    since: SystemTime,
    until: SystemTime,
}

pub struct RunningAggregator {
    state: Mutex<AggregatorState>,
    config: AggregatorConfig,
    filter: Filter,
    logger: PluginLogger,
    pub metrics_pushed: Counter,
    pub metrics_filtered: Counter,
    pub metrics_dropped: Counter,
    pub push_time_ns: Counter,
}

impl RunningAggregator {
    pub fn new(
        mut plugin: Box<dyn Aggregator>,
        config: AggregatorConfig,
    ) -> Result<Self, AgentError> {
        let filter = Filter::compile(&config.filter)?;
        let logger = PluginLogger::new("aggregators", &config.name, config.alias.as_deref());
        plugin.set_logger(logger.clone());
        Ok(Self {
            state: Mutex::new(AggregatorState {
                plugin,
                since: SystemTime::UNIX_EPOCH,
                until: SystemTime::UNIX_EPOCH,
            }),
            config,
            filter,
            logger,
            metrics_pushed: Counter::default(),
            metrics_filtered: Counter::default(),
            metrics_dropped: Counter::default(),
            push_time_ns: Counter::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    #[must_use]
    pub fn log_name(&self) -> &str {
        self.logger.name()
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.config.period()
    }

    pub fn init(&mut self) -> anyhow::Result<()> {
        self.state.get_mut().plugin.init()
    }

    pub async fn update_window(&self, since: SystemTime, until: SystemTime) {
        let mut state = self.state.lock().await;
        state.since = since;
        state.until = until;
        self.logger.debug(format_args!(
            "Updated aggregation range [{}, {}]",
            unix_secs(since),
            unix_secs(until)
        ));
    }

    pub async fn window(&self) -> (SystemTime, SystemTime) {
        let state = self.state.lock().await;
        (state.since, state.until)
    }

    pub async fn end_period(&self) -> SystemTime {
        self.state.lock().await.until
    }

    /// Folds `metric` into the current window. Returns whether the original should be removed
    /// from the stream.
    pub async fn add(&self, metric: &Metric) -> bool {
        if !self.filter.select(metric) {
            return false;
        }
        let mut metric = metric.copy_untracked();
        self.filter.modify(&mut metric);
        if metric.is_empty() {
            self.metrics_filtered.incr(1);
            return self.config.drop_original;
        }

        let mut state = self.state.lock().await;
        let earliest = state
            .since
            .checked_sub(self.config.grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let latest = state.until + self.config.delay;
        if metric.time() < earliest || metric.time() > latest {
            self.logger.debug(format_args!(
                "Metric is outside aggregation window; discarding. {}: m: {} since: {} until: {}",
                metric.name(),
                unix_secs(metric.time()),
                unix_secs(state.since),
                unix_secs(state.until)
            ));
            self.metrics_dropped.incr(1);
            return self.config.drop_original;
        }
        state.plugin.add(&metric);
        self.config.drop_original
    }

    /// Moves the window forward by one period, emits the closed window and resets the plugin.
    pub async fn push(&self, acc: &Accumulator) {
        let mut state = self.state.lock().await;
        let since = state.until;
        state.since = since;
        state.until = since + self.config.period();

        let start = Instant::now();
        state.plugin.push(acc).await;
        self.push_time_ns.add_duration(start.elapsed());
        state.plugin.reset();
    }
}

fn unix_secs(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl MetricMaker for RunningAggregator {
    fn log_name(&self) -> &str {
        self.logger.name()
    }

    fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    fn make_metric(&self, mut metric: Metric) -> Option<Metric> {
        self.config.naming.apply(&mut metric, &[]);
        self.metrics_pushed.incr(1);
        Some(metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::metric::{FieldValue, ValueType, NO_TAGS};
    use crate::tracking::IdSequence;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;
    use tokio::sync::mpsc;

    fn at(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    #[derive(Default)]
    struct Count {
        seen: i64,
    }

    #[async_trait]
    impl Aggregator for Count {
        fn add(&mut self, _metric: &Metric) {
            self.seen += 1;
        }

        async fn push(&mut self, acc: &Accumulator) {
            acc.add_fields("count", [("seen", FieldValue::Int(self.seen))], NO_TAGS, None)
                .await;
        }

        fn reset(&mut self) {
            self.seen = 0;
        }
    }

    fn metric(time: SystemTime) -> Metric {
        Metric::new("cpu", NO_TAGS, [("v", FieldValue::Int(1))], time, ValueType::Gauge)
    }

    #[test]
    fn test_window_rounded() {
        let period = Duration::from_secs(10);
        assert_eq!(window_for(at(3_500), true, period), (at(0), at(10_000)));
        assert_eq!(window_for(at(10_000), true, period), (at(10_000), at(20_000)));
        assert_eq!(window_for(at(3_500), false, period), (at(3_500), at(13_500)));
    }

    #[tokio::test]
    async fn test_add_respects_window_and_claim() {
        let mut config = AggregatorConfig::new("count");
        config.drop_original = true;
        config.grace = Duration::from_secs(1);
        config.filter.namepass = vec!["cpu".to_string()];
        let agg = RunningAggregator::new(Box::new(Count::default()), config).unwrap();
        agg.update_window(at(10_000), at(20_000)).await;

        assert!(agg.add(&metric(at(9_500))).await);
        assert!(agg.add(&metric(at(5_000))).await);
        assert_eq!(agg.metrics_dropped.get(), 1);

        let mut mem = metric(at(15_000));
        mem.set_name("mem");
        assert!(!agg.add(&mem).await);
    }

    #[tokio::test]
    async fn test_push_advances_window_and_resets() {
        let agg = Arc::new(
            RunningAggregator::new(Box::new(Count::default()), AggregatorConfig::new("count"))
                .unwrap(),
        );
        agg.update_window(at(0), at(30_000)).await;
        assert!(!agg.add(&metric(at(1_000))).await);
        assert!(!agg.add(&metric(at(2_000))).await);

        let (tx, mut rx) = mpsc::channel(10);
        let acc = Accumulator::new(
            agg.clone(),
            tx,
            Clock::starting_at(at(30_000)),
            Arc::new(IdSequence::new()),
        );
        agg.push(&acc).await;
        assert_eq!(agg.window().await, (at(30_000), at(60_000)));
        agg.push(&acc).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.get_field("seen"), Some(&FieldValue::Int(2)));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.get_field("seen"), Some(&FieldValue::Int(0)));
        assert_eq!(agg.metrics_pushed.get(), 2);
    }
}
