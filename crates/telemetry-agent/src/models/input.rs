// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::accumulator::{Accumulator, MetricMaker};
use crate::config::deserialize_optional_duration;
use crate::errors::AgentError;
use crate::filter::{Filter, FilterConfig};
use crate::logger::PluginLogger;
use crate::metric::Metric;
use crate::models::stats::Counter;
use crate::models::MetricNaming;
use crate::plugin::Input;

/// Per-input settings. Unset or zero schedule values fall back to the agent defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub name: String,
    pub alias: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub precision: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub collection_jitter: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub collection_offset: Option<Duration>,
    #[serde(flatten)]
    pub naming: MetricNaming,
    pub filter: FilterConfig,
}

impl InputConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Effective collection schedule of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub precision: Option<Duration>,
    pub jitter: Duration,
    pub offset: Duration,
}

pub struct RunningInput {
    plugin: Box<dyn Input>,
    config: InputConfig,
    filter: Filter,
    global_tags: Vec<(String, String)>,
    logger: PluginLogger,
    pub metrics_gathered: Counter,
    pub gather_time_ns: Counter,
    pub gather_timeouts: Counter,
}

impl RunningInput {
    pub fn new(mut plugin: Box<dyn Input>, config: InputConfig) -> Result<Self, AgentError> {
        let filter = Filter::compile(&config.filter)?;
        let logger = PluginLogger::new("inputs", &config.name, config.alias.as_deref());
        plugin.set_logger(logger.clone());
        Ok(Self {
            plugin,
            config,
            filter,
            global_tags: Vec::new(),
            logger,
            metrics_gathered: Counter::default(),
            gather_time_ns: Counter::default(),
            gather_timeouts: Counter::default(),
        })
    }

    pub(crate) fn set_global_tags(&mut self, tags: Vec<(String, String)>) {
        self.global_tags = tags;
    }

    #[must_use]
    pub fn config(&self) -> &InputConfig {
        &self.config
    }

    #[must_use]
    pub fn log_name(&self) -> &str {
        self.logger.name()
    }

    #[must_use]
    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    /// Resolves the schedule against the agent wide defaults.
    #[must_use]
    pub fn schedule(&self, defaults: &Schedule) -> Schedule {
        let set = |d: Option<Duration>| d.filter(|d| !d.is_zero());
        Schedule {
            interval: set(self.config.interval).unwrap_or(defaults.interval),
            precision: set(self.config.precision).or(defaults.precision),
            jitter: set(self.config.collection_jitter).unwrap_or(defaults.jitter),
            offset: set(self.config.collection_offset).unwrap_or(defaults.offset),
        }
    }

    pub fn init(&mut self) -> anyhow::Result<()> {
        self.plugin.init()
    }

    #[must_use]
    pub fn is_service(&self) -> bool {
        self.plugin.is_service()
    }

    pub async fn start(&self, acc: Accumulator) -> anyhow::Result<()> {
        self.plugin.start(acc).await
    }

    pub async fn gather(&self, acc: &Accumulator) -> anyhow::Result<()> {
        let start = Instant::now();
        let result = self.plugin.gather(acc).await;
        self.gather_time_ns.add_duration(start.elapsed());
        result
    }

    pub async fn stop(&self) {
        self.plugin.stop().await;
    }

    /// Gather errors plus errors the plugin logged itself.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.logger.errors()
    }

    #[must_use]
    pub fn get_state(&self) -> Option<Value> {
        self.plugin.get_state()
    }

    pub fn set_state(&mut self, state: Value) -> anyhow::Result<()> {
        self.plugin.set_state(state)
    }
}

impl MetricMaker for RunningInput {
    fn log_name(&self) -> &str {
        self.logger.name()
    }

    fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    fn make_metric(&self, mut metric: Metric) -> Option<Metric> {
        if !self.filter.select(&metric) {
            metric.discard();
            return None;
        }
        self.config.naming.apply(&mut metric, &self.global_tags);
        self.filter.modify(&mut metric);
        if metric.is_empty() {
            metric.discard();
            return None;
        }
        self.metrics_gathered.incr(1);
        Some(metric)
    }
}
