// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;

use crate::config::deserialize_optional_duration;
use crate::errors::AgentError;
use crate::filter::{Filter, FilterConfig};
use crate::logger::PluginLogger;
use crate::metric::Metric;
use crate::models::buffer::MetricBuffer;
use crate::models::stats::Counter;
use crate::plugin::Output;

/// Per-output settings. Unset or zero values fall back to the agent defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub name: String,
    pub alias: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub flush_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub flush_jitter: Option<Duration>,
    pub metric_batch_size: Option<usize>,
    pub metric_buffer_limit: Option<usize>,
    pub name_override: Option<String>,
    pub filter: FilterConfig,
}

impl OutputConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Effective buffering and flush settings of one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSettings {
    pub interval: Duration,
    pub jitter: Duration,
    pub batch_size: usize,
    pub buffer_limit: usize,
}

impl FlushSettings {
    fn resolve(config: &OutputConfig, defaults: &FlushSettings) -> Self {
        let set = |d: Option<Duration>| d.filter(|d| !d.is_zero());
        let batch_size = config
            .metric_batch_size
            .filter(|n| *n > 0)
            .unwrap_or(defaults.batch_size);
        Self {
            interval: set(config.flush_interval).unwrap_or(defaults.interval),
            jitter: set(config.flush_jitter).unwrap_or(defaults.jitter),
            batch_size,
            buffer_limit: config
                .metric_buffer_limit
                .filter(|n| *n > 0)
                .unwrap_or(defaults.buffer_limit)
                .max(batch_size),
        }
    }
}

pub struct RunningOutput {
    plugin: AsyncMutex<Box<dyn Output>>,
    config: OutputConfig,
    settings: FlushSettings,
    filter: Filter,
    logger: PluginLogger,
    buffer: Mutex<MetricBuffer>,
    new_metrics: AtomicUsize,
    batch_ready: Notify,
    pub metrics_added: Counter,
    pub metrics_written: Counter,
    pub metrics_dropped: Counter,
    pub metrics_filtered: Counter,
    pub write_time_ns: Counter,
    pub errors: Counter,
}

impl RunningOutput {
    pub fn new(
        mut plugin: Box<dyn Output>,
        config: OutputConfig,
        defaults: &FlushSettings,
    ) -> Result<Self, AgentError> {
        let filter = Filter::compile(&config.filter)?;
        let logger = PluginLogger::new("outputs", &config.name, config.alias.as_deref());
        plugin.set_logger(logger.clone());
        let settings = FlushSettings::resolve(&config, defaults);
        Ok(Self {
            plugin: AsyncMutex::new(plugin),
            config,
            settings,
            filter,
            logger,
            buffer: Mutex::new(MetricBuffer::new(settings.buffer_limit)),
            new_metrics: AtomicUsize::new(0),
            batch_ready: Notify::new(),
            metrics_added: Counter::default(),
            metrics_written: Counter::default(),
            metrics_dropped: Counter::default(),
            metrics_filtered: Counter::default(),
            write_time_ns: Counter::default(),
            errors: Counter::default(),
        })
    }

    #[must_use]
    pub fn log_name(&self) -> &str {
        self.logger.name()
    }

    #[must_use]
    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    #[must_use]
    pub fn settings(&self) -> &FlushSettings {
        &self.settings
    }

    fn buffer(&self) -> MutexGuard<'_, MetricBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn init(&mut self) -> anyhow::Result<()> {
        self.plugin.get_mut().init()
    }

    pub async fn connect(&self) -> anyhow::Result<()> {
        self.plugin.lock().await.connect().await
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.plugin.lock().await.close().await
    }

    /// Buffers `metric` for the next write. Every `metric_batch_size` new metrics raise the
    /// batch-ready signal.
    pub fn add_metric(&self, mut metric: Metric) {
        if !self.filter.select(&metric) {
            self.metrics_filtered.incr(1);
            metric.discard();
            return;
        }
        self.filter.modify(&mut metric);
        if metric.is_empty() {
            self.metrics_filtered.incr(1);
            metric.discard();
            return;
        }
        if let Some(name) = &self.config.name_override {
            metric.set_name(name.as_str());
        }

        let dropped = self.buffer().add(metric);
        self.metrics_added.incr(1);
        if dropped > 0 {
            self.metrics_dropped.incr(dropped as u64);
        }

        let count = self.new_metrics.fetch_add(1, Ordering::AcqRel) + 1;
        if count == self.settings.batch_size {
            self.new_metrics.store(0, Ordering::Release);
            self.batch_ready.notify_one();
        }
    }

    /// Resolves once a full batch accumulated since the last signal.
    pub async fn batch_ready(&self) {
        self.batch_ready.notified().await;
    }

    /// Writes the metrics buffered at call time, batch by batch. Metrics that arrive during
    /// the write wait for the next call.
    pub async fn write(&self) -> anyhow::Result<()> {
        self.new_metrics.store(0, Ordering::Release);
        let batches = self.buffer_len() / self.settings.batch_size + 1;
        for _ in 0..batches {
            if !self.write_next_batch().await? {
                break;
            }
        }
        Ok(())
    }

    /// Writes a single batch.
    pub async fn write_batch(&self) -> anyhow::Result<()> {
        self.write_next_batch().await.map(|_| ())
    }

    /// Returns whether a batch was written.
    async fn write_next_batch(&self) -> anyhow::Result<bool> {
        let batch = self.buffer().batch(self.settings.batch_size);
        if batch.is_empty() {
            return Ok(false);
        }

        let start = Instant::now();
        let result = self.plugin.lock().await.write(&batch).await;
        let elapsed = start.elapsed();
        self.write_time_ns.add_duration(elapsed);

        match result {
            Ok(()) => {
                self.metrics_written.incr(batch.len() as u64);
                self.logger.debug(format_args!(
                    "Wrote batch of {} metrics in {elapsed:?}",
                    batch.len()
                ));
                for metric in batch {
                    metric.accept();
                }
                Ok(true)
            }
            Err(e) => {
                self.errors.incr(1);
                let dropped = self.buffer().requeue(batch);
                if dropped > 0 {
                    self.metrics_dropped.incr(dropped as u64);
                }
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer().len()
    }

    pub fn log_buffer_status(&self) {
        let buffer = self.buffer();
        self.logger.debug(format_args!(
            "Buffer fullness: {} / {} metrics",
            buffer.len(),
            buffer.limit()
        ));
    }

    pub async fn get_state(&self) -> Option<Value> {
        self.plugin.lock().await.get_state()
    }

    pub fn set_state(&mut self, state: Value) -> anyhow::Result<()> {
        self.plugin.get_mut().set_state(state)
    }
}
