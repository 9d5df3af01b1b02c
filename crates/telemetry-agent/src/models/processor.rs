// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::accumulator::{Accumulator, MetricMaker};
use crate::errors::AgentError;
use crate::filter::{Filter, FilterConfig, FilterHandle};
use crate::logger::PluginLogger;
use crate::metric::Metric;
use crate::plugin::StreamingProcessor;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub name: String,
    pub alias: Option<String>,
    /// Position in the chain. Lower runs first; ties keep registration order.
    pub order: i64,
    pub filter: FilterConfig,
}

impl ProcessorConfig {
    pub fn new(name: impl Into<String>, order: i64) -> Self {
        Self {
            name: name.into(),
            order,
            ..Default::default()
        }
    }
}

/// Forwards whatever the processor emits without further changes.
struct ProcessorOutput {
    logger: PluginLogger,
}

impl MetricMaker for ProcessorOutput {
    fn log_name(&self) -> &str {
        self.logger.name()
    }

    fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    fn make_metric(&self, metric: Metric) -> Option<Metric> {
        Some(metric)
    }
}

pub struct RunningProcessor {
    plugin: Box<dyn StreamingProcessor>,
    config: ProcessorConfig,
    filter: FilterHandle,
    logger: PluginLogger,
}

impl RunningProcessor {
    pub fn new(
        mut plugin: Box<dyn StreamingProcessor>,
        config: ProcessorConfig,
    ) -> Result<Self, AgentError> {
        let filter = FilterHandle::new(Filter::compile(&config.filter)?);
        let logger = PluginLogger::new("processors", &config.name, config.alias.as_deref());
        plugin.set_logger(logger.clone());
        Ok(Self {
            plugin,
            config,
            filter,
            logger,
        })
    }

    #[must_use]
    pub fn order(&self) -> i64 {
        self.config.order
    }

    #[must_use]
    pub fn log_name(&self) -> &str {
        self.logger.name()
    }

    #[must_use]
    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    /// Handle for replacing the filter while the processor runs.
    #[must_use]
    pub fn filter_handle(&self) -> FilterHandle {
        self.filter.clone()
    }

    pub(crate) fn maker(&self) -> Arc<dyn MetricMaker> {
        Arc::new(ProcessorOutput {
            logger: self.logger.clone(),
        })
    }

    pub fn init(&mut self) -> anyhow::Result<()> {
        self.plugin.init()
    }

    pub async fn start(&mut self, acc: Accumulator) -> anyhow::Result<()> {
        self.plugin.start(acc).await
    }

    /// Unselected metrics pass through unchanged and a metric emptied by the filter is
    /// dropped. Everything else goes to the plugin.
    pub async fn add(&mut self, mut metric: Metric, acc: &Accumulator) -> anyhow::Result<()> {
        let selected = {
            let filter = self.filter.lock();
            let selected = filter.select(&metric);
            if selected {
                filter.modify(&mut metric);
            }
            selected
        };
        if !selected {
            acc.add_metric(metric).await;
            return Ok(());
        }
        if metric.is_empty() {
            metric.discard();
            return Ok(());
        }
        self.plugin.add(metric, acc).await
    }

    pub async fn stop(&mut self) {
        self.plugin.stop().await;
    }

    #[must_use]
    pub fn get_state(&self) -> Option<Value> {
        self.plugin.get_state()
    }

    pub fn set_state(&mut self, state: Value) -> anyhow::Result<()> {
        self.plugin.set_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::metric::{FieldValue, ValueType, NO_TAGS};
    use crate::plugin::{Processor, StreamingAdapter};
    use crate::tracking::IdSequence;
    use std::time::UNIX_EPOCH;
    use tokio::sync::mpsc;

    struct Upper;

    impl Processor for Upper {
        fn apply(&mut self, metrics: Vec<Metric>) -> Vec<Metric> {
            metrics
                .into_iter()
                .map(|mut m| {
                    let name = m.name().to_uppercase();
                    m.set_name(name);
                    m
                })
                .collect()
        }
    }

    fn metric(name: &str) -> Metric {
        Metric::new(
            name,
            NO_TAGS,
            [("v", FieldValue::Int(1)), ("w", FieldValue::Int(2))],
            UNIX_EPOCH,
            ValueType::Untyped,
        )
    }

    #[tokio::test]
    async fn test_filtering_and_pass_through() {
        let mut config = ProcessorConfig::new("upper", 1);
        config.filter.namepass = vec!["cpu*".to_string()];
        config.filter.fieldexclude = vec!["w".to_string()];
        let mut processor =
            RunningProcessor::new(Box::new(StreamingAdapter::new(Upper)), config).unwrap();
        let (tx, mut rx) = mpsc::channel(10);
        let acc = Accumulator::new(
            processor.maker(),
            tx,
            Clock::starting_at(UNIX_EPOCH),
            Arc::new(IdSequence::new()),
        );

        processor.add(metric("cpu"), &acc).await.unwrap();
        processor.add(metric("mem"), &acc).await.unwrap();

        let cpu = rx.recv().await.unwrap();
        assert_eq!(cpu.name(), "CPU");
        assert!(!cpu.has_field("w"));
        let mem = rx.recv().await.unwrap();
        assert_eq!(mem.name(), "mem");
        assert!(mem.has_field("w"));
    }

    #[tokio::test]
    async fn test_filter_emptied_metric_is_dropped() {
        let mut processor = RunningProcessor::new(
            Box::new(StreamingAdapter::new(Upper)),
            ProcessorConfig::new("upper", 0),
        )
        .unwrap();
        processor.filter_handle().replace(
            Filter::compile(&FilterConfig {
                fieldexclude: vec!["*".to_string()],
                ..Default::default()
            })
            .unwrap(),
        );
        let (tx, mut rx) = mpsc::channel(10);
        let acc = Accumulator::new(
            processor.maker(),
            tx,
            Clock::starting_at(UNIX_EPOCH),
            Arc::new(IdSequence::new()),
        );
        processor.add(metric("cpu"), &acc).await.unwrap();
        drop(acc);
        assert!(rx.recv().await.is_none());
    }
}
