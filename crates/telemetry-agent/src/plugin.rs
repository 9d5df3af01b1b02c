// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capability traits implemented by plugins.
//!
//! Only `gather`, `add`, `apply`, `push`, `reset` and `write` are mandatory. Every other
//! method has a no-op default, so a plugin opts into initialisation, service lifecycle,
//! logging or state persistence by overriding the matching method. Failures are returned as
//! [`anyhow::Error`]; returning [`crate::PluginRemoved`] from `init`, `start` or `connect`
//! removes the plugin instead of aborting the agent.

use async_trait::async_trait;
use serde_json::Value;

use crate::accumulator::Accumulator;
use crate::logger::PluginLogger;
use crate::metric::Metric;

#[async_trait]
pub trait Input: Send + Sync {
    fn set_logger(&mut self, _logger: PluginLogger) {}

    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Collects one round of metrics. Never called concurrently with itself.
    async fn gather(&self, acc: &Accumulator) -> anyhow::Result<()>;

    /// Service inputs receive `start` and emit on their own schedule until `stop`.
    fn is_service(&self) -> bool {
        false
    }

    /// Called for service inputs only. The accumulator, and every clone of it, must be
    /// released by `stop` so the pipeline can drain.
    async fn start(&self, _acc: Accumulator) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    fn get_state(&self) -> Option<Value> {
        None
    }

    fn set_state(&mut self, _state: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait StreamingProcessor: Send {
    fn set_logger(&mut self, _logger: PluginLogger) {}

    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&mut self, _acc: Accumulator) -> anyhow::Result<()> {
        Ok(())
    }

    /// Consumes `metric`; anything to forward goes through `acc`.
    async fn add(&mut self, metric: Metric, acc: &Accumulator) -> anyhow::Result<()>;

    async fn stop(&mut self) {}

    fn get_state(&self) -> Option<Value> {
        None
    }

    fn set_state(&mut self, _state: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Batch style processor. Registered through [`StreamingAdapter`].
pub trait Processor: Send {
    fn set_logger(&mut self, _logger: PluginLogger) {}

    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn apply(&mut self, metrics: Vec<Metric>) -> Vec<Metric>;

    fn get_state(&self) -> Option<Value> {
        None
    }

    fn set_state(&mut self, _state: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lifts a [`Processor`] into a [`StreamingProcessor`] by applying it to one metric at a time.
pub struct StreamingAdapter<P> {
    processor: P,
}

impl<P: Processor> StreamingAdapter<P> {
    pub fn new(processor: P) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl<P: Processor> StreamingProcessor for StreamingAdapter<P> {
    fn set_logger(&mut self, logger: PluginLogger) {
        self.processor.set_logger(logger);
    }

    fn init(&mut self) -> anyhow::Result<()> {
        self.processor.init()
    }

    async fn add(&mut self, metric: Metric, acc: &Accumulator) -> anyhow::Result<()> {
        for metric in self.processor.apply(vec![metric]) {
            acc.add_metric(metric).await;
        }
        Ok(())
    }

    fn get_state(&self) -> Option<Value> {
        self.processor.get_state()
    }

    fn set_state(&mut self, state: Value) -> anyhow::Result<()> {
        self.processor.set_state(state)
    }
}

#[async_trait]
pub trait Aggregator: Send {
    fn set_logger(&mut self, _logger: PluginLogger) {}

    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Folds `metric` into the current window. The metric itself stays in the stream.
    fn add(&mut self, metric: &Metric);

    /// Emits the aggregates of the window that just closed.
    async fn push(&mut self, acc: &Accumulator);

    fn reset(&mut self);
}

#[async_trait]
pub trait Output: Send {
    fn set_logger(&mut self, _logger: PluginLogger) {}

    fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_state(&self) -> Option<Value> {
        None
    }

    fn set_state(&mut self, _state: Value) -> anyhow::Result<()> {
        Ok(())
    }
}
