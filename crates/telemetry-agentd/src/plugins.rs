// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Plugins bundled with the daemon so a bare configuration produces visible output.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use telemetry_agent::logger::PluginLogger;
use telemetry_agent::metric::NO_TAGS;
use telemetry_agent::plugin::{Input, Output};
use telemetry_agent::{Accumulator, FieldValue, Metric};
use tokio::time::Instant;

/// Emits one `heartbeat` gauge per collection with the agent uptime.
pub struct Heartbeat {
    started: Instant,
    beats: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            beats: AtomicU64::new(0),
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Input for Heartbeat {
    async fn gather(&self, acc: &Accumulator) -> anyhow::Result<()> {
        let beats = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        acc.add_gauge(
            "heartbeat",
            [
                ("beats", FieldValue::UInt(beats)),
                (
                    "uptime_seconds",
                    FieldValue::Float(self.started.elapsed().as_secs_f64()),
                ),
            ],
            NO_TAGS,
            None,
        )
        .await;
        Ok(())
    }
}

/// Prints every metric on its own line to standard output.
#[derive(Default)]
pub struct Stdout {
    logger: Option<PluginLogger>,
}

#[async_trait]
impl Output for Stdout {
    fn set_logger(&mut self, logger: PluginLogger) {
        self.logger = Some(logger);
    }

    async fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
        let mut out = std::io::stdout().lock();
        for metric in metrics {
            writeln!(out, "{metric}")?;
        }
        out.flush()?;
        if let Some(logger) = &self.logger {
            logger.trace(format_args!("printed {} metrics", metrics.len()));
        }
        Ok(())
    }
}
