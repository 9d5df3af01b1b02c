// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

/// Logger handed to every plugin through `set_logger`. Events carry the plugin's log name in
/// the `plugin` field; errors are also counted so the agent can report them at shutdown.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    name: Arc<str>,
    errors: Arc<AtomicU64>,
}

impl PluginLogger {
    /// `kind` is the stage (`inputs`, `processors`, `aggregators`, `outputs`).
    #[must_use]
    pub fn new(kind: &str, name: &str, alias: Option<&str>) -> Self {
        let name = match alias {
            Some(alias) if !alias.is_empty() => format!("{kind}.{name}::{alias}"),
            _ => format!("{kind}.{name}"),
        };
        Self {
            name: name.into(),
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Errors logged through this logger so far.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn error(&self, msg: impl fmt::Display) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        error!(plugin = %self.name, "{msg}");
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        warn!(plugin = %self.name, "{msg}");
    }

    pub fn info(&self, msg: impl fmt::Display) {
        info!(plugin = %self.name, "{msg}");
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        debug!(plugin = %self.name, "{msg}");
    }

    pub fn trace(&self, msg: impl fmt::Display) {
        trace!(plugin = %self.name, "{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_log_names() {
        assert_eq!(PluginLogger::new("inputs", "cpu", None).name(), "inputs.cpu");
        assert_eq!(
            PluginLogger::new("outputs", "file", Some("archive")).name(),
            "outputs.file::archive"
        );
        assert_eq!(
            PluginLogger::new("processors", "rename", Some("")).name(),
            "processors.rename"
        );
    }

    #[traced_test]
    #[test]
    fn test_errors_are_counted_and_tagged() {
        let logger = PluginLogger::new("inputs", "disk", None);
        let clone = logger.clone();
        logger.warn("slow");
        clone.error("device vanished");
        assert_eq!(logger.errors(), 1);
        assert!(logs_contain("device vanished"));
        assert!(logs_contain("inputs.disk"));
    }
}
