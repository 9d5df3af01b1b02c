// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the orchestrator.
//!
//! Plugin calls return [`anyhow::Result`] because plugins are arbitrary collaborators. The
//! orchestrator itself reports through [`AgentError`].

use std::fmt;

/// Errors that abort an agent run or are reported when it completes.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("could not initialize {plugin}: {source}")]
    Init {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("starting {plugin}: {source}")]
    Start {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("connecting output {plugin}: {source}")]
    Connect {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("state persistence failed: {0}")]
    State(String),

    #[error("input plugins recorded {0} errors")]
    GatherErrors(u64),

    #[error("output plugins unable to send {0} metrics")]
    UndeliveredMetrics(usize),

    #[error("pipeline task failed: {0}")]
    Panicked(String),
}

/// Sentinel returned by `init`, `start` or `connect` when a plugin's configuration can never
/// work. The orchestrator removes the plugin and keeps the rest of the pipeline running.
#[derive(Debug)]
pub struct PluginRemoved {
    pub reason: String,
}

impl PluginRemoved {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PluginRemoved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin removed: {}", self.reason)
    }
}

impl std::error::Error for PluginRemoved {}

/// Reports whether `err` carries the [`PluginRemoved`] sentinel anywhere in its chain.
pub fn is_removal(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<PluginRemoved>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_error_display() {
        let error = AgentError::Connect {
            plugin: "outputs.file".to_string(),
            source: anyhow::anyhow!("permission denied"),
        };
        assert_eq!(
            error.to_string(),
            "connecting output outputs.file: permission denied"
        );
        assert_eq!(
            AgentError::UndeliveredMetrics(3).to_string(),
            "output plugins unable to send 3 metrics"
        );
    }

    #[test]
    fn test_removal_detected_through_context() {
        let err = anyhow::Error::new(PluginRemoved::new("no such device"))
            .context("opening device");
        assert!(is_removal(&err));

        let err: anyhow::Result<()> = Err(anyhow::anyhow!("timeout")).context("connecting");
        assert!(!is_removal(&err.unwrap_err()));
    }
}
