// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Plugin state persistence across agent restarts.
//!
//! State is keyed by plugin log name. Plugins without state are never stored.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing::debug;

use crate::errors::AgentError;

pub type PluginStates = HashMap<String, Value>;

pub trait StatePersister: Send + Sync {
    fn load(&self) -> Result<PluginStates, AgentError>;

    fn store(&self, states: PluginStates) -> Result<(), AgentError>;
}

/// Stores all plugin states as one JSON object in a file.
#[derive(Debug, Clone)]
pub struct JsonFilePersister {
    path: PathBuf,
}

impl JsonFilePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatePersister for JsonFilePersister {
    fn load(&self) -> Result<PluginStates, AgentError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("[agent] No state file at {}", self.path.display());
                return Ok(PluginStates::new());
            }
            Err(e) => {
                return Err(AgentError::State(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_slice(&data)
            .map_err(|e| AgentError::State(format!("parsing {}: {e}", self.path.display())))
    }

    fn store(&self, states: PluginStates) -> Result<(), AgentError> {
        let data = serde_json::to_vec_pretty(&states)
            .map_err(|e| AgentError::State(format!("encoding state: {e}")))?;
        // atomic replace
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| AgentError::State(format!("writing {}: {e}", self.path.display())))
    }
}

/// In-process persister, mostly useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    states: Mutex<PluginStates>,
}

impl MemoryPersister {
    #[must_use]
    pub fn new(states: PluginStates) -> Self {
        Self {
            states: Mutex::new(states),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PluginStates {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StatePersister for MemoryPersister {
    fn load(&self) -> Result<PluginStates, AgentError> {
        Ok(self.snapshot())
    }

    fn store(&self, states: PluginStates) -> Result<(), AgentError> {
        *self.states.lock().unwrap_or_else(PoisonError::into_inner) = states;
        Ok(())
    }
}
