// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Running plugin wrappers.
//!
//! Each wrapper pairs a plugin with its effective configuration, its filter, its logger and
//! its statistics. The agent only ever talks to plugins through these wrappers.

pub mod aggregator;
pub mod buffer;
pub mod input;
pub mod output;
pub mod processor;
pub mod stats;

use serde::Deserialize;

use crate::config::deserialize_tags;
use crate::metric::Metric;

pub use aggregator::{AggregatorConfig, RunningAggregator};
pub use buffer::MetricBuffer;
pub use input::{InputConfig, RunningInput};
pub use output::{OutputConfig, RunningOutput};
pub use processor::{ProcessorConfig, RunningProcessor};

/// Renaming and tagging applied to metrics leaving an input or an aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricNaming {
    pub name_override: Option<String>,
    pub measurement_prefix: Option<String>,
    pub measurement_suffix: Option<String>,
    #[serde(deserialize_with = "deserialize_tags")]
    pub tags: Vec<(String, String)>,
}

impl MetricNaming {
    /// Plugin tags win over `extra_tags`; neither overwrites a tag the metric already has.
    pub(crate) fn apply(&self, metric: &mut Metric, extra_tags: &[(String, String)]) {
        if let Some(name) = &self.name_override {
            metric.set_name(name.as_str());
        }
        if let Some(prefix) = &self.measurement_prefix {
            metric.add_prefix(prefix);
        }
        if let Some(suffix) = &self.measurement_suffix {
            metric.add_suffix(suffix);
        }
        for (key, value) in self.tags.iter().chain(extra_tags) {
            if !metric.has_tag(key) {
                metric.add_tag(key.as_str(), value.as_str());
            }
        }
    }
}
