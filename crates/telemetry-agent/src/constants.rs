// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Capacity of every channel connecting two pipeline stages.
pub const CHANNEL_CAPACITY: usize = 100;

/// Delay between the first failed output connection and the single retry.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(15);

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_AGGREGATOR_PERIOD: Duration = Duration::from_secs(30);

pub const DEFAULT_METRIC_BATCH_SIZE: usize = 1000;
pub const DEFAULT_METRIC_BUFFER_LIMIT: usize = 10_000;

/// Prefix of the environment variables read by the configuration loader.
pub const ENV_PREFIX: &str = "TELEMETRY_AGENT_";
