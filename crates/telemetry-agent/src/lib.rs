// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Telemetry Agent
//!
//! Concurrent pipeline orchestrator for a plugin based telemetry agent.
//!
//! Metrics flow through four kinds of stages connected by bounded channels:
//!
//! ```text
//!   inputs ──> processors ──> aggregators ──> (aggregator processors) ──> outputs
//!                                  │                                         ▲
//!                                  └──────── unclaimed originals ────────────┘
//! ```
//!
//! - [`agent`]: builds the pipeline, starts stages in dependency order, runs one task per
//!   plugin and shuts everything down as a closing waterfall.
//! - [`accumulator`]: write side API handed to plugins.
//! - [`tracking`]: delivery tickets for metrics whose producers need to learn their fate.
//! - [`ticker`]: aligned, unaligned and rolling schedules with jitter.
//! - [`models`]: running plugin wrappers carrying effective configuration and stats.
//! - [`plugin`]: the capability traits plugins implement.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod accumulator;
pub mod agent;
pub mod clock;
pub mod config;
pub mod constants;
pub mod errors;
pub mod filter;
pub mod logger;
pub mod metric;
pub mod models;
pub mod persist;
pub mod plugin;
pub mod ticker;
pub mod tracking;

pub use accumulator::{Accumulator, TrackingAccumulator};
pub use agent::{Agent, FlushTrigger};
pub use errors::{AgentError, PluginRemoved};
pub use metric::{Disposition, FieldValue, Metric, ValueType};
