// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline orchestration.
//!
//! [`Agent`] owns every registered plugin until [`Agent::run`] or [`Agent::once`] consumes it.
//! Startup goes from the sink to the sources: outputs connect first, then the post
//! aggregation processors, the aggregators and the processors start, and inputs start last.
//! Shutdown goes the other way: cancelling the token stops input scheduling, and each stage
//! closes its destination channel only after draining its source.

mod aggregators;
mod inputs;
mod outputs;
mod processors;
pub mod supervisor;

use std::mem;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::errors::{is_removal, AgentError};
use crate::metric::Metric;
use crate::models::input::Schedule;
use crate::models::output::FlushSettings;
use crate::models::{
    AggregatorConfig, InputConfig, OutputConfig, ProcessorConfig, RunningAggregator, RunningInput,
    RunningOutput, RunningProcessor,
};
use crate::persist::{JsonFilePersister, PluginStates, StatePersister};
use crate::plugin::{Aggregator, Input, Output, StreamingProcessor};
use crate::tracking::IdSequence;

use aggregators::{run_aggregators, AggregatorUnit};
use inputs::{gather_now, run_inputs, start_inputs, stop_service_inputs, InputUnit};
use outputs::{close_outputs, run_outputs, start_outputs, OutputUnit};
use processors::{run_processor, start_processors, stop_processors, ProcessorUnit};
use supervisor::{exit_process, FatalHandler, Supervisor};

/// Requests an immediate flush of every output.
#[derive(Clone)]
pub struct FlushTrigger(Arc<watch::Sender<u64>>);

impl FlushTrigger {
    pub fn flush(&self) {
        self.0.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// Settings shared by every task of one pipeline run.
#[derive(Clone)]
pub(crate) struct Runtime {
    pub(crate) clock: Clock,
    pub(crate) ids: Arc<IdSequence>,
    pub(crate) capacity: usize,
    pub(crate) round_interval: bool,
    pub(crate) schedule: Schedule,
    pub(crate) precision: Option<Duration>,
    pub(crate) interval: Duration,
    pub(crate) connect_retry_delay: Duration,
    pub(crate) supervisor: Supervisor,
    pub(crate) flush: Arc<watch::Sender<u64>>,
}

#[derive(Default)]
struct Plugins {
    inputs: Vec<RunningInput>,
    processors: Vec<RunningProcessor>,
    aggregator_processors: Vec<RunningProcessor>,
    aggregators: Vec<RunningAggregator>,
    outputs: Vec<RunningOutput>,
}

pub struct Agent {
    config: AgentConfig,
    clock: Clock,
    ids: Arc<IdSequence>,
    persister: Option<Arc<dyn StatePersister>>,
    fatal: FatalHandler,
    flush: Arc<watch::Sender<u64>>,
    plugins: Plugins,
}

impl Agent {
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        let (flush, _) = watch::channel(0);
        Self {
            config,
            clock: Clock::system(),
            ids: Arc::new(IdSequence::new()),
            persister: None,
            fatal: exit_process(),
            flush: Arc::new(flush),
            plugins: Plugins::default(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_id_sequence(mut self, ids: Arc<IdSequence>) -> Self {
        self.ids = ids;
        self
    }

    /// Overrides the persister derived from `state_file`.
    #[must_use]
    pub fn with_persister(mut self, persister: Arc<dyn StatePersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    #[must_use]
    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.fatal = fatal;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn flush_trigger(&self) -> FlushTrigger {
        FlushTrigger(Arc::clone(&self.flush))
    }

    pub fn add_input(&mut self, plugin: Box<dyn Input>, config: InputConfig) -> Result<(), AgentError> {
        let mut input = RunningInput::new(plugin, config)?;
        input.set_global_tags(self.config.global_tags.clone());
        self.plugins.inputs.push(input);
        Ok(())
    }

    pub fn add_processor(
        &mut self,
        plugin: Box<dyn StreamingProcessor>,
        config: ProcessorConfig,
    ) -> Result<(), AgentError> {
        self.plugins
            .processors
            .push(RunningProcessor::new(plugin, config)?);
        Ok(())
    }

    /// Registers a processor applied to aggregator output only.
    pub fn add_aggregator_processor(
        &mut self,
        plugin: Box<dyn StreamingProcessor>,
        config: ProcessorConfig,
    ) -> Result<(), AgentError> {
        self.plugins
            .aggregator_processors
            .push(RunningProcessor::new(plugin, config)?);
        Ok(())
    }

    pub fn add_aggregator(
        &mut self,
        plugin: Box<dyn Aggregator>,
        config: AggregatorConfig,
    ) -> Result<(), AgentError> {
        self.plugins
            .aggregators
            .push(RunningAggregator::new(plugin, config)?);
        Ok(())
    }

    pub fn add_output(&mut self, plugin: Box<dyn Output>, config: OutputConfig) -> Result<(), AgentError> {
        let defaults = FlushSettings {
            interval: self.config.flush_interval,
            jitter: self.config.flush_jitter,
            batch_size: self.config.metric_batch_size,
            buffer_limit: self.config.metric_buffer_limit,
        };
        self.plugins
            .outputs
            .push(RunningOutput::new(plugin, config, &defaults)?);
        Ok(())
    }

    fn runtime(&self, cancel: &CancellationToken) -> Runtime {
        Runtime {
            clock: self.clock,
            ids: Arc::clone(&self.ids),
            capacity: self.config.channel_capacity,
            round_interval: self.config.round_interval,
            schedule: Schedule {
                interval: self.config.interval,
                precision: self.config.precision,
                jitter: self.config.collection_jitter,
                offset: self.config.collection_offset,
            },
            precision: self.config.precision,
            interval: self.config.interval,
            connect_retry_delay: self.config.connect_retry_delay,
            supervisor: Supervisor::new(Arc::clone(&self.fatal), cancel.child_token()),
            flush: Arc::clone(&self.flush),
        }
    }

    fn persister(&self) -> Option<Arc<dyn StatePersister>> {
        self.persister.clone().or_else(|| {
            self.config
                .state_file
                .as_ref()
                .map(|path| Arc::new(JsonFilePersister::new(path)) as Arc<dyn StatePersister>)
        })
    }

    /// Validates the configuration, initialises every plugin and sorts the processor chains.
    fn prepare(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<(Runtime, Plugins, Option<Arc<dyn StatePersister>>), AgentError> {
        self.config.validate()?;
        if self.plugins.inputs.is_empty() {
            return Err(AgentError::Config("no inputs configured".to_string()));
        }
        let rt = self.runtime(cancel);
        let persister = self.persister();
        let mut plugins = mem::take(&mut self.plugins);

        plugins.inputs = init_plugins(plugins.inputs, RunningInput::init, RunningInput::log_name)?;
        plugins.processors = init_plugins(
            plugins.processors,
            RunningProcessor::init,
            RunningProcessor::log_name,
        )?;
        plugins.aggregator_processors = init_plugins(
            plugins.aggregator_processors,
            RunningProcessor::init,
            RunningProcessor::log_name,
        )?;
        plugins.aggregators = init_plugins(
            plugins.aggregators,
            RunningAggregator::init,
            RunningAggregator::log_name,
        )?;
        plugins.outputs =
            init_plugins(plugins.outputs, RunningOutput::init, RunningOutput::log_name)?;
        if plugins.inputs.is_empty() {
            return Err(AgentError::Config("no inputs configured".to_string()));
        }

        plugins.processors.sort_by_key(RunningProcessor::order);
        plugins.aggregator_processors.sort_by_key(RunningProcessor::order);
        Ok((rt, plugins, persister))
    }

    /// Runs the pipeline until `cancel` fires and every stage drained. A panicking task
    /// stops the run early; its state is not stored.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!(
            "[agent] Config: Interval:{:?}, Flush Interval:{:?}",
            self.config.interval, self.config.flush_interval
        );
        let (rt, mut plugins, persister) = self.prepare(&cancel)?;
        if let Some(persister) = &persister {
            restore_states(&mut plugins, persister.load()?)?;
        }

        let stop = rt.supervisor.abort_token().clone();
        let pipeline = build(&rt, plugins, &stop).await?;
        let start = rt.clock.now();
        let (inputs, running) = pipeline.spawn(&rt, start);
        let gathered = inputs.running();

        run_inputs(rt.clone(), start, inputs, stop).await;
        let Finished {
            processors,
            aggregator_processors,
            outputs,
        } = running.wait().await;
        if let Some(failure) = rt.supervisor.failure() {
            return Err(AgentError::Panicked(failure.to_string()));
        }
        info!("[agent] Stopped Successfully");

        if let Some(persister) = persister {
            let mut states = plugin_states(&gathered, &processors, &aggregator_processors);
            output_states(&mut states, &outputs).await;
            persister.store(states)?;
        }
        report(&gathered, &outputs)
    }

    /// Collects once from every input, flushes and returns. Service inputs get `wait` to
    /// emit before the collection. State is neither restored nor stored.
    pub async fn once(self, wait: Duration) -> Result<(), AgentError> {
        let (rt, plugins, _) = self.prepare(&CancellationToken::new())?;
        let pipeline = build(&rt, plugins, rt.supervisor.abort_token()).await?;
        let start = rt.clock.now();
        let (inputs, running) = pipeline.spawn(&rt, start);
        let gathered = inputs.running();

        if gathered.iter().any(|input| input.is_service()) {
            debug!("[agent] Waiting {wait:?} for service inputs");
            tokio::time::sleep(wait).await;
        }
        for (input, acc, _) in &inputs.inputs {
            if let Err(e) = gather_now(input, acc, &rt).await {
                acc.add_error(e);
            }
        }
        stop_service_inputs(&inputs).await;
        drop(inputs);

        let finished = running.wait().await;
        if let Some(failure) = rt.supervisor.failure() {
            return Err(AgentError::Panicked(failure.to_string()));
        }
        report(&gathered, &finished.outputs)
    }
}

fn init_plugins<T>(
    plugins: Vec<T>,
    mut init: impl FnMut(&mut T) -> anyhow::Result<()>,
    log_name: impl Fn(&T) -> &str,
) -> Result<Vec<T>, AgentError> {
    let mut ready = Vec::with_capacity(plugins.len());
    for mut plugin in plugins {
        match init(&mut plugin) {
            Ok(()) => ready.push(plugin),
            Err(e) if is_removal(&e) => {
                warn!("[agent] Removing {}: {e:#}", log_name(&plugin));
            }
            Err(e) => {
                return Err(AgentError::Init {
                    plugin: log_name(&plugin).to_string(),
                    source: e,
                })
            }
        }
    }
    Ok(ready)
}

/// Stages started and connected, waiting to run.
struct Pipeline {
    outputs: Vec<Arc<RunningOutput>>,
    output_src: mpsc::Receiver<Metric>,
    aggregator_processors: Vec<ProcessorUnit>,
    aggregators: Option<AggregatorUnit>,
    processors: Vec<ProcessorUnit>,
    inputs: InputUnit,
}

async fn build(
    rt: &Runtime,
    plugins: Plugins,
    cancel: &CancellationToken,
) -> Result<Pipeline, AgentError> {
    let Plugins {
        inputs,
        processors,
        aggregator_processors,
        aggregators,
        outputs,
    } = plugins;

    let outputs = start_outputs(rt, outputs, cancel).await?;
    let (output_tx, output_src) = mpsc::channel(rt.capacity);

    let (dst, mut aggregator_processors, aggregators) = if aggregators.is_empty() {
        if !aggregator_processors.is_empty() {
            debug!("[agent] No aggregators configured, skipping aggregator processors");
        }
        (output_tx, Vec::new(), None)
    } else {
        let (agg_dst, units) =
            match start_processors(rt, output_tx.clone(), aggregator_processors).await {
                Ok(started) => started,
                Err(e) => {
                    close_outputs(&outputs).await;
                    return Err(e);
                }
            };
        let (agg_tx, agg_src) = mpsc::channel(rt.capacity);
        let unit = AggregatorUnit {
            src: agg_src,
            agg_dst,
            out_dst: output_tx,
            aggregators: aggregators.into_iter().map(Arc::new).collect(),
        };
        (agg_tx, units, Some(unit))
    };

    let (head, mut processors) = match start_processors(rt, dst, processors).await {
        Ok(started) => started,
        Err(e) => {
            stop_processors(&mut aggregator_processors).await;
            close_outputs(&outputs).await;
            return Err(e);
        }
    };

    let inputs = match start_inputs(rt, head, inputs).await {
        Ok(unit) => unit,
        Err(e) => {
            stop_processors(&mut processors).await;
            stop_processors(&mut aggregator_processors).await;
            close_outputs(&outputs).await;
            return Err(e);
        }
    };

    Ok(Pipeline {
        outputs,
        output_src,
        aggregator_processors,
        aggregators,
        processors,
        inputs,
    })
}

impl Pipeline {
    /// Spawns every stage downstream of the inputs. The inputs are handed back to the caller,
    /// whose drop of them starts the closing waterfall.
    fn spawn(self, rt: &Runtime, start: SystemTime) -> (InputUnit, Running) {
        let supervisor = &rt.supervisor;
        let output_task = supervisor.spawn(
            "outputs".to_string(),
            run_outputs(
                rt.clone(),
                OutputUnit {
                    src: self.output_src,
                    outputs: self.outputs.clone(),
                },
            ),
        );
        let spawn_processor = |unit: ProcessorUnit| {
            supervisor.spawn(format!("processor {}", unit.log_name()), run_processor(unit))
        };
        let aggregator_processor_tasks = self
            .aggregator_processors
            .into_iter()
            .map(spawn_processor)
            .collect();
        let aggregator_task = self.aggregators.map(|unit| {
            supervisor.spawn(
                "aggregators".to_string(),
                run_aggregators(rt.clone(), start, unit),
            )
        });
        let processor_tasks = self.processors.into_iter().map(spawn_processor).collect();
        let running = Running {
            outputs: self.outputs,
            output_task,
            aggregator_task,
            aggregator_processor_tasks,
            processor_tasks,
        };
        (self.inputs, running)
    }
}

/// Stage tasks, each already under the supervisor.
struct Running {
    outputs: Vec<Arc<RunningOutput>>,
    output_task: JoinHandle<Option<()>>,
    aggregator_task: Option<JoinHandle<Option<()>>>,
    aggregator_processor_tasks: Vec<JoinHandle<Option<RunningProcessor>>>,
    processor_tasks: Vec<JoinHandle<Option<RunningProcessor>>>,
}

struct Finished {
    processors: Vec<RunningProcessor>,
    aggregator_processors: Vec<RunningProcessor>,
    outputs: Vec<Arc<RunningOutput>>,
}

async fn join_processors(tasks: Vec<JoinHandle<Option<RunningProcessor>>>) -> Vec<RunningProcessor> {
    let mut processors = Vec::with_capacity(tasks.len());
    for task in tasks {
        if let Ok(Some(processor)) = task.await {
            processors.push(processor);
        }
    }
    processors
}

impl Running {
    /// Waits for the stages in the order their inputs close.
    async fn wait(self) -> Finished {
        let processors = join_processors(self.processor_tasks).await;
        if let Some(task) = self.aggregator_task {
            let _ = task.await;
        }
        let aggregator_processors = join_processors(self.aggregator_processor_tasks).await;
        let _ = self.output_task.await;
        Finished {
            processors,
            aggregator_processors,
            outputs: self.outputs,
        }
    }
}

fn aggregator_processor_key(log_name: &str) -> String {
    format!("aggregator_{log_name}")
}

fn restore(
    states: &mut PluginStates,
    key: &str,
    set_state: impl FnOnce(Value) -> anyhow::Result<()>,
) -> Result<(), AgentError> {
    match states.remove(key) {
        Some(state) => set_state(state)
            .map_err(|e| AgentError::State(format!("restoring state of {key}: {e:#}"))),
        None => Ok(()),
    }
}

fn restore_states(plugins: &mut Plugins, mut states: PluginStates) -> Result<(), AgentError> {
    for input in &mut plugins.inputs {
        let key = input.log_name().to_string();
        restore(&mut states, &key, |state| input.set_state(state))?;
    }
    for processor in &mut plugins.processors {
        let key = processor.log_name().to_string();
        restore(&mut states, &key, |state| processor.set_state(state))?;
    }
    for processor in &mut plugins.aggregator_processors {
        let key = aggregator_processor_key(processor.log_name());
        restore(&mut states, &key, |state| processor.set_state(state))?;
    }
    for output in &mut plugins.outputs {
        let key = output.log_name().to_string();
        restore(&mut states, &key, |state| output.set_state(state))?;
    }
    for key in states.keys() {
        debug!("[agent] No plugin for stored state {key}");
    }
    Ok(())
}

fn plugin_states(
    inputs: &[Arc<RunningInput>],
    processors: &[RunningProcessor],
    aggregator_processors: &[RunningProcessor],
) -> PluginStates {
    let mut states = PluginStates::new();
    for input in inputs {
        if let Some(state) = input.get_state() {
            states.insert(input.log_name().to_string(), state);
        }
    }
    for processor in processors {
        if let Some(state) = processor.get_state() {
            states.insert(processor.log_name().to_string(), state);
        }
    }
    for processor in aggregator_processors {
        if let Some(state) = processor.get_state() {
            states.insert(aggregator_processor_key(processor.log_name()), state);
        }
    }
    states
}

// Processors are only `Send`, so no borrow of them may live across this await.
async fn output_states(states: &mut PluginStates, outputs: &[Arc<RunningOutput>]) {
    for output in outputs {
        if let Some(state) = output.get_state().await {
            states.insert(output.log_name().to_string(), state);
        }
    }
}

fn report(inputs: &[Arc<RunningInput>], outputs: &[Arc<RunningOutput>]) -> Result<(), AgentError> {
    let errors: u64 = inputs.iter().map(|input| input.errors()).sum();
    if errors > 0 {
        return Err(AgentError::GatherErrors(errors));
    }
    let undelivered: usize = outputs.iter().map(|output| output.buffer_len()).sum();
    if undelivered > 0 {
        return Err(AgentError::UndeliveredMetrics(undelivered));
    }
    Ok(())
}
