// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accumulator::{precision_for, Accumulator};
use crate::agent::Runtime;
use crate::errors::{is_removal, AgentError};
use crate::metric::Metric;
use crate::models::input::Schedule;
use crate::models::RunningInput;
use crate::ticker::{AlignedTicker, Ticker, UnalignedTicker};

pub(crate) struct InputUnit {
    pub(crate) inputs: Vec<(Arc<RunningInput>, Accumulator, Schedule)>,
}

impl InputUnit {
    pub(crate) fn running(&self) -> Vec<Arc<RunningInput>> {
        self.inputs.iter().map(|(input, _, _)| Arc::clone(input)).collect()
    }
}

/// Builds one accumulator per input on `dst` and starts the service inputs. A failing start
/// stops every service input started before it.
pub(crate) async fn start_inputs(
    rt: &Runtime,
    dst: mpsc::Sender<Metric>,
    inputs: Vec<RunningInput>,
) -> Result<InputUnit, AgentError> {
    let mut unit = InputUnit {
        inputs: Vec::with_capacity(inputs.len()),
    };
    for input in inputs {
        let input = Arc::new(input);
        let schedule = input.schedule(&rt.schedule);
        let mut acc = Accumulator::new(input.clone(), dst.clone(), rt.clock, rt.ids.clone());
        acc.set_precision(precision_for(schedule.precision, schedule.interval));

        if input.is_service() {
            debug!("[agent] Starting service input {}", input.log_name());
            if let Err(e) = input.start(acc.clone()).await {
                if is_removal(&e) {
                    warn!(
                        "[agent] Starting input {} failed, removing it: {e:#}",
                        input.log_name()
                    );
                    continue;
                }
                stop_service_inputs(&unit).await;
                return Err(AgentError::Start {
                    plugin: input.log_name().to_string(),
                    source: e,
                });
            }
        }
        unit.inputs.push((input, acc, schedule));
    }
    Ok(unit)
}

pub(crate) async fn stop_service_inputs(unit: &InputUnit) {
    for (input, _, _) in &unit.inputs {
        if input.is_service() {
            input.stop().await;
        }
    }
}

/// Runs one gather loop per input until `cancel`, then stops the service inputs. Dropping
/// the unit afterwards releases the last senders of the input channel.
pub(crate) async fn run_inputs(
    rt: Runtime,
    start: SystemTime,
    unit: InputUnit,
    cancel: CancellationToken,
) {
    let supervisor = &rt.supervisor;
    let mut loops = Vec::with_capacity(unit.inputs.len());
    for (input, acc, schedule) in &unit.inputs {
        let ticker: Box<dyn Ticker> = if rt.round_interval {
            Box::new(AlignedTicker::new(
                start,
                schedule.interval,
                schedule.jitter,
                schedule.offset,
                rt.clock,
            ))
        } else {
            Box::new(UnalignedTicker::new(
                schedule.interval,
                schedule.jitter,
                schedule.offset,
                rt.clock,
            ))
        };
        loops.push(supervisor.spawn(
            format!("gather loop for {}", input.log_name()),
            gather_loop(
                Arc::clone(input),
                acc.clone(),
                ticker,
                schedule.interval,
                cancel.clone(),
                rt.clone(),
            ),
        ));
    }

    for handle in loops {
        let _ = handle.await;
    }

    debug!("[agent] Stopping service inputs");
    stop_service_inputs(&unit).await;
    drop(unit);
    debug!("[agent] Input channel closed");
}

async fn gather_loop(
    input: Arc<RunningInput>,
    acc: Accumulator,
    mut ticker: Box<dyn Ticker>,
    interval: Duration,
    cancel: CancellationToken,
    rt: Runtime,
) {
    loop {
        let tick = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            tick = ticker.elapsed() => tick,
        };
        if tick.is_none() {
            break;
        }
        if let Err(e) = gather_once(&input, &acc, ticker.as_mut(), interval, &rt).await {
            acc.add_error(e);
        }
    }
    ticker.stop();
}

fn spawn_gather(input: &Arc<RunningInput>, acc: &Accumulator) -> JoinHandle<anyhow::Result<()>> {
    let input = Arc::clone(input);
    let acc = acc.clone();
    tokio::spawn(async move { input.gather(&acc).await })
}

fn gather_failed(input: &RunningInput) -> anyhow::Error {
    anyhow::anyhow!("gather in {} did not complete", input.log_name())
}

/// Runs one gather to completion. Overruns are reported, never cancelled: a warning each
/// `interval` and a skipped-collection notice whenever the ticker fires meanwhile.
pub(crate) async fn gather_once(
    input: &Arc<RunningInput>,
    acc: &Accumulator,
    ticker: &mut dyn Ticker,
    interval: Duration,
    rt: &Runtime,
) -> anyhow::Result<()> {
    let mut task = spawn_gather(input, acc);
    let mut slow_warning = interval_at(Instant::now() + interval, interval);
    let mut ticking = true;
    loop {
        tokio::select! {
            result = &mut task => {
                let task = format!("gather in {}", input.log_name());
                return rt
                    .supervisor
                    .check(result, &task)
                    .unwrap_or_else(|| Err(gather_failed(input)));
            }
            _ = slow_warning.tick() => {
                input.logger().warn(format_args!(
                    "Collection took longer than expected; not complete after interval of {interval:?}"
                ));
                input.gather_timeouts.incr(1);
            }
            tick = ticker.elapsed(), if ticking => match tick {
                Some(_) => input
                    .logger()
                    .debug("Previous collection has not completed; scheduled collection skipped"),
                None => ticking = false,
            },
        }
    }
}

/// Single gather outside any schedule, used by one-shot runs.
pub(crate) async fn gather_now(
    input: &Arc<RunningInput>,
    acc: &Accumulator,
    rt: &Runtime,
) -> anyhow::Result<()> {
    let task = format!("gather in {}", input.log_name());
    rt.supervisor
        .check(spawn_gather(input, acc).await, &task)
        .unwrap_or_else(|| Err(gather_failed(input)))
}
