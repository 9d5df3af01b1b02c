// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output stage: connection management, fan-out and flushing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::supervisor::Supervisor;
use crate::agent::Runtime;
use crate::errors::{is_removal, AgentError};
use crate::metric::Metric;
use crate::models::RunningOutput;
use crate::ticker::{RollingTicker, Ticker};

pub(crate) struct OutputUnit {
    pub(crate) src: mpsc::Receiver<Metric>,
    pub(crate) outputs: Vec<Arc<RunningOutput>>,
}

/// Connects `output`, retrying once after `retry_delay`. A removal error is returned
/// without retrying.
async fn connect_output(
    output: &RunningOutput,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    debug!("[agent] Attempting connection to [{}]", output.log_name());
    let Err(e) = output.connect().await else {
        debug!("[agent] Successfully connected to {}", output.log_name());
        return Ok(());
    };
    if is_removal(&e) {
        return Err(e);
    }
    error!(
        "[agent] Failed to connect to [{}], retrying in {retry_delay:?}, error was \"{e:#}\"",
        output.log_name()
    );
    tokio::select! {
        () = cancel.cancelled() => return Err(e.context("cancelled before retrying")),
        () = sleep(retry_delay) => {}
    }
    output
        .connect()
        .await
        .with_context(|| format!("retrying connection to {}", output.log_name()))?;
    debug!("[agent] Successfully connected to {}", output.log_name());
    Ok(())
}

/// Connects every output. Removed outputs are closed and dropped; any other failure closes
/// the outputs connected so far and aborts.
pub(crate) async fn start_outputs(
    rt: &Runtime,
    outputs: Vec<RunningOutput>,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<RunningOutput>>, AgentError> {
    let mut connected: Vec<Arc<RunningOutput>> = Vec::with_capacity(outputs.len());
    for output in outputs {
        match connect_output(&output, rt.connect_retry_delay, cancel).await {
            Ok(()) => connected.push(Arc::new(output)),
            Err(e) if is_removal(&e) => {
                info!("[agent] Removing output {}: {e:#}", output.log_name());
                if let Err(e) = output.close().await {
                    error!("[agent] Error closing output {}: {e:#}", output.log_name());
                }
            }
            Err(e) => {
                close_outputs(&connected).await;
                return Err(AgentError::Connect {
                    plugin: output.log_name().to_string(),
                    source: e,
                });
            }
        }
    }
    Ok(connected)
}

pub(crate) async fn close_outputs(outputs: &[Arc<RunningOutput>]) {
    for output in outputs {
        if let Err(e) = output.close().await {
            error!("[agent] Error closing output {}: {e:#}", output.log_name());
        }
    }
}

/// Copies every metric from the unit's source to all outputs and runs one flush loop per
/// output. Once the source closes each output flushes everything it buffered and is closed.
pub(crate) async fn run_outputs(rt: Runtime, unit: OutputUnit) {
    let OutputUnit { mut src, outputs } = unit;
    let stop = CancellationToken::new();

    let mut flushers = Vec::with_capacity(outputs.len());
    for output in &outputs {
        let settings = output.settings();
        let ticker = RollingTicker::new(settings.interval, settings.jitter, rt.clock);
        flushers.push(rt.supervisor.spawn(
            format!("flush loop for {}", output.log_name()),
            flush_loop(
                output.clone(),
                ticker,
                rt.flush.subscribe(),
                stop.clone(),
                rt.supervisor.clone(),
            ),
        ));
    }

    while let Some(metric) = src.recv().await {
        match outputs.split_last() {
            Some((last, rest)) => {
                for output in rest {
                    output.add_metric(metric.clone());
                }
                last.add_metric(metric);
            }
            None => metric.discard(),
        }
    }

    info!("[agent] Hang on, flushing any cached metrics before shutdown");
    stop.cancel();
    for flusher in flushers {
        let _ = flusher.await;
    }

    info!("[agent] Stopping running outputs");
    close_outputs(&outputs).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    All,
    Batch,
}

async fn flush_loop(
    output: Arc<RunningOutput>,
    mut ticker: RollingTicker,
    mut flush: watch::Receiver<u64>,
    stop: CancellationToken,
    supervisor: Supervisor,
) {
    let mut ticking = true;
    let mut triggers = true;
    loop {
        let kind = tokio::select! {
            biased;
            () = stop.cancelled() => {
                ticker.stop();
                if let Err(e) = flush_once(&output, &mut ticker, WriteKind::All, &supervisor).await {
                    error!("[agent] Error writing to {}: {e:#}", output.log_name());
                }
                return;
            }
            tick = ticker.elapsed(), if ticking => match tick {
                Some(_) => WriteKind::All,
                None => {
                    ticking = false;
                    continue;
                }
            },
            changed = flush.changed(), if triggers => match changed {
                Ok(()) => {
                    debug!("[agent] Flushing {} on request", output.log_name());
                    WriteKind::All
                }
                Err(_) => {
                    triggers = false;
                    continue;
                }
            },
            () = output.batch_ready() => WriteKind::Batch,
        };
        if let Err(e) = flush_once(&output, &mut ticker, kind, &supervisor).await {
            error!("[agent] Error writing to {}: {e:#}", output.log_name());
        }
    }
}

/// Runs one write to completion. A tick during the write means the output falls behind
/// its flush interval; that is reported and the write continues.
async fn flush_once(
    output: &Arc<RunningOutput>,
    ticker: &mut dyn Ticker,
    kind: WriteKind,
    supervisor: &Supervisor,
) -> anyhow::Result<()> {
    let writer = Arc::clone(output);
    let mut task = tokio::spawn(async move {
        match kind {
            WriteKind::All => writer.write().await,
            WriteKind::Batch => writer.write_batch().await,
        }
    });
    let mut ticking = true;
    loop {
        tokio::select! {
            result = &mut task => {
                output.log_buffer_status();
                let task = format!("write to {}", output.log_name());
                return supervisor.check(result, &task).unwrap_or_else(|| {
                    Err(anyhow::anyhow!("write to {} did not complete", output.log_name()))
                });
            }
            tick = ticker.elapsed(), if ticking => match tick {
                Some(_) => {
                    warn!(
                        "[agent] [{}] did not complete within its flush interval",
                        output.log_name()
                    );
                    output.log_buffer_status();
                }
                None => ticking = false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::runtime;
    use crate::metric::{FieldValue, ValueType, NO_TAGS};
    use crate::models::output::FlushSettings;
    use crate::models::OutputConfig;
    use crate::plugin::Output;
    use crate::PluginRemoved;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::UNIX_EPOCH;

    #[derive(Default)]
    struct Shared {
        connects: AtomicUsize,
        written: Mutex<Vec<String>>,
        closed: AtomicUsize,
    }

    struct Recorder {
        shared: Arc<Shared>,
        fail_connects: usize,
        removed: bool,
    }

    #[async_trait]
    impl Output for Recorder {
        async fn connect(&mut self) -> anyhow::Result<()> {
            let attempt = self.shared.connects.fetch_add(1, Ordering::SeqCst);
            if self.removed {
                return Err(PluginRemoved::new("bad credentials").into());
            }
            if attempt < self.fail_connects {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }

        async fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
            let mut written = self.shared.written.lock().unwrap();
            written.extend(metrics.iter().map(|m| m.name().to_string()));
            Ok(())
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn defaults() -> FlushSettings {
        FlushSettings {
            interval: Duration::from_secs(10),
            jitter: Duration::ZERO,
            batch_size: 100,
            buffer_limit: 1000,
        }
    }

    fn output(fail_connects: usize, removed: bool) -> (RunningOutput, Arc<Shared>) {
        let shared = Arc::new(Shared::default());
        let plugin = Recorder {
            shared: shared.clone(),
            fail_connects,
            removed,
        };
        let output =
            RunningOutput::new(Box::new(plugin), OutputConfig::new("recorder"), &defaults())
                .unwrap();
        (output, shared)
    }

    fn metric(name: &str) -> Metric {
        Metric::new(name, NO_TAGS, [("v", FieldValue::Int(1))], UNIX_EPOCH, ValueType::Untyped)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_once() {
        let (rt, _) = runtime();
        let (flaky, flaky_shared) = output(1, false);
        let (broken, broken_shared) = output(2, false);

        let connected = start_outputs(&rt, vec![flaky], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(flaky_shared.connects.load(Ordering::SeqCst), 2);

        let err = start_outputs(&rt, vec![broken], &CancellationToken::new())
            .await
            .err().unwrap();
        assert!(matches!(err, AgentError::Connect { .. }));
        assert_eq!(broken_shared.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_output_is_closed_without_retry() {
        let (rt, _) = runtime();
        let (kept, _) = output(0, false);
        let (removed, removed_shared) = output(0, true);
        let connected = start_outputs(&rt, vec![removed, kept], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(removed_shared.connects.load(Ordering::SeqCst), 1);
        assert_eq!(removed_shared.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_and_final_flush() {
        let (rt, _) = runtime();
        let (first, first_shared) = output(0, false);
        let (second, second_shared) = output(0, false);
        let (tx, src) = mpsc::channel(10);
        let task = tokio::spawn(run_outputs(
            rt,
            OutputUnit {
                src,
                outputs: vec![Arc::new(first), Arc::new(second)],
            },
        ));
        tx.send(metric("a")).await.unwrap();
        tx.send(metric("b")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        for shared in [first_shared, second_shared] {
            assert_eq!(*shared.written.lock().unwrap(), vec!["a", "b"]);
            assert_eq!(shared.closed.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_trigger_writes_before_interval() {
        let (rt, _) = runtime();
        let (out, shared) = output(0, false);
        let flush = rt.flush.clone();
        let (tx, src) = mpsc::channel(10);
        let task = tokio::spawn(run_outputs(
            rt,
            OutputUnit {
                src,
                outputs: vec![Arc::new(out)],
            },
        ));
        tx.send(metric("a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(shared.written.lock().unwrap().is_empty());

        flush.send_modify(|n| *n = n.wrapping_add(1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*shared.written.lock().unwrap(), vec!["a"]);

        drop(tx);
        task.await.unwrap();
    }
}
