// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::accumulator::Accumulator;
use crate::agent::Runtime;
use crate::errors::{is_removal, AgentError};
use crate::metric::Metric;
use crate::models::RunningProcessor;

pub(crate) struct ProcessorUnit {
    src: mpsc::Receiver<Metric>,
    processor: RunningProcessor,
    acc: Accumulator,
}

impl ProcessorUnit {
    pub(crate) fn log_name(&self) -> &str {
        self.processor.log_name()
    }
}

/// Connects `processors` in order in front of `dst` and starts them. Units are created from
/// the last processor backwards so each one knows the sender of its successor. Returns the
/// sender feeding the chain head, which is `dst` itself when the chain is empty.
pub(crate) async fn start_processors(
    rt: &Runtime,
    dst: mpsc::Sender<Metric>,
    processors: Vec<RunningProcessor>,
) -> Result<(mpsc::Sender<Metric>, Vec<ProcessorUnit>), AgentError> {
    let mut next = dst;
    let mut units = Vec::with_capacity(processors.len());
    for mut processor in processors.into_iter().rev() {
        let (tx, rx) = mpsc::channel(rt.capacity);
        let acc = Accumulator::new(processor.maker(), next.clone(), rt.clock, rt.ids.clone());
        if let Err(e) = processor.start(acc.clone()).await {
            if is_removal(&e) {
                warn!(
                    "[agent] Starting processor {} failed, removing it: {e:#}",
                    processor.log_name()
                );
                continue;
            }
            stop_processors(&mut units).await;
            return Err(AgentError::Start {
                plugin: processor.log_name().to_string(),
                source: e,
            });
        }
        units.push(ProcessorUnit {
            src: rx,
            processor,
            acc,
        });
        next = tx;
    }
    units.reverse();
    Ok((next, units))
}

pub(crate) async fn stop_processors(units: &mut [ProcessorUnit]) {
    for unit in units {
        unit.processor.stop().await;
    }
}

/// Feeds every metric from the unit's source to its processor until the source closes, then
/// stops the processor. Dropping the accumulator closes the successor's channel.
pub(crate) async fn run_processor(unit: ProcessorUnit) -> RunningProcessor {
    let ProcessorUnit {
        mut src,
        mut processor,
        acc,
    } = unit;
    while let Some(metric) = src.recv().await {
        if let Err(e) = processor.add(metric, &acc).await {
            acc.add_error(e);
        }
    }
    processor.stop().await;
    drop(acc);
    debug!("[agent] Processor {} stopped", processor.log_name());
    processor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::runtime;
    use crate::metric::{FieldValue, ValueType, NO_TAGS};
    use crate::models::ProcessorConfig;
    use crate::plugin::{Processor, StreamingAdapter, StreamingProcessor};
    use crate::PluginRemoved;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;

    struct Tagger(&'static str);

    impl Processor for Tagger {
        fn apply(&mut self, metrics: Vec<Metric>) -> Vec<Metric> {
            metrics
                .into_iter()
                .map(|mut m| {
                    let seen = m.get_tag("seen").map(str::to_string);
                    let seen = match seen {
                        Some(seen) => format!("{seen},{}", self.0),
                        None => self.0.to_string(),
                    };
                    m.add_tag("seen", seen);
                    m
                })
                .collect()
        }
    }

    struct Unavailable;

    #[async_trait]
    impl StreamingProcessor for Unavailable {
        async fn start(&mut self, _acc: Accumulator) -> anyhow::Result<()> {
            Err(PluginRemoved::new("missing device").into())
        }

        async fn add(&mut self, _metric: Metric, _acc: &Accumulator) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Lifecycle {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct Listener {
        life: Arc<Lifecycle>,
        fail: bool,
    }

    #[async_trait]
    impl StreamingProcessor for Listener {
        async fn start(&mut self, _acc: Accumulator) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("address in use");
            }
            self.life.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn add(&mut self, _metric: Metric, _acc: &Accumulator) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&mut self) {
            self.life.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn listener(name: &str, life: &Arc<Lifecycle>, fail: bool) -> RunningProcessor {
        let plugin = Listener {
            life: Arc::clone(life),
            fail,
        };
        RunningProcessor::new(Box::new(plugin), ProcessorConfig::new(name, 0)).unwrap()
    }

    fn tagger(name: &'static str, order: i64) -> RunningProcessor {
        RunningProcessor::new(
            Box::new(StreamingAdapter::new(Tagger(name))),
            ProcessorConfig::new(name, order),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let (rt, _) = runtime();
        let (dst, mut out) = mpsc::channel(10);
        let removed =
            RunningProcessor::new(Box::new(Unavailable), ProcessorConfig::new("gone", 0)).unwrap();
        let (head, units) =
            start_processors(&rt, dst, vec![tagger("p1", 1), removed, tagger("p2", 2)])
                .await
                .unwrap();
        assert_eq!(units.len(), 2);
        let tasks: Vec<_> = units
            .into_iter()
            .map(|unit| tokio::spawn(run_processor(unit)))
            .collect();

        head.send(Metric::new(
            "cpu",
            NO_TAGS,
            [("v", FieldValue::Int(1))],
            UNIX_EPOCH,
            ValueType::Untyped,
        ))
        .await
        .unwrap();
        drop(head);

        let metric = out.recv().await.unwrap();
        assert_eq!(metric.get_tag("seen"), Some("p1,p2"));
        assert!(out.recv().await.is_none());
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_failure_stops_started_processors() {
        let (rt, _) = runtime();
        let (dst, _out) = mpsc::channel(10);
        let started = Arc::new(Lifecycle::default());
        let broken = Arc::new(Lifecycle::default());
        // the chain starts from its tail, so "first" is the last to start
        let chain = vec![
            listener("first", &broken, true),
            listener("second", &started, false),
            listener("third", &started, false),
        ];

        let err = match start_processors(&rt, dst, chain).await {
            Ok(_) => panic!("chain should not start"),
            Err(e) => e,
        };
        assert!(matches!(&err, AgentError::Start { plugin, .. } if plugin == "processors.first"));
        assert_eq!(started.started.load(Ordering::SeqCst), 2);
        assert_eq!(started.stopped.load(Ordering::SeqCst), 2);
        assert_eq!(broken.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_returns_destination() {
        let (rt, _) = runtime();
        let (dst, mut out) = mpsc::channel(1);
        let (head, units) = start_processors(&rt, dst, Vec::new()).await.unwrap();
        assert!(units.is_empty());
        head.send(Metric::new(
            "cpu",
            NO_TAGS,
            [("v", FieldValue::Int(1))],
            UNIX_EPOCH,
            ValueType::Untyped,
        ))
        .await
        .unwrap();
        assert_eq!(out.recv().await.unwrap().name(), "cpu");
    }
}
