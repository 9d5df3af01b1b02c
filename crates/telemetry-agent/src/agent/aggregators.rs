// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::accumulator::{precision_for, Accumulator};
use crate::agent::Runtime;
use crate::metric::Metric;
use crate::models::aggregator::window_for;
use crate::models::RunningAggregator;

pub(crate) struct AggregatorUnit {
    pub(crate) src: mpsc::Receiver<Metric>,
    /// Where aggregates go: the aggregator processor chain, or the outputs directly.
    pub(crate) agg_dst: mpsc::Sender<Metric>,
    /// Where unclaimed originals go.
    pub(crate) out_dst: mpsc::Sender<Metric>,
    pub(crate) aggregators: Vec<Arc<RunningAggregator>>,
}

/// Offers every metric from the unit's source to all aggregators and forwards the originals
/// nobody claimed. Each aggregator pushes on its own period; once the source closes every
/// aggregator pushes one final time before its destination closes.
pub(crate) async fn run_aggregators(rt: Runtime, start: SystemTime, unit: AggregatorUnit) {
    let AggregatorUnit {
        mut src,
        agg_dst,
        out_dst,
        aggregators,
    } = unit;

    for aggregator in &aggregators {
        let (since, until) = window_for(start, rt.round_interval, aggregator.period());
        aggregator.update_window(since, until).await;
    }

    let stop = CancellationToken::new();
    let mut pushes = Vec::with_capacity(aggregators.len());
    for aggregator in &aggregators {
        let mut acc = Accumulator::new(
            aggregator.clone(),
            agg_dst.clone(),
            rt.clock,
            rt.ids.clone(),
        );
        acc.set_precision(precision_for(rt.precision, rt.interval));
        pushes.push(rt.supervisor.spawn(
            format!("aggregator push for {}", aggregator.log_name()),
            push_loop(aggregator.clone(), acc, stop.clone(), rt.clone()),
        ));
    }
    drop(agg_dst);

    while let Some(metric) = src.recv().await {
        let mut claimed = false;
        for aggregator in &aggregators {
            if aggregator.add(&metric).await {
                claimed = true;
            }
        }
        if claimed {
            metric.discard();
        } else if let Err(mpsc::error::SendError(metric)) = out_dst.send(metric).await {
            metric.discard();
        }
    }
    drop(out_dst);

    debug!("[agent] Aggregator input closed, pushing final windows");
    stop.cancel();
    for push in pushes {
        let _ = push.await;
    }
    debug!("[agent] Aggregators stopped");
}

async fn push_loop(
    aggregator: Arc<RunningAggregator>,
    acc: Accumulator,
    stop: CancellationToken,
    rt: Runtime,
) {
    loop {
        let deadline = aggregator.end_period().await + aggregator.config().delay;
        tokio::select! {
            biased;
            () = stop.cancelled() => {
                aggregator.push(&acc).await;
                return;
            }
            () = sleep(rt.clock.until(deadline)) => {}
        }
        aggregator.push(&acc).await;
    }
}
