// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Write side API handed to plugins.
//!
//! Every add operation builds a [`Metric`], rounds its timestamp to the accumulator's
//! precision, passes it through the owning plugin's [`MetricMaker`] and sends it to the next
//! stage. Sends suspend while the channel is full, which is how backpressure reaches plugins.

use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::clock::{round_time, Clock};
use crate::logger::PluginLogger;
use crate::metric::{FieldValue, Metric, ValueType};
use crate::tracking::{self, DeliveryInfo, IdSequence, TrackingId};

/// Per-plugin hook applied to every metric before it leaves the plugin.
pub trait MetricMaker: Send + Sync {
    fn log_name(&self) -> &str;

    fn logger(&self) -> &PluginLogger;

    /// Returns `None` when the metric was consumed (filtered out).
    fn make_metric(&self, metric: Metric) -> Option<Metric>;
}

/// Default precision for metrics whose plugin does not configure one: the coarsest of
/// 1s, 1ms, 1us and 1ns that is not larger than `interval`.
#[must_use]
pub fn precision_for(precision: Option<Duration>, interval: Duration) -> Duration {
    if let Some(precision) = precision.filter(|p| !p.is_zero()) {
        return precision;
    }
    [
        Duration::from_secs(1),
        Duration::from_millis(1),
        Duration::from_micros(1),
    ]
    .into_iter()
    .find(|p| interval >= *p)
    .unwrap_or(Duration::from_nanos(1))
}

#[derive(Clone)]
pub struct Accumulator {
    maker: Arc<dyn MetricMaker>,
    tx: mpsc::Sender<Metric>,
    clock: Clock,
    ids: Arc<IdSequence>,
    precision: Duration,
}

impl Accumulator {
    pub fn new(
        maker: Arc<dyn MetricMaker>,
        tx: mpsc::Sender<Metric>,
        clock: Clock,
        ids: Arc<IdSequence>,
    ) -> Self {
        Self {
            maker,
            tx,
            clock,
            ids,
            precision: Duration::from_nanos(1),
        }
    }

    /// Changes the rounding applied to timestamps of metrics added through this accumulator.
    /// Clones made earlier keep their own precision.
    pub fn set_precision(&mut self, precision: Duration) {
        self.precision = precision;
    }

    #[must_use]
    pub fn precision(&self) -> Duration {
        self.precision
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.clock
    }

    #[must_use]
    pub fn log_name(&self) -> &str {
        self.maker.log_name()
    }

    async fn add<N, K, V, F>(
        &self,
        name: N,
        fields: impl IntoIterator<Item = (F, FieldValue)>,
        tags: impl IntoIterator<Item = (K, V)>,
        time: Option<SystemTime>,
        value_type: ValueType,
    ) where
        N: Into<String>,
        K: Into<String>,
        V: Into<String>,
        F: Into<String>,
    {
        let time = time.unwrap_or_else(|| self.clock.now());
        self.add_metric(Metric::new(name, tags, fields, time, value_type))
            .await;
    }

    pub async fn add_fields<N, K, V, F>(
        &self,
        name: N,
        fields: impl IntoIterator<Item = (F, FieldValue)>,
        tags: impl IntoIterator<Item = (K, V)>,
        time: Option<SystemTime>,
    ) where
        N: Into<String>,
        K: Into<String>,
        V: Into<String>,
        F: Into<String>,
    {
        self.add(name, fields, tags, time, ValueType::Untyped).await;
    }

    pub async fn add_gauge<N, K, V, F>(
        &self,
        name: N,
        fields: impl IntoIterator<Item = (F, FieldValue)>,
        tags: impl IntoIterator<Item = (K, V)>,
        time: Option<SystemTime>,
    ) where
        N: Into<String>,
        K: Into<String>,
        V: Into<String>,
        F: Into<String>,
    {
        self.add(name, fields, tags, time, ValueType::Gauge).await;
    }

    pub async fn add_counter<N, K, V, F>(
        &self,
        name: N,
        fields: impl IntoIterator<Item = (F, FieldValue)>,
        tags: impl IntoIterator<Item = (K, V)>,
        time: Option<SystemTime>,
    ) where
        N: Into<String>,
        K: Into<String>,
        V: Into<String>,
        F: Into<String>,
    {
        self.add(name, fields, tags, time, ValueType::Counter).await;
    }

    pub async fn add_summary<N, K, V, F>(
        &self,
        name: N,
        fields: impl IntoIterator<Item = (F, FieldValue)>,
        tags: impl IntoIterator<Item = (K, V)>,
        time: Option<SystemTime>,
    ) where
        N: Into<String>,
        K: Into<String>,
        V: Into<String>,
        F: Into<String>,
    {
        self.add(name, fields, tags, time, ValueType::Summary).await;
    }

    pub async fn add_histogram<N, K, V, F>(
        &self,
        name: N,
        fields: impl IntoIterator<Item = (F, FieldValue)>,
        tags: impl IntoIterator<Item = (K, V)>,
        time: Option<SystemTime>,
    ) where
        N: Into<String>,
        K: Into<String>,
        V: Into<String>,
        F: Into<String>,
    {
        self.add(name, fields, tags, time, ValueType::Histogram)
            .await;
    }

    pub async fn add_metric(&self, mut metric: Metric) {
        metric.set_time(round_time(metric.time(), self.precision));
        let Some(metric) = self.maker.make_metric(metric) else {
            return;
        };
        if metric.is_empty() {
            metric.discard();
            return;
        }
        if let Err(mpsc::error::SendError(metric)) = self.tx.send(metric).await {
            debug!(
                plugin = %self.maker.log_name(),
                "Dropping metric {}: destination closed",
                metric.name()
            );
            metric.discard();
        }
    }

    /// Logs `err` against the owning plugin. Nothing is sent downstream.
    pub fn add_error(&self, err: anyhow::Error) {
        self.maker.logger().error(format_args!("Error in plugin: {err:#}"));
    }

    /// Wraps this accumulator so producers can track up to `max_tracked` metrics or groups
    /// in flight at once.
    #[must_use]
    pub fn with_tracking(self, max_tracked: usize) -> TrackingAccumulator {
        let max_tracked = max_tracked.max(1);
        let (delivered_tx, delivered_rx) = mpsc::channel(max_tracked);
        TrackingAccumulator {
            inner: self,
            max_tracked,
            delivered_tx,
            delivered_rx,
        }
    }
}

pub struct TrackingAccumulator {
    inner: Accumulator,
    max_tracked: usize,
    delivered_tx: mpsc::Sender<DeliveryInfo>,
    delivered_rx: mpsc::Receiver<DeliveryInfo>,
}

impl TrackingAccumulator {
    fn notifier(&self) -> impl FnOnce(DeliveryInfo) + Send + 'static {
        let tx = self.delivered_tx.clone();
        let max_tracked = self.max_tracked;
        move |info| notify_delivered(&tx, info, max_tracked)
    }

    pub async fn add_tracking_metric(&self, metric: Metric) -> TrackingId {
        let (metric, id) = tracking::track(metric, &self.inner.ids, self.notifier());
        self.inner.add_metric(metric).await;
        id
    }

    pub async fn add_tracking_metric_group(&self, metrics: Vec<Metric>) -> TrackingId {
        let (metrics, id) = tracking::track_group(metrics, &self.inner.ids, self.notifier());
        for metric in metrics {
            self.inner.add_metric(metric).await;
        }
        id
    }

    /// Receiver of delivery outcomes, in completion order.
    pub fn delivered(&mut self) -> &mut mpsc::Receiver<DeliveryInfo> {
        &mut self.delivered_rx
    }

    pub async fn next_delivered(&mut self) -> Option<DeliveryInfo> {
        self.delivered_rx.recv().await
    }
}

#[allow(clippy::panic)]
fn notify_delivered(tx: &mpsc::Sender<DeliveryInfo>, info: DeliveryInfo, max_tracked: usize) {
    match tx.try_send(info) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(_)) => panic!(
            "delivery notification for id {} exceeds the {max_tracked} tracked metrics requested",
            info.id()
        ),
    }
}

impl Deref for TrackingAccumulator {
    type Target = Accumulator;

    fn deref(&self) -> &Accumulator {
        &self.inner
    }
}
