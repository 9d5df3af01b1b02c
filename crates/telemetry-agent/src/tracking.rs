// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery tracking for metrics whose producer must learn their final disposition.
//!
//! A tracked unit of work (one metric or a group) owns one [`TrackingData`] shared by every
//! copy in flight. Each holder reports one [`Disposition`]; the holder that brings the
//! reference count to zero runs the notify callback exactly once.
//!
//! ```text
//!   track() ──> Live(refcount > 0) ──clone──> refcount + 1
//!                     │
//!                     └─ accept / reject / drop ──> refcount - 1 ──(== 0)──> notify(DeliveryInfo)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::metric::{Disposition, Metric};

pub type TrackingId = u64;

/// Callback receiving the outcome of a tracked unit of work.
pub type NotifyFn = Box<dyn FnOnce(DeliveryInfo) + Send>;

/// Outcome of a tracked metric or group, handed to the producer's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryInfo {
    id: TrackingId,
    delivered: bool,
}

impl DeliveryInfo {
    #[must_use]
    pub fn id(&self) -> TrackingId {
        self.id
    }

    /// True when no holder rejected the metric.
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.delivered
    }
}

/// Source of tracking ids. Owned by the agent and injected wherever tickets are created so
/// that tests run against isolated sequences.
#[derive(Debug, Default)]
pub struct IdSequence {
    last: AtomicU64,
    outstanding: AtomicI64,
}

impl IdSequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id. Ids start at 1 and strictly increase across all callers.
    pub fn next_id(&self) -> TrackingId {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of tracked units created from this sequence that have not notified yet.
    #[must_use]
    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }
}

pub(crate) struct TrackingData {
    id: TrackingId,
    rc: AtomicI64,
    accepted: AtomicU32,
    rejected: AtomicU32,
    notify: Mutex<Option<NotifyFn>>,
    ids: Arc<IdSequence>,
}

impl fmt::Debug for TrackingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingData")
            .field("id", &self.id)
            .field("rc", &self.rc.load(Ordering::Relaxed))
            .field("accepted", &self.accepted.load(Ordering::Relaxed))
            .field("rejected", &self.rejected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TrackingData {
    fn new(ids: &Arc<IdSequence>, holders: i64, notify: NotifyFn) -> Arc<Self> {
        ids.outstanding.fetch_add(1, Ordering::AcqRel);
        Arc::new(Self {
            id: ids.next_id(),
            rc: AtomicI64::new(holders),
            accepted: AtomicU32::new(0),
            rejected: AtomicU32::new(0),
            notify: Mutex::new(Some(notify)),
            ids: Arc::clone(ids),
        })
    }

    pub(crate) fn id(&self) -> TrackingId {
        self.id
    }

    fn incr(&self) {
        self.rc.fetch_add(1, Ordering::AcqRel);
    }

    fn accept(&self) {
        self.accepted.fetch_add(1, Ordering::AcqRel);
    }

    fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one holder. The release that reaches zero notifies.
    #[allow(clippy::panic)]
    pub(crate) fn decr(&self) {
        let prev = self.rc.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.finish();
        } else if prev <= 0 {
            panic!(
                "tracking reference count for id {} dropped below zero",
                self.id
            );
        }
    }

    fn finish(&self) {
        let info = DeliveryInfo {
            id: self.id,
            delivered: self.rejected.load(Ordering::Acquire) == 0,
        };
        let notify = self
            .notify
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.ids.outstanding.fetch_sub(1, Ordering::AcqRel);
        trace!(
            "Tracking id {} finished: accepted={} rejected={}",
            self.id,
            self.accepted.load(Ordering::Acquire),
            self.rejected.load(Ordering::Acquire)
        );
        if let Some(notify) = notify {
            notify(info);
        }
    }
}

/// One holder's reference to a [`TrackingData`]. Cloning adds a holder; dropping releases it.
#[derive(Debug)]
pub(crate) struct DeliveryTicket {
    data: Arc<TrackingData>,
}

impl DeliveryTicket {
    pub(crate) fn id(&self) -> TrackingId {
        self.data.id()
    }

    pub(crate) fn settle(self, disposition: Disposition) {
        match disposition {
            Disposition::Accept => self.data.accept(),
            Disposition::Reject => self.data.reject(),
            Disposition::Drop => {}
        }
        // the release happens in Drop
    }
}

impl Clone for DeliveryTicket {
    fn clone(&self) -> Self {
        self.data.incr();
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl Drop for DeliveryTicket {
    fn drop(&mut self) {
        self.data.decr();
    }
}

/// Attaches a fresh ticket to `metric`. `notify` runs once every copy has been settled.
pub fn track(
    mut metric: Metric,
    ids: &Arc<IdSequence>,
    notify: impl FnOnce(DeliveryInfo) + Send + 'static,
) -> (Metric, TrackingId) {
    let data = TrackingData::new(ids, 1, Box::new(notify));
    let id = data.id();
    metric.attach(DeliveryTicket { data });
    (metric, id)
}

/// Tracks `metrics` as one unit of work. An empty group notifies immediately as delivered.
pub fn track_group(
    mut metrics: Vec<Metric>,
    ids: &Arc<IdSequence>,
    notify: impl FnOnce(DeliveryInfo) + Send + 'static,
) -> (Vec<Metric>, TrackingId) {
    let holders = metrics.len() as i64;
    let data = TrackingData::new(ids, holders, Box::new(notify));
    let id = data.id();
    if metrics.is_empty() {
        data.finish();
        return (metrics, id);
    }
    for metric in &mut metrics {
        // holders were counted up front, so build tickets without incrementing
        metric.attach(DeliveryTicket {
            data: Arc::clone(&data),
        });
    }
    (metrics, id)
}
