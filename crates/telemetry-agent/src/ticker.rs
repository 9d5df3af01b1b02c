// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recurring timing events with jitter.
//!
//! Every ticker owns a background task that feeds a capacity-1 channel with non-blocking
//! sends: a tick the consumer did not take yet makes later ticks drop, so a slow consumer
//! never builds a backlog of stale events.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::{align_time, Clock};

#[async_trait]
pub trait Ticker: Send {
    /// Waits for the next tick. Returns `None` once the ticker is stopped.
    async fn elapsed(&mut self) -> Option<SystemTime>;

    fn stop(&mut self);
}

/// Uniformly distributed duration in `[0, max)`.
#[must_use]
pub fn random_duration(max: Duration) -> Duration {
    let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

struct TickTask {
    rx: mpsc::Receiver<SystemTime>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TickTask {
    fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(mpsc::Sender<SystemTime>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(tx, cancel.clone()));
        Self { rx, cancel, handle }
    }

    async fn elapsed(&mut self) -> Option<SystemTime> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            tick = self.rx.recv() => tick,
        }
    }

    fn stop(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for TickTask {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Sleeps for `d`, returning `false` when cancelled first.
async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = sleep(d) => true,
    }
}

fn aligned_delay(now: SystemTime, interval: Duration) -> Duration {
    // nudge past a boundary we are sitting on so a tick that fired marginally early does not
    // repeat the same boundary
    let next = align_time(now + interval / 100, interval);
    match next.duration_since(now) {
        Ok(d) if !d.is_zero() => d,
        _ => interval,
    }
}

/// Ticks on multiples of `interval` since the epoch, shifted by `offset` plus fresh jitter.
pub struct AlignedTicker {
    task: TickTask,
}

impl AlignedTicker {
    #[must_use]
    pub fn new(
        start: SystemTime,
        interval: Duration,
        jitter: Duration,
        offset: Duration,
        clock: Clock,
    ) -> Self {
        let task = TickTask::spawn(move |tx, cancel| async move {
            let mut now = start;
            loop {
                let d = aligned_delay(now, interval) + offset + random_duration(jitter);
                if !sleep_or_cancel(d, &cancel).await {
                    return;
                }
                now = clock.now();
                let _ = tx.try_send(now);
            }
        });
        Self { task }
    }
}

#[async_trait]
impl Ticker for AlignedTicker {
    async fn elapsed(&mut self) -> Option<SystemTime> {
        self.task.elapsed().await
    }

    fn stop(&mut self) {
        self.task.stop();
    }
}

/// Ticks every `interval` from creation, each tick delayed by `offset` plus fresh jitter.
/// Without an offset the first tick is immediate.
pub struct UnalignedTicker {
    task: TickTask,
}

impl UnalignedTicker {
    #[must_use]
    pub fn new(interval: Duration, jitter: Duration, offset: Duration, clock: Clock) -> Self {
        let task = TickTask::spawn(move |tx, cancel| {
            if offset.is_zero() {
                let _ = tx.try_send(clock.now());
            }
            async move {
                let mut ticks = interval_at(Instant::now() + interval, interval);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        _ = ticks.tick() => {}
                    }
                    if !sleep_or_cancel(offset + random_duration(jitter), &cancel).await {
                        return;
                    }
                    let _ = tx.try_send(clock.now());
                }
            }
        });
        Self { task }
    }
}

#[async_trait]
impl Ticker for UnalignedTicker {
    async fn elapsed(&mut self) -> Option<SystemTime> {
        self.task.elapsed().await
    }

    fn stop(&mut self) {
        self.task.stop();
    }
}

/// Ticks `interval` plus fresh jitter after the previous tick.
pub struct RollingTicker {
    task: TickTask,
}

impl RollingTicker {
    #[must_use]
    pub fn new(interval: Duration, jitter: Duration, clock: Clock) -> Self {
        let task = TickTask::spawn(move |tx, cancel| async move {
            loop {
                if !sleep_or_cancel(interval + random_duration(jitter), &cancel).await {
                    return;
                }
                let _ = tx.try_send(clock.now());
            }
        });
        Self { task }
    }
}

#[async_trait]
impl Ticker for RollingTicker {
    async fn elapsed(&mut self) -> Option<SystemTime> {
        self.task.elapsed().await
    }

    fn stop(&mut self) {
        self.task.stop();
    }
}
