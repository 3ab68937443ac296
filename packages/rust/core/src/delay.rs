//! Timer-driven batching of outbound events.

use std::collections::VecDeque;
use std::time::Duration;

use crawltail_shared::DocId;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::sink::OutboundEvent;

/// A routed event waiting for the next tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Pending {
    pub event: OutboundEvent,
    /// Handle and identifier of the tailed document the event carries, if any.
    pub origin: Option<(String, DocId)>,
}

impl Pending {
    pub fn new(event: OutboundEvent, origin: Option<(String, DocId)>) -> Self {
        Self { event, origin }
    }
}

/// Buffers events while enabled and drains them oldest first on each tick.
///
/// Disabled until [`activate`](Self::activate) is called; once enabled it
/// stays enabled until [`stop`](Self::stop).
#[derive(Debug, Default)]
pub struct DelayController {
    period: Option<Duration>,
    buffer: VecDeque<Pending>,
    timer: Option<JoinHandle<()>>,
    flushes: u64,
}

impl DelayController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable batching with a tick every `period`, calling `on_tick` each time.
    ///
    /// `on_tick` returns `false` to end the timer. Does nothing if already
    /// enabled. Must be called within a tokio runtime.
    pub fn activate<F>(&mut self, period: Duration, mut on_tick: F) -> bool
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if self.is_enabled() {
            return false;
        }
        let period = period.max(Duration::from_millis(1));
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !on_tick() {
                    break;
                }
            }
        });
        self.period = Some(period);
        self.timer = Some(timer);
        info!(period_ms = period.as_millis() as u64, "batch delay enabled");
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.period.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn push(&mut self, pending: Pending) {
        self.buffer.push_back(pending);
    }

    /// Take every buffered event in the order it was pushed.
    pub fn drain(&mut self) -> Vec<Pending> {
        self.flushes += 1;
        self.buffer.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of drains so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Cancel the timer and discard undelivered events. Returns how many were discarded.
    pub fn stop(&mut self) -> usize {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let discarded = self.buffer.len();
        self.buffer.clear();
        if discarded > 0 {
            debug!(discarded, "discarded buffered events");
        }
        discarded
    }
}

impl Drop for DelayController {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
