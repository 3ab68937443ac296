//! Outbound transport seam.

use crawltail_shared::EventKind;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// One event as written to a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    pub event: EventKind,
    pub data: serde_json::Value,
}

impl OutboundEvent {
    pub fn new(event: EventKind, data: serde_json::Value) -> Self {
        Self { event, data }
    }
}

/// Where a session writes delivered events.
///
/// Called with the session lock held: implementations must not call back
/// into the session.
pub trait EventSink: Send + Sync + 'static {
    fn write_event(&self, event: OutboundEvent);
}

/// Sink that forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn write_event(&self, event: OutboundEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(event = %e.0.event, "event receiver gone, dropping event");
        }
    }
}
