//! Process-wide crawl signal bus.
//!
//! The crawl-management side raises [`CrawlSignal`]s; connection sessions
//! register listeners per [`SignalKind`] and must disconnect them on close so
//! no callback outlives the session it points at.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crawltail_shared::JobId;
use tracing::debug;

/// Upstream lifecycle signals a session can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Aggregate crawl stats of a job changed.
    StatsChanged,
    /// A spider finished and its job reached a final state.
    SpiderClosed,
}

/// A signal raised by the crawl process.
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlSignal {
    StatsChanged {
        job_id: JobId,
        changes: serde_json::Value,
    },
    SpiderClosed {
        job_id: JobId,
    },
}

impl CrawlSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::StatsChanged { .. } => SignalKind::StatsChanged,
            Self::SpiderClosed { .. } => SignalKind::SpiderClosed,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::StatsChanged { job_id, .. } | Self::SpiderClosed { job_id } => job_id,
        }
    }
}

/// Callback invoked for every matching signal.
pub type Listener = Arc<dyn Fn(&CrawlSignal) + Send + Sync>;

/// Handle returned by [`SignalBus::connect`], used to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Typed observer registry for crawl signals.
#[derive(Default)]
pub struct SignalBus {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<SignalKind, Vec<(ListenerId, Listener)>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for signals of `kind`.
    pub fn connect(&self, kind: SignalKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, listener));
        debug!(?kind, ?id, "signal listener connected");
        id
    }

    /// Remove a listener. Returns `false` if it was not connected.
    pub fn disconnect(&self, kind: SignalKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if removed {
            debug!(?kind, ?id, "signal listener disconnected");
        }
        removed
    }

    /// Deliver `signal` to every listener of its kind. Returns how many were called.
    ///
    /// Listeners run outside the bus lock, so they may connect or disconnect.
    pub fn emit(&self, signal: &CrawlSignal) -> usize {
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&signal.kind())
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        debug!(
            kind = ?signal.kind(),
            job_id = %signal.job_id(),
            listeners = targets.len(),
            "emitting signal"
        );
        for listener in &targets {
            listener(signal);
        }
        targets.len()
    }

    /// Number of listeners connected for `kind`.
    pub fn listener_count(&self, kind: SignalKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}
