//! Tailing poller: re-query "documents after watermark" until stopped.
//!
//! A [`Poller`] approximates a change feed over a store that cannot push:
//! it fetches the documents newer than its watermark in identifier order,
//! emits each one, advances the watermark, and idles when there is nothing
//! new. Stopping is cooperative. The loop notices at its next suspension
//! point, so a fetch already in flight always completes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crawltail_query::{Predicate, normalize_predicate};
use crawltail_shared::{Collection, CrawlTailError, DocId, Document, Result, TailConfig};
use crawltail_storage::{DocumentStore, FindQuery};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

/// Lifecycle of a poller loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Tailing,
    /// `stop()` was called; the loop has not reached a suspension point yet.
    Stopping,
    /// The loop exited on a non-retryable error.
    Failed,
}

struct Shared {
    state: Mutex<PollerState>,
    watermark: Mutex<Option<DocId>>,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watermark(&self) -> Option<DocId> {
        *self.watermark.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the watermark forward. Never moves it back.
    fn advance(&self, id: DocId) {
        let mut watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner);
        if watermark.is_none_or(|current| id > current) {
            *watermark = Some(id);
        }
    }
}

/// Tails one collection of a [`DocumentStore`].
pub struct Poller<S> {
    store: Arc<S>,
    collection: Collection,
    config: TailConfig,
    shared: Arc<Shared>,
}

impl<S: DocumentStore> Poller<S> {
    pub fn new(store: Arc<S>, collection: Collection, config: TailConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            collection,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(PollerState::Idle),
                watermark: Mutex::new(None),
                stop_tx,
            }),
        }
    }

    /// Start tailing documents matching `filter` newer than `watermark`.
    ///
    /// Identifier literals in `filter` are normalized first; a literal that
    /// cannot be parsed fails the call and the poller stays idle. Each new
    /// document is sent on `signal`. Must be called within a tokio runtime.
    pub fn start(
        &self,
        mut filter: Predicate,
        fields: Option<Vec<String>>,
        watermark: Option<DocId>,
        signal: mpsc::UnboundedSender<Document>,
    ) -> Result<JoinHandle<()>> {
        let mut state = self.shared.state();
        if matches!(*state, PollerState::Tailing | PollerState::Stopping) {
            return Err(CrawlTailError::AlreadyTailing);
        }
        normalize_predicate(&mut filter)?;

        *self.shared.watermark.lock().unwrap_or_else(PoisonError::into_inner) = watermark;
        self.shared.stop_tx.send_replace(false);
        let stop_rx = self.shared.stop_tx.subscribe();
        *state = PollerState::Tailing;
        drop(state);

        let task = TailLoop {
            store: Arc::clone(&self.store),
            collection: self.collection,
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            filter,
            fields,
            signal,
            stop_rx,
        };
        Ok(tokio::spawn(task.run()))
    }
}

impl<S> Poller<S> {
    /// Ask the loop to exit. Returns `true` only for the call that actually
    /// stopped a tailing loop; repeat calls and calls on an idle poller are no-ops.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state();
        if *state != PollerState::Tailing {
            return false;
        }
        *state = PollerState::Stopping;
        self.shared.stop_tx.send_replace(true);
        true
    }

    pub fn state(&self) -> PollerState {
        *self.shared.state()
    }

    /// Identifier of the last document emitted (or the starting watermark).
    pub fn watermark(&self) -> Option<DocId> {
        self.shared.watermark()
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }
}

struct TailLoop<S> {
    store: Arc<S>,
    collection: Collection,
    config: TailConfig,
    shared: Arc<Shared>,
    filter: Predicate,
    fields: Option<Vec<String>>,
    signal: mpsc::UnboundedSender<Document>,
    stop_rx: watch::Receiver<bool>,
}

enum Exit {
    Stopped,
    Closed,
    Failed,
}

impl<S: DocumentStore> TailLoop<S> {
    #[instrument(skip_all, fields(collection = %self.collection))]
    async fn run(mut self) {
        let exit = self.tail().await;
        let mut state = self.shared.state();
        *state = match exit {
            Exit::Failed => PollerState::Failed,
            Exit::Stopped | Exit::Closed => PollerState::Idle,
        };
        debug!(state = ?*state, watermark = ?self.shared.watermark(), "tail loop exited");
    }

    async fn tail(&mut self) -> Exit {
        let idle = self.config.idle_interval;
        loop {
            if self.stopped() {
                return Exit::Stopped;
            }
            if self.signal.is_closed() {
                debug!("tail signal closed");
                return Exit::Closed;
            }

            let query = FindQuery::new(tail_filter(&self.filter, self.shared.watermark()))
                .with_projection(self.fields.clone())
                .with_limit(self.config.batch_size);

            let batch = match self.store.find(self.collection, &query).await {
                Ok(batch) => batch,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "fetch failed, retrying after idle interval");
                    if !self.pause(idle).await {
                        return Exit::Stopped;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "fetch failed permanently");
                    return Exit::Failed;
                }
            };

            let exhausted = batch.len() < self.config.batch_size;
            for doc in batch {
                if self.stopped() {
                    return Exit::Stopped;
                }
                if self.shared.watermark().is_some_and(|w| doc.id <= w) {
                    continue;
                }
                let id = doc.id;
                if self.signal.send(doc).is_err() {
                    debug!("tail signal closed");
                    return Exit::Closed;
                }
                self.shared.advance(id);
                debug!(%id, "emitted document");

                let delay = self.config.fetch_delay;
                if !delay.is_zero() && !self.pause(delay).await {
                    return Exit::Stopped;
                }
            }

            if exhausted && !self.pause(idle).await {
                return Exit::Stopped;
            }
        }
    }

    fn stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Sleep for `duration` unless stopped first. Returns `false` if stopped
    /// or if nobody is listening on the signal any more.
    async fn pause(&mut self, duration: Duration) -> bool {
        if self.stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop_rx.changed() => {}
            _ = self.signal.closed() => {}
        }
        !self.stopped() && !self.signal.is_closed()
    }
}

/// `filter` restricted to identifiers after `watermark`.
fn tail_filter(filter: &Predicate, watermark: Option<DocId>) -> Predicate {
    match watermark {
        Some(w) if !w.is_beginning() => Predicate::id_after(w).and(filter.clone()),
        _ => filter.clone(),
    }
}
