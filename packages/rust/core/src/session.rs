//! One client connection: its subscriptions, upstream listeners, and batching.
//!
//! All per-connection state lives behind one lock held only for synchronous
//! work, never across an await. Pollers, forwarders, and the batch timer reach
//! the session through weak references, so dropping or closing it is enough
//! to wind every task down.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crawltail_query::SourceCursor;
use crawltail_shared::{CrawlTailError, DocId, Document, EventKind, JobId, Result, TailConfig};
use crawltail_storage::DocumentStore;
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::delay::{DelayController, Pending};
use crate::link::TailReceiver;
use crate::process::CrawlProcess;
use crate::registry::{Route, SubscriptionCriteria, SubscriptionRegistry};
use crate::signals::{CrawlSignal, ListenerId, SignalKind};
use crate::sink::{EventSink, OutboundEvent};

struct State<S> {
    registry: SubscriptionRegistry<S>,
    delay: DelayController,
    closed: bool,
}

struct Shared<S> {
    id: Uuid,
    sink: Arc<dyn EventSink>,
    state: Mutex<State<S>>,
}

impl<S: DocumentStore> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route an event and deliver or buffer it.
    ///
    /// `origin` names the subscription and document a tailed event came from.
    fn deliver(&self, kind: EventKind, payload: Value, origin: Option<(&str, DocId)>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if state.registry.route(kind, &payload, origin.map(|(handle, _)| handle)) == Route::Drop {
            return;
        }
        let pending = Pending::new(
            OutboundEvent::new(kind, payload),
            origin.map(|(handle, id)| (handle.to_string(), id)),
        );
        if state.delay.is_enabled() {
            state.delay.push(pending);
        } else {
            self.write(&mut state, pending);
        }
    }

    /// Hand one event to the sink and advance its subscription's delivered watermark.
    fn write(&self, state: &mut State<S>, pending: Pending) {
        self.sink.write_event(pending.event);
        if let Some((handle, id)) = pending.origin {
            state.registry.mark_delivered(&handle, id);
        }
    }

    /// Write out everything buffered. Returns `false` once the session is closed.
    fn flush(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let batch = state.delay.drain();
        if !batch.is_empty() {
            debug!(session = %self.id, count = batch.len(), "flushing batch");
        }
        for pending in batch {
            self.write(&mut state, pending);
        }
        true
    }

    fn on_stats_changed(&self, job_id: &JobId, changes: &Value) {
        self.deliver(EventKind::StatsChanged, json!([job_id, changes]), None);
    }

    fn on_spider_closed(&self, process: &CrawlProcess) {
        for job in process.jobs() {
            self.deliver(EventKind::JobState, job, None);
        }
    }
}

impl<S: DocumentStore> TailReceiver for Shared<S> {
    fn receive(&self, kind: EventKind, doc: Document, handle: &str) {
        let id = doc.id;
        self.deliver(kind, doc.to_json(), Some((handle, id)));
    }
}

/// A client connection multiplexing many subscriptions over one sink.
pub struct Session<S: DocumentStore> {
    shared: Arc<Shared<S>>,
    process: Option<Arc<CrawlProcess>>,
    listeners: Vec<(SignalKind, ListenerId)>,
}

impl<S: DocumentStore> Session<S> {
    pub fn new(store: Arc<S>, sink: Arc<dyn EventSink>, config: TailConfig) -> Self {
        let id = Uuid::now_v7();
        debug!(session = %id, "session created");
        Self {
            shared: Arc::new(Shared {
                id,
                sink,
                state: Mutex::new(State {
                    registry: SubscriptionRegistry::new(store, config),
                    delay: DelayController::new(),
                    closed: false,
                }),
            }),
            process: None,
            listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Start receiving stats and spider-closed signals from `process`.
    pub fn open(&mut self, process: Arc<CrawlProcess>) {
        if self.process.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.shared);
        let stats = process.signals().connect(
            SignalKind::StatsChanged,
            Arc::new(move |signal: &CrawlSignal| {
                if let (Some(shared), CrawlSignal::StatsChanged { job_id, changes }) =
                    (weak.upgrade(), signal)
                {
                    shared.on_stats_changed(job_id, changes);
                }
            }),
        );
        self.listeners.push((SignalKind::StatsChanged, stats));

        let weak = Arc::downgrade(&self.shared);
        let weak_process: Weak<CrawlProcess> = Arc::downgrade(&process);
        let closed = process.signals().connect(
            SignalKind::SpiderClosed,
            Arc::new(move |_signal: &CrawlSignal| {
                if let (Some(shared), Some(process)) = (weak.upgrade(), weak_process.upgrade()) {
                    shared.on_spider_closed(&process);
                }
            }),
        );
        self.listeners.push((SignalKind::SpiderClosed, closed));

        info!(session = %self.shared.id, "session opened");
        self.process = Some(process);
    }

    /// Subscribe to tailed job documents.
    pub fn subscribe_to_jobs(
        &self,
        include: Vec<String>,
        exclude: Vec<String>,
        delay_ms: u64,
    ) -> Result<String> {
        self.subscribe(SubscriptionCriteria::Jobs { include, exclude }, delay_ms)
    }

    /// Subscribe to tailed pages, one cursor per source key.
    pub fn subscribe_to_pages(
        &self,
        sources: BTreeMap<String, SourceCursor>,
        delay_ms: u64,
    ) -> Result<String> {
        self.subscribe(SubscriptionCriteria::Pages { sources }, delay_ms)
    }

    /// Register a subscription. A non-zero `delay_ms` switches the whole
    /// session to batched delivery on the first such call.
    pub fn subscribe(&self, criteria: SubscriptionCriteria, delay_ms: u64) -> Result<String> {
        let receiver = Arc::downgrade(&self.shared) as Weak<dyn TailReceiver>;
        let mut state = self.shared.lock();
        if state.closed {
            return Err(CrawlTailError::validation("session is closed"));
        }

        let handle = state.registry.subscribe(&criteria, receiver)?;

        if delay_ms > 0 && !state.delay.is_enabled() {
            let weak = Arc::downgrade(&self.shared);
            state.delay.activate(Duration::from_millis(delay_ms), move || {
                weak.upgrade().is_some_and(|shared| shared.flush())
            });
        }

        info!(session = %self.shared.id, %handle, delay_ms, "subscribed");
        Ok(handle)
    }

    /// Stop and remove a subscription. Fails if `handle` is unknown.
    pub fn cancel_subscription(&self, handle: &str) -> Result<()> {
        self.shared.lock().registry.unsubscribe(handle)
    }

    /// Push an event through routing as if raised upstream.
    pub fn write_event(&self, kind: EventKind, payload: Value) {
        self.shared.deliver(kind, payload, None);
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.lock().registry.len()
    }

    /// Job ids a subscription has observed.
    pub fn interest_set(&self, handle: &str) -> Option<HashSet<JobId>> {
        self.shared.lock().registry.interest_set(handle).cloned()
    }

    /// Identifier of the last tailed document written to the sink, per handle.
    ///
    /// Documents fetched but still held in a batch do not count, so this is
    /// always a safe point to resume from.
    pub fn watermarks(&self) -> BTreeMap<String, Option<DocId>> {
        self.shared.lock().registry.watermarks()
    }

    pub fn is_batching(&self) -> bool {
        self.shared.lock().delay.is_enabled()
    }

    /// Number of batch flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.shared.lock().delay.flushes()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Disconnect upstream listeners, stop batching, and stop every subscription.
    ///
    /// Safe to call repeatedly and on a session that was never opened.
    pub fn close(&mut self) {
        if let Some(process) = self.process.take() {
            for (kind, id) in self.listeners.drain(..) {
                process.signals().disconnect(kind, id);
            }
        }

        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let discarded = state.delay.stop();
        let stopped = state.registry.stop_all();
        info!(session = %self.shared.id, stopped, discarded, "session closed");
    }
}

impl<S: DocumentStore> Drop for Session<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crawltail_shared::Collection;
    use crawltail_storage::MemoryStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::sink::ChannelSink;

    fn config() -> TailConfig {
        TailConfig {
            idle_interval: Duration::from_millis(10),
            fetch_delay: Duration::ZERO,
            batch_size: 100,
        }
    }

    fn session() -> (Session<MemoryStore>, Arc<MemoryStore>, UnboundedReceiver<OutboundEvent>) {
        let store = Arc::new(MemoryStore::new());
        let (sink, rx) = ChannelSink::new();
        let session = Session::new(Arc::clone(&store), Arc::new(sink), config());
        (session, store, rx)
    }

    async fn insert(store: &MemoryStore, collection: Collection, body: Value) -> DocId {
        store
            .insert(collection, body.as_object().cloned().unwrap())
            .await
            .unwrap()
    }

    async fn next(rx: &mut UnboundedReceiver<OutboundEvent>) -> OutboundEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("sink closed")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_subscription_delivers_matching_job_once() {
        let (session, store, mut rx) = session();
        let handle = session
            .subscribe_to_jobs(vec!["foo".into()], Vec::new(), 0)
            .unwrap();

        insert(&store, Collection::Jobs, json!({"id": "job-2", "urls": ["bar.com"]})).await;
        let job = json!({"id": "job-1", "urls": ["foo.com"]});
        let id = insert(&store, Collection::Jobs, job).await;

        let event = next(&mut rx).await;
        assert_eq!(event.event, EventKind::JobsTailed);
        assert_eq!(event.data["_id"], json!(id.0));
        assert_eq!(event.data["id"], "job-1");

        settle().await;
        assert!(rx.try_recv().is_err());

        let interest = session.interest_set(&handle).unwrap();
        assert_eq!(interest, HashSet::from([JobId::from("job-1")]));
        assert_eq!(session.watermarks()[&handle], Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn stats_delivered_only_for_followed_jobs() {
        let (mut session, store, mut rx) = session();
        let process = Arc::new(CrawlProcess::new());
        session.open(Arc::clone(&process));
        session.subscribe_to_jobs(Vec::new(), Vec::new(), 0).unwrap();

        insert(&store, Collection::Jobs, json!({"id": "job-1", "urls": ["a.com"]})).await;
        next(&mut rx).await;

        process.stats_changed("job-9", json!({"pages": 1}));
        process.stats_changed("job-1", json!({"pages": 2}));
        let event = next(&mut rx).await;
        assert_eq!(event.event, EventKind::StatsChanged);
        assert_eq!(event.data, json!(["job-1", {"pages": 2}]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn spider_closed_emits_state_for_followed_jobs() {
        let (mut session, store, mut rx) = session();
        let process = Arc::new(CrawlProcess::new());
        session.open(Arc::clone(&process));
        session.subscribe_to_jobs(Vec::new(), Vec::new(), 0).unwrap();

        insert(&store, Collection::Jobs, json!({"id": "job-1"})).await;
        next(&mut rx).await;

        process.upsert_job(json!({"id": "job-1", "state": "finished"})).unwrap();
        process.upsert_job(json!({"id": "job-2", "state": "running"})).unwrap();
        process.spider_closed("job-1");

        let event = next(&mut rx).await;
        assert_eq!(event.event, EventKind::JobState);
        assert_eq!(event.data["state"], "finished");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_session_flushes_in_enqueue_order() {
        let (session, store, mut rx) = session();
        let mut ids = Vec::new();
        for n in 0..3 {
            let page = json!({"url": "http://a.com", "n": n});
            ids.push(insert(&store, Collection::Pages, page).await);
        }

        session.subscribe_to_pages(BTreeMap::new(), 100).unwrap();
        assert!(session.is_batching());

        // Tailed right away, held until the first tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.flush_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.flush_count(), 1);
        for id in &ids {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.event, EventKind::PagesTailed);
            assert_eq!(event.data["_id"], json!(id.0));
        }
        assert!(rx.try_recv().is_err());

        // A later zero delay does not turn batching off.
        session.subscribe_to_jobs(Vec::new(), Vec::new(), 0).unwrap();
        assert!(session.is_batching());
    }

    #[tokio::test(start_paused = true)]
    async fn batched_watermark_counts_only_written_documents() {
        let (mut session, store, mut rx) = session();
        let handle = session.subscribe_to_jobs(Vec::new(), Vec::new(), 100).unwrap();
        let first = insert(&store, Collection::Jobs, json!({"id": "job-1"})).await;

        // Fetched and buffered, but not yet written.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.watermarks()[&handle], None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rx.try_recv().unwrap().data["_id"], json!(first.0));
        assert_eq!(session.watermarks()[&handle], Some(first));

        // A document buffered when the session closes is discarded, and the
        // watermark stays at the last one written.
        insert(&store, Collection::Jobs, json!({"id": "job-2"})).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let watermarks = session.watermarks();
        session.close();
        assert_eq!(watermarks[&handle], Some(first));

        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pages_resume_per_source() {
        let (session, store, mut rx) = session();
        let old = insert(&store, Collection::Pages, json!({"url": "http://a.com/1"})).await;
        insert(&store, Collection::Pages, json!({"url": "http://b.com/1"})).await;
        let fresh = insert(&store, Collection::Pages, json!({"url": "http://a.com/2"})).await;

        let sources = BTreeMap::from([("http://a.com".to_string(), SourceCursor::after(old))]);
        session.subscribe_to_pages(sources, 0).unwrap();

        let event = next(&mut rx).await;
        assert_eq!(event.data["_id"], json!(fresh.0));
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_delivery() {
        let (session, store, mut rx) = session();
        let handle = session.subscribe_to_jobs(Vec::new(), Vec::new(), 0).unwrap();
        session.cancel_subscription(&handle).unwrap();
        assert!(matches!(
            session.cancel_subscription(&handle),
            Err(CrawlTailError::UnknownSubscription { .. })
        ));

        insert(&store, Collection::Jobs, json!({"id": "job-1"})).await;
        settle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.subscription_count(), 0);
    }

    #[tokio::test]
    async fn malformed_criteria_creates_nothing() {
        let (session, _store, _rx) = session();
        let err = session
            .subscribe_to_jobs(vec!["[".into()], Vec::new(), 100)
            .unwrap_err();
        assert!(matches!(err, CrawlTailError::MalformedCriteria { .. }));
        assert_eq!(session.subscription_count(), 0);
        assert!(!session.is_batching());
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_disconnects() {
        let (mut session, store, mut rx) = session();
        let process = Arc::new(CrawlProcess::new());
        session.open(Arc::clone(&process));
        session.subscribe_to_jobs(Vec::new(), Vec::new(), 100).unwrap();
        assert_eq!(process.signals().listener_count(SignalKind::StatsChanged), 1);

        insert(&store, Collection::Jobs, json!({"id": "job-1"})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(process.signals().listener_count(SignalKind::StatsChanged), 0);
        assert_eq!(process.signals().listener_count(SignalKind::SpiderClosed), 0);
        assert_eq!(session.subscription_count(), 0);

        // Buffered events are discarded, nothing arrives later.
        settle().await;
        assert!(rx.try_recv().is_err());
        assert!(session.subscribe_to_jobs(Vec::new(), Vec::new(), 0).is_err());
    }

    #[test]
    fn close_without_open() {
        let (mut session, _store, _rx) = session();
        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn injected_events_follow_routing() {
        let (session, _store, mut rx) = session();
        session.subscribe_to_jobs(Vec::new(), Vec::new(), 0).unwrap();

        session.write_event(EventKind::StatsChanged, json!(["job-5", {}]));
        assert!(rx.try_recv().is_err());

        session.write_event(EventKind::JobsTailed, json!({"_id": 1, "id": "job-5"}));
        session.write_event(EventKind::StatsChanged, json!(["job-5", {}]));
        assert_eq!(rx.try_recv().unwrap().event, EventKind::JobsTailed);
        assert_eq!(rx.try_recv().unwrap().event, EventKind::StatsChanged);
    }
}
