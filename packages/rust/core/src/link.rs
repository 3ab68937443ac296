//! Storage links: a poller bound to one collection and one event kind.

use std::sync::{Arc, Weak};

use crawltail_query::Predicate;
use crawltail_shared::{Collection, DocId, Document, EventKind, Result, TailConfig};
use crawltail_storage::DocumentStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::poller::{Poller, PollerState};

/// Which collection a link tails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Jobs,
    Pages,
}

impl LinkKind {
    pub fn collection(self) -> Collection {
        match self {
            Self::Jobs => Collection::Jobs,
            Self::Pages => Collection::Pages,
        }
    }

    /// Event kind tailed documents are delivered as.
    pub fn event_kind(self) -> EventKind {
        match self {
            Self::Jobs => EventKind::JobsTailed,
            Self::Pages => EventKind::PagesTailed,
        }
    }
}

/// Consumer of documents tailed by a link, identified by subscription handle.
pub trait TailReceiver: Send + Sync + 'static {
    fn receive(&self, kind: EventKind, doc: Document, handle: &str);
}

/// A [`Poller`] plus the task forwarding its documents to a receiver.
///
/// The receiver is held weakly so a link never keeps its session alive.
/// Dropping the link stops its poller.
pub struct StorageLink<S> {
    kind: LinkKind,
    handle: String,
    poller: Poller<S>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: DocumentStore> StorageLink<S> {
    pub fn new(
        kind: LinkKind,
        handle: impl Into<String>,
        store: Arc<S>,
        config: TailConfig,
    ) -> Self {
        Self {
            kind,
            handle: handle.into(),
            poller: Poller::new(store, kind.collection(), config),
            tasks: Vec::new(),
        }
    }

    /// Start tailing and forwarding to `receiver`.
    pub fn start(
        &mut self,
        filter: Predicate,
        fields: Option<Vec<String>>,
        watermark: Option<DocId>,
        receiver: Weak<dyn TailReceiver>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Document>();
        let poll_task = self.poller.start(filter, fields, watermark, tx)?;

        let (kind, handle) = (self.kind, self.handle.clone());
        let forward_task = tokio::spawn(async move {
            while let Some(doc) = rx.recv().await {
                if !emit(&receiver, kind, doc, &handle) {
                    debug!(%handle, "receiver dropped, forwarding stopped");
                    break;
                }
            }
        });

        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(poll_task);
        self.tasks.push(forward_task);
        Ok(())
    }
}

impl<S> StorageLink<S> {
    /// Stop the poller. Documents it already emitted are still forwarded.
    pub fn stop(&self) -> bool {
        self.poller.stop()
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn state(&self) -> PollerState {
        self.poller.state()
    }

    pub fn watermark(&self) -> Option<DocId> {
        self.poller.watermark()
    }
}

impl<S> Drop for StorageLink<S> {
    fn drop(&mut self) {
        if self.poller.stop() {
            debug!(handle = %self.handle, "link dropped, poller stopped");
        }
    }
}

/// Hand one tailed document to the receiver, if it is still alive.
fn emit(receiver: &Weak<dyn TailReceiver>, kind: LinkKind, doc: Document, handle: &str) -> bool {
    match receiver.upgrade() {
        Some(receiver) => {
            receiver.receive(kind.event_kind(), doc, handle);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crawltail_storage::{FindQuery, MemoryStore};
    use serde_json::{Map, Value, json};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(EventKind, DocId, String)>>,
    }

    impl TailReceiver for Recorder {
        fn receive(&self, kind: EventKind, doc: Document, handle: &str) {
            self.seen.lock().unwrap().push((kind, doc.id, handle.to_string()));
        }
    }

    /// Counts every find so tests can tell whether a poller is still running.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        finds: AtomicUsize,
    }

    impl CountingStore {
        fn finds(&self) -> usize {
            self.finds.load(Ordering::SeqCst)
        }
    }

    impl DocumentStore for CountingStore {
        async fn find(&self, collection: Collection, query: &FindQuery) -> Result<Vec<Document>> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            self.inner.find(collection, query).await
        }

        async fn insert(&self, collection: Collection, body: Map<String, Value>) -> Result<DocId> {
            self.inner.insert(collection, body).await
        }
    }

    fn weak(recorder: &Arc<Recorder>) -> Weak<dyn TailReceiver> {
        Arc::downgrade(recorder) as Weak<dyn TailReceiver>
    }

    fn config() -> TailConfig {
        TailConfig {
            idle_interval: Duration::from_millis(10),
            fetch_delay: Duration::ZERO,
            batch_size: 10,
        }
    }

    #[test]
    fn kinds_map_to_collections_and_events() {
        assert_eq!(LinkKind::Jobs.collection(), Collection::Jobs);
        assert_eq!(LinkKind::Pages.event_kind(), EventKind::PagesTailed);
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_tailed_documents_with_handle() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .insert(Collection::Pages, json!({"url": "http://a.com"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut link = StorageLink::new(LinkKind::Pages, "3", store, config());
        link.start(Predicate::All, None, None, weak(&recorder)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![(EventKind::PagesTailed, id, "3".to_string())]
        );
        assert_eq!(link.watermark(), Some(id));
        assert!(link.stop());
        assert!(!link.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_receiver_winds_the_poller_down() {
        let store = Arc::new(CountingStore::default());
        store
            .insert(Collection::Jobs, json!({"id": "j"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let receiver = weak(&recorder);
        drop(recorder);

        let mut link = StorageLink::new(LinkKind::Jobs, "0", Arc::clone(&store), config());
        link.start(Predicate::All, None, None, receiver).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.state(), PollerState::Idle);

        let finds = store.finds();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.finds(), finds);
        assert!(!link.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_link_stops_polling() {
        let store = Arc::new(CountingStore::default());
        let recorder = Arc::new(Recorder::default());
        let mut link = StorageLink::new(LinkKind::Pages, "1", Arc::clone(&store), config());
        link.start(Predicate::All, None, None, weak(&recorder)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.finds() > 0);

        drop(link);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let finds = store.finds();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.finds(), finds);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
