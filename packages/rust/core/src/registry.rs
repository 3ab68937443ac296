//! Per-connection subscription registry and event routing.
//!
//! Handles are a stringified counter that starts at `"0"` and is never reused
//! within a connection, so a stale client handle cannot address a newer
//! subscription.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};

use crawltail_query::{Predicate, SourceCursor, jobs_query, normalize_predicate, pages_query};
use crawltail_shared::{CrawlTailError, DocId, EventKind, JobId, Result, TailConfig};
use crawltail_storage::DocumentStore;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::link::{LinkKind, StorageLink, TailReceiver};

/// What a client asked to follow.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionCriteria {
    /// Jobs whose URL list matches every include and no exclude pattern.
    Jobs {
        include: Vec<String>,
        exclude: Vec<String>,
    },
    /// Pages per source key, each resumed from its own last-seen id.
    Pages {
        sources: BTreeMap<String, SourceCursor>,
    },
}

impl SubscriptionCriteria {
    pub fn kind(&self) -> LinkKind {
        match self {
            Self::Jobs { .. } => LinkKind::Jobs,
            Self::Pages { .. } => LinkKind::Pages,
        }
    }

    /// Build and normalize the store predicate.
    pub fn build_query(&self) -> Result<Predicate> {
        let mut query = match self {
            Self::Jobs { include, exclude } => jobs_query(include, exclude)?,
            Self::Pages { sources } => pages_query(sources)?,
        };
        normalize_predicate(&mut query)?;
        Ok(query)
    }
}

/// Outcome of routing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Deliver,
    Drop,
}

struct Subscription<S> {
    link: StorageLink<S>,
    interest: HashSet<JobId>,
    /// Last tailed document written to the client.
    delivered: Option<DocId>,
}

/// Subscriptions of one connection, keyed by handle.
pub struct SubscriptionRegistry<S> {
    store: Arc<S>,
    config: TailConfig,
    next_handle: u64,
    subscriptions: BTreeMap<String, Subscription<S>>,
}

impl<S: DocumentStore> SubscriptionRegistry<S> {
    pub fn new(store: Arc<S>, config: TailConfig) -> Self {
        Self {
            store,
            config,
            next_handle: 0,
            subscriptions: BTreeMap::new(),
        }
    }

    /// Build the query, start a link feeding `receiver`, and return its handle.
    ///
    /// On error nothing is registered and no handle is consumed.
    pub fn subscribe(
        &mut self,
        criteria: &SubscriptionCriteria,
        receiver: Weak<dyn TailReceiver>,
    ) -> Result<String> {
        let query = criteria.build_query()?;
        let handle = self.next_handle.to_string();

        let mut link = StorageLink::new(
            criteria.kind(),
            handle.clone(),
            Arc::clone(&self.store),
            self.config.clone(),
        );
        // Page queries carry their own per-source id bounds.
        link.start(query, None, Some(DocId::BEGINNING), receiver)?;

        self.next_handle += 1;
        info!(%handle, kind = ?criteria.kind(), "subscription created");
        self.subscriptions.insert(
            handle.clone(),
            Subscription {
                link,
                interest: HashSet::new(),
                delivered: None,
            },
        );
        Ok(handle)
    }

    /// Stop and remove a subscription.
    pub fn unsubscribe(&mut self, handle: &str) -> Result<()> {
        let subscription = self
            .subscriptions
            .remove(handle)
            .ok_or_else(|| CrawlTailError::unknown_subscription(handle))?;
        subscription.link.stop();
        info!(
            %handle,
            polled = ?subscription.link.watermark(),
            delivered = ?subscription.delivered,
            "subscription cancelled"
        );
        Ok(())
    }

    /// Stop every subscription. Returns how many there were.
    pub fn stop_all(&mut self) -> usize {
        let count = self.subscriptions.len();
        for (handle, subscription) in std::mem::take(&mut self.subscriptions) {
            subscription.link.stop();
            debug!(
                %handle,
                polled = ?subscription.link.watermark(),
                delivered = ?subscription.delivered,
                "subscription stopped"
            );
        }
        count
    }

    /// Decide whether an event reaches the client, updating interest sets.
    ///
    /// `origin` is the handle of the subscription that tailed the document,
    /// if any. Tailed documents from a subscription that is gone are dropped.
    pub fn route(&mut self, kind: EventKind, payload: &Value, origin: Option<&str>) -> Route {
        if let Some(handle) = origin {
            if !self.contains(handle) {
                debug!(%handle, %kind, "dropping event from removed subscription");
                return Route::Drop;
            }
        }

        if kind == EventKind::JobsTailed {
            match JobId::of_tailed(payload) {
                Some(job_id) => self.record_interest(job_id, origin),
                None => warn!("tailed job document carries no job id"),
            }
            return Route::Deliver;
        }
        if kind.is_job_scoped() {
            // Stats carry `[job_id, changes]`; job states carry the job itself.
            let job = match kind {
                EventKind::StatsChanged => payload.get(0),
                _ => payload.get("id"),
            };
            return self.gate(kind, job);
        }
        Route::Deliver
    }

    /// Record that document `id`, tailed by `handle`, reached the client.
    ///
    /// The delivered watermark only moves forward. Unknown handles are ignored.
    pub fn mark_delivered(&mut self, handle: &str, id: DocId) {
        if let Some(subscription) = self.subscriptions.get_mut(handle) {
            if subscription.delivered.is_none_or(|current| id > current) {
                subscription.delivered = Some(id);
            }
        }
    }

    fn record_interest(&mut self, job_id: JobId, origin: Option<&str>) {
        match origin.and_then(|handle| self.subscriptions.get_mut(handle)) {
            Some(subscription) => {
                subscription.interest.insert(job_id);
            }
            None => {
                for subscription in self.subscriptions.values_mut() {
                    if subscription.link.kind() == LinkKind::Jobs {
                        subscription.interest.insert(job_id.clone());
                    }
                }
            }
        }
    }

    fn gate(&self, kind: EventKind, job: Option<&Value>) -> Route {
        let Some(job_id) = job.and_then(JobId::from_json) else {
            warn!(%kind, "job-scoped event without a job id");
            return Route::Drop;
        };
        if self.is_interesting(&job_id) {
            Route::Deliver
        } else {
            debug!(%kind, %job_id, "no subscription follows job, dropping");
            Route::Drop
        }
    }

    /// Whether any active subscription has seen `job_id`.
    pub fn is_interesting(&self, job_id: &JobId) -> bool {
        self.subscriptions.values().any(|s| s.interest.contains(job_id))
    }

    pub fn interest_set(&self, handle: &str) -> Option<&HashSet<JobId>> {
        self.subscriptions.get(handle).map(|s| &s.interest)
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.subscriptions.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Last tailed identifier written to the client, per handle.
    pub fn watermarks(&self) -> BTreeMap<String, Option<DocId>> {
        self.subscriptions
            .iter()
            .map(|(handle, s)| (handle.clone(), s.delivered))
            .collect()
    }
}
