//! The crawl-management collaborator sessions observe.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crawltail_shared::{CrawlTailError, JobId, Result};
use serde_json::Value;
use tracing::debug;

use crate::signals::{CrawlSignal, SignalBus};

/// Process-wide view of running crawl jobs plus the signal bus they raise on.
#[derive(Default)]
pub struct CrawlProcess {
    signals: SignalBus,
    jobs: RwLock<BTreeMap<JobId, Value>>,
}

impl CrawlProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    /// Record the current state of a job. The document must carry an `id`.
    pub fn upsert_job(&self, job: Value) -> Result<JobId> {
        let job_id = job
            .get("id")
            .and_then(JobId::from_json)
            .ok_or_else(|| CrawlTailError::validation("job state is missing an 'id' field"))?;
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.clone(), job);
        debug!(%job_id, "job state updated");
        Ok(job_id)
    }

    /// Snapshot of every known job, ordered by job id.
    pub fn jobs(&self) -> Vec<Value> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Raise a stats-changed signal for `job_id`.
    pub fn stats_changed(&self, job_id: impl Into<JobId>, changes: Value) -> usize {
        self.signals.emit(&CrawlSignal::StatsChanged {
            job_id: job_id.into(),
            changes,
        })
    }

    /// Raise a spider-closed signal for `job_id`.
    pub fn spider_closed(&self, job_id: impl Into<JobId>) -> usize {
        self.signals.emit(&CrawlSignal::SpiderClosed {
            job_id: job_id.into(),
        })
    }
}
