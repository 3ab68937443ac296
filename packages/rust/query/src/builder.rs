//! Query builders: subscription criteria → [`Predicate`].
//!
//! - Job subscriptions filter on the job's URL list with include/exclude patterns.
//! - Page subscriptions resume each source independently from its own last-seen id.

use std::collections::BTreeMap;

use crawltail_shared::{CrawlTailError, DocId, Result};
use serde::Deserialize;
use tracing::debug;

use crate::predicate::{ID_FIELD, Predicate};

/// Field holding the URLs a crawl job was started with.
pub const JOB_URL_FIELD: &str = "urls";

/// URL field used for page sources that don't name one.
pub const DEFAULT_PAGE_URL_FIELD: &str = "url";

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Build the filter for a job subscription.
///
/// Each include pattern must match the job URL field, each exclude pattern
/// must not. Patterns are regular expression fragments; an invalid one is
/// rejected as malformed criteria.
pub fn jobs_query(include: &[String], exclude: &[String]) -> Result<Predicate> {
    let mut conditions = Vec::with_capacity(include.len() + exclude.len());

    for pattern in include {
        validate_pattern(pattern)?;
        conditions.push(Predicate::matches(JOB_URL_FIELD, pattern.as_str()));
    }
    for pattern in exclude {
        validate_pattern(pattern)?;
        conditions.push(Predicate::not_matches(JOB_URL_FIELD, pattern.as_str()));
    }

    let query = Predicate::all_of(conditions);
    debug!(include = include.len(), exclude = exclude.len(), %query, "built jobs query");
    Ok(query)
}

fn validate_pattern(pattern: &str) -> Result<()> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| CrawlTailError::malformed(format!("invalid pattern '{pattern}': {e}")))
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

/// An identifier as a client may send it: a number, a bare decimal string,
/// or an `ObjectId(..)` literal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IdRef {
    Num(u64),
    Text(String),
}

impl IdRef {
    pub fn resolve(&self) -> Result<DocId> {
        match self {
            Self::Num(n) => Ok(DocId(*n)),
            Self::Text(text) => text.parse(),
        }
    }
}

impl From<DocId> for IdRef {
    fn from(id: DocId) -> Self {
        Self::Num(id.0)
    }
}

/// Where to resume one page source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SourceCursor {
    /// Explicit last-seen id and the field holding the page URL.
    Full {
        id: IdRef,
        #[serde(default, alias = "urlField")]
        url_field: Option<String>,
    },
    /// Just the last-seen id; the URL lives in [`DEFAULT_PAGE_URL_FIELD`].
    Bare(IdRef),
}

impl SourceCursor {
    /// Cursor for `id` using the default URL field.
    pub fn after(id: DocId) -> Self {
        Self::Bare(id.into())
    }

    /// Last-seen id and URL field, resolved.
    pub fn resolve(&self) -> Result<(DocId, &str)> {
        match self {
            Self::Full { id, url_field } => Ok((
                id.resolve()?,
                url_field.as_deref().unwrap_or(DEFAULT_PAGE_URL_FIELD),
            )),
            Self::Bare(id) => Ok((id.resolve()?, DEFAULT_PAGE_URL_FIELD)),
        }
    }
}

/// Parse a `{source_key: cursor}` JSON object as sent by clients.
pub fn parse_source_criteria(value: serde_json::Value) -> Result<BTreeMap<String, SourceCursor>> {
    serde_json::from_value(value)
        .map_err(|e| CrawlTailError::malformed(format!("invalid page source criteria: {e}")))
}

/// Build the filter for a page subscription.
///
/// One condition per source: the URL field starts with the source key and the
/// id is past that source's last-seen id. Sources are combined with `OR`.
pub fn pages_query(sources: &BTreeMap<String, SourceCursor>) -> Result<Predicate> {
    let mut conditions = Vec::with_capacity(sources.len());

    for (source, cursor) in sources {
        let (last_id, url_field) = cursor.resolve()?;
        conditions.push(Predicate::And(vec![
            Predicate::matches(url_field, format!("^{}", regex::escape(source))),
            Predicate::greater_than(ID_FIELD, last_id),
        ]));
    }

    let query = Predicate::any_of(conditions);
    debug!(sources = sources.len(), %query, "built pages query");
    Ok(query)
}
