//! Turso Embedded / libSQL document store.
//!
//! **Access rules:**
//! - crawl writers: read-write via [`SqlStore::open`]
//! - tailing sessions: read-only via [`SqlStore::open_readonly`] (no migrations)

use std::path::Path;

use chrono::Utc;
use crawltail_shared::{Collection, CrawlTailError, DocId, Document, Result};
use libsql::{Connection, Database, params};
use serde_json::{Map, Value};
use tracing::debug;

use crate::migrations;
use crate::{DocumentStore, Evaluator, FindQuery};

/// Rows scanned per round trip while evaluating a filter.
const SCAN_PAGE: i64 = 256;

/// Document store backed by a libSQL database.
pub struct SqlStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: libsql::Error) -> CrawlTailError {
    CrawlTailError::Storage(e.to_string())
}

impl SqlStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CrawlTailError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let store = Self {
            db,
            conn,
            readonly: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CrawlTailError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CrawlTailError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

impl DocumentStore for SqlStore {
    async fn find(&self, collection: Collection, query: &FindQuery) -> Result<Vec<Document>> {
        let mut after = query.filter.id_lower_bound().unwrap_or(DocId::BEGINNING);
        let mut eval = Evaluator::new();
        let mut found = Vec::new();

        loop {
            let after_param = i64::try_from(after.0).unwrap_or(i64::MAX);
            let mut rows = self
                .conn
                .query(
                    "SELECT id, body_json FROM documents
                     WHERE collection = ?1 AND id > ?2
                     ORDER BY id ASC
                     LIMIT ?3",
                    params![collection.as_str(), after_param, SCAN_PAGE],
                )
                .await
                .map_err(storage_err)?;

            let mut scanned = 0;
            while let Some(row) = rows.next().await.map_err(storage_err)? {
                scanned += 1;
                let doc = row_to_document(&row)?;
                after = doc.id;
                if eval.matches(&query.filter, &doc)? {
                    found.push(query.shape(doc));
                    if found.len() >= query.limit {
                        return Ok(found);
                    }
                }
            }

            if scanned < SCAN_PAGE {
                break;
            }
        }

        debug!(%collection, found = found.len(), "sql store find");
        Ok(found)
    }

    async fn insert(&self, collection: Collection, mut body: Map<String, Value>) -> Result<DocId> {
        self.check_writable()?;
        body.remove("_id");
        let body_json = serde_json::to_string(&body)?;
        let now = Utc::now().to_rfc3339();

        let mut rows = self
            .conn
            .query(
                "INSERT INTO documents (collection, body_json, inserted_at)
                 VALUES (?1, ?2, ?3)
                 RETURNING id",
                params![collection.as_str(), body_json.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let row = rows
            .next()
            .await
            .map_err(storage_err)?
            .ok_or_else(|| CrawlTailError::Storage("insert returned no id".into()))?;
        let id = row.get::<i64>(0).map_err(storage_err)?;
        let id = DocId(u64::try_from(id).map_err(|e| CrawlTailError::Storage(e.to_string()))?);

        debug!(%collection, %id, "sql store insert");
        Ok(id)
    }
}

/// Convert a database row to a [`Document`].
fn row_to_document(row: &libsql::Row) -> Result<Document> {
    let id = row.get::<i64>(0).map_err(storage_err)?;
    let id = u64::try_from(id).map_err(|e| CrawlTailError::Storage(format!("invalid id: {e}")))?;
    let body_json: String = row.get(1).map_err(storage_err)?;
    let body: Map<String, Value> = serde_json::from_str(&body_json)?;
    Ok(Document::new(DocId(id), body))
}
