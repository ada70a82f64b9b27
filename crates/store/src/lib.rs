//! Durable stores for the Strand runtime.
//!
//! Two facades over one SQLite database:
//!
//! - [`TranscriptStore`] — threads, messages, runs, tool calls, run events,
//!   and the versioned thread TODO snapshot.
//! - [`ContextRepo`] — dialogue turns, execution evidence, memory items,
//!   context snapshots, and the provider capability cache.
//!
//! The schema is migrated forward on open; see [`db`] for the migration
//! list. All reads are snapshot-consistent single statements; writes are
//! single statements or explicit transactions.

pub mod context;
pub mod cursor;
pub mod db;
pub mod messages;
pub mod runs;
pub mod threads;
pub mod todos;

use std::path::Path;

use db::Db;
use strand_domain::error::Result;

/// Transcript store facade. Cheap to clone.
#[derive(Clone)]
pub struct TranscriptStore {
    pub(crate) db: Db,
}

impl TranscriptStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { db: Db::open(path)? })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Db::open_in_memory()?,
        })
    }

    /// Context repository over the same database.
    pub fn context_repo(&self) -> ContextRepo {
        ContextRepo {
            db: self.db.clone(),
        }
    }

    /// The committed schema version of an opened store.
    pub async fn schema_version(&self) -> Result<i64> {
        self.db
            .call(|conn| {
                let v: i64 = conn
                    .query_row(
                        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                        [],
                        |row| row.get(0),
                    )
                    .map_err(db::db_err)?;
                Ok(v)
            })
            .await
    }
}

/// Context repository facade. Cheap to clone.
#[derive(Clone)]
pub struct ContextRepo {
    pub(crate) db: Db,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_migrates_to_current_version() {
        let store = TranscriptStore::open_in_memory().unwrap();
        assert_eq!(store.schema_version().await.unwrap(), db::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strand.db");
        {
            let store = TranscriptStore::open(&path).unwrap();
            assert_eq!(store.schema_version().await.unwrap(), db::SCHEMA_VERSION);
        }
        let store = TranscriptStore::open(&path).unwrap();
        assert_eq!(store.schema_version().await.unwrap(), db::SCHEMA_VERSION);
    }
}
