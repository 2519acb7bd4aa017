//! Turso Embedded / libSQL storage layer for enrichkit.
//!
//! The [`Storage`] struct wraps a libSQL database holding per-record batch
//! state, the state transition log, the persistent work stack, batch run
//! history and the persistent (L2) lookup cache.
//!
//! **Access rules:**
//! - The pipeline controller is the only writer of record state
//! - Status/inspection commands may use [`Storage::open_readonly`]
//!
//! Multi-statement writes run inside a transaction guarded by a write gate,
//! since all callers share one connection.

mod cache;
mod migrations;
mod runs;
mod stack;
mod state;

use std::path::Path;

use chrono::{DateTime, Utc};
use enrichkit_shared::{EnrichError, Result};
use libsql::{Connection, Database, Row, Transaction, params};
use tokio::sync::{Mutex, MutexGuard};

pub use runs::{RunRecord, RunStatus};
pub use state::{PendingCursor, SaveOutcome};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_gate: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EnrichError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(EnrichError::storage)?;
        let conn = db.connect().map_err(EnrichError::storage)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_gate: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EnrichError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(EnrichError::storage)?;
        let conn = db.connect().map_err(EnrichError::storage)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_gate: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

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
                        EnrichError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
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
            return Err(EnrichError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Take the write gate and open a transaction on the shared connection.
    async fn begin(&self) -> Result<(MutexGuard<'_, ()>, Transaction)> {
        self.check_writable()?;
        let gate = self.write_gate.lock().await;
        let tx = self.conn.transaction().await.map_err(EnrichError::storage)?;
        Ok((gate, tx))
    }

    /// Commit on `Ok`, roll back on `Err`.
    async fn finish<T>(tx: Transaction, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                tx.commit().await.map_err(EnrichError::storage)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Return the distinct batch ids known to the state store.
    pub async fn list_batches(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT batch_id FROM record_state ORDER BY batch_id",
                params![],
            )
            .await
            .map_err(EnrichError::storage)?;

        let mut batches = Vec::new();
        while let Some(row) = rows.next().await.map_err(EnrichError::storage)? {
            batches.push(col::<String>(&row, 0)?);
        }
        Ok(batches)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

// `libsql::FromValue` is not publicly nameable, so mirror its impls here and
// forward to `Row::get`.
trait ColValue: Sized {
    fn get_from(row: &Row, idx: i32) -> libsql::Result<Self>;
}

macro_rules! impl_col_value {
    ($($t:ty),* $(,)?) => {
        $(
            impl ColValue for $t {
                fn get_from(row: &Row, idx: i32) -> libsql::Result<Self> {
                    row.get::<$t>(idx)
                }
            }
            impl ColValue for Option<$t> {
                fn get_from(row: &Row, idx: i32) -> libsql::Result<Self> {
                    row.get::<Option<$t>>(idx)
                }
            }
        )*
    };
}

impl_col_value!(libsql::Value, i32, u32, i64, u64, f64, Vec<u8>, String, bool);

fn col<T: ColValue>(row: &Row, idx: i32) -> Result<T> {
    T::get_from(row, idx).map_err(EnrichError::storage)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EnrichError::Storage(format!("bad timestamp '{raw}': {e}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Storage;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ek_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_support::test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("ek_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("ek_test_{}.db", Uuid::now_v7()));
        drop(Storage::open(&tmp).await.expect("create"));

        let ro = Storage::open_readonly(&tmp).await.expect("open readonly");
        let err = ro.begin().await.err().expect("write must fail");
        assert!(matches!(err, EnrichError::Storage(_)));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let tmp = std::env::temp_dir().join(format!("ek_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }
}
