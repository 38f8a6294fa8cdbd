//! Ledger database module - SQLite-backed storage for leads, qualification
//! history, meetings, calendar events and the interaction log
pub mod entity_store;
pub mod migration;
pub mod schema;

pub use entity_store::{Changeset, Direction, Entity, EntityStore, FieldValue, Filter, Order};
pub use migration::MigrationManager;
pub use schema::*;

use crate::error::{LedgerError, Result, StorageError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Owner of the connection pool. Construct one per process (or per test)
/// and hand it to every component.
pub struct LeadDatabase {
    pub entities: EntityStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl LeadDatabase {
    pub fn new(db_path: &Path) -> Result<Self> {
        info!("Opening lead ledger at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StorageError::from)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder().max_size(10).build(manager)?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        info!("Lead ledger initialized successfully");
        Ok(Self::from_pool(pool))
    }

    /// Private in-memory database. Each SQLite memory connection is its own
    /// database, so the pool holds exactly one connection.
    pub fn new_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> Self {
        let pool = Arc::new(pool);
        Self {
            entities: EntityStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    /// A raw pooled connection, for maintenance and tests. Release it before
    /// calling any other ledger operation.
    pub fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside an immediate transaction, committing on `Ok`.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    pub fn run_maintenance(&self) -> Result<()> {
        let mut conn = self.pool.get()?;
        Ok(migration::run_maintenance(&mut conn)?)
    }

    /// Delete every row in every table. Test and reset utility.
    pub fn clear_all_data(&self) -> Result<()> {
        let cleared = self.with_transaction(|tx| {
            let mut total = 0;
            for kind in [
                EntityKind::Interaction,
                EntityKind::CalendarEvent,
                EntityKind::Email,
                EntityKind::Meeting,
                EntityKind::Qualification,
                EntityKind::Lead,
            ] {
                total += tx
                    .execute(&format!("DELETE FROM {}", kind.table()), [])
                    .map_err(LedgerError::from)?;
            }
            Ok(total)
        })?;
        warn!("Cleared all ledger data ({} rows)", cleared);
        Ok(())
    }
}

impl Drop for LeadDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        {
            let db = LeadDatabase::new(&path).unwrap();
            db.connection()
                .unwrap()
                .execute(
                    "INSERT INTO leads (lead_id, contact_address, status, created_at, updated_at)
                     VALUES ('l1', 'a@x.io', 'new', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
                    [],
                )
                .unwrap();
        }
        let db = LeadDatabase::new(&path).unwrap();
        assert_eq!(db.stats().unwrap().total_leads, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let result: Result<()> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO leads (lead_id, contact_address, status, created_at, updated_at)
                 VALUES ('l1', 'a@x.io', 'new', 'x', 'x')",
                [],
            )?;
            Err(LedgerError::validation("abort"))
        });
        assert!(result.is_err());
        assert_eq!(db.stats().unwrap().total_leads, 0);
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let db = LeadDatabase::new_in_memory().unwrap();
        let conn = db.connection().unwrap();
        let err = conn.execute(
            "INSERT INTO interactions (lead_id, event_type, event_data, timestamp)
             VALUES ('ghost', 'x', '{}', 'x')",
            [],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_maintenance_runs() {
        let db = LeadDatabase::new_in_memory().unwrap();
        db.run_maintenance().unwrap();
    }
}
