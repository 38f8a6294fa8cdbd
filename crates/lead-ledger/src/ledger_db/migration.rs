//! Database migration system

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use crate::ledger_db::schema::{self, EntityKind};

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Bring the schema up to the latest version.
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing lead ledger schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current ledger schema version: {}", current_version);

        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
    }
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_add_emails.sql")),
    ]
}

/// Row counts per table plus file size. Read-only.
pub fn get_database_stats(conn: &Connection) -> Result<schema::DatabaseStats> {
    fn table_count(conn: &Connection, kind: EntityKind) -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |row| row.get(0))
    }

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::DatabaseStats {
        total_leads: table_count(conn, EntityKind::Lead)?,
        total_qualifications: table_count(conn, EntityKind::Qualification)?,
        total_meetings: table_count(conn, EntityKind::Meeting)?,
        total_calendar_events: table_count(conn, EntityKind::CalendarEvent)?,
        total_interactions: table_count(conn, EntityKind::Interaction)?,
        total_emails: table_count(conn, EntityKind::Email)?,
        database_size_bytes,
    })
}

pub fn run_maintenance(conn: &mut Connection) -> Result<()> {
    info!("Running database maintenance...");
    conn.execute_batch("ANALYZE")?;
    conn.execute_batch("PRAGMA incremental_vacuum(100)")?;
    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if integrity != "ok" {
        warn!("Integrity check reported: {}", integrity);
    }
    info!("Database maintenance completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        {
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database().unwrap();
            assert_eq!(migrator.get_current_version().unwrap(), 2);
            assert!(migrator.has_migration_applied(1).unwrap());
        }
        // Second run is a no-op.
        let mut migrator = MigrationManager::new(&mut conn);
        migrator.initialize_database().unwrap();
        assert_eq!(migrator.get_current_version().unwrap(), 2);
    }

    #[test]
    fn test_stats_on_empty_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        let stats = get_database_stats(&conn).unwrap();
        assert_eq!(stats.total_leads, 0);
        assert_eq!(stats.total_emails, 0);
        assert!(stats.database_size_bytes > 0);
    }

    #[test]
    fn test_stats_fail_when_a_table_is_missing() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        conn.execute_batch("DROP TABLE emails").unwrap();
        assert!(get_database_stats(&conn).is_err());
    }
}
