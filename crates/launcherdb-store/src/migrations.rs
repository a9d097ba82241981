// ABOUTME: Versioned schema migrations applied before the store is first used.
// ABOUTME: EmbeddedMigrations compiles the SQL scripts in and records applied versions in SchemaVersions.

use std::time::Instant;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::codec::timestamp_column;

/// Identifier of the migration set that builds the launcher settings schema.
pub const SETTINGS_MIGRATION_SET: &str = "launcherdb.settings";

/// Errors that can occur while migrating a database.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("unknown migration set: {0}")]
    UnknownSet(String),

    #[error("migration {version} ({name}) failed: {source}")]
    Step {
        version: i64,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Brings a database schema up to date for a named migration set.
pub trait MigrationRunner: Send + Sync {
    fn migrate(&self, conn: &mut Connection, migration_set: &str) -> Result<(), MigrationError>;
}

/// One versioned schema script.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

static SETTINGS_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "config_logins_favorites",
        sql: include_str!("../migrations/0001_config_logins_favorites.sql"),
    },
    Migration {
        version: 2,
        name: "engine_installations",
        sql: include_str!("../migrations/0002_engine_installations.sql"),
    },
    Migration {
        version: 3,
        name: "server_filters",
        sql: include_str!("../migrations/0003_server_filters.sql"),
    },
    Migration {
        version: 4,
        name: "hubs",
        sql: include_str!("../migrations/0004_hubs.sql"),
    },
    Migration {
        version: 5,
        name: "privacy_policies",
        sql: include_str!("../migrations/0005_privacy_policies.sql"),
    },
];

/// The migration runner used by default: scripts embedded at compile time.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedMigrations;

impl EmbeddedMigrations {
    /// Scripts belonging to a migration set, in version order.
    pub fn scripts(migration_set: &str) -> Option<&'static [Migration]> {
        match migration_set {
            SETTINGS_MIGRATION_SET => Some(SETTINGS_MIGRATIONS),
            _ => None,
        }
    }
}

impl MigrationRunner for EmbeddedMigrations {
    fn migrate(&self, conn: &mut Connection, migration_set: &str) -> Result<(), MigrationError> {
        let scripts = Self::scripts(migration_set)
            .ok_or_else(|| MigrationError::UnknownSet(migration_set.to_string()))?;

        let started = Instant::now();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS SchemaVersions (
                Version INTEGER PRIMARY KEY NOT NULL,
                Name TEXT NOT NULL,
                AppliedAt TEXT NOT NULL
            );",
        )?;

        let mut applied = 0;
        for migration in scripts {
            let done = conn
                .query_row(
                    "SELECT 1 FROM SchemaVersions WHERE Version = ?1",
                    params![migration.version],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if done {
                continue;
            }

            let step = |source| MigrationError::Step {
                version: migration.version,
                name: migration.name,
                source,
            };

            let tx = conn.transaction().map_err(step)?;
            tx.execute_batch(migration.sql).map_err(step)?;
            tx.execute(
                "INSERT INTO SchemaVersions (Version, Name, AppliedAt) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, timestamp_column(&Utc::now())],
            )
            .map_err(step)?;
            tx.commit().map_err(step)?;

            tracing::info!(version = migration.version, name = migration.name, "applied migration");
            applied += 1;
        }

        tracing::debug!(
            migration_set,
            applied,
            elapsed = ?started.elapsed(),
            "did migrations"
        );
        Ok(())
    }
}

/// Highest applied schema version, or 0 on a fresh database.
pub fn schema_version(conn: &Connection) -> Result<i64, MigrationError> {
    let table_exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'SchemaVersions'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !table_exists {
        return Ok(0);
    }
    let version: Option<i64> =
        conn.query_row("SELECT MAX(Version) FROM SchemaVersions", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn fresh_database_gets_every_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 0);

        EmbeddedMigrations
            .migrate(&mut conn, SETTINGS_MIGRATION_SET)
            .unwrap();

        let tables = table_names(&conn);
        for expected in [
            "AcceptedPrivacyPolicy",
            "Config",
            "EngineInstallation",
            "EngineModule",
            "FavoriteServer",
            "Hub",
            "Login",
            "SchemaVersions",
            "ServerFilter",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
        assert_eq!(schema_version(&conn).unwrap(), 5);
    }

    #[test]
    fn migrating_twice_is_a_no_op() {
        let mut conn = Connection::open_in_memory().unwrap();
        EmbeddedMigrations
            .migrate(&mut conn, SETTINGS_MIGRATION_SET)
            .unwrap();
        conn.execute("INSERT INTO Config (Key, Value) VALUES ('CompatMode', 1)", [])
            .unwrap();

        EmbeddedMigrations
            .migrate(&mut conn, SETTINGS_MIGRATION_SET)
            .unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM SchemaVersions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 5);
        let kept: i64 = conn
            .query_row("SELECT COUNT(*) FROM Config", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, 1);
    }

    #[test]
    fn partially_migrated_database_resumes() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE SchemaVersions (Version INTEGER PRIMARY KEY NOT NULL, Name TEXT NOT NULL, AppliedAt TEXT NOT NULL);",
        )
        .unwrap();
        conn.execute_batch(SETTINGS_MIGRATIONS[0].sql).unwrap();
        conn.execute(
            "INSERT INTO SchemaVersions VALUES (1, 'config_logins_favorites', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        EmbeddedMigrations
            .migrate(&mut conn, SETTINGS_MIGRATION_SET)
            .unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 5);
    }

    #[test]
    fn unknown_set_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        let err = EmbeddedMigrations.migrate(&mut conn, "nope").unwrap_err();
        assert!(matches!(err, MigrationError::UnknownSet(ref s) if s == "nope"));
    }
}
