//! SQL Dialects
//!
//! SQLite and PostgreSQL agree on almost all of the SQL the storage issues, including
//! `$N` placeholders. They differ in a few places, and every one of those differences
//! lives behind the [`Dialect`] trait:
//!
//! | Concern | SQLite | PostgreSQL |
//! |---------|--------|------------|
//! | Report upsert | `INSERT OR REPLACE` | `INSERT ... ON CONFLICT (cluster) DO UPDATE` |
//! | Rule hit upsert | `INSERT OR REPLACE` | `INSERT ... ON CONFLICT (...) DO UPDATE` |
//! | Writer serialization | one writer per database file | advisory lock per cluster |
//! | Migrations | `migrations/sqlite` | `migrations/postgres` |
//!
//! The dialect is picked once, when the storage is constructed, from the configured
//! [`Backend`].

use crate::error::{Result, StorageError};
use serde::{Deserialize, Deserializer};
use sqlx::migrate::Migrator;
use std::fmt;
use std::str::FromStr;

static SQLITE_MIGRATOR: Migrator = sqlx::migrate!("./migrations/sqlite");
static POSTGRES_MIGRATOR: Migrator = sqlx::migrate!("./migrations/postgres");

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
        }
    }

    /// Backend named by the scheme of a connection URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        scheme.parse()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Backend::Sqlite),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            _ => Err(StorageError::UnsupportedBackend(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for Backend {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Backend-specific SQL.
pub trait Dialect: Send + Sync {
    fn backend(&self) -> Backend;

    /// Upsert of one `report` row.
    ///
    /// Binds: `$1` org_id, `$2` cluster, `$3` report, `$4` reported_at,
    /// `$5` last_checked_at, `$6` kafka_offset.
    fn upsert_report_statement(&self) -> &'static str;

    /// Upsert of one `rule_hit` row.
    ///
    /// Binds: `$1` org_id, `$2` cluster_id, `$3` rule_fqdn, `$4` error_key,
    /// `$5` template_data.
    fn upsert_rule_hit_statement(&self) -> &'static str;

    /// Statement run first inside a report write transaction to serialize writers
    /// of the same cluster across processes. Binds `$1` cluster.
    fn cluster_lock_statement(&self) -> Option<&'static str>;

    /// Key of the in-process writer lock guarding `cluster`.
    fn writer_lock_key<'a>(&self, cluster: &'a str) -> &'a str;

    /// Writer lock key shared by every cluster, for engines that admit a single writer
    /// per database. Multi-cluster writes take it instead of the per-cluster keys.
    fn database_writer_lock_key(&self) -> Option<&'static str>;

    fn migrator(&self) -> &'static Migrator;
}

pub struct SqliteDialect;

const SQLITE_WRITER_KEY: &str = "";

impl Dialect for SqliteDialect {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn upsert_report_statement(&self) -> &'static str {
        r#"
        INSERT OR REPLACE INTO report (org_id, cluster, report, reported_at, last_checked_at, kafka_offset)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#
    }

    fn upsert_rule_hit_statement(&self) -> &'static str {
        r#"
        INSERT OR REPLACE INTO rule_hit (org_id, cluster_id, rule_fqdn, error_key, template_data)
        VALUES ($1, $2, $3, $4, $5)
        "#
    }

    fn cluster_lock_statement(&self) -> Option<&'static str> {
        None
    }

    // SQLite has a single writer per database file.
    fn writer_lock_key<'a>(&self, _cluster: &'a str) -> &'a str {
        SQLITE_WRITER_KEY
    }

    fn database_writer_lock_key(&self) -> Option<&'static str> {
        Some(SQLITE_WRITER_KEY)
    }

    fn migrator(&self) -> &'static Migrator {
        &SQLITE_MIGRATOR
    }
}

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn upsert_report_statement(&self) -> &'static str {
        r#"
        INSERT INTO report (org_id, cluster, report, reported_at, last_checked_at, kafka_offset)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (cluster) DO UPDATE SET
            org_id = EXCLUDED.org_id,
            report = EXCLUDED.report,
            reported_at = EXCLUDED.reported_at,
            last_checked_at = EXCLUDED.last_checked_at,
            kafka_offset = EXCLUDED.kafka_offset
        "#
    }

    fn upsert_rule_hit_statement(&self) -> &'static str {
        r#"
        INSERT INTO rule_hit (org_id, cluster_id, rule_fqdn, error_key, template_data)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (org_id, cluster_id, rule_fqdn, error_key) DO UPDATE SET
            template_data = EXCLUDED.template_data
        "#
    }

    fn cluster_lock_statement(&self) -> Option<&'static str> {
        // pg_advisory_xact_lock returns void, which the pooled driver can't decode.
        Some("SELECT 1 AS locked FROM (SELECT pg_advisory_xact_lock(hashtext($1))) AS cluster_lock")
    }

    fn writer_lock_key<'a>(&self, cluster: &'a str) -> &'a str {
        cluster
    }

    fn database_writer_lock_key(&self) -> Option<&'static str> {
        None
    }

    fn migrator(&self) -> &'static Migrator {
        &POSTGRES_MIGRATOR
    }
}

pub fn dialect_for(backend: Backend) -> Box<dyn Dialect> {
    match backend {
        Backend::Sqlite => Box::new(SqliteDialect),
        Backend::Postgres => Box::new(PostgresDialect),
    }
}

/// Comma separated `$N` placeholders for an `IN (...)` predicate, numbered from
/// `first` and one per bound value.
///
/// Returns `None` for zero values: `IN ()` is not valid SQL, and callers skip the query.
pub fn in_placeholders(first: usize, count: usize) -> Option<String> {
    if count == 0 {
        return None;
    }

    let placeholders: Vec<String> = (first..first + count).map(|i| format!("${}", i)).collect();
    Some(placeholders.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        assert_eq!("sqlite".parse::<Backend>().unwrap(), Backend::Sqlite);
        assert_eq!("sqlite3".parse::<Backend>().unwrap(), Backend::Sqlite);
        assert_eq!("Postgres".parse::<Backend>().unwrap(), Backend::Postgres);
        assert_eq!("postgresql".parse::<Backend>().unwrap(), Backend::Postgres);

        let err = "mysql".parse::<Backend>().unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedBackend(ref name) if name == "mysql"));
    }

    #[test]
    fn test_backend_from_url() {
        assert_eq!(Backend::from_url("sqlite:///tmp/a.db?mode=rwc").unwrap(), Backend::Sqlite);
        assert_eq!(Backend::from_url("sqlite::memory:").unwrap(), Backend::Sqlite);
        assert_eq!(Backend::from_url("postgres://localhost/db").unwrap(), Backend::Postgres);
        assert_eq!(Backend::from_url("postgresql://u:p@h:5432/db").unwrap(), Backend::Postgres);
        assert!(Backend::from_url("mysql://localhost/db").is_err());
    }

    #[test]
    fn test_sqlite_uses_replace_statements() {
        let dialect = dialect_for(Backend::Sqlite);
        assert_eq!(dialect.backend(), Backend::Sqlite);
        assert!(dialect.upsert_report_statement().contains("INSERT OR REPLACE INTO report"));
        assert!(dialect.upsert_rule_hit_statement().contains("INSERT OR REPLACE INTO rule_hit"));
        assert!(dialect.cluster_lock_statement().is_none());
    }

    #[test]
    fn test_postgres_uses_on_conflict_statements() {
        let dialect = dialect_for(Backend::Postgres);
        let report = dialect.upsert_report_statement();
        assert!(report.contains("ON CONFLICT (cluster) DO UPDATE"));
        assert!(!report.contains("OR REPLACE"));

        let rule_hit = dialect.upsert_rule_hit_statement();
        assert!(rule_hit.contains("ON CONFLICT (org_id, cluster_id, rule_fqdn, error_key)"));
        assert!(rule_hit.contains("template_data = EXCLUDED.template_data"));

        assert!(dialect.cluster_lock_statement().unwrap().contains("pg_advisory_xact_lock"));
    }

    #[test]
    fn test_writer_lock_keys() {
        assert_eq!(SqliteDialect.writer_lock_key("c1"), SqliteDialect.writer_lock_key("c2"));
        assert_eq!(PostgresDialect.writer_lock_key("c1"), "c1");
        assert_ne!(PostgresDialect.writer_lock_key("c1"), PostgresDialect.writer_lock_key("c2"));

        assert_eq!(SqliteDialect.database_writer_lock_key(), Some(SqliteDialect.writer_lock_key("c1")));
        assert_eq!(PostgresDialect.database_writer_lock_key(), None);
    }

    #[test]
    fn test_in_placeholders() {
        assert_eq!(in_placeholders(1, 0), None);
        assert_eq!(in_placeholders(1, 1).as_deref(), Some("$1"));
        assert_eq!(in_placeholders(1, 3).as_deref(), Some("$1,$2,$3"));
        assert_eq!(in_placeholders(2, 2).as_deref(), Some("$2,$3"));
    }
}
