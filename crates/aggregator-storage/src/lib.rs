//! Aggregator Storage
//!
//! This crate persists the latest health-check report of every managed cluster and
//! serves it back to the HTTP layer.
//!
//! ## Purpose
//!
//! Reports arrive asynchronously from a message queue, possibly redelivered and out of
//! order. The storage keeps exactly one "current report" per cluster:
//! - **Reports**: latest report blob per cluster plus bookkeeping timestamps and offset
//! - **Rule hits**: normalized list of rules triggered by that report
//! - **Rule toggles**: per-cluster enable/disable override for a rule
//! - **Consumer errors**: audit log of messages that failed processing
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   write_report   ┌───────────────────────────────┐
//! │   Consumer   │ ────────────────►│ StalenessCache (fast reject)  │
//! └──────────────┘                  │ ClusterLocks   (serialize)    │
//!                                   │ transaction: re-check, replace│
//! ┌──────────────┐   reads/toggles  │ rule hits, upsert report      │
//! │  HTTP layer  │ ────────────────►│ Dialect (SQLite / PostgreSQL) │
//! └──────────────┘                  └───────────────┬───────────────┘
//!                                                   ▼
//!                                             AnyPool (sqlx)
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use aggregator_storage::{DbStorage, Storage, StorageConfig};
//!
//! let storage = DbStorage::new(&StorageConfig::sqlite("aggregator.db")).await?;
//! storage.migrate_to_latest().await?;
//! storage.init().await?;
//!
//! storage.write_report(42, "c1", "{...}", &rules, checked_at, offset).await?;
//! let report = storage.read_report(42, "c1").await?;
//! ```
//!
//! ## Consistency
//!
//! - A report is written only if its `checked_at` is strictly newer than the stored one;
//!   otherwise the write fails with [`StorageError::StaleReport`] and nothing changes
//! - Rule hits of a cluster are replaced wholesale in the same transaction as the report
//! - Writers of one cluster are serialized before the in-transaction re-check, so the
//!   newest `checked_at` wins regardless of commit order

pub mod cluster_lock;
pub mod config;
pub mod consumer_error;
pub mod dialect;
pub mod error;
pub mod metrics;
pub mod query;
pub mod report;
pub mod rule_toggle;
pub mod staleness;
pub mod storage;
pub mod types;

pub use config::{Config, PostgresConfig, StorageConfig};
pub use dialect::{Backend, Dialect};
pub use error::{Result, StorageError};
pub use staleness::{Freshness, StalenessCache};
pub use storage::DbStorage;
pub use types::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Storage trait - the interface the HTTP layer and the transport consumer depend on.
///
/// Implemented by [`DbStorage`] for SQLite and PostgreSQL. All implementations must be
/// Send + Sync so they can be shared as `Arc<dyn Storage>`.
///
/// ## Error Handling
///
/// Read paths return [`StorageError::NotFound`] for missing clusters, rule hits and
/// toggles; callers map it to a not-found response. Everything else is an internal error
/// except [`StorageError::StaleReport`], which the consumer treats as "already have
/// something newer".
#[async_trait]
pub trait Storage: Send + Sync {
    // ============================================================
    // LIFECYCLE
    // ============================================================

    /// Warm the staleness cache from the stored reports.
    ///
    /// The schema must already be at its latest version.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: the scan failed; the service must not start
    async fn init(&self) -> Result<()>;

    /// Close the connection pool.
    async fn close(&self);

    // ============================================================
    // REPORT OPERATIONS
    // ============================================================

    /// List organizations with at least one stored report, ascending.
    async fn list_orgs(&self) -> Result<Vec<OrgId>>;

    /// List clusters of an organization reported at or after `since`, ascending.
    async fn list_clusters_for_org(
        &self,
        org_id: OrgId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClusterName>>;

    /// Read rule hits and `last_checked_at` of a cluster.
    ///
    /// Cluster names are globally unique; `org_id` does not narrow the lookup.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no report for the cluster
    async fn read_report(&self, org_id: OrgId, cluster: &str) -> Result<StoredReport>;

    /// Same as [`Storage::read_report`] without an organization.
    async fn read_report_by_cluster(&self, cluster: &str) -> Result<StoredReport>;

    /// Report blobs for several clusters. Clusters without a report are absent from the
    /// result; an empty input returns an empty map without querying.
    async fn read_reports_for_clusters(
        &self,
        clusters: &[ClusterName],
    ) -> Result<HashMap<ClusterName, ClusterReport>>;

    /// Distinct organizations owning the given clusters, ascending.
    async fn read_org_ids_for_clusters(&self, clusters: &[ClusterName]) -> Result<Vec<OrgId>>;

    /// Decoded template data of one rule hit.
    ///
    /// # Errors
    ///
    /// - `NotFound`: the cluster has no such rule hit
    async fn read_rule_template_data(
        &self,
        org_id: OrgId,
        cluster: &str,
        rule_id: &str,
        error_key: &str,
    ) -> Result<TemplateData>;

    /// Highest stored transport offset, 0 without reports.
    async fn latest_kafka_offset(&self) -> Result<KafkaOffset>;

    /// Store a report and replace the cluster's rule hits.
    ///
    /// # Errors
    ///
    /// - `StaleReport`: `checked_at` is not strictly newer than the stored report;
    ///   nothing was written
    /// - `DatabaseError`: the transaction was rolled back
    async fn write_report(
        &self,
        org_id: OrgId,
        cluster: &str,
        report: &str,
        rules: &[ReportItem],
        checked_at: DateTime<Utc>,
        kafka_offset: KafkaOffset,
    ) -> Result<()>;

    /// Number of stored reports.
    async fn reports_count(&self) -> Result<i64>;

    /// Delete all reports (and rule hits) of an organization.
    async fn delete_reports_for_org(&self, org_id: OrgId) -> Result<()>;

    /// Delete the report (and rule hits) of a cluster.
    async fn delete_reports_for_cluster(&self, cluster: &str) -> Result<()>;

    /// Owning organization of a cluster.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no report for the cluster
    async fn org_id_for_cluster(&self, cluster: &str) -> Result<OrgId>;

    /// Whether a report is stored for the cluster.
    async fn cluster_exists(&self, cluster: &str) -> Result<bool>;

    // ============================================================
    // RULE TOGGLE OPERATIONS
    // ============================================================

    /// Enable or disable a rule for a cluster. Last writer wins.
    async fn set_toggle(
        &self,
        cluster: &str,
        rule_id: &str,
        error_key: &str,
        toggle: RuleToggle,
    ) -> Result<()>;

    /// Most recently updated toggle of a rule.
    ///
    /// # Errors
    ///
    /// - `NotFound`: the rule was never toggled for the cluster
    async fn get_toggle(&self, cluster: &str, rule_id: &str) -> Result<ClusterRuleToggle>;

    /// `rule_id -> disabled` for the toggled rules among `rule_ids`.
    async fn get_toggles_for_rules(
        &self,
        cluster: &str,
        rule_ids: &[RuleId],
    ) -> Result<HashMap<RuleId, bool>>;

    /// Remove a toggle. Administrative use only.
    async fn delete_toggle(&self, cluster: &str, rule_id: &str) -> Result<()>;

    // ============================================================
    // CONSUMER ERRORS
    // ============================================================

    /// Record a message that failed processing.
    ///
    /// # Errors
    ///
    /// - `ConstraintViolation`: the (topic, partition, offset) was already recorded
    async fn write_consumer_error(&self, message: &ConsumerMessage, error: &str) -> Result<()>;
}
