//! Report Upsert Engine
//!
//! The write path for cluster reports:
//!
//! 1. Reject reports the staleness cache already knows to be old (no database access)
//! 2. Take the writer lock for the cluster
//! 3. Begin a transaction; on PostgreSQL take the cluster's advisory lock
//! 4. Re-check staleness against the stored report (authoritative)
//! 5. Delete the cluster's rule hits and insert the new ones
//! 6. Upsert the report row
//! 7. Commit, then record `checked_at` in the staleness cache
//!
//! A report is stale when its `checked_at` is equal to or older than the stored one.
//! Both checks report staleness the same way: [`StorageError::StaleReport`], with
//! nothing written.

use crate::{
    error::{Result, StorageError},
    metrics,
    staleness::Freshness,
    storage::{finish_transaction, DbStorage},
    types::*,
};
use chrono::{DateTime, Utc};
use sqlx::{Any, Transaction};
use tracing::{debug, error, warn};

impl DbStorage {
    /// Store a report and replace the cluster's rule hits. See the module docs.
    pub async fn write_report(
        &self,
        org_id: OrgId,
        cluster: &str,
        report: &str,
        rules: &[ReportItem],
        checked_at: DateTime<Utc>,
        kafka_offset: KafkaOffset,
    ) -> Result<()> {
        // The database keeps microseconds; compare and cache exactly what it stores.
        let checked_at = truncate_to_micros(checked_at);

        if let Freshness::Stale { stored } = self.last_checked.check(cluster, checked_at).await {
            warn!(
                org_id,
                cluster,
                %checked_at,
                %stored,
                "Skipping report that is not newer than the last accepted one"
            );
            metrics::stale_report("cache");
            return Err(StorageError::StaleReport {
                cluster: cluster.to_string(),
                checked_at,
                stored,
            });
        }

        let _writer = self
            .writer_locks
            .lock(self.dialect.writer_lock_key(cluster))
            .await;

        let mut tx = self.pool.begin().await?;
        let outcome = self
            .replace_report(&mut tx, org_id, cluster, report, rules, checked_at, kafka_offset)
            .await;
        let result = finish_transaction(tx, outcome).await;

        match &result {
            Ok(()) => {
                self.last_checked.record(cluster, checked_at).await;
                metrics::WRITTEN_REPORTS_TOTAL.inc();
                debug!(org_id, cluster, %checked_at, rules = rules.len(), kafka_offset, "Report written");
            }
            Err(StorageError::StaleReport { stored, .. }) => {
                warn!(
                    org_id,
                    cluster,
                    %checked_at,
                    stored = %stored,
                    "Database already contains a report that is not older"
                );
                self.last_checked.record(cluster, *stored).await;
                metrics::stale_report("database");
            }
            Err(_) => {}
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn replace_report(
        &self,
        tx: &mut Transaction<'_, Any>,
        org_id: OrgId,
        cluster: &str,
        report: &str,
        rules: &[ReportItem],
        checked_at: DateTime<Utc>,
        kafka_offset: KafkaOffset,
    ) -> Result<()> {
        if let Some(lock) = self.dialect.cluster_lock_statement() {
            sqlx::query(lock).bind(cluster).execute(&mut **tx).await?;
        }

        // Cluster names are globally unique, so the org doesn't take part in the check.
        let stored: Option<i64> = sqlx::query_scalar(
            "SELECT last_checked_at FROM report WHERE cluster = $1 AND last_checked_at >= $2",
        )
        .bind(cluster)
        .bind(to_micros(checked_at))
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| {
            error!(error = %e, org_id, cluster, "Unable to look up the most recent report in the database");
            StorageError::from(e)
        })?;

        if let Some(stored) = stored {
            return Err(StorageError::StaleReport {
                cluster: cluster.to_string(),
                checked_at,
                stored: from_micros(stored),
            });
        }

        sqlx::query("DELETE FROM rule_hit WHERE cluster_id = $1")
            .bind(cluster)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                error!(error = %e, org_id, cluster, "Unable to remove previous rule hits");
                StorageError::from(e)
            })?;

        let upsert_rule_hit = self.dialect.upsert_rule_hit_statement();
        for rule in rules {
            sqlx::query(upsert_rule_hit)
                .bind(org_id)
                .bind(cluster)
                .bind(rule.module.as_str())
                .bind(rule.error_key.as_str())
                .bind(rule.template_data.as_slice())
                .execute(&mut **tx)
                .await
                .map_err(|e| {
                    error!(
                        error = %e,
                        org_id,
                        cluster,
                        rule = %rule.module,
                        error_key = %rule.error_key,
                        "Unable to upsert rule hit"
                    );
                    StorageError::from(e)
                })?;
        }

        sqlx::query(self.dialect.upsert_report_statement())
            .bind(org_id)
            .bind(cluster)
            .bind(report)
            .bind(to_micros(Utc::now()))
            .bind(to_micros(checked_at))
            .bind(kafka_offset)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                error!(error = %e, org_id, cluster, "Unable to upsert the cluster report");
                StorageError::from(e)
            })?;

        Ok(())
    }

    /// Delete all reports and rule hits of an organization.
    pub async fn delete_reports_for_org(&self, org_id: OrgId) -> Result<()> {
        let database_writer = self.database_writer().await;

        let mut tx = self.pool.begin().await?;
        let outcome = Self::delete_org_rows(&mut tx, org_id).await;
        let clusters = finish_transaction(tx, outcome).await?;

        for cluster in &clusters {
            // A writer of the cluster may still be about to record its timestamp; wait
            // for it so the entry can't outlive the deleted report.
            let _writer = if database_writer.is_some() {
                None
            } else {
                Some(self.writer_locks.lock(self.dialect.writer_lock_key(cluster)).await)
            };
            self.last_checked.forget(cluster).await;
        }
        debug!(org_id, clusters = clusters.len(), "Reports deleted for organization");
        Ok(())
    }

    async fn delete_org_rows(tx: &mut Transaction<'_, Any>, org_id: OrgId) -> Result<Vec<String>> {
        sqlx::query("DELETE FROM rule_hit WHERE org_id = $1")
            .bind(org_id)
            .execute(&mut **tx)
            .await?;

        let clusters = sqlx::query_scalar("DELETE FROM report WHERE org_id = $1 RETURNING cluster")
            .bind(org_id)
            .fetch_all(&mut **tx)
            .await?;

        Ok(clusters)
    }

    /// Delete the report and rule hits of a cluster.
    pub async fn delete_reports_for_cluster(&self, cluster: &str) -> Result<()> {
        let _writer = self
            .writer_locks
            .lock(self.dialect.writer_lock_key(cluster))
            .await;

        let mut tx = self.pool.begin().await?;
        let outcome = Self::delete_cluster_rows(&mut tx, cluster).await;
        finish_transaction(tx, outcome).await?;

        self.last_checked.forget(cluster).await;
        debug!(cluster, "Report deleted for cluster");
        Ok(())
    }

    async fn delete_cluster_rows(tx: &mut Transaction<'_, Any>, cluster: &str) -> Result<()> {
        sqlx::query("DELETE FROM rule_hit WHERE cluster_id = $1")
            .bind(cluster)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM report WHERE cluster = $1")
            .bind(cluster)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}
