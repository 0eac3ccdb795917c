//! Report Queries
//!
//! Read-only lookups served to the HTTP layer. None of them take the writer lock; they
//! observe whatever the last committed report write left behind.
//!
//! Cluster names are unique across organizations, so every per-cluster lookup is keyed
//! by the cluster alone. An organization passed alongside is only compared against the
//! stored owner for diagnostics.

use crate::{
    dialect::in_placeholders,
    error::{Result, StorageError},
    storage::DbStorage,
    types::*,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, error};

impl DbStorage {
    /// Organizations with at least one stored report, ascending.
    pub async fn list_orgs(&self) -> Result<Vec<OrgId>> {
        let orgs = sqlx::query_scalar("SELECT DISTINCT org_id FROM report ORDER BY org_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(orgs)
    }

    /// Clusters of an organization whose report arrived at or after `since`, ascending.
    pub async fn list_clusters_for_org(
        &self,
        org_id: OrgId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClusterName>> {
        let clusters = sqlx::query_scalar(
            "SELECT cluster FROM report WHERE org_id = $1 AND reported_at >= $2 ORDER BY cluster",
        )
        .bind(org_id)
        .bind(to_micros(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(clusters)
    }

    /// Rule hits and `last_checked_at` of a cluster.
    pub async fn read_report(&self, org_id: OrgId, cluster: &str) -> Result<StoredReport> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT org_id, last_checked_at FROM report WHERE cluster = $1")
                .bind(cluster)
                .fetch_optional(&self.pool)
                .await?;

        let Some((stored_org, last_checked_at)) = row else {
            return Err(StorageError::not_found(format!("{}/{}", org_id, cluster)));
        };
        if stored_org != org_id {
            debug!(org_id, stored_org, cluster, "Cluster report belongs to another organization");
        }

        Ok(StoredReport {
            rules: self.read_rule_hits(cluster).await?,
            last_checked_at: from_micros(last_checked_at),
        })
    }

    pub async fn read_report_by_cluster(&self, cluster: &str) -> Result<StoredReport> {
        let last_checked_at: Option<i64> =
            sqlx::query_scalar("SELECT last_checked_at FROM report WHERE cluster = $1")
                .bind(cluster)
                .fetch_optional(&self.pool)
                .await?;

        let last_checked_at = last_checked_at.ok_or_else(|| StorageError::not_found(cluster))?;

        Ok(StoredReport {
            rules: self.read_rule_hits(cluster).await?,
            last_checked_at: from_micros(last_checked_at),
        })
    }

    async fn read_rule_hits(&self, cluster: &str) -> Result<Vec<RuleOnReport>> {
        let rows: Vec<(String, String, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT rule_fqdn, error_key, template_data
            FROM rule_hit
            WHERE cluster_id = $1
            ORDER BY rule_fqdn, error_key
            "#,
        )
        .bind(cluster)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, cluster, "Unable to read rule hits");
            StorageError::from(e)
        })?;

        Ok(rows
            .into_iter()
            .map(|(module, error_key, template_data)| RuleOnReport {
                module,
                error_key,
                template_data: decode_template_data(&template_data),
            })
            .collect())
    }

    /// Report blobs for the given clusters. Unknown clusters are left out.
    pub async fn read_reports_for_clusters(
        &self,
        clusters: &[ClusterName],
    ) -> Result<HashMap<ClusterName, ClusterReport>> {
        let Some(placeholders) = in_placeholders(1, clusters.len()) else {
            return Ok(HashMap::new());
        };

        let sql = format!(
            "SELECT cluster, report FROM report WHERE cluster IN ({})",
            placeholders
        );
        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        for cluster in clusters {
            query = query.bind(cluster.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }

    /// Distinct owners of the given clusters, ascending.
    pub async fn read_org_ids_for_clusters(&self, clusters: &[ClusterName]) -> Result<Vec<OrgId>> {
        let Some(placeholders) = in_placeholders(1, clusters.len()) else {
            return Ok(Vec::new());
        };

        let sql = format!(
            "SELECT DISTINCT org_id FROM report WHERE cluster IN ({}) ORDER BY org_id",
            placeholders
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for cluster in clusters {
            query = query.bind(cluster.as_str());
        }

        Ok(query.fetch_all(&self.pool).await?)
    }

    pub async fn read_rule_template_data(
        &self,
        org_id: OrgId,
        cluster: &str,
        rule_id: &str,
        error_key: &str,
    ) -> Result<TemplateData> {
        let template_data: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT template_data
            FROM rule_hit
            WHERE cluster_id = $1 AND rule_fqdn = $2 AND error_key = $3
            "#,
        )
        .bind(cluster)
        .bind(rule_id)
        .bind(error_key)
        .fetch_optional(&self.pool)
        .await?;

        match template_data {
            Some(data) => Ok(decode_template_data(&data)),
            None => Err(StorageError::not_found(format!(
                "{}/{}/{}|{}",
                org_id, cluster, rule_id, error_key
            ))),
        }
    }

    /// Highest stored transport offset; consumers resume from here after a restart.
    pub async fn latest_kafka_offset(&self) -> Result<KafkaOffset> {
        let offset = sqlx::query_scalar("SELECT COALESCE(MAX(kafka_offset), 0) FROM report")
            .fetch_one(&self.pool)
            .await?;
        Ok(offset)
    }

    pub async fn reports_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM report")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn org_id_for_cluster(&self, cluster: &str) -> Result<OrgId> {
        let org_id: Option<i64> = sqlx::query_scalar("SELECT org_id FROM report WHERE cluster = $1")
            .bind(cluster)
            .fetch_optional(&self.pool)
            .await?;
        org_id.ok_or_else(|| StorageError::not_found(cluster))
    }

    pub async fn cluster_exists(&self, cluster: &str) -> Result<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT cluster FROM report WHERE cluster = $1")
                .bind(cluster)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::sqlite_storage;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 5, 1, hour, 0, 0).unwrap()
    }

    fn names(clusters: &[&str]) -> Vec<ClusterName> {
        clusters.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_storage() {
        let (storage, _dir) = sqlite_storage().await;
        assert!(storage.list_orgs().await.unwrap().is_empty());
        assert_eq!(storage.latest_kafka_offset().await.unwrap(), 0);
        assert_eq!(storage.reports_count().await.unwrap(), 0);
        assert!(!storage.cluster_exists("c1").await.unwrap());
        assert!(storage.org_id_for_cluster("c1").await.unwrap_err().is_not_found());
        assert!(storage.read_report_by_cluster("c1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_orgs_is_distinct_and_sorted() {
        let (storage, _dir) = sqlite_storage().await;
        storage.write_report(3, "c1", "{}", &[], at(1), 1).await.unwrap();
        storage.write_report(1, "c2", "{}", &[], at(1), 2).await.unwrap();
        storage.write_report(3, "c3", "{}", &[], at(1), 3).await.unwrap();

        assert_eq!(storage.list_orgs().await.unwrap(), vec![1, 3]);
        assert_eq!(storage.latest_kafka_offset().await.unwrap(), 3);
        assert_eq!(storage.org_id_for_cluster("c3").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_list_clusters_for_org_filters_by_reported_at() {
        let (storage, _dir) = sqlite_storage().await;
        storage.write_report(1, "c2", "{}", &[], at(1), 1).await.unwrap();
        storage.write_report(1, "c1", "{}", &[], at(1), 2).await.unwrap();
        storage.write_report(2, "c3", "{}", &[], at(1), 3).await.unwrap();

        let past = Utc::now() - Duration::hours(1);
        assert_eq!(
            storage.list_clusters_for_org(1, past).await.unwrap(),
            names(&["c1", "c2"])
        );

        let future = Utc::now() + Duration::hours(1);
        assert!(storage.list_clusters_for_org(1, future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_report_returns_sorted_rule_hits() {
        let (storage, _dir) = sqlite_storage().await;
        let rules = vec![
            ReportItem::new("rule.b", "KEY_1", r#"{"b": 1}"#),
            ReportItem::new("rule.a", "KEY_2", r#"{"a": 2}"#),
            ReportItem::new("rule.a", "KEY_1", "not json"),
        ];
        storage.write_report(1, "c1", "{}", &rules, at(1), 1).await.unwrap();

        let stored = storage.read_report(1, "c1").await.unwrap();
        let keys: Vec<(&str, &str)> = stored
            .rules
            .iter()
            .map(|r| (r.module.as_str(), r.error_key.as_str()))
            .collect();
        assert_eq!(keys, vec![("rule.a", "KEY_1"), ("rule.a", "KEY_2"), ("rule.b", "KEY_1")]);

        assert_eq!(stored.rules[0].template_data, TemplateData::Opaque(b"not json".to_vec()));
        assert_eq!(stored.rules[1].template_data, TemplateData::Parsed(json!({"a": 2})));
        assert_eq!(stored.last_checked_at, at(1));
    }

    #[tokio::test]
    async fn test_read_report_ignores_org_mismatch() {
        let (storage, _dir) = sqlite_storage().await;
        storage
            .write_report(1, "c1", "{}", &[ReportItem::new("rule.a", "KEY", "{}")], at(1), 1)
            .await
            .unwrap();

        let stored = storage.read_report(999, "c1").await.unwrap();
        assert_eq!(stored.rules.len(), 1);

        let err = storage.read_report(1, "missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { ref item } if item == "1/missing"));
    }

    #[tokio::test]
    async fn test_read_reports_for_clusters() {
        let (storage, _dir) = sqlite_storage().await;
        storage.write_report(1, "c1", "report-1", &[], at(1), 1).await.unwrap();
        storage.write_report(2, "c2", "report-2", &[], at(1), 2).await.unwrap();

        let reports = storage
            .read_reports_for_clusters(&names(&["c1", "c2", "unknown"]))
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports["c1"], "report-1");
        assert_eq!(reports["c2"], "report-2");

        assert!(storage.read_reports_for_clusters(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_org_ids_for_clusters() {
        let (storage, _dir) = sqlite_storage().await;
        storage.write_report(5, "c1", "{}", &[], at(1), 1).await.unwrap();
        storage.write_report(2, "c2", "{}", &[], at(1), 2).await.unwrap();
        storage.write_report(5, "c3", "{}", &[], at(1), 3).await.unwrap();

        assert_eq!(
            storage
                .read_org_ids_for_clusters(&names(&["c1", "c2", "c3", "unknown"]))
                .await
                .unwrap(),
            vec![2, 5]
        );
        assert!(storage.read_org_ids_for_clusters(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_rule_template_data() {
        let (storage, _dir) = sqlite_storage().await;
        let rules = vec![ReportItem::new("rule.a", "KEY", r#"{"nodes": ["n1"]}"#)];
        storage.write_report(1, "c1", "{}", &rules, at(1), 1).await.unwrap();

        let data = storage.read_rule_template_data(1, "c1", "rule.a", "KEY").await.unwrap();
        assert_eq!(data, TemplateData::Parsed(json!({"nodes": ["n1"]})));

        assert!(storage
            .read_rule_template_data(1, "c1", "rule.a", "OTHER")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
