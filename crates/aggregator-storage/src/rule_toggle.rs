//! Rule Toggle Store
//!
//! Per-cluster enable/disable overrides keyed by `(cluster_id, rule_id, error_key)`.
//!
//! Writes are last-writer-wins upserts. Each write stamps `updated_at` and exactly one
//! of `disabled_at`/`enabled_at`; the other timestamp keeps whatever the previous write
//! left, so a re-enabled rule still shows when it was disabled.
//!
//! Reads pick the row with the greatest `updated_at`, which also covers rule ids toggled
//! under more than one error key.

use crate::{
    dialect::in_placeholders,
    error::{Result, StorageError},
    storage::DbStorage,
    types::*,
};
use chrono::Utc;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, error};

impl DbStorage {
    pub async fn set_toggle(
        &self,
        cluster: &str,
        rule_id: &str,
        error_key: &str,
        toggle: RuleToggle,
    ) -> Result<()> {
        let _writer = self.database_writer().await;
        let now = to_micros(Utc::now());
        let (disabled_at, enabled_at) = match toggle {
            RuleToggle::Disabled => (Some(now), None),
            RuleToggle::Enabled => (None, Some(now)),
        };

        sqlx::query(
            r#"
            INSERT INTO cluster_rule_toggle (
                cluster_id, rule_id, error_key, disabled, disabled_at, enabled_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (cluster_id, rule_id, error_key) DO UPDATE SET
                disabled = EXCLUDED.disabled,
                disabled_at = COALESCE(EXCLUDED.disabled_at, cluster_rule_toggle.disabled_at),
                enabled_at = COALESCE(EXCLUDED.enabled_at, cluster_rule_toggle.enabled_at),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(cluster)
        .bind(rule_id)
        .bind(error_key)
        .bind(toggle.as_db())
        .bind(disabled_at)
        .bind(enabled_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, cluster, rule_id, error_key, "Unable to toggle rule");
            StorageError::from(e)
        })?;

        debug!(cluster, rule_id, error_key, disabled = toggle.is_disabled(), "Rule toggled");
        Ok(())
    }

    pub async fn get_toggle(&self, cluster: &str, rule_id: &str) -> Result<ClusterRuleToggle> {
        let row = sqlx::query(
            r#"
            SELECT cluster_id, rule_id, error_key, disabled, disabled_at, enabled_at, updated_at
            FROM cluster_rule_toggle
            WHERE cluster_id = $1 AND rule_id = $2
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(cluster)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found(format!("{}/{}", cluster, rule_id)))?;

        Ok(ClusterRuleToggle {
            cluster_id: row.try_get("cluster_id")?,
            rule_id: row.try_get("rule_id")?,
            error_key: row.try_get("error_key")?,
            disabled: RuleToggle::from_db(row.try_get("disabled")?),
            disabled_at: row.try_get::<Option<i64>, _>("disabled_at")?.map(from_micros),
            enabled_at: row.try_get::<Option<i64>, _>("enabled_at")?.map(from_micros),
            updated_at: row.try_get::<Option<i64>, _>("updated_at")?.map(from_micros),
        })
    }

    /// `rule_id -> disabled` for the rules of `rule_ids` that were ever toggled on the
    /// cluster. An empty input returns an empty map without querying.
    pub async fn get_toggles_for_rules(
        &self,
        cluster: &str,
        rule_ids: &[RuleId],
    ) -> Result<HashMap<RuleId, bool>> {
        let Some(placeholders) = in_placeholders(2, rule_ids.len()) else {
            return Ok(HashMap::new());
        };

        // Ascending, so the most recently updated row of a rule is inserted last.
        let sql = format!(
            r#"
            SELECT rule_id, disabled
            FROM cluster_rule_toggle
            WHERE cluster_id = $1 AND rule_id IN ({})
            ORDER BY COALESCE(updated_at, 0)
            "#,
            placeholders
        );

        let mut query = sqlx::query_as::<_, (String, i64)>(&sql).bind(cluster);
        for rule_id in rule_ids {
            query = query.bind(rule_id.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(rule_id, disabled)| (rule_id, RuleToggle::from_db(disabled).is_disabled()))
            .collect())
    }

    pub async fn delete_toggle(&self, cluster: &str, rule_id: &str) -> Result<()> {
        let _writer = self.database_writer().await;
        let result = sqlx::query(
            "DELETE FROM cluster_rule_toggle WHERE cluster_id = $1 AND rule_id = $2",
        )
        .bind(cluster)
        .bind(rule_id)
        .execute(&self.pool)
        .await?;

        debug!(cluster, rule_id, rows = result.rows_affected(), "Rule toggle deleted");
        Ok(())
    }
}
