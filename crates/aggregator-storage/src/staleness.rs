//! Report Staleness Cache
//!
//! In-memory map from cluster name to the `last_checked_at` of the newest report
//! accepted for that cluster. It lets the write path reject obviously old reports
//! (redelivered or reordered transport messages) without opening a transaction.
//!
//! ## Purpose
//!
//! ```text
//! report(c1, t=10) ──► check ──► Fresh ──► transaction ──► record(c1, 10)
//! report(c1, t=7)  ──► check ──► Stale { stored: 10 }  (no database round trip)
//! ```
//!
//! The cache is an accelerator, not the source of truth. The authoritative staleness
//! check runs inside the write transaction; see [`crate::DbStorage`].
//!
//! ## Lifetime
//!
//! - Warmed once at startup from every stored report
//! - Updated after every committed write
//! - Never persisted; rebuilt on restart

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Result of checking a candidate report against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Strictly newer than anything seen, or cluster not seen yet.
    Fresh,
    /// Not newer than the report already accepted.
    Stale { stored: DateTime<Utc> },
}

/// Statistics about the staleness cache.
#[derive(Debug, Clone)]
pub struct StalenessStats {
    pub entries: usize,
    pub fresh: u64,
    pub stale: u64,
}

pub struct StalenessCache {
    last_checked: RwLock<HashMap<String, DateTime<Utc>>>,
    fresh: AtomicU64,
    stale: AtomicU64,
}

impl Default for StalenessCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StalenessCache {
    pub fn new() -> Self {
        Self {
            last_checked: RwLock::new(HashMap::new()),
            fresh: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    /// Replace the cache content with the given `(cluster, last_checked_at)` pairs.
    pub async fn warm<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, DateTime<Utc>)>,
    {
        let mut map = self.last_checked.write().await;
        map.clear();
        for (cluster, checked_at) in entries {
            let slot = map.entry(cluster).or_insert(checked_at);
            if checked_at > *slot {
                *slot = checked_at;
            }
        }
        map.len()
    }

    /// Check whether a report checked at `checked_at` may be written.
    pub async fn check(&self, cluster: &str, checked_at: DateTime<Utc>) -> Freshness {
        let map = self.last_checked.read().await;
        match map.get(cluster) {
            Some(&stored) if checked_at <= stored => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                Freshness::Stale { stored }
            }
            _ => {
                self.fresh.fetch_add(1, Ordering::Relaxed);
                Freshness::Fresh
            }
        }
    }

    /// Remember an accepted (or authoritatively stored) timestamp.
    ///
    /// The entry only moves forward.
    pub async fn record(&self, cluster: &str, checked_at: DateTime<Utc>) {
        let mut map = self.last_checked.write().await;
        match map.get_mut(cluster) {
            Some(stored) => {
                if checked_at > *stored {
                    *stored = checked_at;
                }
            }
            None => {
                map.insert(cluster.to_string(), checked_at);
            }
        }
    }

    /// Forget a cluster, e.g. after its report was deleted.
    pub async fn forget(&self, cluster: &str) {
        self.last_checked.write().await.remove(cluster);
    }

    pub async fn get(&self, cluster: &str) -> Option<DateTime<Utc>> {
        self.last_checked.read().await.get(cluster).copied()
    }

    pub async fn len(&self) -> usize {
        self.last_checked.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.last_checked.read().await.is_empty()
    }

    pub async fn stats(&self) -> StalenessStats {
        StalenessStats {
            entries: self.len().await,
            fresh: self.fresh.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unknown_cluster_is_fresh() {
        let cache = StalenessCache::new();
        assert_eq!(cache.check("c1", Utc::now()).await, Freshness::Fresh);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_equal_and_older_are_stale() {
        let cache = StalenessCache::new();
        let t1 = Utc::now();
        cache.record("c1", t1).await;

        assert_eq!(cache.check("c1", t1).await, Freshness::Stale { stored: t1 });
        assert_eq!(
            cache.check("c1", t1 - Duration::seconds(1)).await,
            Freshness::Stale { stored: t1 }
        );
        assert_eq!(cache.check("c1", t1 + Duration::milliseconds(1)).await, Freshness::Fresh);

        // Other clusters are independent
        assert_eq!(cache.check("c2", t1).await, Freshness::Fresh);
    }

    #[tokio::test]
    async fn test_record_only_moves_forward() {
        let cache = StalenessCache::new();
        let t1 = Utc::now();
        cache.record("c1", t1).await;
        cache.record("c1", t1 - Duration::minutes(5)).await;
        assert_eq!(cache.get("c1").await, Some(t1));

        let t2 = t1 + Duration::minutes(5);
        cache.record("c1", t2).await;
        assert_eq!(cache.get("c1").await, Some(t2));
    }

    #[tokio::test]
    async fn test_warm_replaces_content() {
        let cache = StalenessCache::new();
        let t = Utc::now();
        cache.record("old", t).await;

        let loaded = cache
            .warm(vec![
                ("c1".to_string(), t),
                ("c2".to_string(), t - Duration::hours(1)),
            ])
            .await;

        assert_eq!(loaded, 2);
        assert_eq!(cache.get("old").await, None);
        assert_eq!(cache.get("c2").await, Some(t - Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_forget() {
        let cache = StalenessCache::new();
        let t = Utc::now();
        cache.record("c1", t).await;
        cache.forget("c1").await;
        assert_eq!(cache.check("c1", t).await, Freshness::Fresh);
    }

    #[tokio::test]
    async fn test_stats_tracking() {
        let cache = StalenessCache::new();
        let t = Utc::now();
        cache.check("c1", t).await;
        cache.record("c1", t).await;
        cache.check("c1", t).await;

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.stale, 1);
    }

    #[tokio::test]
    async fn test_concurrent_records_keep_newest() {
        let cache = Arc::new(StalenessCache::new());
        let base = Utc::now();

        let mut handles = Vec::new();
        for i in 0..50 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let cluster = format!("c{}", i % 5);
                cache.record(&cluster, base + Duration::seconds(i)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.len().await, 5);
        // Cluster c4 received seconds 4, 9, ..., 49
        assert_eq!(cache.get("c4").await, Some(base + Duration::seconds(49)));
    }
}
