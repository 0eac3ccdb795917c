//! Consumer Error Recorder
//!
//! Append-only log of transport messages that failed processing, keyed by
//! `(topic, partition, offset)`. Recording the same message twice fails with
//! [`StorageError::ConstraintViolation`]; the recorder does not deduplicate.

use crate::{
    error::{Result, StorageError},
    metrics,
    storage::DbStorage,
    types::*,
};
use chrono::Utc;
use tracing::{error, warn};

impl DbStorage {
    pub async fn write_consumer_error(&self, message: &ConsumerMessage, error: &str) -> Result<()> {
        let _writer = self.database_writer().await;
        let result = sqlx::query(
            r#"
            INSERT INTO consumer_error (
                topic, partition, topic_offset, key, produced_at, consumed_at, message, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.topic.as_str())
        .bind(i64::from(message.partition))
        .bind(message.offset)
        .bind(message.key.as_deref())
        .bind(to_micros(message.produced_at))
        .bind(to_micros(Utc::now()))
        .bind(message.payload.as_slice())
        .bind(error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                metrics::CONSUMER_ERRORS_TOTAL.inc();
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error,
                    "Consumer error recorded"
                );
                Ok(())
            }
            Err(e) => {
                let e = StorageError::from(e);
                error!(
                    error = %e,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Unable to record consumer error"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::sqlite_storage;

    fn message(offset: i64) -> ConsumerMessage {
        ConsumerMessage {
            topic: "topic".to_string(),
            partition: 0,
            offset,
            key: Some(b"key".to_vec()),
            produced_at: Utc::now(),
            payload: br#"{"OrgID": 1, "ClusterName": "c1"}"#.to_vec(),
        }
    }

    async fn count(storage: &DbStorage) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM consumer_error")
            .fetch_one(&storage.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_record_consumer_error() {
        let (storage, _dir) = sqlite_storage().await;
        storage.write_consumer_error(&message(5), "parse error").await.unwrap();

        let (key, payload, error): (Option<Vec<u8>>, Vec<u8>, String) = sqlx::query_as(
            "SELECT key, message, error FROM consumer_error WHERE topic = $1 AND topic_offset = $2",
        )
        .bind("topic")
        .bind(5i64)
        .fetch_one(&storage.pool)
        .await
        .unwrap();

        assert_eq!(key.as_deref(), Some(&b"key"[..]));
        assert_eq!(payload, message(5).payload);
        assert_eq!(error, "parse error");
    }

    #[tokio::test]
    async fn test_duplicate_consumer_error_is_constraint_violation() {
        let (storage, _dir) = sqlite_storage().await;
        storage.write_consumer_error(&message(5), "first").await.unwrap();

        let err = storage.write_consumer_error(&message(5), "second").await.unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
        assert_eq!(count(&storage).await, 1);
    }

    #[tokio::test]
    async fn test_message_without_key() {
        let (storage, _dir) = sqlite_storage().await;
        let mut keyless = message(6);
        keyless.key = None;
        storage.write_consumer_error(&keyless, "error").await.unwrap();
        storage.write_consumer_error(&message(7), "error").await.unwrap();
        assert_eq!(count(&storage).await, 2);
    }
}
