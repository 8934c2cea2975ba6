use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;

use shipyard_core::{Event, EventStream};

use crate::event::EventRow;

pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Event queue stored in the `event_queue` table, one row per (event, subscriber).
///
/// Rows are claimed with `FOR UPDATE SKIP LOCKED` so concurrent workers sharing a consumer
/// id never receive the same row, and a claimed row that is not acknowledged within the
/// visibility timeout is handed out again.
#[derive(Debug)]
pub struct PostgresqlEventStream {
    pub db: Arc<PgPool>,
    pub subscribers: Vec<String>,

    pub dedup_ttl: Duration,
    pub visibility_timeout: Duration,
    pub batch_size: i64,
}

impl PostgresqlEventStream {
    pub fn new(db: Arc<PgPool>, subscribers: Vec<String>) -> Self {
        Self {
            db,
            subscribers,
            dedup_ttl: Duration::seconds(5),
            visibility_timeout: Duration::seconds(30),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[async_trait]
impl EventStream for PostgresqlEventStream {
    #[tracing::instrument(name = "postgresql_stream::delete", skip_all)]
    async fn delete(&self, event: &Event, consumer_id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                DELETE FROM event_queue WHERE id = $1
            "#,
        )
        .bind(EventRow::make_id(&event.id, consumer_id))
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "postgresql_stream::receive", skip_all)]
    async fn receive(&self, consumer_id: &str) -> anyhow::Result<Vec<Event>> {
        let now = Utc::now();

        let mut rows = sqlx::query_as::<_, EventRow>(
            r#"
                UPDATE event_queue SET claimed_at = $2
                WHERE id IN (
                    SELECT id FROM event_queue
                    WHERE consumer_id = $1
                      AND (claimed_at IS NULL OR claimed_at < $3)
                    ORDER BY enqueued_at
                    LIMIT $4
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
            "#,
        )
        .bind(consumer_id)
        .bind(now)
        .bind(now - self.visibility_timeout)
        .bind(self.batch_size)
        .fetch_all(&*self.db)
        .await?;

        rows.sort_by_key(|row| row.enqueued_at);

        rows.into_iter().map(Event::try_from).collect()
    }

    #[tracing::instrument(name = "postgresql_stream::send", skip_all)]
    async fn send(&self, event: &Event) -> anyhow::Result<()> {
        let now = Utc::now();

        for consumer_id in self.subscribers.iter() {
            let result = sqlx::query(
                r#"
                    INSERT INTO event_queue
                        (id, event_id, consumer_id, operation_id, workspace_id, model_type,
                         event_type, dedup_key, serialized_previous_model,
                         serialized_current_model, event_timestamp, enqueued_at, claimed_at)
                    SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL
                    WHERE $8::text IS NULL OR NOT EXISTS (
                        SELECT 1 FROM event_queue
                        WHERE consumer_id = $3
                          AND dedup_key = $8
                          AND claimed_at IS NULL
                          AND enqueued_at > $13
                    )
                    ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(EventRow::make_id(&event.id, consumer_id))
            .bind(&event.id)
            .bind(consumer_id)
            .bind(&event.operation_id.id)
            .bind(&event.workspace_id)
            .bind(event.model_type.as_str())
            .bind(event.event_type.as_str())
            .bind(&event.dedup_key)
            .bind(&event.serialized_previous_model)
            .bind(&event.serialized_current_model)
            .bind(event.timestamp)
            .bind(now)
            .bind(now - self.dedup_ttl)
            .execute(&*self.db)
            .await?;

            if result.rows_affected() == 0 {
                tracing::debug!(
                    "postgresql_stream: collapsed event {} for consumer {}",
                    event.id,
                    consumer_id
                );
            }
        }

        Ok(())
    }

    async fn send_many(&self, events: &[Event]) -> anyhow::Result<()> {
        for event in events {
            self.send(event).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use shipyard_core::{create_event, make_dedup_key, EventType, ModelType, OperationId};
    use sqlx::postgres::PgPoolOptions;

    use super::*;

    const CONSUMER_ID: &str = "reconciler-stream-test";

    #[tokio::test]
    #[ignore]
    async fn test_send_receive_delete_with_dedup() {
        dotenvy::from_filename(".env.test").ok();

        let database_url = dotenvy::var("DATABASE_URL").unwrap();
        let db = Arc::new(
            PgPoolOptions::new()
                .max_connections(2)
                .connect(&database_url)
                .await
                .unwrap(),
        );

        sqlx::query("DELETE FROM event_queue WHERE consumer_id = $1")
            .bind(CONSUMER_ID)
            .execute(&*db)
            .await
            .unwrap();

        let event_stream = PostgresqlEventStream::new(db, vec![CONSUMER_ID.to_owned()]);

        let make_event = || {
            create_event(
                &Some(serde_json::json!({ "release_target_id": "target-1" })),
                &None,
                EventType::Requested,
                ModelType::Evaluation,
                "workspace-fixture",
                &OperationId::create(),
            )
            .unwrap()
            .with_dedup_key(make_dedup_key(ModelType::Evaluation, "target-1"))
        };

        event_stream.send(&make_event()).await.unwrap();
        event_stream.send(&make_event()).await.unwrap();

        let received_events = event_stream.receive(CONSUMER_ID).await.unwrap();
        assert_eq!(received_events.len(), 1);

        let received_event = received_events.first().unwrap();
        assert_eq!(received_event.model_type, ModelType::Evaluation);
        assert!(event_stream.receive(CONSUMER_ID).await.unwrap().is_empty());

        let deleted = event_stream
            .delete(received_event, CONSUMER_ID)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
