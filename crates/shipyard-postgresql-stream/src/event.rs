use chrono::{DateTime, Utc};
use shipyard_core::{Event, OperationId};

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub event_id: String,
    pub consumer_id: String,

    pub operation_id: String,
    pub workspace_id: String,

    pub model_type: String,
    pub event_type: String,
    pub dedup_key: Option<String>,

    pub serialized_previous_model: Option<serde_json::Value>,
    pub serialized_current_model: Option<serde_json::Value>,

    pub event_timestamp: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl EventRow {
    pub fn make_id(event_id: &str, consumer_id: &str) -> String {
        format!("{}-{}", event_id, consumer_id)
    }
}

impl TryFrom<EventRow> for Event {
    type Error = anyhow::Error;

    fn try_from(row: EventRow) -> anyhow::Result<Self> {
        Ok(Event {
            id: row.event_id,
            operation_id: OperationId {
                id: row.operation_id,
            },
            workspace_id: row.workspace_id,
            model_type: row.model_type.parse()?,
            event_type: row.event_type.parse()?,
            dedup_key: row.dedup_key,
            serialized_previous_model: row.serialized_previous_model,
            serialized_current_model: row.serialized_current_model,
            timestamp: row.event_timestamp,
        })
    }
}
