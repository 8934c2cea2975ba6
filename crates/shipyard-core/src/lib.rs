mod condition;
mod event;
mod event_stream;
mod operation;
mod persistence;

pub use condition::{
    ComparisonOperator, Condition, DateOperator, MetadataOperator, Selectable, StringOperator,
    MAX_CONDITION_DEPTH,
};
pub use event::{create_event, make_dedup_key, Event, EventType, ModelType};
pub use event_stream::EventStream;
pub use operation::OperationId;
pub use persistence::{LockOutcome, PersistableModel, Persistence};
