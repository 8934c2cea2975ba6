use async_trait::async_trait;
use std::fmt::Debug;

use crate::Event;

/// At-least-once queue of events fanned out to named consumers.
///
/// `receive` claims pending events for a consumer; a claimed event stays on the stream
/// until the consumer `delete`s (acknowledges) it and becomes visible again if it is never
/// acknowledged.
#[async_trait]
pub trait EventStream: Debug + Send + Sync {
    async fn delete(&self, event: &Event, consumer_id: &str) -> anyhow::Result<u64>;
    async fn receive(&self, consumer_id: &str) -> anyhow::Result<Vec<Event>>;
    async fn send(&self, event: &Event) -> anyhow::Result<()>;
    async fn send_many(&self, events: &[Event]) -> anyhow::Result<()>;
}
