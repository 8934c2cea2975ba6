use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use shipyard_core::{Event, EventStream};

const DEFAULT_DEDUP_TTL_SECONDS: i64 = 5;
const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: i64 = 30;

#[derive(Clone, Debug)]
struct QueuedEvent {
    consumer_id: String,
    event: Event,
    enqueued_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
}

/// In-process event stream used by tests and single-binary setups.
///
/// Every sent event is queued once per subscriber. An empty subscriber list queues events
/// for a single anonymous consumer that every `receive` call reads from.
#[derive(Debug)]
pub struct MemoryEventStream {
    events: Arc<Mutex<VecDeque<QueuedEvent>>>,
    subscribers: Vec<String>,
    dedup_ttl: Duration,
    visibility_timeout: Duration,
}

impl MemoryEventStream {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_subscribers(vec![])
    }

    pub fn with_subscribers(subscribers: Vec<String>) -> anyhow::Result<Self> {
        Ok(MemoryEventStream {
            events: Arc::new(Mutex::new(VecDeque::new())),
            subscribers,
            dedup_ttl: Duration::seconds(DEFAULT_DEDUP_TTL_SECONDS),
            visibility_timeout: Duration::seconds(DEFAULT_VISIBILITY_TIMEOUT_SECONDS),
        })
    }

    pub fn with_dedup_ttl(mut self, dedup_ttl: Duration) -> Self {
        self.dedup_ttl = dedup_ttl;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Number of events not yet acknowledged, claimed or not.
    pub fn len(&self) -> anyhow::Result<usize> {
        Ok(self.get_events_locked()?.len())
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn get_events_locked(&self) -> anyhow::Result<MutexGuard<'_, VecDeque<QueuedEvent>>> {
        match self.events.lock() {
            Ok(locked_events) => Ok(locked_events),
            Err(_) => Err(anyhow::anyhow!("failed to acquire lock")),
        }
    }

    fn consumer_ids(&self) -> Vec<String> {
        if self.subscribers.is_empty() {
            vec![String::new()]
        } else {
            self.subscribers.clone()
        }
    }

    fn matches_consumer(&self, queued: &QueuedEvent, consumer_id: &str) -> bool {
        self.subscribers.is_empty() || queued.consumer_id == consumer_id
    }
}

#[async_trait]
impl EventStream for MemoryEventStream {
    #[tracing::instrument(name = "memory_stream::delete", skip_all)]
    async fn delete(&self, event: &Event, consumer_id: &str) -> anyhow::Result<u64> {
        let mut events = self.get_events_locked()?;

        let starting_len = events.len();
        events.retain(|queued| {
            !(queued.event.id == event.id && self.matches_consumer(queued, consumer_id))
        });
        let deleted_count = starting_len - events.len();

        Ok(deleted_count as u64)
    }

    #[tracing::instrument(name = "memory_stream::send", skip_all)]
    async fn send(&self, event: &Event) -> anyhow::Result<()> {
        let mut events = self.get_events_locked()?;
        let now = Utc::now();

        for consumer_id in self.consumer_ids() {
            if let Some(dedup_key) = &event.dedup_key {
                let pending_duplicate = events.iter().any(|queued| {
                    queued.consumer_id == consumer_id
                        && queued.claimed_at.is_none()
                        && queued.event.dedup_key.as_deref() == Some(dedup_key.as_str())
                        && now - queued.enqueued_at < self.dedup_ttl
                });

                if pending_duplicate {
                    tracing::debug!(
                        "memory_stream: dropping duplicate event for dedup key {}",
                        dedup_key
                    );
                    continue;
                }
            }

            events.push_back(QueuedEvent {
                consumer_id,
                event: event.clone(),
                enqueued_at: now,
                claimed_at: None,
            });
        }

        Ok(())
    }

    async fn send_many(&self, events: &[Event]) -> anyhow::Result<()> {
        for event in events.iter() {
            self.send(event).await?;
        }

        Ok(())
    }

    #[tracing::instrument(name = "memory_stream::receive", skip_all)]
    async fn receive(&self, consumer_id: &str) -> anyhow::Result<Vec<Event>> {
        let mut events = self.get_events_locked()?;
        let now = Utc::now();
        let subscribers_empty = self.subscribers.is_empty();

        let mut received = Vec::new();
        for queued in events.iter_mut() {
            if !subscribers_empty && queued.consumer_id != consumer_id {
                continue;
            }

            let visible = match queued.claimed_at {
                Some(claimed_at) => now - claimed_at >= self.visibility_timeout,
                None => true,
            };

            if visible {
                queued.claimed_at = Some(now);
                received.push(queued.event.clone());
            }
        }

        Ok(received)
    }
}
