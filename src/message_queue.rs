/*!
 * At-least-once message channel carrying order-approved events from the
 * request path to the fulfillment worker.
 *
 * A received message stays leased until completed; abandoning it (or letting
 * the visibility timeout lapse) schedules redelivery, and messages that
 * exhaust their delivery budget are dead-lettered.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";
pub const MESSAGE_TYPE_PROPERTY: &str = "MessageType";

/// Message queue errors
#[derive(Error, Debug)]
pub enum MessageQueueError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Unknown message lease: {0}")]
    UnknownLease(Uuid),
}

/// Message envelope for queue items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// `"<TypeName> Message"`
    pub subject: String,
    pub content_type: String,
    pub payload: serde_json::Value,
    pub application_properties: HashMap<String, String>,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: u32,
}

impl Message {
    /// Builds a JSON message for a typed payload, tagging the envelope the
    /// way consumers dispatch on it.
    pub fn json<T: Serialize>(type_name: &str, payload: &T) -> Result<Self, MessageQueueError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| MessageQueueError::SerializationError(e.to_string()))?;

        let mut application_properties = HashMap::new();
        application_properties.insert(MESSAGE_TYPE_PROPERTY.to_string(), type_name.to_string());

        Ok(Self {
            id: Uuid::new_v4(),
            subject: format!("{} Message", type_name),
            content_type: JSON_CONTENT_TYPE.to_string(),
            payload,
            application_properties,
            enqueued_at: Utc::now(),
            delivery_count: 0,
        })
    }

    pub fn message_type(&self) -> Option<&str> {
        self.application_properties
            .get(MESSAGE_TYPE_PROPERTY)
            .map(String::as_str)
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .to_ascii_lowercase()
            .starts_with("application/json")
    }
}

/// Message queue trait for different implementations
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message, visible after `delay`.
    async fn publish(&self, message: Message, delay: Duration) -> Result<(), MessageQueueError>;

    /// Lease the next visible message, if any. The lease lapses after the
    /// queue's visibility timeout unless completed or abandoned.
    async fn receive(&self) -> Result<Option<Message>, MessageQueueError>;

    /// Settle a leased message successfully.
    async fn complete(&self, message_id: Uuid) -> Result<(), MessageQueueError>;

    /// Return a leased message for redelivery (or dead-lettering once the
    /// delivery budget is exhausted).
    async fn abandon(&self, message_id: Uuid) -> Result<(), MessageQueueError>;
}

struct QueueState {
    ready: VecDeque<(Message, Instant)>,
    inflight: HashMap<Uuid, (Message, Instant)>,
    dead: Vec<Message>,
}

/// In-memory message queue implementation
pub struct InMemoryMessageQueue {
    state: Mutex<QueueState>,
    visibility_timeout: Duration,
    max_deliveries: u32,
}

impl InMemoryMessageQueue {
    pub fn new(visibility_timeout: Duration, max_deliveries: u32) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                inflight: HashMap::new(),
                dead: Vec::new(),
            }),
            visibility_timeout,
            max_deliveries,
        }
    }

    /// Number of ready (possibly not yet visible) messages.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn dead_letters(&self) -> Vec<Message> {
        self.lock().dead.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn requeue_or_bury(&self, state: &mut QueueState, message: Message) {
        if message.delivery_count >= self.max_deliveries {
            warn!(
                message_id = %message.id,
                subject = %message.subject,
                deliveries = message.delivery_count,
                "delivery budget exhausted; dead-lettering message"
            );
            state.dead.push(message);
        } else {
            state.ready.push_back((message, Instant::now()));
        }
    }

    fn reap_expired_leases(&self, state: &mut QueueState) {
        let now = Instant::now();
        let expired: Vec<Uuid> = state
            .inflight
            .iter()
            .filter(|(_, (_, leased_at))| now.duration_since(*leased_at) >= self.visibility_timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some((message, _)) = state.inflight.remove(&id) {
                warn!(message_id = %id, "message lease expired; scheduling redelivery");
                self.requeue_or_bury(state, message);
            }
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, message: Message, delay: Duration) -> Result<(), MessageQueueError> {
        let visible_at = Instant::now() + delay;
        self.lock().ready.push_back((message, visible_at));
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Message>, MessageQueueError> {
        let mut state = self.lock();
        self.reap_expired_leases(&mut state);

        let now = Instant::now();
        let position = state
            .ready
            .iter()
            .position(|(_, visible_at)| *visible_at <= now);

        let Some((mut message, _)) = position.and_then(|p| state.ready.remove(p)) else {
            return Ok(None);
        };

        message.delivery_count += 1;
        state
            .inflight
            .insert(message.id, (message.clone(), Instant::now()));
        Ok(Some(message))
    }

    async fn complete(&self, message_id: Uuid) -> Result<(), MessageQueueError> {
        let mut state = self.lock();
        state
            .inflight
            .remove(&message_id)
            .map(|_| ())
            .ok_or(MessageQueueError::UnknownLease(message_id))
    }

    async fn abandon(&self, message_id: Uuid) -> Result<(), MessageQueueError> {
        let mut state = self.lock();
        let (message, _) = state
            .inflight
            .remove(&message_id)
            .ok_or(MessageQueueError::UnknownLease(message_id))?;
        self.requeue_or_bury(&mut state, message);
        Ok(())
    }
}
