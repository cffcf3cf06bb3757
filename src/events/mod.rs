/*!
 * In-process domain events.
 *
 * Services emit events on a bounded channel; a background loop logs them.
 * Delivery is best-effort and never gates the request path — the durable
 * hand-off to fulfillment goes through the message channel instead.
 */

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        total_cost: Decimal,
    },
    PaymentConfirmed {
        order_id: Uuid,
        payment_intent_id: String,
    },
    CostsRecalculated {
        order_id: Uuid,
        total_cost: Decimal,
    },
    OrderApproved {
        order_id: Uuid,
        auto_approved: bool,
    },
    OrderCompleted {
        order_id: Uuid,
    },
    OrderCancelled {
        order_id: Uuid,
    },
}

impl Event {
    pub fn order_id(&self) -> Uuid {
        match self {
            Event::OrderCreated { order_id, .. }
            | Event::PaymentConfirmed { order_id, .. }
            | Event::CostsRecalculated { order_id, .. }
            | Event::OrderApproved { order_id, .. }
            | Event::OrderCompleted { order_id }
            | Event::OrderCancelled { order_id } => *order_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::PaymentConfirmed { .. } => "payment_confirmed",
            Event::CostsRecalculated { .. } => "costs_recalculated",
            Event::OrderApproved { .. } => "order_approved",
            Event::OrderCompleted { .. } => "order_completed",
            Event::OrderCancelled { .. } => "order_cancelled",
        }
    }
}

/// Cloneable sending half handed to every service.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Emit an event. A full or closed channel is logged and swallowed.
    pub async fn send(&self, event: Event) {
        if let Err(e) = self.tx.send(event).await {
            error!("Failed to send event: {}", e);
        }
    }
}

pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Drains the event channel until all senders drop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Event processor started");
    while let Some(event) = rx.recv().await {
        debug!(event = event.name(), order_id = %event.order_id(), "processing event");
        match &event {
            Event::OrderApproved {
                order_id,
                auto_approved,
            } => {
                info!(%order_id, auto_approved, "order approved");
            }
            Event::OrderCompleted { order_id } => {
                info!(%order_id, "order completed");
            }
            Event::OrderCancelled { order_id } => {
                info!(%order_id, "order cancelled");
            }
            _ => {}
        }
    }
    info!("Event processor stopped");
}
