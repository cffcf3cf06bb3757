/*!
 * Order lifecycle: PaymentIncomplete -> AwaitingApproval -> InProgress ->
 * {Completed | Cancelled}. Every transition is an explicit, versioned status
 * write; concurrent writers lose with `ConcurrentModification`.
 */

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::preferences::{self, SINGLETON_ID};
use crate::entities::{order, order_item};
use crate::entities::order::OrderStatus;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::message_queue::{Message, MessageQueue};
use crate::models::{
    Address, Basket, CustomerDetails, OrderApprovedEvent, OrderDetails, OrderItemDetails,
};
use crate::services::approval;

const DEFAULT_LOOKBACK_DAYS: i64 = 365;

/// Sort order for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSort {
    CreatedAsc,
    #[default]
    CreatedDesc,
}

/// Listing filter. An empty result set is a successful response, not an
/// error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    /// Case-sensitive substring match on the customer email
    pub email: Option<String>,
    /// Creation-date window; defaults to a year, non-positive values coerced
    pub in_last_days: Option<i64>,
    #[serde(default)]
    pub sort: OrderSort,
    #[serde(default)]
    pub exclude_payment_incomplete: bool,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    queue: Arc<dyn MessageQueue>,
    events: EventSender,
    currency_code: String,
    publish_delay: Duration,
}

impl OrderService {
    pub fn new(
        db: Arc<DbPool>,
        queue: Arc<dyn MessageQueue>,
        events: EventSender,
        currency_code: String,
        publish_delay: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            events,
            currency_code,
            publish_delay,
        }
    }

    /// Persists a priced basket as a new `PaymentIncomplete` order.
    #[instrument(skip(self, basket), fields(items = basket.items.len()))]
    pub async fn create_order(&self, basket: &Basket) -> Result<Uuid, ServiceError> {
        basket.validate()?;

        let order_id = Uuid::new_v4();
        let items_cost = basket.items_cost();
        let total_cost = basket.total_cost();
        verify_cost_invariant(items_cost, basket.shipping_cost, total_cost)?;

        let now = Utc::now();
        let order_row = order::ActiveModel {
            id: Set(order_id),
            customer_name: Set(None),
            customer_email: Set(None),
            status: Set(OrderStatus::PaymentIncomplete),
            items_cost: Set(items_cost),
            shipping_cost: Set(basket.shipping_cost),
            total_cost: Set(total_cost),
            currency: Set(self.currency_code.clone()),
            shipping_method: Set(basket.shipping_method.clone()),
            shipping_address: Set(None),
            payment_intent_id: Set(None),
            payment_completed_at: Set(None),
            fulfillment_response: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
            version: Set(1),
        };

        let item_rows: Vec<order_item::ActiveModel> = basket
            .items
            .iter()
            .map(|item| {
                Ok(order_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order_id),
                    sku: Set(item.sku.clone()),
                    name: Set(item.name.clone()),
                    image_url: Set(item.image_url.clone()),
                    quantity: Set(item.quantity),
                    attributes: Set(Some(serde_json::to_string(&item.attributes)?)),
                    markup_percentage: Set(item.markup_percentage),
                    total: Set(item.total),
                    created_at: Set(now),
                })
            })
            .collect::<Result<_, ServiceError>>()?;

        let txn = self.db.begin().await?;
        order::Entity::insert(order_row).exec(&txn).await?;
        order_item::Entity::insert_many(item_rows).exec(&txn).await?;
        txn.commit().await?;

        info!(%order_id, %total_cost, "order created");
        self.events
            .send(Event::OrderCreated {
                order_id,
                total_cost,
            })
            .await;

        Ok(order_id)
    }

    /// Marks payment as captured and moves the order to `AwaitingApproval`.
    ///
    /// Idempotent against webhook redelivery: returns `true` only for the
    /// delivery that actually performed the transition, so approval
    /// decisioning runs exactly once.
    #[instrument(skip(self, customer, address), fields(order_id = %order_id))]
    pub async fn confirm_payment(
        &self,
        order_id: Uuid,
        customer: CustomerDetails,
        address: Address,
        payment_intent_id: &str,
    ) -> Result<bool, ServiceError> {
        let existing = self.load_order(order_id).await?;

        if existing.status != OrderStatus::PaymentIncomplete {
            info!(%order_id, status = existing.status.as_str(), "payment already recorded; ignoring replay");
            return Ok(false);
        }

        let update = order::ActiveModel {
            customer_name: Set(Some(customer.name)),
            customer_email: Set(Some(customer.email)),
            status: Set(OrderStatus::AwaitingApproval),
            shipping_address: Set(Some(serde_json::to_string(&address)?)),
            payment_intent_id: Set(Some(payment_intent_id.to_string())),
            payment_completed_at: Set(Some(Utc::now())),
            ..Default::default()
        };
        self.apply_versioned(order_id, existing.version, update)
            .await?;

        self.events
            .send(Event::PaymentConfirmed {
                order_id,
                payment_intent_id: payment_intent_id.to_string(),
            })
            .await;

        Ok(true)
    }

    /// Re-syncs persisted costs from a freshly-quoted basket, closing the
    /// drift window between order creation and payment capture.
    #[instrument(skip(self, basket))]
    pub async fn update_order_costs(&self, basket: &Basket) -> Result<(), ServiceError> {
        let order_id = basket.order_id.ok_or_else(|| {
            ServiceError::InvalidInput("basket has not been committed to an order".to_string())
        })?;

        let existing = self.load_order(order_id).await?;
        if existing.status != OrderStatus::PaymentIncomplete {
            return Err(ServiceError::InvalidStatus(format!(
                "cannot reprice order in status {}",
                existing.status.as_str()
            )));
        }

        let items_cost = basket.items_cost();
        let total_cost = basket.total_cost();
        verify_cost_invariant(items_cost, basket.shipping_cost, total_cost)?;

        let txn = self.db.begin().await?;
        for item in &basket.items {
            order_item::Entity::update_many()
                .col_expr(order_item::Column::Total, Expr::value(item.total))
                .filter(order_item::Column::OrderId.eq(order_id))
                .filter(order_item::Column::Sku.eq(item.sku.clone()))
                .exec(&txn)
                .await?;
        }

        let update = order::ActiveModel {
            items_cost: Set(items_cost),
            shipping_cost: Set(basket.shipping_cost),
            total_cost: Set(total_cost),
            ..Default::default()
        };
        self.apply_versioned_in(&txn, order_id, existing.version, update)
            .await?;
        txn.commit().await?;

        self.events
            .send(Event::CostsRecalculated {
                order_id,
                total_cost,
            })
            .await;

        Ok(())
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderDetails>, ServiceError> {
        let Some(order_row) = order::Entity::find_by_id(order_id).one(&*self.db).await? else {
            return Ok(None);
        };
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(Some(to_details(order_row, items)?))
    }

    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        filter: &OrderFilter,
    ) -> Result<Vec<OrderDetails>, ServiceError> {
        let days = match filter.in_last_days {
            Some(d) if d > 0 => d,
            Some(_) | None => DEFAULT_LOOKBACK_DAYS,
        };
        let cutoff = Utc::now() - ChronoDuration::days(days);

        let mut query = order::Entity::find().filter(order::Column::CreatedAt.gte(cutoff));

        if let Some(status) = filter.status {
            query = query.filter(order::Column::Status.eq(status));
        }
        if filter.exclude_payment_incomplete {
            query = query.filter(order::Column::Status.ne(OrderStatus::PaymentIncomplete));
        }
        if let Some(email) = filter.email.as_deref().filter(|e| !e.is_empty()) {
            query = query.filter(order::Column::CustomerEmail.contains(email));
        }

        query = match filter.sort {
            OrderSort::CreatedAsc => query.order_by_asc(order::Column::CreatedAt),
            OrderSort::CreatedDesc => query.order_by_desc(order::Column::CreatedAt),
        };

        let rows = query
            .find_with_related(order_item::Entity)
            .all(&*self.db)
            .await?;

        rows.into_iter()
            .map(|(order_row, items)| to_details(order_row, items))
            .collect()
    }

    /// Consults the approval policy for a paid order. A missing preferences
    /// row fails closed.
    pub async fn should_auto_approve(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        let order_row = self.load_order(order_id).await?;

        let Some(prefs) = preferences::Entity::find_by_id(SINGLETON_ID)
            .one(&*self.db)
            .await?
        else {
            info!(%order_id, "no preferences configured; defaulting to manual approval");
            return Ok(false);
        };

        Ok(approval::should_auto_approve(
            prefs.auto_approve_mode,
            prefs.auto_approve_limit,
            order_row.total_cost,
        ))
    }

    /// Approves an order for production: persists `InProgress`, then hands
    /// the snapshot to the message channel.
    ///
    /// A publish failure after the status write is surfaced as `QueueError`
    /// without rolling the status back; the reconciliation sweep re-emits the
    /// event for orders stuck in that gap.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn approve_order(
        &self,
        order_id: Uuid,
        auto_approved: bool,
    ) -> Result<(), ServiceError> {
        let existing = self.load_order(order_id).await?;
        if existing.status != OrderStatus::AwaitingApproval {
            return Err(ServiceError::InvalidStatus(format!(
                "cannot approve order in status {}",
                existing.status.as_str()
            )));
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        let approved = approved_event_for(&existing, &items)?;

        let update = order::ActiveModel {
            status: Set(OrderStatus::InProgress),
            ..Default::default()
        };
        self.apply_versioned(order_id, existing.version, update)
            .await?;

        self.publish_approved(&approved).await?;

        info!(%order_id, auto_approved, "order approved for fulfillment");
        self.events
            .send(Event::OrderApproved {
                order_id,
                auto_approved,
            })
            .await;

        Ok(())
    }

    /// Stores the provider's acceptance response and completes the order.
    /// Redeliveries after completion are benign.
    #[instrument(skip(self, response), fields(order_id = %order_id))]
    pub async fn record_fulfillment(
        &self,
        order_id: Uuid,
        response: &serde_json::Value,
    ) -> Result<(), ServiceError> {
        let existing = self.load_order(order_id).await?;

        match existing.status {
            OrderStatus::Completed => {
                info!(%order_id, "order already completed; ignoring duplicate fulfillment");
                return Ok(());
            }
            OrderStatus::InProgress => {}
            other => {
                return Err(ServiceError::InvalidStatus(format!(
                    "cannot record fulfillment for order in status {}",
                    other.as_str()
                )));
            }
        }

        let update = order::ActiveModel {
            status: Set(OrderStatus::Completed),
            fulfillment_response: Set(Some(serde_json::to_string(response)?)),
            ..Default::default()
        };
        self.apply_versioned(order_id, existing.version, update)
            .await?;

        self.events.send(Event::OrderCompleted { order_id }).await;
        Ok(())
    }

    /// Stores a provider status callback payload on the order without
    /// touching its status.
    pub async fn record_provider_callback(
        &self,
        order_id: Uuid,
        payload: &serde_json::Value,
    ) -> Result<(), ServiceError> {
        let existing = self.load_order(order_id).await?;

        let update = order::ActiveModel {
            fulfillment_response: Set(Some(serde_json::to_string(payload)?)),
            ..Default::default()
        };
        self.apply_versioned(order_id, existing.version, update)
            .await
    }

    /// Cancels an order from any non-terminal state.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let existing = self.load_order(order_id).await?;
        if !existing.status.can_transition_to(OrderStatus::Cancelled) {
            return Err(ServiceError::InvalidStatus(format!(
                "cannot cancel order in status {}",
                existing.status.as_str()
            )));
        }

        let update = order::ActiveModel {
            status: Set(OrderStatus::Cancelled),
            ..Default::default()
        };
        self.apply_versioned(order_id, existing.version, update)
            .await?;

        self.events.send(Event::OrderCancelled { order_id }).await;
        Ok(())
    }

    /// Re-publishes the approved snapshot for `InProgress` orders older than
    /// `stale_after` with no recorded fulfillment response. Recovers orders
    /// that were approved but whose publish failed.
    pub async fn republish_stale_approvals(
        &self,
        stale_after: Duration,
    ) -> Result<usize, ServiceError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(stale_after)
                .map_err(|e| ServiceError::InternalError(format!("stale_after: {e}")))?;

        let stuck = order::Entity::find()
            .filter(order::Column::Status.eq(OrderStatus::InProgress))
            .filter(order::Column::FulfillmentResponse.is_null())
            .filter(order::Column::UpdatedAt.lt(cutoff))
            .find_with_related(order_item::Entity)
            .all(&*self.db)
            .await?;

        let mut republished = 0;
        for (order_row, items) in stuck {
            let order_id = order_row.id;
            match approved_event_for(&order_row, &items) {
                Ok(event) => {
                    warn!(%order_id, "re-publishing approved event for stuck order");
                    self.publish_approved(&event).await?;
                    republished += 1;
                }
                Err(err) => {
                    warn!(%order_id, error = %err, "skipping stuck order with incomplete snapshot");
                }
            }
        }

        Ok(republished)
    }

    async fn publish_approved(&self, event: &OrderApprovedEvent) -> Result<(), ServiceError> {
        let message = Message::json(OrderApprovedEvent::TYPE_NAME, event)
            .map_err(|e| ServiceError::QueueError(e.to_string()))?;
        self.queue
            .publish(message, self.publish_delay)
            .await
            .map_err(|e| ServiceError::QueueError(e.to_string()))
    }

    async fn load_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Optimistic versioned replace: the write only lands if the version the
    /// caller read is still current.
    async fn apply_versioned(
        &self,
        order_id: Uuid,
        version: i32,
        update: order::ActiveModel,
    ) -> Result<(), ServiceError> {
        self.apply_versioned_in(&*self.db, order_id, version, update)
            .await
    }

    async fn apply_versioned_in<C: sea_orm::ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        version: i32,
        mut update: order::ActiveModel,
    ) -> Result<(), ServiceError> {
        update.updated_at = Set(Some(Utc::now()));
        update.version = Set(version + 1);

        let result = order::Entity::update_many()
            .set(update)
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Version.eq(version))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }
        Ok(())
    }
}

fn verify_cost_invariant(
    items_cost: Decimal,
    shipping_cost: Decimal,
    total_cost: Decimal,
) -> Result<(), ServiceError> {
    if items_cost + shipping_cost != total_cost {
        return Err(ServiceError::InternalError(format!(
            "cost invariant violated: {items_cost} + {shipping_cost} != {total_cost}"
        )));
    }
    Ok(())
}

fn to_details(
    order_row: order::Model,
    items: Vec<order_item::Model>,
) -> Result<OrderDetails, ServiceError> {
    let shipping_address = order_row
        .shipping_address
        .as_deref()
        .map(serde_json::from_str::<Address>)
        .transpose()?;
    let fulfillment_response = order_row
        .fulfillment_response
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()?;

    let items = items
        .into_iter()
        .map(to_item_details)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OrderDetails {
        id: order_row.id,
        status: order_row.status,
        customer_name: order_row.customer_name,
        customer_email: order_row.customer_email,
        items,
        items_cost: order_row.items_cost,
        shipping_cost: order_row.shipping_cost,
        total_cost: order_row.total_cost,
        currency: order_row.currency,
        shipping_method: order_row.shipping_method,
        shipping_address,
        payment_intent_id: order_row.payment_intent_id,
        payment_completed_at: order_row.payment_completed_at,
        fulfillment_response,
        created_at: order_row.created_at,
    })
}

fn to_item_details(item: order_item::Model) -> Result<OrderItemDetails, ServiceError> {
    let attributes: HashMap<String, String> = item
        .attributes
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?
        .unwrap_or_default();

    Ok(OrderItemDetails {
        id: item.id,
        sku: item.sku,
        name: item.name,
        image_url: item.image_url,
        quantity: item.quantity,
        attributes,
        total: item.total,
    })
}

/// Builds the channel snapshot for an approved order. Fails if the paid
/// order is missing any field payment capture should have populated.
fn approved_event_for(
    order_row: &order::Model,
    items: &[order_item::Model],
) -> Result<OrderApprovedEvent, ServiceError> {
    let missing = |field: &str| {
        ServiceError::InvalidStatus(format!(
            "order {} is missing {} required for fulfillment",
            order_row.id, field
        ))
    };

    let shipping_address: Address = serde_json::from_str(
        order_row
            .shipping_address
            .as_deref()
            .ok_or_else(|| missing("a shipping address"))?,
    )?;

    Ok(OrderApprovedEvent {
        order_id: order_row.id,
        customer_name: order_row
            .customer_name
            .clone()
            .ok_or_else(|| missing("a customer name"))?,
        customer_email: order_row
            .customer_email
            .clone()
            .ok_or_else(|| missing("a customer email"))?,
        items: items
            .iter()
            .cloned()
            .map(to_item_details)
            .collect::<Result<Vec<_>, _>>()?,
        items_cost: order_row.items_cost,
        shipping_cost: order_row.shipping_cost,
        total_cost: order_row.total_cost,
        currency: order_row.currency.clone(),
        shipping_method: order_row.shipping_method.clone(),
        shipping_address,
        payment_intent_id: order_row
            .payment_intent_id
            .clone()
            .ok_or_else(|| missing("a payment intent"))?,
        approved_at: Utc::now(),
    })
}
