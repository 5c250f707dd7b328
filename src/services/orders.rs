use crate::{
    auth::AuthUser,
    entities::{
        order::{
            self, DeliveryMethod, Entity as Order, OrderStatus, PaymentMethod, PaymentStatus,
            ShippingAddress,
        },
        order_item::{self, Entity as OrderItem},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        catalog::CatalogService,
        payment_gateway::{CallbackPayload, PaymentGateway},
        pricing::{round_money, DeliveryPolicy},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const DEFAULT_PER_PAGE: u64 = 20;
const MAX_PER_PAGE: u64 = 100;
/// Re-reads allowed when a concurrent writer changes an order mid-transition
const TRANSITION_ATTEMPTS: usize = 8;

/// One cart line as submitted by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CartLine {
    pub product: Uuid,
    pub amount: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderInput {
    pub order_items: Vec<CartLine>,
    pub shipping_address: ShippingAddress,
    pub delivery_method: DeliveryMethod,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Order with its snapshot lines
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    #[serde(flatten)]
    pub order: order::Model,
    pub order_items: Vec<order_item::Model>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order: OrderView,
    /// Gateway checkout URL, `None` for cash on delivery
    pub payment_link: Option<String>,
}

/// Validated line ready to be reserved
#[derive(Debug, Clone)]
struct PlannedLine {
    product_id: Uuid,
    name: String,
    image: Option<String>,
    price: Decimal,
    amount: i32,
}

/// Order assembler and lifecycle controller.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    catalog: CatalogService,
    gateway: Option<Arc<PaymentGateway>>,
    delivery: DeliveryPolicy,
    event_sender: Arc<EventSender>,
    allow_reopen_cancelled: bool,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: CatalogService,
        gateway: Option<Arc<PaymentGateway>>,
        delivery: DeliveryPolicy,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            catalog,
            gateway,
            delivery,
            event_sender,
            allow_reopen_cancelled: false,
        }
    }

    /// Permit admin status edits that move an order out of `Cancelled`
    pub fn with_reopen_cancelled(mut self, allow: bool) -> Self {
        self.allow_reopen_cancelled = allow;
        self
    }

    pub fn gateway(&self) -> Option<&Arc<PaymentGateway>> {
        self.gateway.as_ref()
    }

    /// Places an order.
    ///
    /// Every line is checked before any stock moves. Reservations are then
    /// taken one line at a time with the atomic conditional decrement, and
    /// all of them are handed back if a later line or the order write fails.
    #[instrument(skip(self, input), fields(lines = input.order_items.len()))]
    pub async fn create_order(
        &self,
        user_id: &str,
        input: CreateOrderInput,
    ) -> Result<CreatedOrder, ServiceError> {
        if input.order_items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Order must contain at least one item".to_string(),
            ));
        }
        if let Some(index) = input.order_items.iter().position(|line| line.amount < 1) {
            return Err(ServiceError::ValidationError(format!(
                "Line {}: amount must be at least 1",
                index
            )));
        }
        let gateway = if input.payment_method.requires_gateway() {
            Some(self.gateway.clone().ok_or_else(|| {
                ServiceError::ServiceUnavailable(
                    "Online card payment is not available".to_string(),
                )
            })?)
        } else {
            None
        };

        let lines = self.plan_lines(&input.order_items).await?;
        let subtotal = round_money(
            lines
                .iter()
                .map(|line| line.price * Decimal::from(line.amount))
                .sum(),
        );
        let delivery_fee = self.delivery.fee(
            input.delivery_method,
            subtotal,
            input.shipping_address.delivery_fee,
        )?;
        let total_price = round_money(subtotal + delivery_fee);

        let order_id = Uuid::new_v4();
        let payment_link = match &gateway {
            Some(gateway) => {
                let request = gateway.build_payment_request(order_id, total_price)?;
                Some(gateway.checkout_url(&request)?)
            }
            None => None,
        };

        let reservations: Vec<(Uuid, i32)> = lines
            .iter()
            .map(|line| (line.product_id, line.amount))
            .collect();
        self.reserve(&reservations)
            .await
            .map_err(|(index, e)| annotate_line(index, e))?;

        let persisted = self
            .persist_order(order_id, user_id, &input, &lines, subtotal, delivery_fee, total_price)
            .await;
        let view = match persisted {
            Ok(view) => view,
            Err(e) => {
                error!(%order_id, error = %e, "Order write failed; releasing reservations");
                self.compensate(&reservations).await;
                return Err(e);
            }
        };

        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id,
                total_price,
            })
            .await;
        info!(
            %order_id,
            %subtotal,
            %delivery_fee,
            %total_price,
            payment_method = %input.payment_method,
            "Order created"
        );

        Ok(CreatedOrder {
            order: view,
            payment_link,
        })
    }

    async fn plan_lines(&self, cart: &[CartLine]) -> Result<Vec<PlannedLine>, ServiceError> {
        let mut planned = Vec::with_capacity(cart.len());
        for (index, line) in cart.iter().enumerate() {
            let product = self.catalog.find_live(line.product).await?.ok_or_else(|| {
                ServiceError::ProductNotFound(format!(
                    "Line {}: product {} not found",
                    index, line.product
                ))
            })?;
            if product.stock < line.amount {
                return Err(ServiceError::InsufficientStock(format!(
                    "Line {}: {} (product {}): requested {}, available {}",
                    index, product.name, product.id, line.amount, product.stock
                )));
            }
            planned.push(PlannedLine {
                product_id: product.id,
                name: product.name,
                image: product.image,
                price: product.price,
                amount: line.amount,
            });
        }
        Ok(planned)
    }

    /// Reserves every `(product, qty)` or none of them.
    ///
    /// On failure returns the index of the failing entry together with the error.
    async fn reserve(&self, reservations: &[(Uuid, i32)]) -> Result<(), (usize, ServiceError)> {
        for (index, (product_id, qty)) in reservations.iter().enumerate() {
            if let Err(e) = self.catalog.decrement_stock(*product_id, *qty).await {
                warn!(%product_id, qty, error = %e, "Reservation failed; compensating");
                self.compensate(&reservations[..index]).await;
                return Err((index, e));
            }
        }
        Ok(())
    }

    /// Returns stock for reservations already taken
    async fn compensate(&self, reservations: &[(Uuid, i32)]) {
        for (product_id, qty) in reservations {
            if let Err(e) = self.catalog.increment_stock(*product_id, *qty).await {
                error!(%product_id, qty, error = %e, "Compensating stock increment failed");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_order(
        &self,
        order_id: Uuid,
        user_id: &str,
        input: &CreateOrderInput,
        lines: &[PlannedLine],
        subtotal: Decimal,
        delivery_fee: Decimal,
        total_price: Decimal,
    ) -> Result<OrderView, ServiceError> {
        let txn = self.db.begin().await?;

        let order = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id.to_string()),
            subtotal: Set(subtotal),
            delivery_fee: Set(delivery_fee),
            total_price: Set(total_price),
            delivery_method: Set(input.delivery_method),
            payment_method: Set(input.payment_method),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            shipping_address: Set(input.shipping_address.clone()),
            notes: Set(input.notes.clone()),
            payment_details: Set(None),
            stock_reserved: Set(true),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let items: Vec<order_item::ActiveModel> = lines
            .iter()
            .map(|line| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                name: Set(line.name.clone()),
                image: Set(line.image.clone()),
                price: Set(line.price),
                amount: Set(line.amount),
            })
            .collect();
        OrderItem::insert_many(items)
            .exec_without_returning(&txn)
            .await?;

        let order_items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        txn.commit().await?;

        Ok(OrderView { order, order_items })
    }

    /// Applies a verified gateway callback to its order.
    ///
    /// Redelivery of the same outcome is idempotent. A callback that
    /// contradicts a final payment status is acknowledged but not applied.
    #[instrument(skip(self, payload), fields(order_id = %payload.order_id, status = %payload.status))]
    pub async fn apply_payment_callback(
        &self,
        payload: &CallbackPayload,
    ) -> Result<order::Model, ServiceError> {
        let order_id = Uuid::parse_str(&payload.order_id)
            .map_err(|_| ServiceError::NotFound(format!("Order {} not found", payload.order_id)))?;

        for _ in 0..TRANSITION_ATTEMPTS {
            let order = self.find_order(order_id).await?;
            let applied = if payload.is_success() {
                self.try_payment_success(&order, payload).await?
            } else {
                self.try_payment_failure(&order, payload).await?
            };
            if let Some(updated) = applied {
                return Ok(updated);
            }
            debug!(%order_id, "Order changed during callback; re-reading");
        }
        Err(contended(order_id))
    }

    async fn try_payment_success(
        &self,
        order: &order::Model,
        payload: &CallbackPayload,
    ) -> Result<Option<order::Model>, ServiceError> {
        let order_id = order.id;
        if order.payment_status == PaymentStatus::Failed {
            warn!(%order_id, "Success callback after payment failure ignored; needs manual reconciliation");
            return Ok(Some(order.clone()));
        }

        let newly_paid = order.payment_status != PaymentStatus::Paid;
        let next_status = match order.status {
            OrderStatus::Pending => OrderStatus::Processing,
            // Cancelled stays cancelled; later stages are never rolled back
            other => other,
        };
        let changes = order::ActiveModel {
            status: Set(next_status),
            payment_status: Set(PaymentStatus::Paid),
            payment_details: Set(Some(payload.raw.clone())),
            ..Default::default()
        };
        if !self.compare_and_set(order, changes).await? {
            return Ok(None);
        }

        if newly_paid {
            if order.status == OrderStatus::Cancelled {
                warn!(%order_id, "Payment received for cancelled order; needs refund");
            }
            self.event_sender
                .send_or_log(Event::PaymentReceived {
                    order_id,
                    amount: payload.amount,
                })
                .await;
            info!(%order_id, "Payment received");
        }
        self.find_order(order_id).await.map(Some)
    }

    async fn try_payment_failure(
        &self,
        order: &order::Model,
        payload: &CallbackPayload,
    ) -> Result<Option<order::Model>, ServiceError> {
        let order_id = order.id;
        if order.payment_status == PaymentStatus::Paid {
            warn!(%order_id, gateway_status = %payload.status, "Failure callback after payment success ignored; needs manual reconciliation");
            return Ok(Some(order.clone()));
        }

        let newly_failed = order.payment_status != PaymentStatus::Failed;
        let next_status = match order.status {
            OrderStatus::Cancelled => OrderStatus::Cancelled,
            _ => OrderStatus::Pending,
        };
        let changes = order::ActiveModel {
            status: Set(next_status),
            payment_status: Set(PaymentStatus::Failed),
            payment_details: Set(Some(payload.raw.clone())),
            stock_reserved: Set(false),
            ..Default::default()
        };
        if !self.compare_and_set(order, changes).await? {
            return Ok(None);
        }

        if newly_failed {
            self.event_sender
                .send_or_log(Event::PaymentFailed {
                    order_id,
                    gateway_status: payload.status.clone(),
                })
                .await;
            info!(%order_id, gateway_status = %payload.status, "Payment failed");
        }
        if order.stock_reserved {
            self.return_stock(order_id).await?;
        }
        self.find_order(order_id).await.map(Some)
    }

    /// Admin status edit.
    ///
    /// Entering `Cancelled` hands the reservation back exactly once; leaving
    /// it is refused unless reopening is enabled, in which case stock is
    /// reserved again first.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let order = self.find_order(order_id).await?;
            let old_status = order.status;
            if old_status == new_status {
                return Ok(order);
            }
            let Some(updated) = self.try_status_change(&order, new_status).await? else {
                debug!(%order_id, "Order changed during status edit; re-reading");
                continue;
            };

            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id,
                    old_status: old_status.to_string(),
                    new_status: new_status.to_string(),
                })
                .await;
            info!(%order_id, %old_status, %new_status, "Order status updated");
            return Ok(updated);
        }
        Err(contended(order_id))
    }

    async fn try_status_change(
        &self,
        order: &order::Model,
        new_status: OrderStatus,
    ) -> Result<Option<order::Model>, ServiceError> {
        let order_id = order.id;
        let mut reserve_again = false;
        if order.status == OrderStatus::Cancelled {
            if !self.allow_reopen_cancelled {
                return Err(ServiceError::InvalidOperation(format!(
                    "Order {} is cancelled and cannot be moved to {}",
                    order_id, new_status
                )));
            }
            reserve_again = !order.stock_reserved && order.payment_status != PaymentStatus::Failed;
        }

        let mut changes = order::ActiveModel {
            status: Set(new_status),
            ..Default::default()
        };
        let mut reserved_now = Vec::new();
        if new_status == OrderStatus::Cancelled {
            changes.stock_reserved = Set(false);
        } else if reserve_again {
            let items = self.order_items(order_id).await?;
            reserved_now = items.iter().map(|i| (i.product_id, i.amount)).collect();
            self.reserve(&reserved_now)
                .await
                .map_err(|(index, e)| annotate_line(index, e))?;
            changes.stock_reserved = Set(true);
        }

        let written = match self.compare_and_set(order, changes).await {
            Ok(written) => written,
            Err(e) => {
                self.compensate(&reserved_now).await;
                return Err(e);
            }
        };
        if !written {
            self.compensate(&reserved_now).await;
            return Ok(None);
        }

        if new_status == OrderStatus::Cancelled && order.stock_reserved {
            self.return_stock(order_id).await?;
        }
        self.find_order(order_id).await.map(Some)
    }

    /// Writes `changes` only while the row still carries the status, payment
    /// status and reservation flag observed in `observed`.
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_set(
        &self,
        observed: &order::Model,
        mut changes: order::ActiveModel,
    ) -> Result<bool, ServiceError> {
        changes.updated_at = Set(Utc::now());
        let result = Order::update_many()
            .set(changes)
            .filter(order::Column::Id.eq(observed.id))
            .filter(order::Column::Status.eq(observed.status))
            .filter(order::Column::PaymentStatus.eq(observed.payment_status))
            .filter(order::Column::StockReserved.eq(observed.stock_reserved))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Hands an order's reserved stock back to the catalog.
    ///
    /// Only the caller whose transition cleared `stock_reserved` may call this,
    /// so each reservation is returned once.
    async fn return_stock(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let items = self.order_items(order_id).await?;
        let returned: Vec<(Uuid, i32)> = items.iter().map(|i| (i.product_id, i.amount)).collect();
        self.compensate(&returned).await;

        self.event_sender
            .send_or_log(Event::StockRestored {
                order_id,
                lines: returned.len(),
            })
            .await;
        info!(%order_id, lines = returned.len(), "Stock restored");
        Ok(())
    }

    /// Fetches an order visible to `requester`
    #[instrument(skip(self, requester), fields(user = %requester.user_id))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        requester: &AuthUser,
    ) -> Result<OrderView, ServiceError> {
        let order = self.find_order(order_id).await?;
        if !requester.is_admin() && order.user_id != requester.user_id {
            return Err(ServiceError::NotFound(format!(
                "Order {} not found",
                order_id
            )));
        }
        let order_items = self.order_items(order_id).await?;
        Ok(OrderView { order, order_items })
    }

    /// Requester's orders (all orders for admins), newest first
    #[instrument(skip(self, requester), fields(user = %requester.user_id))]
    pub async fn list_orders(
        &self,
        requester: &AuthUser,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderView>, u64), ServiceError> {
        let per_page = match per_page {
            0 => DEFAULT_PER_PAGE,
            n => n.min(MAX_PER_PAGE),
        };
        let mut query = Order::find();
        if !requester.is_admin() {
            query = query.filter(order::Column::UserId.eq(requester.user_id.as_str()));
        }
        let paginator = query
            .order_by_desc(order::Column::CreatedAt)
            .order_by_asc(order::Column::Id)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        let mut items_by_order: HashMap<Uuid, Vec<order_item::Model>> = HashMap::new();
        if !orders.is_empty() {
            let items = OrderItem::find()
                .filter(order_item::Column::OrderId.is_in(orders.iter().map(|o| o.id)))
                .all(&*self.db)
                .await?;
            for item in items {
                items_by_order.entry(item.order_id).or_default().push(item);
            }
        }

        let views = orders
            .into_iter()
            .map(|order| {
                let order_items = items_by_order.remove(&order.id).unwrap_or_default();
                OrderView { order, order_items }
            })
            .collect();
        Ok((views, total))
    }

    async fn find_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?)
    }
}

/// Prefixes stock and product errors with the offending cart line
fn annotate_line(index: usize, err: ServiceError) -> ServiceError {
    match err {
        ServiceError::InsufficientStock(msg) => {
            ServiceError::InsufficientStock(format!("Line {}: {}", index, msg))
        }
        ServiceError::ProductNotFound(msg) => {
            ServiceError::ProductNotFound(format!("Line {}: {}", index, msg))
        }
        other => other,
    }
}

fn contended(order_id: Uuid) -> ServiceError {
    ServiceError::Conflict(format!(
        "Order {} is being updated concurrently; retry the request",
        order_id
    ))
}
