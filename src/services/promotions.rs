use crate::{
    entities::{
        product::{self, Entity as Product},
        promotion::{self, Entity as Promotion},
        promotion_product::{self, Entity as PromotionProduct},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        catalog::{CatalogService, PriceUpdate},
        pricing::{discounted_price, validate_discount},
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, JoinType, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Promotion together with its member product ids
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionView {
    #[serde(flatten)]
    pub promotion: promotion::Model,
    pub products: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePromotionInput {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub discount: Decimal,
    pub products: Vec<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// Partial update; absent fields keep their current value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePromotionInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub discount: Option<Decimal>,
    pub products: Option<Vec<Uuid>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

/// Outcome of one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub expired: usize,
    pub failed: usize,
}

/// Active promotion that currently sets a product's price, if any.
///
/// When several active promotions list the product the most recently
/// updated one wins. `excluding` skips a promotion that is being released.
pub async fn governing_promotion<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    excluding: Option<Uuid>,
) -> Result<Option<(Uuid, Decimal)>, ServiceError> {
    let mut query = Promotion::find()
        .join(
            JoinType::InnerJoin,
            promotion::Relation::PromotionProduct.def(),
        )
        .filter(promotion_product::Column::ProductId.eq(product_id))
        .filter(promotion::Column::IsActive.eq(true));
    if let Some(excluded) = excluding {
        query = query.filter(promotion::Column::Id.ne(excluded));
    }

    let governing = query
        .order_by_desc(promotion::Column::UpdatedAt)
        .order_by_desc(promotion::Column::Id)
        .one(conn)
        .await?;

    Ok(governing.map(|p| (p.id, p.discount)))
}

fn dedupe(ids: &[Uuid]) -> Vec<Uuid> {
    ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

fn validate_title(title: &str) -> Result<(), ServiceError> {
    if title.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "Promotion title must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), ServiceError> {
    if start >= end {
        return Err(ServiceError::ValidationError(
            "startDate must be before endDate".to_string(),
        ));
    }
    Ok(())
}

/// Promotion engine: keeps product prices in line with active promotions.
#[derive(Clone)]
pub struct PromotionService {
    db: Arc<DatabaseConnection>,
    catalog: CatalogService,
    event_sender: Arc<EventSender>,
}

impl PromotionService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: CatalogService,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            catalog,
            event_sender,
        }
    }

    /// Creates an active promotion and prices its products immediately
    #[instrument(skip(self, input), fields(title = %input.title))]
    pub async fn create_promotion(
        &self,
        input: CreatePromotionInput,
    ) -> Result<PromotionView, ServiceError> {
        validate_title(&input.title)?;
        validate_discount(input.discount)?;
        validate_window(input.start_date, input.end_date)?;
        let members = dedupe(&input.products);
        if members.is_empty() {
            return Err(ServiceError::ValidationError(
                "Promotion must include at least one product".to_string(),
            ));
        }
        self.ensure_live_products(&members).await?;

        let txn = self.db.begin().await?;
        let created = promotion::ActiveModel {
            title: Set(input.title.trim().to_string()),
            description: Set(input.description),
            discount: Set(input.discount),
            start_date: Set(input.start_date),
            end_date: Set(input.end_date),
            is_active: Set(true),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        Self::insert_members(&txn, created.id, &members).await?;
        txn.commit().await?;

        let priced = self
            .apply_discount(created.id, created.discount, &members)
            .await?;
        self.event_sender
            .send_or_log(Event::PromotionApplied {
                promotion_id: created.id,
                products: priced,
            })
            .await;

        info!(promotion_id = %created.id, products = priced, "Created promotion");
        Ok(PromotionView {
            promotion: created,
            products: members,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_promotion(&self, promotion_id: Uuid) -> Result<PromotionView, ServiceError> {
        let promotion = self.find_promotion(promotion_id).await?;
        let products = self.member_ids(promotion_id).await?;
        Ok(PromotionView {
            promotion,
            products,
        })
    }

    #[instrument(skip(self))]
    pub async fn list_promotions(
        &self,
        active_only: bool,
    ) -> Result<Vec<PromotionView>, ServiceError> {
        let mut query = Promotion::find();
        if active_only {
            query = query.filter(promotion::Column::IsActive.eq(true));
        }
        let promotions = query
            .order_by_desc(promotion::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        if promotions.is_empty() {
            return Ok(Vec::new());
        }

        let rows = PromotionProduct::find()
            .filter(
                promotion_product::Column::PromotionId.is_in(promotions.iter().map(|p| p.id)),
            )
            .all(&*self.db)
            .await?;
        let mut members: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for row in rows {
            members.entry(row.promotion_id).or_default().push(row.product_id);
        }

        Ok(promotions
            .into_iter()
            .map(|promotion| {
                let mut products = members.remove(&promotion.id).unwrap_or_default();
                products.sort();
                PromotionView {
                    promotion,
                    products,
                }
            })
            .collect())
    }

    /// Applies a partial update and reconciles member prices with the result
    #[instrument(skip(self, input))]
    pub async fn update_promotion(
        &self,
        promotion_id: Uuid,
        input: UpdatePromotionInput,
    ) -> Result<PromotionView, ServiceError> {
        let existing = self.find_promotion(promotion_id).await?;
        let old_members = self.member_ids(promotion_id).await?;

        let title = input.title.unwrap_or_else(|| existing.title.clone());
        validate_title(&title)?;
        let discount = input.discount.unwrap_or(existing.discount);
        validate_discount(discount)?;
        let start_date = input.start_date.unwrap_or(existing.start_date);
        let end_date = input.end_date.unwrap_or(existing.end_date);
        validate_window(start_date, end_date)?;

        let new_members = match input.products {
            Some(products) => {
                let products = dedupe(&products);
                if products.is_empty() {
                    return Err(ServiceError::ValidationError(
                        "Promotion must include at least one product".to_string(),
                    ));
                }
                products
            }
            None => old_members.clone(),
        };
        let added: Vec<Uuid> = new_members
            .iter()
            .filter(|id| !old_members.contains(id))
            .copied()
            .collect();
        let removed: Vec<Uuid> = old_members
            .iter()
            .filter(|id| !new_members.contains(id))
            .copied()
            .collect();
        self.ensure_live_products(&added).await?;

        let was_active = existing.is_active;
        let now_active = input.is_active.unwrap_or(was_active);

        let txn = self.db.begin().await?;
        let mut active: promotion::ActiveModel = existing.into();
        active.title = Set(title.trim().to_string());
        if let Some(description) = input.description {
            active.description = Set(Some(description));
        }
        active.discount = Set(discount);
        active.start_date = Set(start_date);
        active.end_date = Set(end_date);
        active.is_active = Set(now_active);
        let updated = active.update(&txn).await?;

        if !removed.is_empty() {
            PromotionProduct::delete_many()
                .filter(promotion_product::Column::PromotionId.eq(promotion_id))
                .filter(promotion_product::Column::ProductId.is_in(removed.iter().copied()))
                .exec(&txn)
                .await?;
        }
        Self::insert_members(&txn, promotion_id, &added).await?;
        txn.commit().await?;

        match (was_active, now_active) {
            (true, false) => {
                let released = self.release_products(promotion_id, &old_members).await?;
                self.event_sender
                    .send_or_log(Event::PromotionReverted {
                        promotion_id,
                        products: released,
                    })
                    .await;
            }
            (false, true) => {
                let priced = self
                    .apply_discount(promotion_id, discount, &new_members)
                    .await?;
                self.event_sender
                    .send_or_log(Event::PromotionApplied {
                        promotion_id,
                        products: priced,
                    })
                    .await;
            }
            (true, true) => {
                self.release_products(promotion_id, &removed).await?;
                // Recomputed from each baseline, so unchanged members keep their price
                self.apply_discount(promotion_id, discount, &new_members)
                    .await?;
            }
            (false, false) => {}
        }

        info!(
            %promotion_id,
            added = added.len(),
            removed = removed.len(),
            is_active = now_active,
            "Updated promotion"
        );
        Ok(PromotionView {
            promotion: updated,
            products: new_members,
        })
    }

    /// Deletes a promotion; member prices are always reverted
    #[instrument(skip(self))]
    pub async fn delete_promotion(&self, promotion_id: Uuid) -> Result<(), ServiceError> {
        self.find_promotion(promotion_id).await?;
        let members = self.member_ids(promotion_id).await?;

        let txn = self.db.begin().await?;
        PromotionProduct::delete_many()
            .filter(promotion_product::Column::PromotionId.eq(promotion_id))
            .exec(&txn)
            .await?;
        Promotion::delete_by_id(promotion_id).exec(&txn).await?;
        txn.commit().await?;

        let released = self.release_products(promotion_id, &members).await?;
        self.event_sender
            .send_or_log(Event::PromotionReverted {
                promotion_id,
                products: released,
            })
            .await;

        info!(%promotion_id, "Deleted promotion");
        Ok(())
    }

    /// Deactivates every active promotion whose end date is at or before `now`.
    ///
    /// Each promotion is claimed with a conditional update, so one that was
    /// deactivated concurrently is skipped.
    #[instrument(skip(self))]
    pub async fn run_expiry_sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary, ServiceError> {
        let candidates = Promotion::find()
            .filter(promotion::Column::IsActive.eq(true))
            .filter(promotion::Column::EndDate.lte(now))
            .all(&*self.db)
            .await?;

        let mut summary = SweepSummary::default();
        for candidate in candidates {
            match self.expire_promotion(candidate.id, now).await {
                Ok(true) => summary.expired += 1,
                Ok(false) => debug!(promotion_id = %candidate.id, "Already deactivated"),
                Err(e) => {
                    summary.failed += 1;
                    warn!(promotion_id = %candidate.id, error = %e, "Failed to expire promotion");
                }
            }
        }

        if summary.expired > 0 || summary.failed > 0 {
            info!(
                expired = summary.expired,
                failed = summary.failed,
                "Promotion expiry sweep finished"
            );
            self.event_sender
                .send_or_log(Event::PromotionsExpired {
                    expired: summary.expired,
                    failed: summary.failed,
                    at: now,
                })
                .await;
        }
        Ok(summary)
    }

    async fn expire_promotion(
        &self,
        promotion_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let claimed = Promotion::update_many()
            .col_expr(promotion::Column::IsActive, Expr::value(false))
            .col_expr(promotion::Column::UpdatedAt, Expr::value(now))
            .filter(promotion::Column::Id.eq(promotion_id))
            .filter(promotion::Column::IsActive.eq(true))
            .exec(&*self.db)
            .await?;
        if claimed.rows_affected == 0 {
            return Ok(false);
        }

        let members = self.member_ids(promotion_id).await?;
        self.release_products(promotion_id, &members).await?;
        Ok(true)
    }

    /// Prices `product_ids` at `discount` off their baseline, capturing the
    /// baseline on first application. Deleted products are skipped.
    async fn apply_discount(
        &self,
        promotion_id: Uuid,
        discount: Decimal,
        product_ids: &[Uuid],
    ) -> Result<usize, ServiceError> {
        let products = self.catalog.find_live_many(product_ids).await?;
        let updates: Vec<PriceUpdate> = products
            .iter()
            .map(|p| {
                let base = p.base_price();
                PriceUpdate {
                    product_id: p.id,
                    price: discounted_price(base, discount),
                    original_price: Some(base),
                }
            })
            .collect();

        let failed = self.write_prices(promotion_id, &updates).await;
        Ok(updates.len() - failed)
    }

    /// Stops `promotion_id` from governing `product_ids`.
    ///
    /// Products still listed by another active promotion are re-priced with
    /// that promotion's discount; the rest get their baseline price back.
    async fn release_products(
        &self,
        promotion_id: Uuid,
        product_ids: &[Uuid],
    ) -> Result<usize, ServiceError> {
        if product_ids.is_empty() {
            return Ok(0);
        }
        let products = Product::find()
            .filter(product::Column::Id.is_in(product_ids.iter().copied()))
            .all(&*self.db)
            .await?;

        let mut repriced = Vec::new();
        let mut to_revert = Vec::new();
        for product in &products {
            match governing_promotion(&*self.db, product.id, Some(promotion_id)).await? {
                Some((other, discount)) if !product.deleted => {
                    debug!(product_id = %product.id, governing = %other, "Handing product to overlapping promotion");
                    let base = product.base_price();
                    repriced.push(PriceUpdate {
                        product_id: product.id,
                        price: discounted_price(base, discount),
                        original_price: Some(base),
                    });
                }
                _ => to_revert.push(product.id),
            }
        }

        let mut failed = self.write_prices(promotion_id, &repriced).await;
        if let Err(e) = self.catalog.revert_prices(&to_revert).await {
            warn!(%promotion_id, error = %e, "Bulk price revert failed; retrying per product");
            for product_id in &to_revert {
                if let Err(e) = self.catalog.revert_price(*product_id).await {
                    failed += 1;
                    warn!(%promotion_id, %product_id, error = %e, "Price revert failed");
                }
            }
        }

        Ok(products.len() - failed)
    }

    /// Bulk price write with per-product fallback; returns the failure count
    async fn write_prices(&self, promotion_id: Uuid, updates: &[PriceUpdate]) -> usize {
        match self.catalog.set_prices_bulk(updates).await {
            Ok(()) => 0,
            Err(e) => {
                warn!(%promotion_id, error = %e, "Bulk price update failed; retrying per product");
                let failed = self.catalog.set_prices_sequential(updates).await;
                if failed > 0 {
                    warn!(%promotion_id, failed, "Promotion prices partially applied");
                }
                failed
            }
        }
    }

    async fn find_promotion(&self, promotion_id: Uuid) -> Result<promotion::Model, ServiceError> {
        Promotion::find_by_id(promotion_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Promotion {} not found", promotion_id)))
    }

    async fn member_ids(&self, promotion_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        let mut ids: Vec<Uuid> = PromotionProduct::find()
            .filter(promotion_product::Column::PromotionId.eq(promotion_id))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|row| row.product_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn ensure_live_products(&self, product_ids: &[Uuid]) -> Result<(), ServiceError> {
        let found = self.catalog.find_live_many(product_ids).await?;
        if found.len() == product_ids.len() {
            return Ok(());
        }
        let missing: Vec<String> = product_ids
            .iter()
            .filter(|id| !found.iter().any(|p| p.id == **id))
            .map(Uuid::to_string)
            .collect();
        Err(ServiceError::ValidationError(format!(
            "Unknown or deleted products: {}",
            missing.join(", ")
        )))
    }

    async fn insert_members<C: ConnectionTrait>(
        conn: &C,
        promotion_id: Uuid,
        product_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        if product_ids.is_empty() {
            return Ok(());
        }
        let rows = product_ids.iter().map(|product_id| promotion_product::ActiveModel {
            promotion_id: Set(promotion_id),
            product_id: Set(*product_id),
        });
        PromotionProduct::insert_many(rows)
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }
}

/// Runs the expiry sweep on a fixed interval; the first pass runs immediately.
pub fn spawn_expiry_sweep(service: PromotionService, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = service.run_expiry_sweep(Utc::now()).await {
                error!(error = %e, "Promotion expiry sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::services::catalog::CreateProductInput;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    /// Aborts any price write to the product named `Locked`
    const LOCK_PRICE_TRIGGER: &str = "CREATE TRIGGER locked_price BEFORE UPDATE OF price ON products \
         WHEN OLD.name = 'Locked' BEGIN SELECT RAISE(ABORT, 'price is locked'); END;";

    async fn engine() -> (PromotionService, mpsc::Receiver<Event>) {
        let pool = establish_connection_with_config(&DbConfig::sqlite_memory())
            .await
            .expect("connect");
        run_migrations(&pool).await.expect("migrate");
        let db = Arc::new(pool);
        let (tx, rx) = mpsc::channel(16);
        let service = PromotionService::new(
            db.clone(),
            CatalogService::new(db),
            Arc::new(EventSender::new(tx)),
        );
        (service, rx)
    }

    async fn seed(service: &PromotionService, name: &str, price: Decimal) -> product::Model {
        service
            .catalog
            .create_product(CreateProductInput {
                name: name.to_string(),
                description: None,
                price,
                stock: 5,
                category_id: None,
                image: None,
            })
            .await
            .expect("seed product")
    }

    fn flash_sale(products: Vec<Uuid>) -> CreatePromotionInput {
        let now = Utc::now();
        CreatePromotionInput {
            title: "Flash sale".to_string(),
            description: None,
            discount: dec!(50),
            products,
            start_date: now - ChronoDuration::hours(1),
            end_date: now + ChronoDuration::days(1),
        }
    }

    async fn lock_prices(service: &PromotionService) {
        service
            .db
            .execute_unprepared(LOCK_PRICE_TRIGGER)
            .await
            .expect("install trigger");
    }

    #[tokio::test]
    async fn failed_bulk_apply_falls_back_per_product() {
        let (service, mut rx) = engine().await;
        let open = seed(&service, "Open", dec!(200)).await;
        let locked = seed(&service, "Locked", dec!(300)).await;
        lock_prices(&service).await;

        let created = service
            .create_promotion(flash_sale(vec![open.id, locked.id]))
            .await
            .expect("promotion is created despite one locked product");

        let open = service.catalog.get_product(open.id).await.unwrap();
        assert_eq!(open.price, dec!(100));
        assert_eq!(open.original_price, Some(dec!(200)));
        let locked = service.catalog.get_product(locked.id).await.unwrap();
        assert_eq!(locked.price, dec!(300));
        assert_eq!(locked.original_price, None);

        assert_eq!(
            rx.recv().await,
            Some(Event::PromotionApplied {
                promotion_id: created.promotion.id,
                products: 1,
            })
        );
    }

    #[tokio::test]
    async fn failed_bulk_revert_falls_back_per_product() {
        let (service, _rx) = engine().await;
        let open = seed(&service, "Open", dec!(200)).await;
        let locked = seed(&service, "Locked", dec!(300)).await;
        let promotion_id = service
            .create_promotion(flash_sale(vec![open.id, locked.id]))
            .await
            .unwrap()
            .promotion
            .id;
        lock_prices(&service).await;

        let released = service
            .release_products(promotion_id, &[open.id, locked.id])
            .await
            .unwrap();
        assert_eq!(released, 1);

        let open = service.catalog.get_product(open.id).await.unwrap();
        assert_eq!(open.price, dec!(200));
        assert_eq!(open.original_price, None);
        let locked = service.catalog.get_product(locked.id).await.unwrap();
        assert_eq!(locked.price, dec!(150));
        assert_eq!(locked.original_price, Some(dec!(300)));
    }
}
