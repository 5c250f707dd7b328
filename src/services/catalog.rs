use crate::{
    entities::product::{self, Entity as Product},
    errors::ServiceError,
    services::{
        pricing::{discounted_price, round_money, validate_price},
        promotions::governing_promotion,
    },
};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, Func, SimpleExpr},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const DEFAULT_PER_PAGE: u64 = 20;
const MAX_PER_PAGE: u64 = 100;

/// A computed price change for one product
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceUpdate {
    pub product_id: Uuid,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductInput {
    #[validate(length(min = 1, max = 255, message = "Product name must be between 1 and 255 characters"))]
    pub name: String,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    pub price: Decimal,
    #[validate(range(min = 0, message = "Stock must not be negative"))]
    pub stock: i32,
    pub category_id: Option<Uuid>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProductInput {
    #[validate(length(min = 1, max = 255, message = "Product name must be between 1 and 255 characters"))]
    pub name: Option<String>,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    /// Undiscounted price; re-derives the sale price while a promotion applies
    pub price: Option<Decimal>,
    #[validate(range(min = 0, message = "Stock must not be negative"))]
    pub stock: Option<i32>,
    pub category_id: Option<Uuid>,
    pub image: Option<String>,
}

/// Catalog store: product reads and the atomic stock and price primitives.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Fetches a live (non-deleted) product
    #[instrument(skip(self))]
    pub async fn get_product(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        self.find_live(product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    pub(crate) async fn find_live(
        &self,
        product_id: Uuid,
    ) -> Result<Option<product::Model>, ServiceError> {
        Ok(Product::find_by_id(product_id)
            .filter(product::Column::Deleted.eq(false))
            .one(&*self.db)
            .await?)
    }

    pub(crate) async fn find_live_many(
        &self,
        product_ids: &[Uuid],
    ) -> Result<Vec<product::Model>, ServiceError> {
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(Product::find()
            .filter(product::Column::Id.is_in(product_ids.iter().copied()))
            .filter(product::Column::Deleted.eq(false))
            .all(&*self.db)
            .await?)
    }

    /// Atomically takes `qty` units off the product's stock.
    ///
    /// Single conditional update: succeeds only while `stock >= qty`, so
    /// concurrent reservations can never oversubscribe a product.
    #[instrument(skip(self))]
    pub async fn decrement_stock(&self, product_id: Uuid, qty: i32) -> Result<(), ServiceError> {
        let result = Product::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(qty),
            )
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Deleted.eq(false))
            .filter(product::Column::Stock.gte(qty))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 1 {
            debug!(%product_id, qty, "Stock decremented");
            return Ok(());
        }

        match self.find_live(product_id).await? {
            None => Err(ServiceError::ProductNotFound(format!(
                "Product {} not found",
                product_id
            ))),
            Some(product) => Err(ServiceError::InsufficientStock(format!(
                "{} (product {}): requested {}, available {}",
                product.name, product_id, qty, product.stock
            ))),
        }
    }

    /// Atomically returns `qty` units to the product's stock.
    ///
    /// Soft-deleted products still take restored stock.
    #[instrument(skip(self))]
    pub async fn increment_stock(&self, product_id: Uuid, qty: i32) -> Result<(), ServiceError> {
        let result = Product::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(qty),
            )
            .filter(product::Column::Id.eq(product_id))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ProductNotFound(format!(
                "Product {} not found",
                product_id
            )));
        }
        debug!(%product_id, qty, "Stock incremented");
        Ok(())
    }

    /// Writes the sale price and its pre-promotion baseline.
    #[instrument(skip(self))]
    pub async fn set_price(
        &self,
        product_id: Uuid,
        price: Decimal,
        original_price: Option<Decimal>,
    ) -> Result<(), ServiceError> {
        let update = PriceUpdate {
            product_id,
            price,
            original_price,
        };
        let rows = apply_price_update(&*self.db, &update).await?;
        if rows == 0 {
            return Err(ServiceError::ProductNotFound(format!(
                "Product {} not found",
                product_id
            )));
        }
        Ok(())
    }

    /// Writes a batch of price changes in one transaction.
    pub async fn set_prices_bulk(&self, updates: &[PriceUpdate]) -> Result<(), ServiceError> {
        if updates.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin().await?;
        for update in updates {
            apply_price_update(&txn, update).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Restores `price` from `original_price` and clears the baseline.
    ///
    /// No-op for products that carry no baseline.
    #[instrument(skip(self))]
    pub async fn revert_price(&self, product_id: Uuid) -> Result<(), ServiceError> {
        self.revert_prices(&[product_id]).await.map(|_| ())
    }

    /// Bulk form of [`Self::revert_price`]; returns the number of products reverted.
    pub async fn revert_prices(&self, product_ids: &[Uuid]) -> Result<u64, ServiceError> {
        if product_ids.is_empty() {
            return Ok(0);
        }
        let result = Product::update_many()
            .col_expr(
                product::Column::Price,
                SimpleExpr::from(Func::coalesce([
                    SimpleExpr::from(Expr::col(product::Column::OriginalPrice)),
                    SimpleExpr::from(Expr::col(product::Column::Price)),
                ])),
            )
            .col_expr(
                product::Column::OriginalPrice,
                Expr::value(Option::<Decimal>::None),
            )
            .col_expr(
                product::Column::UpdatedAt,
                Expr::value(chrono::Utc::now()),
            )
            .filter(product::Column::Id.is_in(product_ids.iter().copied()))
            .filter(product::Column::OriginalPrice.is_not_null())
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Lists live products, newest first
    #[instrument(skip(self))]
    pub async fn list_products(
        &self,
        page: u64,
        per_page: u64,
        category_id: Option<Uuid>,
    ) -> Result<(Vec<product::Model>, u64), ServiceError> {
        let per_page = match per_page {
            0 => DEFAULT_PER_PAGE,
            n => n.min(MAX_PER_PAGE),
        };
        let mut query = Product::find().filter(product::Column::Deleted.eq(false));
        if let Some(category_id) = category_id {
            query = query.filter(product::Column::CategoryId.eq(category_id));
        }

        let paginator = query
            .order_by_desc(product::Column::CreatedAt)
            .order_by_asc(product::Column::Id)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let products = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((products, total))
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_product(
        &self,
        input: CreateProductInput,
    ) -> Result<product::Model, ServiceError> {
        input.validate()?;
        validate_price(input.price)?;

        let product = product::ActiveModel {
            name: Set(input.name),
            description: Set(input.description),
            price: Set(round_money(input.price)),
            original_price: Set(None),
            stock: Set(input.stock),
            category_id: Set(input.category_id),
            image: Set(input.image),
            deleted: Set(false),
            ..Default::default()
        }
        .insert(&*self.db)
        .await?;

        info!(product_id = %product.id, "Created product");
        Ok(product)
    }

    /// Updates catalog fields.
    ///
    /// A price edit on a discounted product moves the baseline and re-derives
    /// the sale price from the promotion that governs it.
    #[instrument(skip(self, input))]
    pub async fn update_product(
        &self,
        product_id: Uuid,
        input: UpdateProductInput,
    ) -> Result<product::Model, ServiceError> {
        input.validate()?;
        let product = self.get_product(product_id).await?;
        let mut active: product::ActiveModel = product.into();

        if let Some(name) = input.name {
            active.name = Set(name);
        }
        if let Some(description) = input.description {
            active.description = Set(Some(description));
        }
        if let Some(stock) = input.stock {
            active.stock = Set(stock);
        }
        if let Some(category_id) = input.category_id {
            active.category_id = Set(Some(category_id));
        }
        if let Some(image) = input.image {
            active.image = Set(Some(image));
        }
        if let Some(price) = input.price {
            validate_price(price)?;
            let base = round_money(price);
            match governing_promotion(&*self.db, product_id, None).await? {
                Some((promotion_id, discount)) => {
                    debug!(%product_id, %promotion_id, "Re-deriving discounted price");
                    active.original_price = Set(Some(base));
                    active.price = Set(discounted_price(base, discount));
                }
                None => {
                    active.original_price = Set(None);
                    active.price = Set(base);
                }
            }
        }

        let product = active.update(&*self.db).await?;
        info!(%product_id, "Updated product");
        Ok(product)
    }

    /// Soft delete; the row stays for order history
    #[instrument(skip(self))]
    pub async fn delete_product(&self, product_id: Uuid) -> Result<(), ServiceError> {
        let product = self.get_product(product_id).await?;
        let mut active: product::ActiveModel = product.into();
        active.deleted = Set(true);
        active.update(&*self.db).await?;

        info!(%product_id, "Soft-deleted product");
        Ok(())
    }

    /// Per-product fallback for a failed bulk price write.
    ///
    /// Returns the number of products that could not be updated.
    pub(crate) async fn set_prices_sequential(&self, updates: &[PriceUpdate]) -> usize {
        let mut failed = 0;
        for update in updates {
            if let Err(e) = self
                .set_price(update.product_id, update.price, update.original_price)
                .await
            {
                failed += 1;
                warn!(product_id = %update.product_id, error = %e, "Price update failed");
            }
        }
        failed
    }
}

async fn apply_price_update<C: ConnectionTrait>(
    conn: &C,
    update: &PriceUpdate,
) -> Result<u64, ServiceError> {
    let result = Product::update_many()
        .col_expr(product::Column::Price, Expr::value(update.price))
        .col_expr(
            product::Column::OriginalPrice,
            Expr::value(update.original_price),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(product::Column::Id.eq(update.product_id))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}
