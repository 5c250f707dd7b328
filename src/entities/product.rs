use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog product.
///
/// `original_price` is only present while a promotion discount is applied;
/// it holds the undiscounted price that `price` is derived from.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    pub description: Option<String>,

    /// Current selling price
    pub price: Decimal,

    /// Pre-promotion price, set only while discounted
    pub original_price: Option<Decimal>,

    /// Units available for sale
    pub stock: i32,

    pub category_id: Option<Uuid>,

    pub image: Option<String>,

    /// Soft-delete marker
    #[serde(default, skip_serializing)]
    pub deleted: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Undiscounted price: `original_price` while a promotion applies, else `price`
    pub fn base_price(&self) -> Decimal {
        self.original_price.unwrap_or(self.price)
    }

    pub fn is_discounted(&self) -> bool {
        self.original_price.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::promotion_product::Entity")]
    PromotionProduct,
}

impl Related<super::promotion_product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PromotionProduct.def()
    }
}

impl Related<super::promotion::Entity> for Entity {
    fn to() -> RelationDef {
        super::promotion_product::Relation::Promotion.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::promotion_product::Relation::Product.def().rev())
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.id {
                active_model.id = Set(Uuid::new_v4());
            }
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }
        active_model.updated_at = Set(now);

        Ok(active_model)
    }
}
