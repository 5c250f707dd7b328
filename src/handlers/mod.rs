pub mod common;
pub mod health;
pub mod orders;
pub mod payments;
pub mod products;
pub mod promotions;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        pricing::DeliveryPolicy, CatalogService, OrderService, PaymentGateway, PromotionService,
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: CatalogService,
    pub promotions: PromotionService,
    pub orders: OrderService,
}

impl AppServices {
    /// Wires every service over one pool and event channel.
    ///
    /// The payment gateway is only configured when both keys are present;
    /// without it gateway-paid checkout and callbacks answer 503.
    pub fn new(db_pool: Arc<DbPool>, config: &AppConfig, event_sender: Arc<EventSender>) -> Self {
        let catalog = CatalogService::new(db_pool.clone());
        let promotions =
            PromotionService::new(db_pool.clone(), catalog.clone(), event_sender.clone());
        let gateway = PaymentGateway::from_config(config).map(Arc::new);
        let orders = OrderService::new(
            db_pool,
            catalog.clone(),
            gateway,
            DeliveryPolicy::from(config),
            event_sender,
        )
        .with_reopen_cancelled(config.allow_reopen_cancelled_orders);

        Self {
            catalog,
            promotions,
            orders,
        }
    }
}
