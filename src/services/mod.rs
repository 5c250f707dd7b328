// Catalog store and money rules
pub mod catalog;
pub mod pricing;

// Promotion engine
pub mod promotions;

// Checkout, payment and order lifecycle
pub mod orders;
pub mod payment_gateway;

pub use catalog::CatalogService;
pub use orders::OrderService;
pub use payment_gateway::PaymentGateway;
pub use promotions::PromotionService;
