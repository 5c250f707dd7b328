pub mod order;
pub mod order_item;
pub mod product;
pub mod promotion;
pub mod promotion_product;
