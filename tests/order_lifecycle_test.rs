mod common;

use assert_matches::assert_matches;
use common::{callback_payload, order_input, TestApp, CUSTOMER_ID};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::{
    entities::order::{DeliveryMethod, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
};
use uuid::Uuid;

#[tokio::test]
async fn cash_order_reserves_stock_and_snapshots_lines() {
    let app = TestApp::new().await;
    let balloon = app.seed_product("Balloon", dec!(120), 10).await;
    let garland = app.seed_product("Garland", dec!(350), 4).await;

    let created = app
        .place_order(
            &[(balloon.id, 3), (garland.id, 1)],
            PaymentMethod::CashOnDelivery,
        )
        .await;

    assert!(created.payment_link.is_none());
    let order = &created.order.order;
    assert_eq!(order.user_id, CUSTOMER_ID);
    assert_eq!(order.subtotal, dec!(710));
    assert_eq!(order.delivery_fee, dec!(0));
    assert_eq!(order.total_price, dec!(710));
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert!(order.stock_reserved);

    assert_eq!(created.order.order_items.len(), 2);
    let line = created
        .order
        .order_items
        .iter()
        .find(|item| item.product_id == balloon.id)
        .expect("balloon line");
    assert_eq!(line.name, "Balloon");
    assert_eq!(line.price, dec!(120));
    assert_eq!(line.amount, 3);

    assert_eq!(app.product(balloon.id).await.stock, 7);
    assert_eq!(app.product(garland.id).await.stock, 3);
}

#[tokio::test]
async fn gateway_order_returns_signed_checkout_link() {
    let app = TestApp::new().await;
    let product = app.seed_product("Foil star", dec!(80), 5).await;

    let created = app
        .place_order(&[(product.id, 2)], PaymentMethod::Gateway)
        .await;

    let link = created.payment_link.expect("payment link");
    let url = url::Url::parse(&link).expect("valid url");
    let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
    assert!(params.contains_key("data"));
    assert!(params.contains_key("signature"));
}

#[tokio::test]
async fn courier_delivery_fee_depends_on_subtotal() {
    let app = TestApp::new().await;
    let cheap = app.seed_product("Confetti", dec!(200), 50).await;
    let pricey = app.seed_product("Arch kit", dec!(1200), 5).await;

    let mut input = order_input(&[(cheap.id, 1)], PaymentMethod::CashOnDelivery);
    input.delivery_method = DeliveryMethod::Courier;
    let small = app
        .state
        .services
        .orders
        .create_order(CUSTOMER_ID, input)
        .await
        .unwrap();
    assert_eq!(small.order.order.delivery_fee, dec!(100));
    assert_eq!(small.order.order.total_price, dec!(300));

    let mut input = order_input(&[(pricey.id, 1)], PaymentMethod::CashOnDelivery);
    input.delivery_method = DeliveryMethod::Courier;
    let large = app
        .state
        .services
        .orders
        .create_order(CUSTOMER_ID, input)
        .await
        .unwrap();
    assert_eq!(large.order.order.delivery_fee, dec!(0));
    assert_eq!(large.order.order.total_price, dec!(1200));
}

#[tokio::test]
async fn carrier_delivery_passes_quoted_fee_through() {
    let app = TestApp::new().await;
    let product = app.seed_product("Helium tank", dec!(900), 2).await;

    let mut input = order_input(&[(product.id, 1)], PaymentMethod::CashOnDelivery);
    input.delivery_method = DeliveryMethod::NovaPoshta;
    input.shipping_address = serde_json::from_value(json!({
        "fullName": "Olena Test",
        "phone": "+380501234567",
        "city": "Lviv",
        "warehouse": "Branch 12",
        "deliveryFee": "75.50"
    }))
    .unwrap();

    let created = app
        .state
        .services
        .orders
        .create_order(CUSTOMER_ID, input)
        .await
        .unwrap();
    assert_eq!(created.order.order.delivery_fee, dec!(75.50));
    assert_eq!(created.order.order.total_price, dec!(975.50));
}

#[tokio::test]
async fn invalid_carts_are_rejected_before_stock_moves() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(100), 2).await;
    let orders = &app.state.services.orders;

    let empty = orders
        .create_order(CUSTOMER_ID, order_input(&[], PaymentMethod::CashOnDelivery))
        .await;
    assert_matches!(empty, Err(ServiceError::ValidationError(_)));

    let zero = orders
        .create_order(
            CUSTOMER_ID,
            order_input(&[(product.id, 1), (product.id, 0)], PaymentMethod::CashOnDelivery),
        )
        .await;
    assert_matches!(zero, Err(ServiceError::ValidationError(msg)) if msg.contains("Line 1"));

    let unknown = orders
        .create_order(
            CUSTOMER_ID,
            order_input(&[(Uuid::new_v4(), 1)], PaymentMethod::CashOnDelivery),
        )
        .await;
    assert_matches!(unknown, Err(ServiceError::ProductNotFound(_)));

    let too_many = orders
        .create_order(
            CUSTOMER_ID,
            order_input(&[(product.id, 3)], PaymentMethod::CashOnDelivery),
        )
        .await;
    assert_matches!(too_many, Err(ServiceError::InsufficientStock(msg)) if msg.contains("Balloon"));

    assert_eq!(app.product(product.id).await.stock, 2);
}

#[tokio::test]
async fn failed_reservation_hands_back_earlier_lines() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(100), 3).await;

    // Each line fits on its own, together they do not
    let result = app
        .state
        .services
        .orders
        .create_order(
            CUSTOMER_ID,
            order_input(&[(product.id, 2), (product.id, 2)], PaymentMethod::CashOnDelivery),
        )
        .await;

    assert_matches!(result, Err(ServiceError::InsufficientStock(msg)) if msg.starts_with("Line 1"));
    assert_eq!(app.product(product.id).await.stock, 3);
}

#[tokio::test]
async fn deleted_products_cannot_be_ordered() {
    let app = TestApp::new().await;
    let product = app.seed_product("Retired", dec!(100), 3).await;
    app.state
        .services
        .catalog
        .delete_product(product.id)
        .await
        .unwrap();

    let result = app
        .state
        .services
        .orders
        .create_order(
            CUSTOMER_ID,
            order_input(&[(product.id, 1)], PaymentMethod::CashOnDelivery),
        )
        .await;
    assert_matches!(result, Err(ServiceError::ProductNotFound(_)));
}

#[tokio::test]
async fn gateway_checkout_needs_configured_keys() {
    let app = TestApp::with_config(|cfg| {
        cfg.gateway_public_key = None;
        cfg.gateway_private_key = None;
    })
    .await;
    let product = app.seed_product("Balloon", dec!(100), 3).await;

    let result = app
        .state
        .services
        .orders
        .create_order(
            CUSTOMER_ID,
            order_input(&[(product.id, 1)], PaymentMethod::Gateway),
        )
        .await;
    assert_matches!(result, Err(ServiceError::ServiceUnavailable(_)));
    assert_eq!(app.product(product.id).await.stock, 3);

    // Cash on delivery still works
    app.place_order(&[(product.id, 1)], PaymentMethod::CashOnDelivery)
        .await;
    assert_eq!(app.product(product.id).await.stock, 2);
}

#[tokio::test]
async fn cancellation_restores_stock_exactly_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(100), 10).await;
    let created = app
        .place_order(&[(product.id, 4)], PaymentMethod::Gateway)
        .await;
    let order_id = created.order.order.id;
    assert_eq!(app.product(product.id).await.stock, 6);

    let orders = &app.state.services.orders;
    let cancelled = orders
        .update_status(order_id, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(!cancelled.stock_reserved);
    assert_eq!(app.product(product.id).await.stock, 10);

    // Repeat cancel and a late failure callback must not restore again
    orders
        .update_status(order_id, OrderStatus::Cancelled)
        .await
        .unwrap();
    orders
        .apply_payment_callback(&callback_payload(order_id, "failure"))
        .await
        .unwrap();
    assert_eq!(app.product(product.id).await.stock, 10);
    assert_eq!(app.order(order_id).await.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn cancelling_after_payment_failure_does_not_double_restore() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(100), 5).await;
    let order_id = app
        .place_order(&[(product.id, 2)], PaymentMethod::Gateway)
        .await
        .order
        .order
        .id;

    let orders = &app.state.services.orders;
    orders
        .apply_payment_callback(&callback_payload(order_id, "failure"))
        .await
        .unwrap();
    assert_eq!(app.product(product.id).await.stock, 5);

    orders
        .update_status(order_id, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(app.product(product.id).await.stock, 5);
}

#[tokio::test]
async fn cancelled_orders_stay_cancelled_by_default() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(100), 5).await;
    let order_id = app
        .place_order(&[(product.id, 2)], PaymentMethod::CashOnDelivery)
        .await
        .order
        .order
        .id;

    let orders = &app.state.services.orders;
    orders
        .update_status(order_id, OrderStatus::Cancelled)
        .await
        .unwrap();
    let reopened = orders.update_status(order_id, OrderStatus::Processing).await;

    assert_matches!(reopened, Err(ServiceError::InvalidOperation(_)));
    assert_eq!(app.order(order_id).await.status, OrderStatus::Cancelled);
    assert_eq!(app.product(product.id).await.stock, 5);
}

#[tokio::test]
async fn reopening_reserves_stock_again_when_enabled() {
    let app = TestApp::with_config(|cfg| cfg.allow_reopen_cancelled_orders = true).await;
    let product = app.seed_product("Balloon", dec!(100), 5).await;
    let order_id = app
        .place_order(&[(product.id, 2)], PaymentMethod::CashOnDelivery)
        .await
        .order
        .order
        .id;

    let orders = &app.state.services.orders;
    orders
        .update_status(order_id, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(app.product(product.id).await.stock, 5);

    let reopened = orders
        .update_status(order_id, OrderStatus::Processing)
        .await
        .unwrap();
    assert_eq!(reopened.status, OrderStatus::Processing);
    assert!(reopened.stock_reserved);
    assert_eq!(app.product(product.id).await.stock, 3);

    orders
        .update_status(order_id, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(app.product(product.id).await.stock, 5);
}

#[tokio::test]
async fn reopening_fails_cleanly_when_stock_is_gone() {
    let app = TestApp::with_config(|cfg| cfg.allow_reopen_cancelled_orders = true).await;
    let product = app.seed_product("Balloon", dec!(100), 2).await;
    let first = app
        .place_order(&[(product.id, 2)], PaymentMethod::CashOnDelivery)
        .await
        .order
        .order
        .id;

    let orders = &app.state.services.orders;
    orders
        .update_status(first, OrderStatus::Cancelled)
        .await
        .unwrap();
    app.place_order(&[(product.id, 2)], PaymentMethod::CashOnDelivery)
        .await;

    let reopened = orders.update_status(first, OrderStatus::Processing).await;
    assert_matches!(reopened, Err(ServiceError::InsufficientStock(_)));
    assert_eq!(app.order(first).await.status, OrderStatus::Cancelled);
    assert_eq!(app.product(product.id).await.stock, 0);
}

#[tokio::test]
async fn orders_are_visible_to_owner_and_admin_only() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(100), 5).await;
    let order_id = app
        .place_order(&[(product.id, 1)], PaymentMethod::CashOnDelivery)
        .await
        .order
        .order
        .id;
    let orders = &app.state.services.orders;

    let own = orders.get_order(order_id, &app.customer()).await.unwrap();
    assert_eq!(own.order_items.len(), 1);
    orders.get_order(order_id, &app.admin()).await.unwrap();

    let stranger = storefront_api::auth::AuthUser {
        user_id: "someone-else".to_string(),
        roles: Vec::new(),
    };
    assert_matches!(
        orders.get_order(order_id, &stranger).await,
        Err(ServiceError::NotFound(_))
    );
    let (listed, total) = orders.list_orders(&stranger, 1, 20).await.unwrap();
    assert!(listed.is_empty());
    assert_eq!(total, 0);

    let (listed, total) = orders.list_orders(&app.admin(), 1, 20).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(listed[0].order_items.len(), 1);
}
