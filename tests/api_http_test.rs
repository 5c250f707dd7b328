mod common;

use axum::http::{Method, StatusCode};
use common::{money, read_json, TestApp, CUSTOMER_ID};
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn health_reports_database_up() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = read_json(response).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"], "up");
}

#[tokio::test]
async fn product_writes_require_an_admin() {
    let app = TestApp::new().await;
    let payload = json!({ "name": "Foil heart", "price": "99.90", "stock": 12 });

    let anonymous = app
        .request(Method::POST, "/api/v1/products", Some(payload.clone()), None)
        .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let customer = app.customer_token();
    let forbidden = app
        .request(Method::POST, "/api/v1/products", Some(payload.clone()), Some(&customer))
        .await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let admin = app.admin_token();
    let created = app
        .request(Method::POST, "/api/v1/products", Some(payload), Some(&admin))
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let body = read_json(created).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["name"], "Foil heart");
    assert_eq!(money(&body["data"]["price"]), dec!(99.90));
    assert!(body["data"].get("deleted").is_none());
}

#[tokio::test]
async fn products_can_be_listed_fetched_and_soft_deleted() {
    let app = TestApp::new().await;
    let first = app.seed_product("Balloon", dec!(40), 100).await;
    app.seed_product("Ribbon", dec!(15), 100).await;
    let admin = app.admin_token();

    let listed = read_json(
        app.request(Method::GET, "/api/v1/products?page=1&per_page=10", None, None)
            .await,
    )
    .await;
    assert_eq!(listed["data"]["total"], 2);
    assert_eq!(listed["data"]["items"].as_array().unwrap().len(), 2);

    let uri = format!("/api/v1/products/{}", first.id);
    let fetched = app.request(Method::GET, &uri, None, None).await;
    assert_eq!(fetched.status(), StatusCode::OK);

    let deleted = app.request(Method::DELETE, &uri, None, Some(&admin)).await;
    assert_eq!(deleted.status(), StatusCode::OK);
    let gone = app.request(Method::GET, &uri, None, None).await;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);

    let listed = read_json(app.request(Method::GET, "/api/v1/products", None, None).await).await;
    assert_eq!(listed["data"]["total"], 1);
    assert!(app.product(first.id).await.deleted);
}

#[tokio::test]
async fn checkout_over_http_returns_order_and_payment_link() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(120), 5).await;
    let token = app.customer_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "orderItems": [{ "product": product.id, "amount": 2 }],
                "shippingAddress": {
                    "fullName": "Olena Test",
                    "phone": "+380501234567",
                    "city": "Kyiv",
                    "street": "Khreshchatyk 1"
                },
                "deliveryMethod": "courier",
                "paymentMethod": "gateway",
                "notes": "Ring twice"
            })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = read_json(response).await;
    let data = &body["data"];
    assert!(data["paymentLink"]
        .as_str()
        .unwrap()
        .starts_with("https://www.liqpay.ua/api/3/checkout?"));
    assert!(data["message"].as_str().is_some());
    assert_eq!(data["order"]["userId"], CUSTOMER_ID);
    assert_eq!(data["order"]["deliveryMethod"], "courier");
    assert_eq!(data["order"]["paymentMethod"], "gateway");
    assert_eq!(data["order"]["status"], "Pending");
    assert_eq!(money(&data["order"]["subtotal"]), dec!(240));
    assert_eq!(money(&data["order"]["deliveryFee"]), dec!(100));
    assert_eq!(money(&data["order"]["totalPrice"]), dec!(340));
    assert_eq!(data["order"]["orderItems"][0]["product"], product.id.to_string());
    assert_eq!(app.product(product.id).await.stock, 3);
}

#[tokio::test]
async fn checkout_errors_map_to_statuses() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(120), 1).await;
    let token = app.customer_token();
    let order = |amount: i32| {
        json!({
            "orderItems": [{ "product": product.id, "amount": amount }],
            "shippingAddress": { "fullName": "A", "phone": "1", "city": "Kyiv" },
            "deliveryMethod": "pickup",
            "paymentMethod": "cashOnDelivery"
        })
    };

    let unauthenticated = app
        .request(Method::POST, "/api/v1/orders", Some(order(1)), None)
        .await;
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let short = app
        .request(Method::POST, "/api/v1/orders", Some(order(5)), Some(&token))
        .await;
    assert_eq!(short.status(), StatusCode::CONFLICT);
    let body = read_json(short).await;
    assert!(body["message"].as_str().unwrap().contains("Balloon"));

    let bad_method = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "orderItems": [{ "product": product.id, "amount": 1 }],
                "shippingAddress": { "fullName": "A", "phone": "1", "city": "Kyiv" },
                "deliveryMethod": "teleport",
                "paymentMethod": "cashOnDelivery"
            })),
            Some(&token),
        )
        .await;
    assert_eq!(bad_method.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.product(product.id).await.stock, 1);
}

#[tokio::test]
async fn admin_moves_orders_through_statuses() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(120), 5).await;
    let order_id = app
        .place_order(
            &[(product.id, 2)],
            storefront_api::entities::order::PaymentMethod::CashOnDelivery,
        )
        .await
        .order
        .order
        .id;
    let uri = format!("/api/v1/orders/{}/status", order_id);

    let customer = app.customer_token();
    let denied = app
        .request(Method::PUT, &uri, Some(json!({ "status": "Shipped" })), Some(&customer))
        .await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let admin = app.admin_token();
    let shipped = app
        .request(Method::PUT, &uri, Some(json!({ "status": "Shipped" })), Some(&admin))
        .await;
    assert_eq!(shipped.status(), StatusCode::OK);
    assert_eq!(read_json(shipped).await["data"]["status"], "Shipped");

    let cancelled = app
        .request(Method::PUT, &uri, Some(json!({ "status": "Cancelled" })), Some(&admin))
        .await;
    assert_eq!(cancelled.status(), StatusCode::OK);
    assert_eq!(app.product(product.id).await.stock, 5);

    let reopened = app
        .request(Method::PUT, &uri, Some(json!({ "status": "Pending" })), Some(&admin))
        .await;
    assert_eq!(reopened.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn customers_see_only_their_orders() {
    let app = TestApp::new().await;
    let product = app.seed_product("Balloon", dec!(120), 5).await;
    let order_id = app
        .place_order(
            &[(product.id, 1)],
            storefront_api::entities::order::PaymentMethod::CashOnDelivery,
        )
        .await
        .order
        .order
        .id;
    let uri = format!("/api/v1/orders/{}", order_id);

    let owner = app.customer_token();
    let own = app.request(Method::GET, &uri, None, Some(&owner)).await;
    assert_eq!(own.status(), StatusCode::OK);

    let other = app.token_for("customer-2", &[]);
    let hidden = app.request(Method::GET, &uri, None, Some(&other)).await;
    assert_eq!(hidden.status(), StatusCode::NOT_FOUND);

    let listed = read_json(
        app.request(Method::GET, "/api/v1/orders", None, Some(&other))
            .await,
    )
    .await;
    assert_eq!(listed["data"]["total"], 0);
}

#[tokio::test]
async fn promotions_over_http_reprice_products() {
    let app = TestApp::new().await;
    let product = app.seed_product("Bouquet", dec!(500), 5).await;
    let admin = app.admin_token();
    let now = chrono::Utc::now();

    let created = app
        .request(
            Method::POST,
            "/api/v1/promotions",
            Some(json!({
                "title": "Spring sale",
                "discount": 20,
                "products": [product.id],
                "startDate": now,
                "endDate": now + chrono::Duration::days(3)
            })),
            Some(&admin),
        )
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let body = read_json(created).await;
    let promotion_id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["isActive"], true);
    assert_eq!(body["data"]["products"][0], product.id.to_string());

    let fetched = read_json(
        app.request(Method::GET, &format!("/api/v1/products/{}", product.id), None, None)
            .await,
    )
    .await;
    assert_eq!(money(&fetched["data"]["price"]), dec!(400));
    assert_eq!(money(&fetched["data"]["originalPrice"]), dec!(500));

    let active = read_json(
        app.request(Method::GET, "/api/v1/promotions?active=true", None, None)
            .await,
    )
    .await;
    assert_eq!(active["data"].as_array().unwrap().len(), 1);

    let uri = format!("/api/v1/promotions/{}", promotion_id);
    let toggled = app
        .request(Method::PUT, &uri, Some(json!({ "isActive": false })), Some(&admin))
        .await;
    assert_eq!(toggled.status(), StatusCode::OK);
    assert_eq!(app.product(product.id).await.price, dec!(500));

    let deleted = app.request(Method::DELETE, &uri, None, Some(&admin)).await;
    assert_eq!(deleted.status(), StatusCode::OK);
    let missing = app.request(Method::GET, &uri, None, None).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
