#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use sea_orm::EntityTrait;
use serde_json::{json, Value};
use storefront_api::{
    auth::{AuthUser, ADMIN_ROLE},
    config::AppConfig,
    db::{self, DbConfig},
    entities::{order, product},
    events::{self, EventSender},
    services::{
        catalog::CreateProductInput,
        orders::{CartLine, CreateOrderInput, CreatedOrder},
        payment_gateway::CallbackPayload,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const GATEWAY_PUBLIC_KEY: &str = "sandbox_public_key";
pub const GATEWAY_PRIVATE_KEY: &str = "sandbox_private_key";
pub const PUBLIC_BASE_URL: &str = "http://shop.test";
pub const CUSTOMER_ID: &str = "customer-1";
pub const ADMIN_ID: &str = "admin-1";

/// Helper harness for spinning up an application state backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Fresh database, gateway configured, cancelled orders stay cancelled.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            TEST_JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            PUBLIC_BASE_URL.to_string(),
            "test".to_string(),
        );
        cfg.gateway_public_key = Some(GATEWAY_PUBLIC_KEY.to_string());
        cfg.gateway_private_key = Some(GATEWAY_PRIVATE_KEY.to_string());
        customize(&mut cfg);

        let pool = db::establish_connection_with_config(&DbConfig::sqlite_memory())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));
        let state = AppState::new(Arc::new(pool), cfg, EventSender::new(event_tx));
        let router = storefront_api::app_router(state.clone());

        Self {
            router,
            state,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, sub: &str, roles: &[&str]) -> String {
        self.state
            .jwt
            .issue(sub, roles, chrono::Duration::hours(1))
            .expect("issue test token")
    }

    pub fn admin_token(&self) -> String {
        self.token_for(ADMIN_ID, &[ADMIN_ROLE])
    }

    pub fn customer_token(&self) -> String {
        self.token_for(CUSTOMER_ID, &[])
    }

    pub fn admin(&self) -> AuthUser {
        AuthUser {
            user_id: ADMIN_ID.to_string(),
            roles: vec![ADMIN_ROLE.to_string()],
        }
    }

    pub fn customer(&self) -> AuthUser {
        AuthUser {
            user_id: CUSTOMER_ID.to_string(),
            roles: Vec::new(),
        }
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).expect("build request")).await
    }

    pub async fn send(&self, request: Request<Body>) -> axum::response::Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        self.state
            .services
            .catalog
            .create_product(CreateProductInput {
                name: name.to_string(),
                description: None,
                price,
                stock,
                category_id: None,
                image: Some(format!("/images/{}.png", name.to_lowercase())),
            })
            .await
            .expect("seed product")
    }

    /// Reads a product row, soft-deleted ones included
    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query product")
            .expect("product exists")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn place_order(
        &self,
        lines: &[(Uuid, i32)],
        payment_method: order::PaymentMethod,
    ) -> CreatedOrder {
        self.state
            .services
            .orders
            .create_order(CUSTOMER_ID, order_input(lines, payment_method))
            .await
            .expect("place order")
    }

    /// Signs `payload` with the test gateway keys, as the gateway would
    pub fn signed_callback(&self, payload: &Value) -> (String, String) {
        let data = STANDARD.encode(serde_json::to_vec(payload).expect("serialize payload"));
        let signature = self
            .state
            .services
            .orders
            .gateway()
            .expect("gateway configured")
            .sign(&data);
        (data, signature)
    }
}

pub fn order_input(lines: &[(Uuid, i32)], payment_method: order::PaymentMethod) -> CreateOrderInput {
    CreateOrderInput {
        order_items: lines
            .iter()
            .map(|(product, amount)| CartLine {
                product: *product,
                amount: *amount,
            })
            .collect(),
        shipping_address: serde_json::from_value(json!({
            "fullName": "Olena Test",
            "phone": "+380501234567",
            "city": "Kyiv",
            "street": "Khreshchatyk 1"
        }))
        .expect("valid address"),
        delivery_method: order::DeliveryMethod::Pickup,
        payment_method,
        notes: None,
    }
}

pub fn callback_payload(order_id: Uuid, status: &str) -> CallbackPayload {
    let raw = json!({ "order_id": order_id.to_string(), "status": status });
    CallbackPayload {
        order_id: order_id.to_string(),
        status: status.to_string(),
        amount: None,
        raw,
    }
}

pub async fn read_json(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn read_text(response: axum::response::Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

/// Parses a money field that may be serialized as a string or a number
pub fn money(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a money value: {other}"),
    }
}
