//! Redirect-based card gateway: signed checkout requests and callback verification.
//!
//! Both directions use the same scheme: `data` is base64 of a JSON document and
//! `signature = base64(sha1(private_key + data + private_key))`.

use crate::{
    config::{AppConfig, GatewayCredentials},
    errors::ServiceError,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::debug;
use url::Url;

const API_VERSION: u8 = 3;
const STATUS_SUCCESS: &str = "success";
const STATUS_SANDBOX: &str = "sandbox";

/// Signed request handed to the gateway checkout page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub data: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
struct CheckoutParams<'a> {
    version: u8,
    public_key: &'a str,
    action: &'a str,
    amount: f64,
    currency: &'a str,
    description: String,
    order_id: String,
    result_url: String,
    server_url: String,
}

/// `data` + `signature` pair as received from the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub data: String,
    pub signature: String,
}

/// Inbound callback, transport-agnostic
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackRequest<'a> {
    /// Raw query string without the leading `?`
    pub query: Option<&'a str>,
    pub body: &'a [u8],
}

/// Verified and decoded callback payload
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackPayload {
    pub order_id: String,
    pub status: String,
    pub amount: Option<Decimal>,
    /// Full decoded document, stored on the order for audit
    pub raw: Value,
}

impl CallbackPayload {
    pub fn is_success(&self) -> bool {
        matches!(self.status.as_str(), STATUS_SUCCESS | STATUS_SANDBOX)
    }
}

type ExtractFn = fn(&CallbackRequest<'_>) -> Option<SignedPayload>;

/// Tried in order; the gateway does not stick to one transport.
const EXTRACTION_STRATEGIES: &[(&str, ExtractFn)] = &[
    ("json_body", extract_from_json_body),
    ("query_string", extract_from_query),
    ("form_body", extract_from_form_body),
];

fn pick_pair<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Option<SignedPayload>
where
    K: AsRef<str>,
    V: Into<String>,
{
    let mut data = None;
    let mut signature = None;
    for (key, value) in pairs {
        let key = key.as_ref();
        if data.is_none() && key.eq_ignore_ascii_case("data") {
            data = Some(value.into());
        } else if signature.is_none() && key.eq_ignore_ascii_case("signature") {
            signature = Some(value.into());
        }
    }
    match (data, signature) {
        (Some(data), Some(signature)) if !data.is_empty() && !signature.is_empty() => {
            Some(SignedPayload { data, signature })
        }
        _ => None,
    }
}

fn extract_from_json_body(request: &CallbackRequest<'_>) -> Option<SignedPayload> {
    let body: serde_json::Map<String, Value> = serde_json::from_slice(request.body).ok()?;
    pick_pair(body.into_iter().filter_map(|(key, value)| match value {
        Value::String(s) => Some((key, s)),
        _ => None,
    }))
}

fn extract_from_query(request: &CallbackRequest<'_>) -> Option<SignedPayload> {
    let query = request.query?;
    pick_pair(url::form_urlencoded::parse(query.as_bytes()))
}

fn extract_from_form_body(request: &CallbackRequest<'_>) -> Option<SignedPayload> {
    if request.body.is_empty() {
        return None;
    }
    pick_pair(url::form_urlencoded::parse(request.body))
}

/// Finds `data`/`signature` using the first strategy that yields both
pub fn extract_signed_payload(request: &CallbackRequest<'_>) -> Option<SignedPayload> {
    EXTRACTION_STRATEGIES.iter().find_map(|(name, extract)| {
        let found = extract(request);
        if found.is_some() {
            debug!(transport = name, "Extracted gateway callback fields");
        }
        found
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone)]
pub struct PaymentGateway {
    credentials: GatewayCredentials,
    checkout_url: String,
    public_base_url: String,
    currency: String,
}

impl std::fmt::Debug for PaymentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentGateway")
            .field("checkout_url", &self.checkout_url)
            .field("currency", &self.currency)
            .finish_non_exhaustive()
    }
}

impl PaymentGateway {
    pub fn new(
        credentials: GatewayCredentials,
        checkout_url: impl Into<String>,
        public_base_url: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            checkout_url: checkout_url.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            currency: currency.into(),
        }
    }

    /// Gateway configured from `cfg`, or `None` when keys are missing
    pub fn from_config(cfg: &AppConfig) -> Option<Self> {
        cfg.gateway_credentials().map(|credentials| {
            Self::new(
                credentials,
                cfg.gateway_checkout_url.clone(),
                cfg.public_base_url.clone(),
                cfg.currency.clone(),
            )
        })
    }

    /// `base64(sha1(private_key + data + private_key))`
    pub fn sign(&self, data: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.credentials.private_key.as_bytes());
        hasher.update(data.as_bytes());
        hasher.update(self.credentials.private_key.as_bytes());
        STANDARD.encode(hasher.finalize())
    }

    pub fn result_url(&self, order_id: &uuid::Uuid) -> String {
        format!("{}/orders/{}", self.public_base_url, order_id)
    }

    pub fn server_url(&self) -> String {
        format!("{}/api/v1/payments/callback", self.public_base_url)
    }

    /// Builds the signed `pay` request for an order's total
    pub fn build_payment_request(
        &self,
        order_id: uuid::Uuid,
        amount: Decimal,
    ) -> Result<PaymentRequest, ServiceError> {
        let amount = amount.to_f64().ok_or_else(|| {
            ServiceError::InternalError(format!("amount {} is not representable", amount))
        })?;
        let params = CheckoutParams {
            version: API_VERSION,
            public_key: &self.credentials.public_key,
            action: "pay",
            amount,
            currency: &self.currency,
            description: format!("Order {}", order_id),
            order_id: order_id.to_string(),
            result_url: self.result_url(&order_id),
            server_url: self.server_url(),
        };

        let json = serde_json::to_vec(&params)?;
        let data = STANDARD.encode(json);
        let signature = self.sign(&data);
        Ok(PaymentRequest { data, signature })
    }

    /// Checkout page URL carrying `data` and `signature`
    pub fn checkout_url(&self, request: &PaymentRequest) -> Result<String, ServiceError> {
        Url::parse_with_params(
            &self.checkout_url,
            &[
                ("data", request.data.as_str()),
                ("signature", request.signature.as_str()),
            ],
        )
        .map(String::from)
        .map_err(|e| ServiceError::InternalError(format!("invalid gateway checkout URL: {}", e)))
    }

    /// Authenticates and decodes a gateway callback.
    ///
    /// Nothing is decoded until the signature matches exactly.
    pub fn verify_callback(
        &self,
        request: &CallbackRequest<'_>,
    ) -> Result<CallbackPayload, ServiceError> {
        let signed = extract_signed_payload(request).ok_or_else(|| {
            ServiceError::MalformedPayload("callback is missing data or signature".to_string())
        })?;

        let expected = self.sign(&signed.data);
        if !constant_time_eq(expected.as_bytes(), signed.signature.as_bytes()) {
            return Err(ServiceError::InvalidSignature);
        }

        let decoded = STANDARD
            .decode(signed.data.as_bytes())
            .map_err(|_| ServiceError::MalformedPayload("data is not valid base64".to_string()))?;
        let raw: Value = serde_json::from_slice(&decoded)
            .map_err(|_| ServiceError::MalformedPayload("data is not valid JSON".to_string()))?;

        let order_id = match raw.get("order_id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ServiceError::MalformedPayload(
                    "payload has no order_id".to_string(),
                ))
            }
        };
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServiceError::MalformedPayload("payload has no status".to_string()))?
            .to_string();
        let amount = raw.get("amount").and_then(|v| match v {
            Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });

        Ok(CallbackPayload {
            order_id,
            status,
            amount,
            raw,
        })
    }
}
