use crate::{errors::ServiceError, services::payment_gateway::CallbackRequest, AppState};
use axum::extract::{RawQuery, State};
use bytes::Bytes;
use tracing::{info, warn};

/// Gateway server-to-server callback.
///
/// Accepts the signed `data`/`signature` pair as a JSON body, a query string
/// or a form body, on both GET and POST. Replies `ok` once the outcome has
/// been recorded so the gateway stops redelivering.
pub async fn payment_callback(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<&'static str, ServiceError> {
    let gateway = state.services.orders.gateway().ok_or_else(|| {
        ServiceError::ServiceUnavailable("Payment gateway is not configured".to_string())
    })?;

    let request = CallbackRequest {
        query: query.as_deref(),
        body: &body,
    };
    let payload = match gateway.verify_callback(&request) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Rejected payment callback");
            return Err(e);
        }
    };

    let order = state
        .services
        .orders
        .apply_payment_callback(&payload)
        .await?;
    info!(
        order_id = %order.id,
        gateway_status = %payload.status,
        payment_status = %order.payment_status,
        "Payment callback processed"
    );
    Ok("ok")
}
