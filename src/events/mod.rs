use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted by the storefront services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated {
        order_id: Uuid,
        total_price: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payment events
    PaymentReceived {
        order_id: Uuid,
        amount: Option<Decimal>,
    },
    PaymentFailed {
        order_id: Uuid,
        gateway_status: String,
    },

    // Inventory events
    StockRestored {
        order_id: Uuid,
        lines: usize,
    },

    // Promotion events
    PromotionApplied {
        promotion_id: Uuid,
        products: usize,
    },
    PromotionReverted {
        promotion_id: Uuid,
        products: usize,
    },
    PromotionsExpired {
        expired: usize,
        failed: usize,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Drains the event channel, logging each event until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentFailed { order_id, gateway_status } => {
                warn!(%order_id, %gateway_status, "Payment failed");
            }
            Event::PromotionsExpired { failed, .. } if *failed > 0 => {
                warn!(?event, "Promotion sweep finished with failures");
            }
            _ => info!(?event, "Domain event"),
        }
    }

    info!("Event processing loop stopped");
}
