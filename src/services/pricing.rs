//! Money arithmetic shared by the catalog, promotion and order services.

use crate::{config::AppConfig, entities::order::DeliveryMethod, errors::ServiceError};
use rust_decimal::{Decimal, RoundingStrategy};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Rounds to 2 decimal places, midpoint away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Price after taking `discount` percent off `base`.
///
/// Always computed from the undiscounted base, so reapplying a discount
/// never compounds.
pub fn discounted_price(base: Decimal, discount: Decimal) -> Decimal {
    round_money(base * (HUNDRED - discount) / HUNDRED)
}

pub fn validate_discount(discount: Decimal) -> Result<(), ServiceError> {
    if discount < Decimal::ZERO || discount > HUNDRED {
        return Err(ServiceError::ValidationError(format!(
            "Discount must be between 0 and 100, got {}",
            discount
        )));
    }
    Ok(())
}

pub fn validate_price(price: Decimal) -> Result<(), ServiceError> {
    if price < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Price must not be negative".to_string(),
        ));
    }
    Ok(())
}

/// Delivery fee rules per delivery method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryPolicy {
    pub courier_free_threshold: Decimal,
    pub courier_fee: Decimal,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            courier_free_threshold: Decimal::from(1000),
            courier_fee: Decimal::from(100),
        }
    }
}

impl From<&AppConfig> for DeliveryPolicy {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            courier_free_threshold: cfg.courier_free_delivery_threshold,
            courier_fee: cfg.courier_delivery_fee,
        }
    }
}

impl DeliveryPolicy {
    /// Fee for `method` given the order subtotal.
    ///
    /// Carrier methods pass through the fee quoted on the shipping address
    /// (zero when absent).
    pub fn fee(
        &self,
        method: DeliveryMethod,
        subtotal: Decimal,
        quoted_fee: Option<Decimal>,
    ) -> Result<Decimal, ServiceError> {
        let fee = match method {
            carrier if carrier.is_carrier() => {
                let quoted = quoted_fee.unwrap_or(Decimal::ZERO);
                if quoted < Decimal::ZERO {
                    return Err(ServiceError::ValidationError(
                        "shippingAddress.deliveryFee must not be negative".to_string(),
                    ));
                }
                quoted
            }
            DeliveryMethod::Courier if subtotal < self.courier_free_threshold => self.courier_fee,
            _ => Decimal::ZERO,
        };
        Ok(round_money(fee))
    }
}
