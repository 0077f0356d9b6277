use alloy::primitives::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::ArithmeticError;

/// Price is carried with 6 decimal places.
const PRICE_SCALE: u64 = 1_000_000;
/// Payout asset uses 18-decimal fixed point.
const PAYOUT_UNIT: u64 = 1_000_000_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub fee: U256,
    pub payout: U256,
}

/// Split off the 1% service fee and convert the rest at `price`.
///
/// `received` is in 6-decimal units of the deposit asset; the payout comes
/// back in 18-decimal units of the payout asset. The fee is whatever the
/// integer 99/100 split leaves over, so it rounds up rather than down.
pub fn compute(received: U256, price: Decimal) -> Result<Settlement, ArithmeticError> {
    if price.is_sign_negative() {
        return Err(ArithmeticError::InvalidPrice(price.to_string()));
    }

    let after_fee = received
        .checked_mul(U256::from(99u64))
        .ok_or(ArithmeticError::Overflow)?
        / U256::from(100u64);
    let fee = received - after_fee;

    let price_scaled = price
        .checked_mul(Decimal::from(PRICE_SCALE))
        .ok_or_else(|| ArithmeticError::InvalidPrice(price.to_string()))?
        .trunc()
        .to_u128()
        .ok_or_else(|| ArithmeticError::InvalidPrice(price.to_string()))?;
    if price_scaled == 0 {
        return Err(ArithmeticError::ZeroPrice);
    }

    let payout = after_fee
        .checked_mul(U256::from(PAYOUT_UNIT))
        .ok_or(ArithmeticError::Overflow)?
        / U256::from(price_scaled);

    Ok(Settlement { fee, payout })
}
