/*
 * Exact conversions between raw on-chain integers and human decimals
 */

use ethers::types::U256;
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use rust_decimal::{Decimal, RoundingStrategy};
use crate::models::{PoolError, Result};

/// Largest scale a `Decimal` can carry.
pub const MAX_DECIMAL_SCALE: u32 = 28;

#[must_use]
pub fn u256_to_biguint(value: U256) -> BigUint {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    BigUint::from_bytes_be(&buf)
}

pub fn biguint_to_u256(value: &BigUint) -> Result<U256> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return Err(PoolError::CalculationError(format!(
            "{value} does not fit in 256 bits"
        )));
    }
    Ok(U256::from_big_endian(&bytes))
}

#[must_use]
pub fn pow10(exp: u32) -> BigUint {
    BigUint::from(10u32).pow(exp)
}

/// Renders `numerator / denominator` as the most precise `Decimal` that fits,
/// rounding half-even at the last kept digit.
pub fn ratio_to_decimal(numerator: &BigUint, denominator: &BigUint) -> Result<Decimal> {
    if denominator.is_zero() {
        return Err(PoolError::CalculationError("Division by zero".to_string()));
    }

    let mantissa_limit = BigUint::from(1u8) << 96u32;
    let two = BigUint::from(2u8);

    for scale in (0..=MAX_DECIMAL_SCALE).rev() {
        let scaled = numerator * pow10(scale);
        let mut quotient = &scaled / denominator;
        let remainder = &scaled % denominator;

        let doubled = &remainder * &two;
        if doubled > *denominator || (doubled == *denominator && quotient.bit(0)) {
            quotient += 1u32;
        }

        if quotient < mantissa_limit {
            let mantissa = quotient.to_i128().ok_or_else(|| {
                PoolError::CalculationError(format!("Mantissa {quotient} out of range"))
            })?;
            let value = Decimal::try_from_i128_with_scale(mantissa, scale)
                .map_err(|e| PoolError::CalculationError(format!("Decimal conversion error: {e}")))?;
            return Ok(value.normalize());
        }
    }

    Err(PoolError::CalculationError(format!(
        "{numerator}/{denominator} exceeds the decimal range"
    )))
}

/// Converts a raw token amount into human units.
pub fn from_base_units(raw: U256, decimals: u8) -> Result<Decimal> {
    ratio_to_decimal(&u256_to_biguint(raw), &pow10(u32::from(decimals)))
}

/// Converts a human amount into raw token units, rounding half-even at the
/// token's smallest unit.
pub fn to_base_units(amount: Decimal, decimals: u8) -> Result<U256> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(PoolError::InvalidAmount(format!(
            "Negative amount {amount} cannot be converted to token units"
        )));
    }

    let rounded = round_to_token(amount, decimals);
    let mantissa = rounded.mantissa().unsigned_abs();
    let shift = u32::from(decimals) - rounded.scale().min(u32::from(decimals));

    U256::from(mantissa)
        .checked_mul(U256::exp10(shift as usize))
        .ok_or_else(|| {
            PoolError::InvalidAmount(format!(
                "Amount {amount} with {decimals} decimals overflows 256 bits"
            ))
        })
}

/// Round-half-even at the token's unit granularity (capped at the decimal scale limit).
#[must_use]
pub fn round_to_token(amount: Decimal, decimals: u8) -> Decimal {
    amount.round_dp_with_strategy(
        u32::from(decimals).min(MAX_DECIMAL_SCALE),
        RoundingStrategy::MidpointNearestEven,
    )
}

/// Wei to ether-denominated native currency.
pub fn wei_to_native(wei: U256) -> Result<Decimal> {
    from_base_units(wei, 18)
}
