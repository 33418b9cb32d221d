/*
 * Price codec: sqrt-price encodings, ticks and human decimal prices
 */

use ethers::types::U256;
use num_bigint::BigUint;
use num_traits::Zero;
use rust_decimal::Decimal;
use crate::models::{PoolError, Result};
use crate::utils::{pow10, ratio_to_decimal, u256_to_biguint};

pub const MIN_TICK: i32 = -887_272;
pub const MAX_TICK: i32 = 887_272;

/// sqrt_ratio_at_tick(MIN_TICK)
pub const MIN_SQRT_RATIO: U256 = U256([4_295_128_739, 0, 0, 0]);

/// sqrt_ratio_at_tick(MAX_TICK)
pub const MAX_SQRT_RATIO: U256 = U256([
    0x5d95_1d52_6398_8d26,
    0xefd1_fc6a_5064_8849,
    0xfffd_8963,
    0,
]);

// 1/sqrt(1.0001)^(2^i) in Q128.128, one entry per bit of |tick|.
const TICK_FACTORS: [u128; 20] = [
    0xfffc_b933_bd6f_ad37_aa2d_162d_1a59_4001,
    0xfff9_7272_373d_4132_59a4_6990_580e_213a,
    0xfff2_e50f_5f65_6932_ef12_357c_f3c7_fdcc,
    0xffe5_caca_7e10_e4e6_1c36_24ea_a094_1cd0,
    0xffcb_9843_d60f_6159_c9db_5883_5c92_6644,
    0xff97_3b41_fa98_c081_472e_6896_dfb2_54c0,
    0xff2e_a164_66c9_6a38_43ec_78b3_26b5_2861,
    0xfe5d_ee04_6a99_a2a8_11c4_61f1_969c_3053,
    0xfcbe_86c7_900a_88ae_dcff_c83b_479a_a3a4,
    0xf987_a725_3ac4_1317_6f2b_074c_f781_5e54,
    0xf339_2b08_22b7_0005_940c_7a39_8e4b_70f3,
    0xe715_9475_a2c2_9b74_43b2_9c7f_a6e8_89d9,
    0xd097_f3bd_fd20_22b8_845a_d8f7_92aa_5825,
    0xa9f7_4646_2d87_0fdf_8a65_dc1f_90e0_61e5,
    0x70d8_69a1_56d2_a1b8_90bb_3df6_2baf_32f7,
    0x31be_135f_97d0_8fd9_8123_1505_542f_cfa6,
    0x09aa_508b_5b7a_84e1_c677_de54_f3e9_9bc9,
    0x005d_6af8_dedb_8119_6699_c329_225e_e604,
    0x0000_2216_e584_f5fa_1ea9_2604_1bed_fe98,
    0x0000_0000_048a_1703_91f7_dc42_444e_8fa2,
];

fn check_encoded(sqrt_price_x96: U256) -> Result<()> {
    if sqrt_price_x96 < MIN_SQRT_RATIO || sqrt_price_x96 > MAX_SQRT_RATIO {
        return Err(PoolError::MalformedPrice(format!(
            "sqrtPriceX96 {sqrt_price_x96} outside [{MIN_SQRT_RATIO}, {MAX_SQRT_RATIO}]"
        )));
    }
    Ok(())
}

/// Decodes a Q64.96 square-root price into token1 per token0 (or token0 per
/// token1 when `invert` is set), scaled by each token's decimals.
///
/// The whole computation is an exact rational; only the final rendering to
/// `Decimal` rounds (half-even at the 28th significant place available).
pub fn decode_price(
    sqrt_price_x96: U256,
    decimals0: u8,
    decimals1: u8,
    invert: bool,
) -> Result<Decimal> {
    check_encoded(sqrt_price_x96)?;

    let sqrt = u256_to_biguint(sqrt_price_x96);
    let raw_num = &sqrt * &sqrt * pow10(u32::from(decimals0));
    let raw_den = (BigUint::from(1u8) << 192u32) * pow10(u32::from(decimals1));

    let (num, den) = if invert {
        (raw_den, raw_num)
    } else {
        (raw_num, raw_den)
    };

    let price = ratio_to_decimal(&num, &den).map_err(|e| {
        PoolError::MalformedPrice(format!(
            "sqrtPriceX96 {sqrt_price_x96} with decimals ({decimals0}, {decimals1}) is not representable: {e}"
        ))
    })?;

    if price.is_zero() && !num.is_zero() {
        return Err(PoolError::MalformedPrice(format!(
            "sqrtPriceX96 {sqrt_price_x96} with decimals ({decimals0}, {decimals1}) rounds to zero"
        )));
    }

    Ok(price)
}

/// Reciprocal of a decoded price, with the same rounding as `decode_price`.
pub fn invert_price(price: Decimal) -> Result<Decimal> {
    if price <= Decimal::ZERO {
        return Err(PoolError::MalformedPrice(format!(
            "Cannot invert non-positive price {price}"
        )));
    }
    Decimal::ONE
        .checked_div(price)
        .ok_or_else(|| PoolError::MalformedPrice(format!("Inverse of {price} overflows")))
}

/// Exact Q64.96 square-root price at `tick`.
pub fn sqrt_ratio_at_tick(tick: i32) -> Result<U256> {
    if !(MIN_TICK..=MAX_TICK).contains(&tick) {
        return Err(PoolError::MalformedPrice(format!(
            "Tick {tick} outside [{MIN_TICK}, {MAX_TICK}]"
        )));
    }

    let abs_tick = tick.unsigned_abs();
    let mut ratio = if abs_tick & 1 != 0 {
        U256::from(TICK_FACTORS[0])
    } else {
        U256::one() << 128
    };

    for (bit, factor) in TICK_FACTORS.iter().enumerate().skip(1) {
        if abs_tick & (1 << bit) != 0 {
            ratio = (ratio * U256::from(*factor)) >> 128;
        }
    }

    if tick > 0 {
        ratio = U256::MAX / ratio;
    }

    // Q128.128 -> Q64.96, rounding up
    let rounding = if (ratio & U256::from(u32::MAX)).is_zero() {
        U256::zero()
    } else {
        U256::one()
    };
    Ok((ratio >> 32) + rounding)
}

/// Greatest tick whose square-root price does not exceed `sqrt_price_x96`.
pub fn tick_at_sqrt_ratio(sqrt_price_x96: U256) -> Result<i32> {
    if sqrt_price_x96 < MIN_SQRT_RATIO || sqrt_price_x96 >= MAX_SQRT_RATIO {
        return Err(PoolError::MalformedPrice(format!(
            "sqrtPriceX96 {sqrt_price_x96} outside [{MIN_SQRT_RATIO}, {MAX_SQRT_RATIO})"
        )));
    }

    let (mut low, mut high) = (MIN_TICK, MAX_TICK);
    while low < high {
        // upper midpoint so `low = mid` always makes progress
        let mid = low + (high - low + 1) / 2;
        if sqrt_ratio_at_tick(mid)? <= sqrt_price_x96 {
            low = mid;
        } else {
            high = mid - 1;
        }
    }
    Ok(low)
}

/// The initialisable tick boundaries `[lower, upper)` that enclose `tick`.
pub fn tick_range(tick: i32, tick_spacing: i32) -> Result<(i32, i32)> {
    if tick_spacing <= 0 {
        return Err(PoolError::CalculationError(format!(
            "Tick spacing must be positive, got {tick_spacing}"
        )));
    }
    let lower = tick.div_euclid(tick_spacing) * tick_spacing;
    Ok((lower, lower + tick_spacing))
}
