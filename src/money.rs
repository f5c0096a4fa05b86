//! Money helpers
//!
//! All user-facing amounts are `rust_decimal::Decimal` in whole USDT. The
//! chain side works in integer token units (`10^decimals` per USDT, 18 for
//! BEP-20 USDT); conversions between the two MUST go through this module.

use rust_decimal::prelude::*;
use thiserror::Error;

/// Decimals shown to users
pub const USDT_DISPLAY_DECIMALS: u32 = 2;

/// Decimals kept when storing computed fees
pub const FEE_DECIMALS: u32 = 8;

#[derive(Debug, Error, PartialEq)]
pub enum MoneyError {
    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,
}

// ============================================================================
// Display
// ============================================================================

/// `100` -> `"100.00 USDT"`
pub fn format_usdt(amount: Decimal) -> String {
    format!(
        "{:.prec$} USDT",
        amount.round_dp(USDT_DISPLAY_DECIMALS),
        prec = USDT_DISPLAY_DECIMALS as usize
    )
}

// ============================================================================
// Percentages
// ============================================================================

/// `amount * percent / 100`
pub fn percent_of(amount: Decimal, percent: Decimal) -> Decimal {
    amount * percent / Decimal::ONE_HUNDRED
}

/// Service fee for a withdrawal, `fee_percent` given in percent (1.5 = 1.5%)
pub fn service_fee(amount: Decimal, fee_percent: Decimal) -> Decimal {
    if fee_percent <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    percent_of(amount, fee_percent).round_dp(FEE_DECIMALS)
}

/// `part / whole * 100`, or zero when `whole` is zero
pub fn ratio_percent(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    part / whole * Decimal::ONE_HUNDRED
}

// ============================================================================
// Token units
// ============================================================================

/// Whole tokens -> integer token units. Digits beyond `decimals` are truncated.
pub fn to_token_units(amount: Decimal, decimals: u32) -> Result<u128, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::InvalidAmount);
    }
    let scale = Decimal::from_u128(10u128.pow(decimals)).ok_or(MoneyError::Overflow)?;
    amount
        .checked_mul(scale)
        .ok_or(MoneyError::Overflow)?
        .trunc()
        .to_u128()
        .ok_or(MoneyError::Overflow)
}

/// Integer token units -> whole tokens
pub fn from_token_units(units: u128, decimals: u32) -> Result<Decimal, MoneyError> {
    let mut value = Decimal::from_u128(units).ok_or(MoneyError::Overflow)?;
    value
        .set_scale(decimals)
        .map_err(|_| MoneyError::Overflow)?;
    Ok(value.normalize())
}
