//! Decimal stake amounts in the chain's native unit
//!
//! Users type amounts like `"0.1"`; the hook takes wei. Conversion goes
//! through `rust_decimal` so no float rounding ever touches a stake.

use std::str::FromStr;

use ethereum_types::U256;
use rust_decimal::Decimal;

/// Decimals of the native unit
pub const NATIVE_DECIMALS: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("not a decimal number: {0:?}")]
    Malformed(String),

    #[error("amount cannot be negative")]
    Negative,

    #[error("amount has more than {NATIVE_DECIMALS} fractional digits")]
    TooPrecise,

    #[error("amount is too large")]
    Overflow,
}

/// Parse a decimal string into wei
pub fn parse_ether(value: &str) -> Result<U256, AmountError> {
    let trimmed = value.trim();
    let mut decimal = Decimal::from_str(trimmed)
        .map_err(|_| AmountError::Malformed(trimmed.to_string()))?;

    if decimal.is_sign_negative() && !decimal.is_zero() {
        return Err(AmountError::Negative);
    }
    if decimal.scale() > NATIVE_DECIMALS {
        return Err(AmountError::TooPrecise);
    }

    // rescale saturates instead of failing, so check it actually got there
    decimal.rescale(NATIVE_DECIMALS);
    if decimal.scale() != NATIVE_DECIMALS {
        return Err(AmountError::Overflow);
    }

    let wei = decimal.mantissa();
    if wei < 0 {
        return Err(AmountError::Negative);
    }
    Ok(U256::from(wei as u128))
}

/// Render wei as a trimmed decimal string ("0.1", "2", "0")
pub fn format_ether(wei: U256) -> String {
    let unit = U256::exp10(NATIVE_DECIMALS as usize);
    let whole = wei / unit;
    let frac = wei % unit;

    if frac.is_zero() {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac.to_string(), width = NATIVE_DECIMALS as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
