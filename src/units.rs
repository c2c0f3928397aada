//! Native-unit conversions
//!
//! Amounts cross the tool boundary as decimal strings ("0.1") and live as
//! `U256` wei everywhere inside the core. Arithmetic is integer over wei;
//! no floating point touches amount, fee, total, or balance fields.

use alloy::primitives::U256;

use crate::{Error, Result};

/// Decimals of the native currency.
pub const NATIVE_DECIMALS: u32 = 18;

/// Wei per gwei.
pub const GWEI: u128 = 1_000_000_000;

/// Parse a decimal native-unit string (e.g. "0.1") into wei.
///
/// Rejects empty input, signs, exponents, and more than 18 fractional
/// digits. "1", "1.", ".5", and "1.50" are all accepted.
pub fn parse_native(s: &str) -> Result<U256> {
    let s = s.trim();
    if s.is_empty() || s == "." {
        return Err(Error::InvalidArgument(format!("invalid amount '{s}'")));
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > NATIVE_DECIMALS as usize {
        return Err(Error::InvalidArgument(format!(
            "amount '{s}' has more than {NATIVE_DECIMALS} fractional digits"
        )));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidArgument(format!("invalid amount '{s}'")));
    }

    let scale = U256::from(10u64).pow(U256::from(NATIVE_DECIMALS));
    let whole_part = if whole.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(whole, 10)
            .map_err(|_| Error::InvalidArgument(format!("invalid amount '{s}'")))?
    };
    let frac_part = if frac.is_empty() {
        U256::ZERO
    } else {
        let padded = format!("{frac:0<width$}", width = NATIVE_DECIMALS as usize);
        U256::from_str_radix(&padded, 10)
            .map_err(|_| Error::InvalidArgument(format!("invalid amount '{s}'")))?
    };

    whole_part
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_part))
        .ok_or_else(|| Error::InvalidArgument(format!("amount '{s}' overflows")))
}

/// Format wei as a decimal native-unit string, trimming trailing zeros.
pub fn format_native(wei: U256) -> String {
    format_units(wei, NATIVE_DECIMALS)
}

/// Format a U256 value with the given number of decimals.
pub fn format_units(value: U256, decimals: u32) -> String {
    if value.is_zero() {
        return "0".to_string();
    }

    let divisor = U256::from(10u64).pow(U256::from(decimals));
    let whole = value / divisor;
    let remainder = value % divisor;

    if remainder.is_zero() {
        whole.to_string()
    } else {
        let remainder_str = format!("{:0>width$}", remainder, width = decimals as usize);
        let trimmed = remainder_str.trim_end_matches('0');
        if trimmed.is_empty() {
            whole.to_string()
        } else {
            format!("{}.{}", whole, trimmed)
        }
    }
}

/// Convert wei to whole gwei, rounding down.
pub fn wei_to_gwei(wei: u128) -> u128 {
    wei / GWEI
}

/// Convert whole gwei to wei.
pub fn gwei_to_wei(gwei: u64) -> u128 {
    gwei as u128 * GWEI
}

/// Parse a wei amount stored as a decimal string (storage representation).
pub fn parse_wei(s: &str) -> Result<U256> {
    U256::from_str_radix(s, 10).map_err(|_| Error::Storage(format!("invalid wei value '{s}'")))
}
