//! Fixed-point monetary conversion.
//!
//! On-chain amounts are integers in the chain's smallest unit, scaled by
//! 10^18. User input and display use decimal strings.

use ethers::types::U256;
use ethers::utils;

use crate::errors::{CampaignError, Result};

/// Fractional digits of the native token.
pub const ETHER_DECIMALS: usize = 18;

/// Parse a decimal ether string (e.g. `"0.25"`) into its fixed-point value.
///
/// Only plain decimals are accepted: no sign, exponent or grouping.
pub fn parse_ether(input: &str) -> Result<U256> {
    let trimmed = input.trim();
    let (whole, fraction) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid(input, "no digits"));
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid(input, "expected a plain decimal number"));
    }
    if fraction.len() > ETHER_DECIMALS {
        return Err(invalid(input, "more than 18 fractional digits"));
    }

    let whole = if whole.is_empty() { "0" } else { whole };
    let fraction = if fraction.is_empty() { "0" } else { fraction };
    utils::parse_ether(format!("{whole}.{fraction}")).map_err(|e| invalid(input, &e.to_string()))
}

/// Render a fixed-point value as a decimal ether string.
///
/// Always keeps at least one fractional digit: `5.0`, `0.01`, `1.5`.
pub fn format_ether(value: U256) -> String {
    let formatted = utils::format_ether(value);
    match formatted.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                format!("{whole}.0")
            } else {
                format!("{whole}.{fraction}")
            }
        }
        None => format!("{formatted}.0"),
    }
}

/// `part / whole * 100`, computed in basis points to stay in integers.
pub fn percent_of(part: U256, whole: U256) -> f64 {
    if whole.is_zero() {
        return 0.0;
    }
    match part.checked_mul(U256::from(10_000u64)) {
        Some(scaled) => {
            let basis_points = scaled / whole;
            if basis_points > U256::from(u64::MAX) {
                f64::INFINITY
            } else {
                basis_points.low_u64() as f64 / 100.0
            }
        }
        // Too large to scale; fall back to a lossy float ratio.
        None => to_f64(part) / to_f64(whole) * 100.0,
    }
}

fn to_f64(value: U256) -> f64 {
    value.to_string().parse().unwrap_or(f64::INFINITY)
}

fn invalid(input: &str, reason: &str) -> CampaignError {
    CampaignError::Validation(format!("invalid amount '{input}': {reason}"))
}
