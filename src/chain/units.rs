//! Decimal formatting for raw token units

use crate::{Error, Result};
use alloy::primitives::U256;

/// Format a U256 value with decimals
pub fn format_units(value: U256, decimals: u8) -> String {
    if value.is_zero() {
        return "0".to_string();
    }

    let divisor = U256::from(10).pow(U256::from(decimals));
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

/// Raw units as a float, for display and USD valuation only
pub fn units_to_f64(value: U256, decimals: u8) -> f64 {
    format_units(value, decimals).parse().unwrap_or(0.0)
}

/// Parse a decimal string ("12.5") into raw units.
///
/// Digits beyond `decimals` are truncated, never rounded up, so the parsed
/// amount never exceeds what the user typed.
pub fn parse_units(amount: &str, decimals: u8) -> Result<U256> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(Error::InvalidAmount("empty amount".to_string()));
    }

    let (whole, fraction) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    let whole = if whole.is_empty() { "0" } else { whole };

    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(Error::InvalidAmount(format!("'{}' is not a number", amount)));
    }

    let mut fraction: String = fraction.chars().take(decimals as usize).collect();
    while fraction.len() < decimals as usize {
        fraction.push('0');
    }

    let digits = format!("{}{}", whole, fraction);
    U256::from_str_radix(&digits, 10)
        .map_err(|e| Error::InvalidAmount(format!("'{}' out of range: {}", amount, e)))
}

/// Convert a float amount into raw units via its decimal representation
pub fn f64_to_units(amount: f64, decimals: u8) -> Result<U256> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(Error::InvalidAmount(format!("{} is not a valid amount", amount)));
    }
    parse_units(&format!("{:.*}", decimals as usize, amount), decimals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_units() {
        let one_eth = U256::from(1_000_000_000_000_000_000u128);
        assert_eq!(format_units(one_eth, 18), "1");

        let one_point_five = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(format_units(one_point_five, 18), "1.5");

        let thousand_usdc = U256::from(1_000_000_000u64);
        assert_eq!(format_units(thousand_usdc, 6), "1000");

        assert_eq!(format_units(U256::ZERO, 18), "0");
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_units("12.5", 6).unwrap(), U256::from(12_500_000u64));
        assert_eq!(parse_units("0.000001", 6).unwrap(), U256::from(1u64));
        assert_eq!(parse_units(".5", 6).unwrap(), U256::from(500_000u64));
        // Extra precision truncates
        assert_eq!(parse_units("1.0000009", 6).unwrap(), U256::from(1_000_000u64));
    }

    #[test]
    fn test_parse_units_rejects_garbage() {
        assert!(matches!(parse_units("abc", 6), Err(Error::InvalidAmount(_))));
        assert!(matches!(parse_units("-1", 6), Err(Error::InvalidAmount(_))));
        assert!(matches!(parse_units("", 6), Err(Error::InvalidAmount(_))));
    }

    #[test]
    fn test_units_to_f64() {
        assert!((units_to_f64(U256::from(30_000_000u64), 6) - 30.0).abs() < 1e-9);
        assert_eq!(f64_to_units(30.0, 6).unwrap(), U256::from(30_000_000u64));
    }
}
