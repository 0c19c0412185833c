//! Kubernetes resource quantity parsing
//!
//! Quantities such as `250m`, `1.5`, `128Mi` or `1e3` are converted to base
//! units (cores or bytes) by a single parser shared by CPU and memory.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity '{0}'")]
    InvalidNumber(String),

    #[error("unknown suffix '{suffix}' in quantity '{quantity}'")]
    UnknownSuffix { quantity: String, suffix: String },

    #[error("quantity '{0}' is out of range")]
    OutOfRange(String),
}

/// Parse a quantity string into base units
pub fn parse_quantity(input: &str) -> Result<f64, QuantityError> {
    let quantity = input.trim();
    if quantity.is_empty() {
        return Err(QuantityError::Empty);
    }

    let split = quantity
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '+' || c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);

    if !number.chars().any(|c| c.is_ascii_digit()) {
        return Err(QuantityError::InvalidNumber(quantity.to_string()));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::InvalidNumber(quantity.to_string()))?;

    let multiplier = suffix_multiplier(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
        quantity: quantity.to_string(),
        suffix: suffix.to_string(),
    })?;

    let result = value * multiplier;
    if !result.is_finite() {
        return Err(QuantityError::OutOfRange(quantity.to_string()));
    }
    Ok(result)
}

fn suffix_multiplier(suffix: &str) -> Option<f64> {
    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return exponent_multiplier(suffix),
    };
    Some(multiplier)
}

/// Decimal exponent notation: `e3`, `E-2`, `e+6`
fn exponent_multiplier(suffix: &str) -> Option<f64> {
    let exponent = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    let digits = exponent
        .strip_prefix('+')
        .or_else(|| exponent.strip_prefix('-'))
        .unwrap_or(exponent);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let exponent: i32 = exponent.parse().ok()?;
    Some(10f64.powi(exponent))
}

/// CPU quantity in milli-units, rounded up
pub fn cpu_millis(input: &str) -> Result<i64, QuantityError> {
    to_i64(input, parse_quantity(input)? * 1000.0)
}

/// Memory quantity in bytes, rounded up
pub fn memory_bytes(input: &str) -> Result<i64, QuantityError> {
    to_i64(input, parse_quantity(input)?)
}

fn to_i64(input: &str, value: f64) -> Result<i64, QuantityError> {
    // Strip float noise like 250.00000000000003 before rounding up
    let rounded = (value * 1e6).round() / 1e6;
    let ceiled = rounded.ceil();
    if ceiled > i64::MAX as f64 || ceiled < i64::MIN as f64 {
        return Err(QuantityError::OutOfRange(input.to_string()));
    }
    Ok(ceiled as i64)
}
