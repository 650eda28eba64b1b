/// Shared helpers for JSON-RPC quantities and identifiers
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("Missing quantity")]
    Missing,

    #[error("Invalid quantity: {0}")]
    Invalid(String),
}

/// Parses a JSON-RPC quantity: `"0x1a"`, a decimal string, or a JSON number
pub fn parse_quantity(value: &Value) -> Result<u128, QuantityError> {
    match value {
        Value::String(s) => parse_quantity_str(s),
        Value::Number(n) => n
            .as_u64()
            .map(u128::from)
            .ok_or_else(|| QuantityError::Invalid(n.to_string())),
        Value::Null => Err(QuantityError::Missing),
        other => Err(QuantityError::Invalid(other.to_string())),
    }
}

pub fn parse_quantity_str(s: &str) -> Result<u128, QuantityError> {
    let trimmed = s.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some("") => Ok(0),
        Some(hex) => u128::from_str_radix(hex, 16),
        None => trimmed.parse::<u128>(),
    };
    parsed.map_err(|_| QuantityError::Invalid(s.to_string()))
}

pub fn parse_u64(value: &Value) -> Result<u64, QuantityError> {
    let quantity = parse_quantity(value)?;
    u64::try_from(quantity).map_err(|_| QuantityError::Invalid(quantity.to_string()))
}

/// Converts a quantity expressed in the chain's smallest unit using `decimals`,
/// e.g. wei to gwei with `decimals = 9`
pub fn convert_hex_to_number(value: &Value, decimals: u32) -> Result<f64, QuantityError> {
    let quantity = parse_quantity(value)? as f64;
    Ok(quantity / 10f64.powi(decimals as i32))
}

/// `0x` prefixed hex encoding used for block number parameters
pub fn to_hex_quantity(number: u64) -> String {
    format!("0x{:x}", number)
}

/// Normalises a display name into the camelCase id used on every outbound message.
/// Words are split on non-alphanumerics and on lower-to-upper case transitions.
pub fn node_id(name: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;

    for c in name.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if c.is_uppercase() && previous_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        previous_lower = c.is_lowercase() || c.is_numeric();
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .iter()
        .enumerate()
        .map(|(i, word)| {
            let lower = word.to_lowercase();
            if i == 0 {
                lower
            } else {
                let mut chars = lower.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
        })
        .collect()
}

/// Milliseconds since the unix epoch, the clock used for ping round trips
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
