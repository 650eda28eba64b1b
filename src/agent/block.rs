use serde_json::{Map, Value};
use thiserror::Error;

use crate::agent::types::BlockRecord;
use crate::core::utils::{parse_quantity, parse_u64, QuantityError};

#[derive(Debug, Error, PartialEq)]
pub enum FormatError {
    #[error("Block payload is null")]
    Null,

    #[error("Block payload is not an object")]
    NotObject,

    #[error("Block number is missing or invalid: {0}")]
    Number(QuantityError),

    #[error("Block difficulty is missing")]
    MissingDifficulty,

    #[error("Invalid {field}: {source}")]
    Field {
        field: &'static str,
        source: QuantityError,
    },
}

///
/// Normalises a raw `eth_getBlockByNumber` result. A block without a valid number
/// or without a difficulty is rejected as a whole.
///
pub fn format_block(raw: &Value) -> Result<BlockRecord, FormatError> {
    let block = match raw {
        Value::Null => return Err(FormatError::Null),
        Value::Object(block) => block,
        _ => return Err(FormatError::NotObject),
    };

    let number = parse_u64(block.get("number").unwrap_or(&Value::Null)).map_err(FormatError::Number)?;

    let difficulty = match block.get("difficulty") {
        None | Some(Value::Null) => return Err(FormatError::MissingDifficulty),
        Some(value) => parse_quantity(value).map_err(|source| FormatError::Field {
            field: "difficulty",
            source,
        })?,
    };

    Ok(BlockRecord {
        number,
        hash: string_field(block, "hash"),
        parent_hash: string_field(block, "parentHash"),
        miner: string_field(block, "miner"),
        difficulty,
        total_difficulty: optional_quantity(block, "totalDifficulty")?,
        timestamp: optional_u64(block, "timestamp")?,
        size: optional_u64(block, "size")?,
        gas_used: optional_u64(block, "gasUsed")?,
        gas_limit: optional_u64(block, "gasLimit")?,
        nonce: string_field(block, "nonce"),
        transactions: transaction_hashes(block.get("transactions")),
        uncles: block
            .get("uncles")
            .and_then(Value::as_array)
            .map(|uncles| {
                uncles
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn string_field(block: &Map<String, Value>, field: &str) -> String {
    block
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn optional_quantity(block: &Map<String, Value>, field: &'static str) -> Result<u128, FormatError> {
    match block.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(value) => parse_quantity(value).map_err(|source| FormatError::Field { field, source }),
    }
}

fn optional_u64(block: &Map<String, Value>, field: &'static str) -> Result<u64, FormatError> {
    match block.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(value) => parse_u64(value).map_err(|source| FormatError::Field { field, source }),
    }
}

// Expanded transactions carry `hash`, some clients only fill `blockHash`
fn transaction_hashes(transactions: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(transactions)) = transactions else {
        return Vec::new();
    };
    transactions
        .iter()
        .filter_map(|tx| match tx {
            Value::String(hash) => Some(hash.clone()),
            Value::Object(tx) => tx
                .get("hash")
                .and_then(Value::as_str)
                .or_else(|| tx.get("blockHash").and_then(Value::as_str))
                .map(str::to_string),
            _ => None,
        })
        .collect()
}
