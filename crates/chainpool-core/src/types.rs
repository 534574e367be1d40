//! Shared chain data types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::TransportError;

/// A block header as reported by a remote endpoint.
///
/// Only the fields the pool needs for liveness and sync tracking are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    /// Block height.
    pub number: u64,
    /// Block timestamp in seconds since the Unix epoch.
    pub timestamp: u64,
    /// Block hash, when the endpoint returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Head {
    #[must_use]
    pub fn new(number: u64, timestamp: u64) -> Self {
        Self { number, timestamp, hash: None }
    }

    /// Parses a head from an `eth_getBlockByNumber` result object.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidResponse`] if the result is `null`, or if
    /// `number` or `timestamp` is missing or not a hex quantity.
    pub fn from_block_json(block: &Value) -> Result<Self, TransportError> {
        if block.is_null() {
            return Err(TransportError::InvalidResponse("block is null".to_string()));
        }

        let number = block
            .get("number")
            .ok_or_else(|| TransportError::InvalidResponse("block has no number".to_string()))
            .and_then(parse_hex_u64)?;
        let timestamp = block
            .get("timestamp")
            .ok_or_else(|| TransportError::InvalidResponse("block has no timestamp".to_string()))
            .and_then(parse_hex_u64)?;
        let hash = block.get("hash").and_then(Value::as_str).map(str::to_string);

        Ok(Self { number, timestamp, hash })
    }
}

/// Parses a JSON-RPC hex quantity (`"0x1a"`) into a `u64`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidResponse`] if the value is not a string or not valid hex.
pub fn parse_hex_u64(value: &Value) -> Result<u64, TransportError> {
    let raw = value
        .as_str()
        .ok_or_else(|| TransportError::InvalidResponse(format!("expected hex string, got {value}")))?;
    let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")).unwrap_or(raw);
    if digits.is_empty() {
        return Err(TransportError::InvalidResponse(format!("empty hex quantity: {raw:?}")));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| TransportError::InvalidResponse(format!("invalid hex quantity {raw:?}: {e}")))
}
