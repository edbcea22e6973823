use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: T,
}

impl<T> JsonRpcRequest<T> {
    pub fn new(id: u64, method: &'static str, params: T) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Server push frame for `eth_subscribe`.
#[derive(Debug, Deserialize)]
pub struct SubscriptionNotification {
    pub method: String,
    pub params: NotificationParams,
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    pub subscription: String,
    pub result: Value,
}

/// Parses an Ethereum hex quantity such as `0x1b4`.
pub fn parse_quantity(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

/// Block number of a header or block object.
pub fn block_number(block: &Value) -> Option<u64> {
    block.get("number")?.as_str().and_then(parse_quantity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantities_round_through_hex() {
        assert_eq!(parse_quantity("0x1b4"), Some(436));
        assert_eq!(parse_quantity("0x0"), Some(0));
        assert_eq!(parse_quantity("0x"), None);
        assert_eq!(parse_quantity("0xzz"), None);
        assert_eq!(format_quantity(436), "0x1b4");
    }

    #[test]
    fn reads_block_number_from_header() {
        assert_eq!(block_number(&json!({"number": "0x10"})), Some(16));
        assert_eq!(block_number(&json!({"number": 16})), None);
        assert_eq!(block_number(&json!({})), None);
    }

    #[test]
    fn decodes_error_responses() {
        let response: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32601, "message": "method not found"}
        }))
        .unwrap();
        assert_eq!(response.id, Some(4));
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, -32601);
    }
}
