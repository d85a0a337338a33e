//! Wire types of the Electrum JSON-RPC protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::btc::blockchain::{ChainError, TxHistoryEntry};

/// Outgoing request. One per line on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
	pub jsonrpc: &'static str,
	pub id: u64,
	pub method: &'a str,
	pub params: Vec<Value>,
}

impl<'a> Request<'a> {
	pub fn new(id: u64, method: &'a str, params: Vec<Value>) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			method,
			params,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
	#[serde(default)]
	pub code: i64,
	#[serde(default)]
	pub message: String,
}

/// Anything the server sends: a response to one of our requests, or a subscription notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Incoming {
	pub id: Option<u64>,
	pub result: Option<Value>,
	pub error: Option<Value>,
	pub method: Option<String>,
	#[serde(default)]
	pub params: Vec<Value>,
}

impl Incoming {
	/// Converts a response into its result or the server error.
	pub fn into_result(self) -> Result<Value, ChainError> {
		if let Some(error) = self.error {
			if error.is_null() {
				return Ok(self.result.unwrap_or(Value::Null));
			}
			return Err(match serde_json::from_value::<RpcErrorObject>(error.clone()) {
				Ok(object) => ChainError::Rpc {
					code: object.code,
					message: object.message,
				},
				Err(_) => ChainError::Rpc {
					code: 0,
					message: error.to_string(),
				},
			});
		}
		Ok(self.result.unwrap_or(Value::Null))
	}
}

/// Item of `blockchain.scripthash.get_history`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryItem {
	pub tx_hash: String,
	pub height: i64,
}

impl TryFrom<HistoryItem> for TxHistoryEntry {
	type Error = ChainError;

	fn try_from(item: HistoryItem) -> Result<Self, Self::Error> {
		Ok(TxHistoryEntry {
			tx_hash: item
				.tx_hash
				.parse()
				.map_err(|_| ChainError::InvalidResponse(format!("bad tx hash {}", item.tx_hash)))?,
			height: item.height,
		})
	}
}

/// Result of `blockchain.headers.subscribe` and payload of its notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderNotification {
	pub height: u64,
	/// Hex of the 80 byte block header.
	pub hex: String,
}

pub mod methods {
	pub const SCRIPTHASH_GET_HISTORY: &str = "blockchain.scripthash.get_history";
	pub const SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
	pub const TRANSACTION_GET: &str = "blockchain.transaction.get";
	pub const TRANSACTION_BROADCAST: &str = "blockchain.transaction.broadcast";
	pub const HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";
	pub const BLOCK_HEADER: &str = "blockchain.block.header";
	pub const ESTIMATE_FEE: &str = "blockchain.estimatefee";
	pub const RELAY_FEE: &str = "blockchain.relayfee";
	pub const SERVER_VERSION: &str = "server.version";
}

/// Converts a BTC/kvB float as returned by the server to sat/kvB.
pub fn btc_per_kb_to_sat(value: f64) -> u64 {
	(value * 100_000_000.0).round() as u64
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_incoming_response_and_error() {
		let ok: Incoming = serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "result": 0.0001})).unwrap();
		assert_eq!(ok.id, Some(3));
		assert_eq!(ok.into_result().unwrap(), json!(0.0001));

		let failed: Incoming = serde_json::from_value(json!({
			"jsonrpc": "2.0",
			"id": 4,
			"error": {"code": 2, "message": "missing transaction"}
		}))
		.unwrap();
		match failed.into_result() {
			Err(ChainError::Rpc { code, message }) => {
				assert_eq!(code, 2);
				assert_eq!(message, "missing transaction");
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn test_notification() {
		let notification: Incoming = serde_json::from_value(json!({
			"jsonrpc": "2.0",
			"method": "blockchain.scripthash.subscribe",
			"params": ["abcd", "status"]
		}))
		.unwrap();
		assert!(notification.id.is_none());
		assert_eq!(notification.method.as_deref(), Some(methods::SCRIPTHASH_SUBSCRIBE));
	}

	#[test]
	fn test_fee_conversion() {
		assert_eq!(btc_per_kb_to_sat(0.00001), 1000);
		assert_eq!(btc_per_kb_to_sat(0.0002345), 23_450);
	}
}
