//!
//! Ethereum JSON-RPC client over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigInt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::address::EthAddress;
use super::client::{EthClient, erc20_balance_of_data, parse_uint256};
use super::types::{
	CallMsg, EthError, TxReceipt, parse_quantity, parse_quantity_u64, to_quantity,
};

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
	code: i64,
	message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
	#[serde(default)]
	result: Option<Value>,
	#[serde(default)]
	error: Option<RpcErrorObject>,
}

impl RpcResponse {
	fn into_result(self) -> Result<Value, EthError> {
		if let Some(error) = self.error {
			return Err(EthError::Rpc {
				code: error.code,
				message: error.message,
			});
		}
		Ok(self.result.unwrap_or(Value::Null))
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
	block_number: Option<String>,
	gas_used: String,
	status: Option<String>,
}

impl TryFrom<RawReceipt> for TxReceipt {
	type Error = EthError;

	fn try_from(raw: RawReceipt) -> Result<Self, Self::Error> {
		Ok(TxReceipt {
			block_number: raw
				.block_number
				.as_deref()
				.map(parse_quantity_u64)
				.transpose()?
				.unwrap_or(0),
			gas_used: parse_quantity_u64(&raw.gas_used)?,
			// Pre-Byzantium receipts have no status and are treated as successful.
			success: raw.status.as_deref() != Some("0x0"),
		})
	}
}

fn call_object(call: &CallMsg) -> Value {
	let mut object = json!({
		"from": call.from.to_lower_hex(),
		"to": call.to.to_lower_hex(),
		"value": to_quantity(&call.value),
		"data": format!("0x{}", hex::encode(&call.data)),
	});
	if let Some(gas_price) = &call.gas_price {
		object["gasPrice"] = Value::String(to_quantity(gas_price));
	}
	object
}

fn expect_str(value: &Value) -> Result<&str, EthError> {
	value
		.as_str()
		.ok_or_else(|| EthError::InvalidResponse(format!("expected a string, got {}", value)))
}

fn decode_hex_data(value: &str) -> Result<Vec<u8>, EthError> {
	hex::decode(value.trim_start_matches("0x"))
		.map_err(|e| EthError::InvalidResponse(format!("bad hex data: {}", e)))
}

/// JSON-RPC client of an Ethereum node
#[derive(Debug)]
pub struct RpcClient {
	http_client: Client,
	url: String,
	next_id: AtomicU64,
}

impl RpcClient {
	/// Create a new client for the node at `url`.
	///
	/// # Arguments
	/// * `url` - HTTP endpoint of the node.
	///
	/// # Returns
	/// The client, or an error if the HTTP client can't be built.
	pub fn new(url: impl Into<String>) -> Result<Self, EthError> {
		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;
		Ok(Self {
			http_client,
			url: url.into(),
			next_id: AtomicU64::new(1),
		})
	}

	/// Execute one JSON-RPC call.
	///
	/// # Arguments
	/// * `method` - The RPC method name.
	/// * `params` - Positional parameters.
	///
	/// # Returns
	/// The `result` member, or the node's error.
	pub async fn call(&self, method: &str, params: Value) -> Result<Value, EthError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let request = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});
		debug!(method, id, "Ethereum RPC request");
		let response: RpcResponse = self
			.http_client
			.post(&self.url)
			.json(&request)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		response.into_result()
	}
}

#[async_trait]
impl EthClient for RpcClient {
	async fn block_number(&self) -> Result<u64, EthError> {
		let result = self.call("eth_blockNumber", json!([])).await?;
		parse_quantity_u64(expect_str(&result)?)
	}

	async fn balance_at(
		&self,
		address: &EthAddress,
		block_number: Option<u64>,
	) -> Result<BigInt, EthError> {
		let block = match block_number {
			Some(number) => to_quantity(&BigInt::from(number)),
			None => "latest".to_string(),
		};
		let result = self
			.call("eth_getBalance", json!([address.to_lower_hex(), block]))
			.await?;
		parse_quantity(expect_str(&result)?)
	}

	async fn pending_nonce_at(&self, address: &EthAddress) -> Result<u64, EthError> {
		let result = self
			.call("eth_getTransactionCount", json!([address.to_lower_hex(), "pending"]))
			.await?;
		parse_quantity_u64(expect_str(&result)?)
	}

	async fn suggest_gas_price(&self) -> Result<BigInt, EthError> {
		let result = self.call("eth_gasPrice", json!([])).await?;
		parse_quantity(expect_str(&result)?)
	}

	async fn estimate_gas(&self, call: &CallMsg) -> Result<u64, EthError> {
		let result = self.call("eth_estimateGas", json!([call_object(call)])).await?;
		parse_quantity_u64(expect_str(&result)?)
	}

	async fn erc20_balance(&self, owner: &EthAddress, token: &EthAddress) -> Result<BigInt, EthError> {
		let call = json!({
			"to": token.to_lower_hex(),
			"data": format!("0x{}", hex::encode(erc20_balance_of_data(owner))),
		});
		let result = self.call("eth_call", json!([call, "latest"])).await?;
		parse_uint256(&decode_hex_data(expect_str(&result)?)?)
	}

	async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, EthError> {
		let result = self
			.call("eth_sendRawTransaction", json!([format!("0x{}", hex::encode(raw))]))
			.await?;
		Ok(expect_str(&result)?.to_string())
	}

	async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, EthError> {
		let result = self
			.call("eth_getTransactionReceipt", json!([tx_hash]))
			.await?;
		if result.is_null() {
			return Ok(None);
		}
		let raw: RawReceipt = serde_json::from_value(result)?;
		Ok(Some(raw.try_into()?))
	}
}
