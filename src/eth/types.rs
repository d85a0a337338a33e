//!
//! Types shared by the Ethereum clients and accounts.

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::address::{AddressError, EthAddress};

/// Confirmations after which an Ethereum transaction is final and no longer re-checked.
pub const NUM_CONFIRMATIONS_COMPLETE: u32 = 12;

/// Errors from the Ethereum node and Etherscan clients
#[derive(Debug, Error)]
pub enum EthError {
	#[error("HTTP request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("RPC error {code}: {message}")]
	Rpc { code: i64, message: String },

	#[error("API error: {0}")]
	Api(String),

	#[error("invalid response: {0}")]
	InvalidResponse(String),

	#[error("invalid address: {0}")]
	Address(#[from] AddressError),
}

/// Call arguments for `eth_estimateGas` and `eth_call`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallMsg {
	pub from: EthAddress,
	pub to: EthAddress,
	pub gas_price: Option<BigInt>,
	pub value: BigInt,
	pub data: Vec<u8>,
}

/// The parts of a transaction receipt the wallet needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
	pub block_number: u64,
	pub gas_used: u64,
	/// False when the transaction reverted (receipt status 0).
	pub success: bool,
}

/// An unsigned legacy transaction handed to the keystore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthTxRequest {
	pub chain_id: u64,
	pub nonce: u64,
	pub gas_price: BigInt,
	pub gas_limit: u64,
	pub to: EthAddress,
	pub value: BigInt,
	pub data: Vec<u8>,
}

/// An outgoing transaction we broadcast, kept until the transactions source reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
	pub hash: String,
	pub nonce: u64,
	pub from: EthAddress,
	/// The recipient. For token transfers this is the token recipient, not the contract.
	pub to: EthAddress,
	/// Value in the account's unit (wei or token base units).
	pub amount: BigInt,
	pub gas_limit: u64,
	pub gas_price: BigInt,
	/// 0 while unmined.
	pub height: u64,
	pub gas_used: u64,
	pub success: bool,
	pub created: DateTime<Utc>,
}

/// Parses a `0x` prefixed hex quantity.
pub fn parse_quantity(value: &str) -> Result<BigInt, EthError> {
	let digits = value
		.strip_prefix("0x")
		.ok_or_else(|| EthError::InvalidResponse(format!("quantity without 0x: {}", value)))?;
	if digits.is_empty() {
		return Ok(BigInt::from(0));
	}
	BigInt::parse_bytes(digits.as_bytes(), 16)
		.ok_or_else(|| EthError::InvalidResponse(format!("bad quantity {}", value)))
}

pub fn parse_quantity_u64(value: &str) -> Result<u64, EthError> {
	let digits = value
		.strip_prefix("0x")
		.ok_or_else(|| EthError::InvalidResponse(format!("quantity without 0x: {}", value)))?;
	if digits.is_empty() {
		return Ok(0);
	}
	u64::from_str_radix(digits, 16)
		.map_err(|_| EthError::InvalidResponse(format!("bad quantity {}", value)))
}

pub fn to_quantity(value: &BigInt) -> String {
	format!("0x{}", value.to_str_radix(16))
}
