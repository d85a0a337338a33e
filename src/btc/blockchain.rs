//! The interface UTXO accounts consume from an Electrum-style chain backend.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::{Hash, sha256};
use bitcoin::{Script, Transaction, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hex of the reversed sha256 of an output script, the Electrum subscription key.
pub type ScriptHashHex = String;

pub fn script_hash_hex(script: &Script) -> ScriptHashHex {
	let mut hash = sha256::Hash::hash(script.as_bytes()).to_byte_array();
	hash.reverse();
	hex::encode(hash)
}

/// One entry of `blockchain.scripthash.get_history`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHistoryEntry {
	pub tx_hash: Txid,
	/// Positive when mined, 0 when in the mempool with confirmed parents, -1 otherwise.
	pub height: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
	pub height: u64,
	pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum ChainError {
	#[error("connection error: {0}")]
	Connection(String),

	#[error("server error {code}: {message}")]
	Rpc { code: i64, message: String },

	#[error("invalid response: {0}")]
	InvalidResponse(String),

	#[error("request timed out")]
	Timeout,

	#[error("client closed")]
	Closed,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("decoding error: {0}")]
	Decode(#[from] bitcoin::consensus::encode::Error),
}

/// Called with the new status hash when an address history changes.
pub type StatusCallback = Arc<dyn Fn(ScriptHashHex, Option<String>) + Send + Sync>;
/// Called with every new chain tip.
pub type HeaderCallback = Arc<dyn Fn(Header) + Send + Sync>;

#[async_trait]
pub trait ChainBackend: Send + Sync {
	async fn script_hash_get_history(
		&self,
		script_hash: &str,
	) -> Result<Vec<TxHistoryEntry>, ChainError>;

	/// Subscribes to status changes of an address and returns the current status. `None` means
	/// the address has no history.
	async fn script_hash_subscribe(
		&self,
		script_hash: &str,
		on_status_change: StatusCallback,
	) -> Result<Option<String>, ChainError>;

	async fn transaction_get(&self, tx_hash: Txid) -> Result<Transaction, ChainError>;

	/// Subscribes to new chain tips and returns the current one.
	async fn headers_subscribe(&self, on_header: HeaderCallback) -> Result<Header, ChainError>;

	/// Block time of the header at `height`.
	async fn header_timestamp(&self, height: u64) -> Result<DateTime<Utc>, ChainError>;

	async fn transaction_broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;

	/// Fee rate in sat/kvB to confirm within `blocks`. `None` if the server has no estimate.
	async fn estimate_fee(&self, blocks: u32) -> Result<Option<u64>, ChainError>;

	/// Minimum relay fee rate in sat/kvB.
	async fn relay_fee(&self) -> Result<u64, ChainError>;

	async fn close(&self);
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::ScriptBuf;

	#[test]
	fn test_script_hash_is_reversed_sha256() {
		// P2PKH script of the genesis coinbase key hash, as used in the Electrum protocol docs.
		let script = ScriptBuf::from_hex("76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac").unwrap();
		assert_eq!(
			script_hash_hex(&script),
			"8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161"
		);
	}
}
