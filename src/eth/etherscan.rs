//!
//! Etherscan API client: batched balances, the block number and transaction lists.
//!
//! Etherscan allows about five calls per second; calls are serialized and spaced by
//! [`CALL_INTERVAL`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use num_bigint::BigInt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::address::EthAddress;
use super::types::{EthError, NUM_CONFIRMATIONS_COMPLETE, parse_quantity_u64};
use crate::accounts::transaction::{AddressAndAmount, TransactionData, TxStatus, TxType};
use crate::coin::Amount;

pub const CALL_INTERVAL: Duration = Duration::from_millis(210);

/// Maximum number of addresses per `balancemulti` call.
pub const BALANCES_PER_CALL: usize = 20;

/// Batched balance lookups for many accounts of one chain
#[async_trait]
pub trait BalanceFetcher: Send + Sync {
	/// Balances in wei. Addresses the server does not report are missing from the map.
	async fn balances(
		&self,
		addresses: &[EthAddress],
	) -> Result<HashMap<EthAddress, BigInt>, EthError>;

	async fn block_number(&self) -> Result<u64, EthError>;
}

/// Mined transactions of an address, as reported by an indexer
#[async_trait]
pub trait TransactionsSource: Send + Sync {
	/// Transactions of `address` up to `end_block`, newest first. With `erc20_token` only
	/// transfers of that token are returned.
	async fn transactions(
		&self,
		address: &EthAddress,
		end_block: u64,
		erc20_token: Option<&EthAddress>,
	) -> Result<Vec<TransactionData>, EthError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
	#[serde(default)]
	status: String,
	#[serde(default)]
	message: String,
	#[serde(default)]
	result: Value,
}

#[derive(Debug, Deserialize)]
struct AccountBalance {
	account: String,
	balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiTransaction {
	hash: String,
	block_number: String,
	time_stamp: String,
	#[serde(default)]
	nonce: String,
	from: String,
	#[serde(default)]
	to: String,
	#[serde(default)]
	contract_address: String,
	value: String,
	gas_used: String,
	gas_price: String,
	#[serde(default)]
	confirmations: String,
	#[serde(default)]
	is_error: String,
}

fn parse_decimal(field: &str, value: &str) -> Result<BigInt, EthError> {
	BigInt::parse_bytes(value.as_bytes(), 10)
		.ok_or_else(|| EthError::InvalidResponse(format!("bad {}: {:?}", field, value)))
}

fn parse_decimal_u64(field: &str, value: &str) -> Result<u64, EthError> {
	value
		.parse()
		.map_err(|_| EthError::InvalidResponse(format!("bad {}: {:?}", field, value)))
}

impl ApiResponse {
	/// The result list. "No transactions found" comes with status 0 and an empty list.
	fn into_list(self) -> Result<Vec<Value>, EthError> {
		match self.result {
			Value::Array(items) => Ok(items),
			Value::String(reason) if self.status != "1" => {
				Err(EthError::Api(format!("{}: {}", self.message, reason)))
			}
			other => Err(EthError::InvalidResponse(format!("unexpected result {}", other))),
		}
	}
}

fn parse_balances(response: ApiResponse) -> Result<HashMap<EthAddress, BigInt>, EthError> {
	let mut balances = HashMap::new();
	for item in response.into_list()? {
		let entry: AccountBalance = serde_json::from_value(item)?;
		balances.insert(
			entry.account.parse::<EthAddress>()?,
			parse_decimal("balance", &entry.balance)?,
		);
	}
	Ok(balances)
}

/// Converts the list for `ours` into transactions. Self sends show up twice and are
/// deduplicated.
fn parse_transactions(
	response: ApiResponse,
	ours: &EthAddress,
	erc20: bool,
) -> Result<Vec<TransactionData>, EthError> {
	let mut seen = HashSet::new();
	let mut transactions = Vec::new();
	for item in response.into_list()? {
		let tx: ApiTransaction = serde_json::from_value(item)?;
		if !seen.insert(tx.hash.clone()) {
			continue;
		}
		let from: EthAddress = tx.from.parse()?;
		let to: EthAddress = match (tx.to.as_str(), tx.contract_address.as_str()) {
			("", "") => {
				return Err(EthError::InvalidResponse(format!(
					"transaction {} has neither recipient nor contract",
					tx.hash
				)));
			}
			("", contract) => contract.parse()?,
			(to, _) => to.parse()?,
		};
		let tx_type = match (from == *ours, to == *ours) {
			(true, true) => TxType::SendSelf,
			(true, false) => TxType::Send,
			(false, true) => TxType::Receive,
			(false, false) => {
				return Err(EthError::InvalidResponse(format!(
					"transaction {} does not belong to {}",
					tx.hash, ours
				)));
			}
		};

		let amount = Amount::new(parse_decimal("value", &tx.value)?);
		let gas_used = parse_decimal_u64("gasUsed", &tx.gas_used)?;
		let fee = BigInt::from(gas_used) * parse_decimal("gasPrice", &tx.gas_price)?;
		let timestamp_secs = parse_decimal_u64("timeStamp", &tx.time_stamp)?;
		let confirmations = if tx.confirmations.is_empty() {
			0
		} else {
			parse_decimal_u64("confirmations", &tx.confirmations)?
		};
		let nonce = if tx.nonce.is_empty() {
			None
		} else {
			Some(parse_decimal_u64("nonce", &tx.nonce)?)
		};

		transactions.push(TransactionData {
			tx_id: tx.hash.clone(),
			internal_id: tx.hash,
			tx_type,
			status: if tx.is_error == "1" {
				TxStatus::Failed
			} else {
				TxStatus::Confirmed
			},
			addresses: vec![AddressAndAmount {
				address: to.to_checksum(),
				amount: amount.clone(),
				ours: to == *ours,
			}],
			amount,
			fee: Some(Amount::new(fee)),
			fee_is_different_unit: erc20,
			timestamp: DateTime::from_timestamp(timestamp_secs as i64, 0),
			created_timestamp: None,
			height: parse_decimal_u64("blockNumber", &tx.block_number)? as i64,
			num_confirmations: u32::try_from(confirmations).unwrap_or(u32::MAX),
			num_confirmations_complete: NUM_CONFIRMATIONS_COMPLETE,
			gas: Some(gas_used),
			nonce,
			..Default::default()
		});
	}
	Ok(transactions)
}

/// Rate limited Etherscan client for one chain
pub struct EtherScan {
	http_client: Client,
	url: String,
	api_key: Option<String>,
	chain_id: u64,
	last_call: Mutex<Option<Instant>>,
}

impl EtherScan {
	/// Create a new client.
	///
	/// # Arguments
	/// * `url` - The API endpoint, e.g. `https://api.etherscan.io/v2/api`.
	/// * `api_key` - Optional API key.
	/// * `chain_id` - Chain the client is scoped to.
	pub fn new(url: impl Into<String>, api_key: Option<String>, chain_id: u64) -> Result<Self, EthError> {
		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;
		Ok(Self {
			http_client,
			url: url.into(),
			api_key,
			chain_id,
			last_call: Mutex::new(None),
		})
	}

	pub fn chain_id(&self) -> u64 {
		self.chain_id
	}

	async fn call<T: for<'de> Deserialize<'de>>(&self, params: &[(&str, String)]) -> Result<T, EthError> {
		let mut last_call = self.last_call.lock().await;
		if let Some(last) = *last_call {
			tokio::time::sleep_until(last + CALL_INTERVAL).await;
		}
		let mut query: Vec<(&str, String)> = vec![("chainid", self.chain_id.to_string())];
		query.extend(params.iter().cloned());
		if let Some(api_key) = &self.api_key {
			query.push(("apikey", api_key.clone()));
		}
		debug!(action = ?params.iter().find(|(key, _)| *key == "action"), "Etherscan request");
		let result = async {
			self.http_client
				.get(&self.url)
				.query(&query)
				.send()
				.await?
				.error_for_status()?
				.json::<T>()
				.await
		}
		.await;
		*last_call = Some(Instant::now());
		Ok(result?)
	}
}

#[async_trait]
impl BalanceFetcher for EtherScan {
	async fn balances(
		&self,
		addresses: &[EthAddress],
	) -> Result<HashMap<EthAddress, BigInt>, EthError> {
		let mut balances = HashMap::with_capacity(addresses.len());
		for chunk in addresses.chunks(BALANCES_PER_CALL) {
			let joined = chunk
				.iter()
				.map(|address| address.to_lower_hex())
				.collect::<Vec<_>>()
				.join(",");
			let response: ApiResponse = self
				.call(&[
					("module", "account".to_string()),
					("action", "balancemulti".to_string()),
					("tag", "latest".to_string()),
					("address", joined),
				])
				.await?;
			balances.extend(parse_balances(response)?);
		}
		Ok(balances)
	}

	async fn block_number(&self) -> Result<u64, EthError> {
		let response: Value = self
			.call(&[
				("module", "proxy".to_string()),
				("action", "eth_blockNumber".to_string()),
			])
			.await?;
		let result = response
			.get("result")
			.and_then(Value::as_str)
			.ok_or_else(|| EthError::InvalidResponse(format!("unexpected block number {}", response)))?;
		parse_quantity_u64(result)
	}
}

#[async_trait]
impl TransactionsSource for EtherScan {
	async fn transactions(
		&self,
		address: &EthAddress,
		end_block: u64,
		erc20_token: Option<&EthAddress>,
	) -> Result<Vec<TransactionData>, EthError> {
		let mut params = vec![("module", "account".to_string())];
		match erc20_token {
			Some(token) => {
				params.push(("action", "tokentx".to_string()));
				params.push(("contractaddress", token.to_lower_hex()));
			}
			None => params.push(("action", "txlist".to_string())),
		}
		params.extend([
			("startblock", "0".to_string()),
			("endblock", end_block.to_string()),
			("sort", "desc".to_string()),
			("address", address.to_lower_hex()),
		]);
		let response: ApiResponse = self.call(&params).await?;
		parse_transactions(response, address, erc20_token.is_some())
	}
}
