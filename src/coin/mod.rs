//! Coin descriptors shared by all account kinds.

pub mod amount;

pub use amount::{Amount, AmountError, SendAmount};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chain family a coin belongs to. Accounts dispatch on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinFamily {
	Btc,
	Eth,
}

/// An ERC-20 token living on an Ethereum chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Erc20Token {
	/// Lowercase 0x-prefixed contract address.
	pub contract_address: String,
	pub decimals: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
	/// Code used as key everywhere, e.g. `btc`, `tbtc`, `eth`, `eth-erc20-usdt`.
	pub code: String,
	/// Unit shown to the user, e.g. `BTC`, `ETH`, `USDT`.
	pub unit: String,
	pub decimals: u32,
	pub family: CoinFamily,
	/// Chain id for Ethereum coins.
	pub chain_id: Option<u64>,
	pub erc20: Option<Erc20Token>,
}

impl Coin {
	pub fn btc() -> Self {
		Self {
			code: "btc".to_string(),
			unit: "BTC".to_string(),
			decimals: 8,
			family: CoinFamily::Btc,
			chain_id: None,
			erc20: None,
		}
	}

	pub fn tbtc() -> Self {
		Self {
			code: "tbtc".to_string(),
			unit: "TBTC".to_string(),
			..Self::btc()
		}
	}

	pub fn eth() -> Self {
		Self {
			code: "eth".to_string(),
			unit: "ETH".to_string(),
			decimals: 18,
			family: CoinFamily::Eth,
			chain_id: Some(1),
			erc20: None,
		}
	}

	pub fn erc20(code: &str, unit: &str, contract_address: &str, decimals: u32) -> Self {
		Self {
			code: code.to_string(),
			unit: unit.to_string(),
			decimals,
			family: CoinFamily::Eth,
			chain_id: Some(1),
			erc20: Some(Erc20Token {
				contract_address: contract_address.to_lowercase(),
				decimals,
			}),
		}
	}

	pub fn is_erc20(&self) -> bool {
		self.erc20.is_some()
	}

	/// Unit of the fee. ERC-20 fees are paid in the chain's native coin.
	pub fn fee_unit(&self) -> &str {
		if self.is_erc20() { "ETH" } else { &self.unit }
	}

	/// Code used to look up exchange rates, e.g. `tbtc` is priced as `btc`.
	pub fn rates_code(&self) -> &str {
		match self.code.as_str() {
			"tbtc" | "rbtc" => "btc",
			"sepeth" | "goeth" => "eth",
			code => code,
		}
	}

	/// Name of the unit amounts are stored in.
	pub fn smallest_unit(&self) -> &'static str {
		match self.family {
			CoinFamily::Btc => "sat",
			CoinFamily::Eth => "wei",
		}
	}

	pub fn format_amount(&self, amount: &Amount) -> String {
		amount.format(self.decimals)
	}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized fee target code: {0}")]
pub struct UnknownFeeTarget(pub String);

/// Requested confirmation speed for a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTargetCode {
	Low,
	Economy,
	#[default]
	Normal,
	High,
	Custom,
}

impl FeeTargetCode {
	pub const ALL_ESTIMATED: [FeeTargetCode; 4] = [
		FeeTargetCode::Low,
		FeeTargetCode::Economy,
		FeeTargetCode::Normal,
		FeeTargetCode::High,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			FeeTargetCode::Low => "low",
			FeeTargetCode::Economy => "economy",
			FeeTargetCode::Normal => "normal",
			FeeTargetCode::High => "high",
			FeeTargetCode::Custom => "custom",
		}
	}
}

impl FromStr for FeeTargetCode {
	type Err = UnknownFeeTarget;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"" | "normal" => Ok(FeeTargetCode::Normal),
			"low" => Ok(FeeTargetCode::Low),
			"economy" => Ok(FeeTargetCode::Economy),
			"high" => Ok(FeeTargetCode::High),
			"custom" => Ok(FeeTargetCode::Custom),
			other => Err(UnknownFeeTarget(other.to_string())),
		}
	}
}

impl fmt::Display for FeeTargetCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
