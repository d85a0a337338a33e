//!
//! Types shared by the rates client, store and updater.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Errors from fetching or persisting exchange rates
#[derive(Debug, Error)]
pub enum RatesError {
	#[error("HTTP request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("unsupported coin {0}")]
	UnsupportedCoin(String),

	#[error("unsupported fiat {0}")]
	UnsupportedFiat(String),

	#[error("upstream returned no rates for a recent range")]
	EmptyRange,

	#[error("store error: {0}")]
	Store(#[from] StoreError),
}

/// Price of one coin unit in a fiat currency at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
	pub value: f64,
	pub timestamp: DateTime<Utc>,
}

impl ExchangeRate {
	pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
		Self { value, timestamp }
	}
}

/// Outcome of a historical price lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceLookup {
	/// Exact sample or interpolated between two samples.
	Found(f64),
	/// Earlier than the first sample.
	BeforeRange,
	/// Later than the last sample.
	AfterRange,
	/// No samples for the pair.
	Empty,
}

impl PriceLookup {
	/// The price, with 0 for every miss.
	pub fn value_or_zero(self) -> f64 {
		match self {
			PriceLookup::Found(value) => value,
			_ => 0.0,
		}
	}
}

/// Latest quotes: coin code to fiat code to price.
pub type LatestRates = std::collections::HashMap<String, std::collections::HashMap<String, f64>>;

/// Name of a pair's history, also its bucket name, e.g. `btcUSD`.
pub fn pair_key(coin: &str, fiat: &str) -> String {
	format!("{}{}", coin, fiat)
}
