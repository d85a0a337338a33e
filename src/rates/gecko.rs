//!
//! CoinGecko client for latest and historical exchange rates.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::types::{ExchangeRate, LatestRates, RatesError};

pub const COINGECKO_API_V3: &str = "https://api.coingecko.com/api/v3";

/// Minimal interval between two API calls. The public API allows about 30 calls per minute.
pub const RATE_LIMIT: Duration = Duration::from_secs(2);

/// Coin codes and their CoinGecko ids. Testnet coins are priced as their mainnet coin.
const GECKO_COINS: &[(&str, &str)] = &[
	("btc", "bitcoin"),
	("ltc", "litecoin"),
	("eth", "ethereum"),
	("tbtc", "bitcoin"),
	("rbtc", "bitcoin"),
	("tltc", "litecoin"),
	("sepeth", "ethereum"),
	("eth-erc20-bat", "basic-attention-token"),
	("eth-erc20-dai0x6b17", "dai"),
	("eth-erc20-link", "chainlink"),
	("eth-erc20-mkr", "maker"),
	("eth-erc20-usdc", "usd-coin"),
	("eth-erc20-usdt", "tether"),
	("eth-erc20-zrx", "0x"),
];

/// Fiat codes and their CoinGecko `vs_currency`.
const GECKO_FIATS: &[(&str, &str)] = &[
	("USD", "usd"),
	("EUR", "eur"),
	("CHF", "chf"),
	("GBP", "gbp"),
	("JPY", "jpy"),
	("KRW", "krw"),
	("CNY", "cny"),
	("RUB", "rub"),
	("CAD", "cad"),
	("AUD", "aud"),
	("ILS", "ils"),
	("BTC", "btc"),
];

pub fn gecko_coin(code: &str) -> Option<&'static str> {
	GECKO_COINS.iter().find(|(coin, _)| *coin == code).map(|(_, id)| *id)
}

pub fn gecko_fiat(code: &str) -> Option<&'static str> {
	GECKO_FIATS.iter().find(|(fiat, _)| *fiat == code).map(|(_, id)| *id)
}

pub fn supported_coins() -> impl Iterator<Item = &'static str> {
	GECKO_COINS.iter().map(|(coin, _)| *coin)
}

pub fn supported_fiats() -> impl Iterator<Item = &'static str> {
	GECKO_FIATS.iter().map(|(fiat, _)| *fiat)
}

/// Upstream of exchange rates
#[async_trait]
pub trait RatesSource: Send + Sync {
	/// Current prices of every supported coin in every supported fiat.
	async fn latest(&self) -> Result<LatestRates, RatesError>;

	/// Samples of `coin` in `fiat` between `start` and `end`, ascending.
	async fn market_range(
		&self,
		coin: &str,
		fiat: &str,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<Vec<ExchangeRate>, RatesError>;
}

#[derive(Debug, Deserialize)]
struct MarketChart {
	/// `[unix millis, price]`, ascending.
	prices: Vec<(f64, f64)>,
}

/// Turns `simple/price` ids back into coin codes. Several codes may share an id.
fn latest_from_simple_price(prices: HashMap<String, HashMap<String, f64>>) -> LatestRates {
	let mut latest = LatestRates::new();
	for (coin, id) in GECKO_COINS {
		let Some(quotes) = prices.get(*id) else {
			continue;
		};
		let coin_quotes = latest.entry(coin.to_string()).or_default();
		for (fiat, vs_currency) in GECKO_FIATS {
			if let Some(price) = quotes.get(*vs_currency) {
				coin_quotes.insert(fiat.to_string(), *price);
			}
		}
	}
	latest
}

fn rates_from_market_chart(chart: MarketChart) -> Vec<ExchangeRate> {
	chart
		.prices
		.into_iter()
		.filter_map(|(millis, price)| {
			// Second precision, like the stored history.
			DateTime::from_timestamp(millis as i64 / 1000, 0)
				.map(|timestamp| ExchangeRate::new(price, timestamp))
		})
		.collect()
}

/// Rate limited CoinGecko client
pub struct GeckoClient {
	http_client: Client,
	url: String,
	last_call: Mutex<Option<Instant>>,
}

impl GeckoClient {
	/// Create a new client.
	///
	/// # Arguments
	/// * `url` - API base, e.g. [`COINGECKO_API_V3`].
	pub fn new(url: impl Into<String>) -> Result<Self, RatesError> {
		let http_client = Client::builder().timeout(Duration::from_secs(60)).build()?;
		Ok(Self {
			http_client,
			url: url.into().trim_end_matches('/').to_string(),
			last_call: Mutex::new(None),
		})
	}

	async fn get<T: for<'de> Deserialize<'de>>(
		&self,
		path: &str,
		query: &[(&str, String)],
	) -> Result<T, RatesError> {
		let mut last_call = self.last_call.lock().await;
		if let Some(last) = *last_call {
			tokio::time::sleep_until(last + RATE_LIMIT).await;
		}
		debug!(path, "CoinGecko request");
		let result = async {
			self.http_client
				.get(format!("{}{}", self.url, path))
				.query(query)
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
impl RatesSource for GeckoClient {
	async fn latest(&self) -> Result<LatestRates, RatesError> {
		let mut ids: Vec<&str> = GECKO_COINS.iter().map(|(_, id)| *id).collect();
		ids.sort_unstable();
		ids.dedup();
		let vs_currencies: Vec<&str> = GECKO_FIATS.iter().map(|(_, id)| *id).collect();
		let prices: HashMap<String, HashMap<String, f64>> = self
			.get(
				"/simple/price",
				&[("ids", ids.join(",")), ("vs_currencies", vs_currencies.join(","))],
			)
			.await?;
		Ok(latest_from_simple_price(prices))
	}

	async fn market_range(
		&self,
		coin: &str,
		fiat: &str,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<Vec<ExchangeRate>, RatesError> {
		let id = gecko_coin(coin).ok_or_else(|| RatesError::UnsupportedCoin(coin.to_string()))?;
		let vs_currency =
			gecko_fiat(fiat).ok_or_else(|| RatesError::UnsupportedFiat(fiat.to_string()))?;
		let chart: MarketChart = self
			.get(
				&format!("/coins/{}/market_chart/range", id),
				&[
					("vs_currency", vs_currency.to_string()),
					("from", start.timestamp().to_string()),
					("to", end.timestamp().to_string()),
				],
			)
			.await?;
		Ok(rates_from_market_chart(chart))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_lookup_tables() {
		assert_eq!(gecko_coin("tbtc"), Some("bitcoin"));
		assert_eq!(gecko_coin("eth-erc20-usdt"), Some("tether"));
		assert_eq!(gecko_coin("BTC"), None);
		assert_eq!(gecko_fiat("CHF"), Some("chf"));
		assert_eq!(gecko_fiat("usd"), None);
		assert_eq!(supported_fiats().count(), 12);
	}

	#[test]
	fn test_latest_maps_ids_to_codes() {
		let prices: HashMap<String, HashMap<String, f64>> = serde_json::from_value(json!({
			"bitcoin": {"usd": 10000.5, "chf": 9000.0},
			"ethereum": {"usd": 350.0},
		}))
		.unwrap();
		let latest = latest_from_simple_price(prices);
		assert_eq!(latest["btc"]["USD"], 10000.5);
		assert_eq!(latest["tbtc"]["CHF"], 9000.0);
		assert_eq!(latest["eth"]["USD"], 350.0);
		assert!(!latest["eth"].contains_key("EUR"));
		assert!(!latest.contains_key("ltc"));
	}

	#[test]
	fn test_market_chart() {
		let chart: MarketChart = serde_json::from_value(json!({
			"prices": [[1598918700000.0, 10000.0], [1598922501000.0, 10001.0]],
			"market_caps": [],
		}))
		.unwrap();
		let rates = rates_from_market_chart(chart);
		assert_eq!(rates.len(), 2);
		assert_eq!(rates[0].timestamp.timestamp(), 1_598_918_700);
		assert_eq!(rates[1].value, 10001.0);
	}

	#[tokio::test]
	async fn test_unsupported_pair() {
		let client = GeckoClient::new("http://127.0.0.1:9").unwrap();
		let now = Utc::now();
		assert!(matches!(
			client.market_range("doge", "USD", now, now).await,
			Err(RatesError::UnsupportedCoin(_))
		));
		assert!(matches!(
			client.market_range("btc", "XYZ", now, now).await,
			Err(RatesError::UnsupportedFiat(_))
		));
	}
}
