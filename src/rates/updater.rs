//!
//! Keeps the latest exchange rates and per-pair histories up to date.
//!
//! Every enabled pair runs two tasks. The forward task extends the history towards the present
//! every few minutes; the backfill task walks from the earliest sample back in time until the
//! upstream has no older data. The forward task retries failures every second, the backfill
//! with exponential backoff. Both stop when the pair is disabled or the updater is stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Constant;
use backoff::future::retry;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::gecko::{COINGECKO_API_V3, RatesSource, gecko_coin, gecko_fiat};
use super::history::{
	backfill_exhausted, backfill_range, forward_range, merge, price_at,
};
use super::store::{HistoryEncoding, HistoryRepository};
use super::types::{ExchangeRate, LatestRates, PriceLookup, RatesError, pair_key};
use crate::observable::{Event, EventsBus, RatesEvent};
use crate::shutdown::ShutdownSignal;

/// Rates configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatesConfig {
	pub coingecko_url: String,
	/// Fiat codes histories are kept for, e.g. `USD`.
	pub fiats: Vec<String>,
	/// Coin codes histories are kept for.
	pub history_coins: Vec<String>,
	/// Seconds between two polls of the latest rates.
	pub latest_interval_secs: u64,
	/// Seconds between two forward history updates of a pair.
	pub history_interval_secs: u64,
	pub history_encoding: HistoryEncoding,
}

impl Default for RatesConfig {
	fn default() -> Self {
		Self {
			coingecko_url: COINGECKO_API_V3.to_string(),
			fiats: vec!["USD".to_string(), "EUR".to_string(), "CHF".to_string()],
			history_coins: vec!["btc".to_string(), "eth".to_string()],
			latest_interval_secs: 5 * 60,
			history_interval_secs: 10 * 60,
			history_encoding: HistoryEncoding::default(),
		}
	}
}

/// Pause between two attempts of a failed forward update.
const FORWARD_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Retry policy of backfill requests: 1s doubling up to one minute, forever.
fn backfill_backoff() -> ExponentialBackoff {
	ExponentialBackoff {
		initial_interval: Duration::from_secs(1),
		max_interval: Duration::from_secs(60),
		max_elapsed_time: None,
		..Default::default()
	}
}

struct Inner {
	source: Arc<dyn RatesSource>,
	repository: Option<HistoryRepository>,
	events: EventsBus,
	latest_interval: Duration,
	history_interval: Duration,
	last: RwLock<LatestRates>,
	history: RwLock<HashMap<String, Vec<ExchangeRate>>>,
	/// Stop signal of each enabled pair's tasks.
	history_tasks: Mutex<HashMap<String, ShutdownSignal>>,
	quit: ShutdownSignal,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RateUpdater {
	inner: Arc<Inner>,
}

impl RateUpdater {
	/// Without a repository histories live in memory only.
	pub fn new(
		source: Arc<dyn RatesSource>,
		repository: Option<HistoryRepository>,
		events: EventsBus,
		config: &RatesConfig,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				source,
				repository,
				events,
				latest_interval: Duration::from_secs(config.latest_interval_secs.max(1)),
				history_interval: Duration::from_secs(config.history_interval_secs.max(1)),
				last: RwLock::new(LatestRates::new()),
				history: RwLock::new(HashMap::new()),
				history_tasks: Mutex::new(HashMap::new()),
				quit: ShutdownSignal::new(),
			}),
		}
	}

	/// Snapshot of the latest quotes.
	pub fn last(&self) -> LatestRates {
		self.inner.last.read().clone()
	}

	/// Historical price of `coin` in `fiat` at `at`, interpolated between samples. 0 when
	/// there is no sample around `at`; see [`RateUpdater::price_at_checked`] to tell why.
	pub fn price_at(&self, coin: &str, fiat: &str, at: DateTime<Utc>) -> f64 {
		self.price_at_checked(coin, fiat, at).value_or_zero()
	}

	pub fn price_at_checked(&self, coin: &str, fiat: &str, at: DateTime<Utc>) -> PriceLookup {
		let history = self.inner.history.read();
		match history.get(&pair_key(coin, fiat)) {
			Some(rates) => price_at(rates, at),
			None => PriceLookup::Empty,
		}
	}

	pub fn history_latest_timestamp(&self, coin: &str, fiat: &str) -> Option<DateTime<Utc>> {
		self.inner
			.history
			.read()
			.get(&pair_key(coin, fiat))
			.and_then(|rates| rates.last())
			.map(|rate| rate.timestamp)
	}

	pub fn history_earliest_timestamp(&self, coin: &str, fiat: &str) -> Option<DateTime<Utc>> {
		self.inner
			.history
			.read()
			.get(&pair_key(coin, fiat))
			.and_then(|rates| rates.first())
			.map(|rate| rate.timestamp)
	}

	/// The latest time for which rates of all `coins` are known: the earliest of their latest
	/// timestamps. `None` if any coin has no history.
	pub fn history_latest_timestamp_all(&self, coins: &[&str], fiat: &str) -> Option<DateTime<Utc>> {
		let mut result: Option<DateTime<Utc>> = None;
		for coin in coins {
			let latest = self.history_latest_timestamp(coin, fiat)?;
			result = Some(result.map_or(latest, |current| current.min(latest)));
		}
		result
	}

	/// Starts the history tasks of a pair unless they already run. Persisted samples are loaded
	/// first.
	pub fn enable_history_pair(&self, coin: &str, fiat: &str) -> Result<(), RatesError> {
		if gecko_coin(coin).is_none() {
			return Err(RatesError::UnsupportedCoin(coin.to_string()));
		}
		if gecko_fiat(fiat).is_none() {
			return Err(RatesError::UnsupportedFiat(fiat.to_string()));
		}
		let key = pair_key(coin, fiat);
		let stop = {
			let mut tasks = self.inner.history_tasks.lock();
			if tasks.contains_key(&key) {
				return Ok(());
			}
			let stop = ShutdownSignal::new();
			tasks.insert(key.clone(), stop.clone());
			stop
		};

		if let Some(repository) = &self.inner.repository {
			match repository.load(&key) {
				Ok(rates) if !rates.is_empty() => {
					debug!(pair = %key, count = rates.len(), "Loaded rate history");
					let mut history = self.inner.history.write();
					let entry = history.entry(key.clone()).or_default();
					merge(entry, rates);
					entry.dedup_by_key(|rate| rate.timestamp);
				}
				Ok(_) => {}
				// The history is refetched.
				Err(e) => error!(pair = %key, "Failed to load rate history: {}", e),
			}
		}

		info!(pair = %key, "Enabling rate history");
		tokio::spawn(self.clone().forward_loop(coin.to_string(), fiat.to_string(), stop.clone()));
		tokio::spawn(self.clone().backfill_loop(coin.to_string(), fiat.to_string(), stop));
		Ok(())
	}

	/// Stops every history task, then enables exactly the pairs of `coins` × `fiats`.
	/// Unsupported codes are logged and skipped.
	pub fn reconfigure_history(&self, coins: &[String], fiats: &[String]) {
		info!(?coins, ?fiats, "Reconfiguring rate history");
		self.stop_all_history();
		for coin in coins {
			for fiat in fiats {
				if let Err(e) = self.enable_history_pair(coin, fiat) {
					error!("Not enabling rate history {}/{}: {}", coin, fiat, e);
				}
			}
		}
	}

	/// Returns before the tasks exited.
	pub fn stop_all_history(&self) {
		for (key, stop) in self.inner.history_tasks.lock().drain() {
			debug!(pair = %key, "Stopping rate history");
			stop.send();
		}
	}

	pub fn enabled_pairs(&self) -> Vec<String> {
		let mut pairs: Vec<String> = self.inner.history_tasks.lock().keys().cloned().collect();
		pairs.sort();
		pairs
	}

	/// Fetches a range and merges it into the history. Returns the number of fetched samples.
	pub async fn update_history(
		&self,
		coin: &str,
		fiat: &str,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<usize, RatesError> {
		let fetched = self.inner.source.market_range(coin, fiat, start, end).await?;
		let count = fetched.len();
		let key = pair_key(coin, fiat);
		let snapshot = {
			let mut history = self.inner.history.write();
			let rates = history.entry(key.clone()).or_default();
			merge(rates, fetched);
			self.inner.repository.as_ref().map(|_| rates.clone())
		};
		if let (Some(repository), Some(rates)) = (&self.inner.repository, snapshot) {
			// The in-memory history stays authoritative.
			if let Err(e) = repository.dump(&key, &rates) {
				error!(pair = %key, "Failed to store rate history: {}", e);
			}
		}
		if count > 0 {
			debug!(pair = %key, count, %start, %end, "Merged rate history");
			self.inner
				.events
				.send(Event::Rates(RatesEvent::HistoryUpdated { pair: key }));
		}
		Ok(count)
	}

	async fn forward_loop(self, coin: String, fiat: String, stop: ShutdownSignal) {
		debug!(%coin, %fiat, "Started forward rate history");
		loop {
			let range = forward_range(self.history_latest_timestamp(&coin, &fiat), Utc::now());
			// Without history the backfill fetches the recent range.
			if let Some((start, end)) = range {
				let fetch = retry(Constant::new(FORWARD_RETRY_INTERVAL), || async {
					self.update_history(&coin, &fiat, start, end).await.map_err(|e| {
						warn!(%coin, %fiat, "Forward rate history update failed: {}", e);
						backoff::Error::transient(e)
					})
				});
				tokio::select! {
					_ = stop.recv() => break,
					_ = self.inner.quit.recv() => break,
					_ = fetch => {}
				}
			}
			let jitter = Duration::from_secs(rand::rng().random_range(0..30));
			tokio::select! {
				_ = stop.recv() => break,
				_ = self.inner.quit.recv() => break,
				_ = sleep(self.inner.history_interval + jitter) => {}
			}
		}
		debug!(%coin, %fiat, "Stopped forward rate history");
	}

	async fn backfill_loop(self, coin: String, fiat: String, stop: ShutdownSignal) {
		debug!(%coin, %fiat, "Started rate history backfill");
		loop {
			let now = Utc::now();
			let (start, end) = backfill_range(self.history_earliest_timestamp(&coin, &fiat), now);
			let fetch = retry(backfill_backoff(), || async {
				let count = self.update_history(&coin, &fiat, start, end).await.map_err(|e| {
					warn!(%coin, %fiat, "Rate history backfill failed: {}", e);
					backoff::Error::transient(e)
				})?;
				if count == 0 && !backfill_exhausted(count, end, now) {
					return Err(backoff::Error::transient(RatesError::EmptyRange));
				}
				Ok::<usize, backoff::Error<RatesError>>(count)
			});
			let count = tokio::select! {
				_ = stop.recv() => break,
				_ = self.inner.quit.recv() => break,
				result = fetch => match result {
					Ok(count) => count,
					Err(e) => {
						error!(%coin, %fiat, "Giving up rate history backfill: {}", e);
						break;
					}
				},
			};
			if count == 0 {
				info!(%coin, %fiat, %start, "Rate history backfill reached the end of data");
				break;
			}
			let pause = Duration::from_secs(rand::rng().random_range(1..=5));
			tokio::select! {
				_ = stop.recv() => break,
				_ = self.inner.quit.recv() => break,
				_ = sleep(pause) => {}
			}
		}
		debug!(%coin, %fiat, "Stopped rate history backfill");
	}

	/// Replaces the latest quotes once.
	pub async fn update_latest(&self) -> Result<(), RatesError> {
		let latest = self.inner.source.latest().await?;
		*self.inner.last.write() = latest;
		self.inner.events.send(Event::Rates(RatesEvent::Updated));
		Ok(())
	}

	/// Polls the latest quotes until [`RateUpdater::stop`].
	pub fn start(&self) -> JoinHandle<()> {
		let updater = self.clone();
		tokio::spawn(async move {
			info!(interval = ?updater.inner.latest_interval, "Starting rate updater");
			loop {
				if let Err(e) = updater.update_latest().await {
					warn!("Failed to update latest rates: {}", e);
				}
				tokio::select! {
					_ = updater.inner.quit.recv() => break,
					_ = sleep(updater.inner.latest_interval) => {}
				}
			}
			info!("Stopped rate updater");
		})
	}

	/// Stops the latest poll and all history tasks.
	pub fn stop(&self) {
		self.inner.quit.send();
		self.stop_all_history();
	}
}
