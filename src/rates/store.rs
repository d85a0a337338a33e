//! Persistence of rate histories, one bucket per pair.
//!
//! Two layouts are supported. [`HistoryEncoding::Individual`] stores one entry per sample, the
//! key being the big-endian Unix timestamp in seconds and the value the big-endian IEEE-754
//! bits of the price. [`HistoryEncoding::Blob`] stores the whole series under a single key,
//! which is much faster to dump and load for long series.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::ExchangeRate;
use crate::store::{KvStore, StoreError, be_u64, from_be_u64};

const BLOB_KEY: &[u8] = b"all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryEncoding {
	Individual,
	#[default]
	Blob,
}

#[derive(Clone)]
pub struct HistoryRepository {
	store: KvStore,
	encoding: HistoryEncoding,
}

impl HistoryRepository {
	pub fn new(store: KvStore, encoding: HistoryEncoding) -> Self {
		Self { store, encoding }
	}

	/// Replaces the stored series of `pair`. Timestamps are stored with second precision.
	pub fn dump(&self, pair: &str, rates: &[ExchangeRate]) -> Result<(), StoreError> {
		let mut tx = self.store.begin(pair)?;
		tx.clear();
		match self.encoding {
			HistoryEncoding::Individual => {
				for rate in rates {
					let seconds = u64::try_from(rate.timestamp.timestamp()).map_err(|_| {
						StoreError::Corrupt {
							bucket: pair.to_string(),
							reason: format!("timestamp before 1970: {}", rate.timestamp),
						}
					})?;
					tx.put(be_u64(seconds).to_vec(), rate.value.to_bits().to_be_bytes().to_vec());
				}
			}
			HistoryEncoding::Blob => {
				tx.put(BLOB_KEY.to_vec(), bincode::serialize(rates)?);
			}
		}
		tx.commit()?;
		debug!(pair, count = rates.len(), "Stored rate history");
		Ok(())
	}

	/// The stored series of `pair`, ascending. Empty if nothing was stored.
	pub fn load(&self, pair: &str) -> Result<Vec<ExchangeRate>, StoreError> {
		match self.encoding {
			HistoryEncoding::Individual => self
				.store
				.entries(pair)?
				.iter()
				.map(|(key, value)| {
					let seconds = from_be_u64(pair, key)?;
					let bits = from_be_u64(pair, value)?;
					let timestamp = DateTime::from_timestamp(seconds as i64, 0).ok_or_else(|| {
						StoreError::Corrupt {
							bucket: pair.to_string(),
							reason: format!("timestamp out of range: {}", seconds),
						}
					})?;
					Ok(ExchangeRate::new(f64::from_bits(bits), timestamp))
				})
				.collect(),
			HistoryEncoding::Blob => match self.store.get(pair, BLOB_KEY)? {
				Some(blob) => Ok(bincode::deserialize(&blob)?),
				None => Ok(Vec::new()),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::{TimeZone, Utc};

	fn series(n: usize) -> Vec<ExchangeRate> {
		let start = Utc.with_ymd_and_hms(2020, 9, 1, 0, 0, 0).unwrap();
		(0..n)
			.map(|i| {
				ExchangeRate::new(
					10_000.0 + i as f64 * 0.25,
					start + chrono::TimeDelta::hours(i as i64),
				)
			})
			.collect()
	}

	#[test]
	fn test_dump_and_load_both_encodings() {
		let rates = series(500);
		for encoding in [HistoryEncoding::Individual, HistoryEncoding::Blob] {
			let repository = HistoryRepository::new(KvStore::temporary().unwrap(), encoding);
			assert!(repository.load("btcUSD").unwrap().is_empty());
			repository.dump("btcUSD", &rates).unwrap();
			assert_eq!(repository.load("btcUSD").unwrap(), rates, "{:?}", encoding);

			// A shorter dump replaces everything.
			repository.dump("btcUSD", &rates[..3]).unwrap();
			assert_eq!(repository.load("btcUSD").unwrap(), rates[..3].to_vec());
			assert!(repository.load("ethUSD").unwrap().is_empty());
		}
	}

	#[test]
	fn test_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let rates = series(10);
		{
			let store = KvStore::open(dir.path().join("rates")).unwrap();
			HistoryRepository::new(store.clone(), HistoryEncoding::Individual)
				.dump("ethEUR", &rates)
				.unwrap();
			store.flush().unwrap();
		}
		let store = KvStore::open(dir.path().join("rates")).unwrap();
		let loaded = HistoryRepository::new(store, HistoryEncoding::Individual)
			.load("ethEUR")
			.unwrap();
		assert_eq!(loaded, rates);
	}
}
