//! Exchange rates: latest quotes and interpolated price history per coin/fiat pair.

pub mod gecko;
pub mod history;
pub mod store;
pub mod types;
pub mod updater;

pub use gecko::{GeckoClient, RatesSource};
pub use store::{HistoryEncoding, HistoryRepository};
pub use types::{ExchangeRate, LatestRates, PriceLookup, RatesError};
pub use updater::{RateUpdater, RatesConfig};
