//!
//! Application configuration, read from a JSON file.
//!
//! The path comes from `WALLET_SYNC_CONFIG` and defaults to `./wallet-sync.json`. A missing
//! file means the defaults; every field of the file is optional.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::btc::GapLimits;
use crate::rates::RatesConfig;
use crate::signing::SigningConfiguration;

pub const CONFIG_ENV: &str = "WALLET_SYNC_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "wallet-sync.json";

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("invalid config {path}: {source}")]
	Parse {
		path: PathBuf,
		source: serde_json::Error,
	},
}

/// Electrum connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectrumConfig {
	/// `host:port` per coin code.
	pub servers: HashMap<String, String>,
	/// Seconds to wait for a response.
	pub request_timeout_secs: u64,
}

impl Default for ElectrumConfig {
	fn default() -> Self {
		Self {
			servers: HashMap::from([
				("btc".to_string(), "electrum.blockstream.info:50001".to_string()),
				("tbtc".to_string(), "electrum.blockstream.info:60001".to_string()),
			]),
			request_timeout_secs: 30,
		}
	}
}

impl ElectrumConfig {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}
}

/// Ethereum node and indexer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EthConfig {
	pub rpc_url: String,
	pub etherscan_url: String,
	pub etherscan_api_key: Option<String>,
	/// Seconds between two global balance updates.
	pub poll_interval_secs: u64,
}

impl Default for EthConfig {
	fn default() -> Self {
		Self {
			rpc_url: "https://ethereum-rpc.publicnode.com".to_string(),
			etherscan_url: "https://api.etherscan.io/v2/api".to_string(),
			etherscan_api_key: None,
			poll_interval_secs: 60,
		}
	}
}

impl EthConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.poll_interval_secs.max(1))
	}
}

/// A watch-only account to keep in sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchAccountConfig {
	pub code: String,
	pub name: String,
	/// `btc`, `tbtc` or `eth`.
	pub coin: String,
	pub signing_configuration: SigningConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
	/// Holds the key-value store and the notes files.
	pub data_dir: PathBuf,
	pub electrum: ElectrumConfig,
	pub eth: EthConfig,
	pub gap_limits: GapLimits,
	pub rates: RatesConfig,
	pub accounts: Vec<WatchAccountConfig>,
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			data_dir: PathBuf::from("wallet-data"),
			electrum: ElectrumConfig::default(),
			eth: EthConfig::default(),
			gap_limits: GapLimits::default(),
			rates: RatesConfig::default(),
			accounts: Vec::new(),
		}
	}
}

impl AppConfig {
	/// Loads the file named by `WALLET_SYNC_CONFIG`, or the default path.
	pub fn load() -> Result<Self, ConfigError> {
		let path = std::env::var_os(CONFIG_ENV)
			.map(PathBuf::from)
			.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
		Self::load_from(&path)
	}

	/// Loads `path`, falling back to the defaults if it does not exist.
	pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
		let contents = match std::fs::read_to_string(path) {
			Ok(contents) => contents,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				info!("No config at {:?}, using defaults", path);
				return Ok(Self::default());
			}
			Err(source) => {
				return Err(ConfigError::Read {
					path: path.to_path_buf(),
					source,
				});
			}
		};
		serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}

	pub fn store_path(&self) -> PathBuf {
		self.data_dir.join("db")
	}

	pub fn notes_dir(&self) -> PathBuf {
		self.data_dir.join("notes")
	}
}
