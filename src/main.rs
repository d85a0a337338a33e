use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::Network;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wallet_sync_core::accounts::{Account, AccountConfig, AccountError};
use wallet_sync_core::btc::{BtcAccount, BtcAccountConfig, ChainBackend, ChainError};
use wallet_sync_core::coin::Coin;
use wallet_sync_core::config::{AppConfig, ConfigError, WatchAccountConfig};
use wallet_sync_core::electrum::ElectrumClient;
use wallet_sync_core::eth::{
	BalanceFetcher, EthAccount, EthAccountConfig, EthBalanceUpdater, EthError, EthUpdater,
	EthUpdaterHandle, EtherScan, RpcClient, TransactionsSource,
};
use wallet_sync_core::keystore::{Keystore, WatchOnly};
use wallet_sync_core::observable::{AccountEventKind, Event, EventsBus, RatesEvent};
use wallet_sync_core::rates::{GeckoClient, HistoryRepository, RateUpdater, RatesError};
use wallet_sync_core::store::{KvStore, StoreError};

#[derive(Error, Debug)]
enum StartupError {
	#[error("config: {0}")]
	Config(#[from] ConfigError),

	#[error("store: {0}")]
	Store(#[from] StoreError),

	#[error("rates: {0}")]
	Rates(#[from] RatesError),

	#[error("ethereum: {0}")]
	Eth(#[from] EthError),

	#[error("electrum: {0}")]
	Chain(#[from] ChainError),

	#[error("account: {0}")]
	Account(#[from] AccountError),

	#[error("account {code}: unsupported coin {coin}")]
	UnsupportedCoin { code: String, coin: String },

	#[error("no Electrum server configured for {0}")]
	NoElectrumServer(String),
}

/// Shared connections the watched accounts are built on.
struct Backends<'a> {
	config: &'a AppConfig,
	store: KvStore,
	events: EventsBus,
	keystore: Arc<dyn Keystore>,
	electrum: HashMap<String, Arc<dyn ChainBackend>>,
	eth_client: Arc<RpcClient>,
	etherscan: Arc<EtherScan>,
	eth_updater: EthUpdaterHandle<Arc<EthAccount>>,
	eth_accounts: EthBalanceUpdater,
}

impl Backends<'_> {
	async fn electrum_backend(&mut self, coin: &str) -> Result<Arc<dyn ChainBackend>, StartupError> {
		if let Some(backend) = self.electrum.get(coin) {
			return Ok(backend.clone());
		}
		let server = self
			.config
			.electrum
			.servers
			.get(coin)
			.ok_or_else(|| StartupError::NoElectrumServer(coin.to_string()))?;
		let client: Arc<dyn ChainBackend> = Arc::new(
			ElectrumClient::connect(server, self.config.electrum.request_timeout()).await?,
		);
		self.electrum.insert(coin.to_string(), client.clone());
		Ok(client)
	}

	async fn account(&mut self, watch: &WatchAccountConfig) -> Result<Account, StartupError> {
		let (coin, network) = match watch.coin.as_str() {
			"btc" => (Coin::btc(), Some(Network::Bitcoin)),
			"tbtc" => (Coin::tbtc(), Some(Network::Testnet)),
			"eth" => (Coin::eth(), None),
			other => {
				return Err(StartupError::UnsupportedCoin {
					code: watch.code.clone(),
					coin: other.to_string(),
				});
			}
		};
		let account_config = AccountConfig {
			code: watch.code.clone(),
			name: watch.name.clone(),
			coin,
			notes_dir: self.config.notes_dir(),
		};
		match network {
			Some(network) => {
				let backend = self.electrum_backend(&watch.coin).await?;
				let account = BtcAccount::new(
					BtcAccountConfig {
						account: account_config,
						network,
						signing_configuration: watch.signing_configuration.clone(),
						gap_limits: self.config.gap_limits,
					},
					backend,
					self.keystore.clone(),
					self.events.clone(),
				)?;
				Ok(Account::Btc(account))
			}
			None => {
				let transactions_source: Arc<dyn TransactionsSource> = self.etherscan.clone();
				let account = EthAccount::new(
					EthAccountConfig {
						account: account_config,
						signing_configuration: watch.signing_configuration.clone(),
					},
					self.eth_client.clone(),
					Some(transactions_source),
					self.store.clone(),
					self.keystore.clone(),
					self.eth_updater.clone(),
					self.events.clone(),
				)?;
				self.eth_accounts.add_account(account.clone());
				Ok(Account::Eth(account))
			}
		}
	}
}

fn log_event(event: &Event, rates: &RateUpdater, fiat: &str) {
	match event {
		Event::Account(event) if event.kind == AccountEventKind::SyncDone => {
			info!(account = %event.account_code, "Account synced");
		}
		Event::Account(_) => {}
		Event::Rates(RatesEvent::Updated) => {
			let last = rates.last();
			for (coin, quotes) in last.iter() {
				if let Some(price) = quotes.get(fiat) {
					info!(coin = %coin, fiat, price, "Latest rate");
				}
			}
		}
		Event::Rates(RatesEvent::HistoryUpdated { pair }) => {
			info!(pair = %pair, "Rate history updated");
		}
	}
}

async fn run() -> Result<(), StartupError> {
	let config = AppConfig::load()?;
	let store = KvStore::open(config.store_path())?;
	let events = EventsBus::new();
	let mut events_rx = events.subscribe();

	let rates = RateUpdater::new(
		Arc::new(GeckoClient::new(config.rates.coingecko_url.clone())?),
		Some(HistoryRepository::new(store.clone(), config.rates.history_encoding)),
		events.clone(),
		&config.rates,
	);
	let rates_task = rates.start();
	rates.reconfigure_history(&config.rates.history_coins, &config.rates.fiats);
	info!(pairs = ?rates.enabled_pairs(), "Rate updater started");

	let etherscan = Arc::new(EtherScan::new(
		config.eth.etherscan_url.clone(),
		config.eth.etherscan_api_key.clone(),
		1,
	)?);
	let fetcher: Arc<dyn BalanceFetcher> = etherscan.clone();
	let eth_accounts = EthBalanceUpdater::new(HashMap::from([(1, fetcher)]));
	let (eth_updater, eth_handle) = EthUpdater::new(eth_accounts.clone(), config.eth.poll_interval());
	let eth_task = tokio::spawn(eth_updater.poll_balances());

	let mut backends = Backends {
		config: &config,
		store: store.clone(),
		events: events.clone(),
		keystore: Arc::new(WatchOnly),
		electrum: HashMap::new(),
		eth_client: Arc::new(RpcClient::new(config.eth.rpc_url.clone())?),
		etherscan,
		eth_updater: eth_handle.clone(),
		eth_accounts,
	};

	let mut accounts = Vec::new();
	for watch in &config.accounts {
		match backends.account(watch).await {
			Ok(account) => {
				if let Err(e) = account.initialize().await {
					warn!(account = %watch.code, "Failed to initialize: {}", e);
				}
				accounts.push(account);
			}
			Err(e) => error!("Skipping account {}: {}", watch.code, e),
		}
	}
	info!("Watching {} accounts", accounts.len());

	let fiat = config
		.rates
		.fiats
		.first()
		.cloned()
		.unwrap_or_else(|| "USD".to_string());
	let ctrl_c = tokio::signal::ctrl_c();
	tokio::pin!(ctrl_c);
	loop {
		tokio::select! {
			result = &mut ctrl_c => {
				if let Err(e) = result {
					error!("Failed to listen for Ctrl-C: {}", e);
				}
				break;
			}
			event = events_rx.recv() => log_event(&event, &rates, &fiat),
		}
	}

	info!("Shutting down");
	for account in &accounts {
		account.close();
	}
	eth_handle.close();
	rates.stop();
	let _ = eth_task.await;
	let _ = rates_task.await;
	store.flush()?;
	Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting wallet sync service");
	if let Err(e) = run().await {
		error!("{}", e);
	}
}
