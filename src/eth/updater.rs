//!
//! Balance polling for Ethereum accounts.
//!
//! [`EthUpdater::poll_balances`] runs the scheduling loop: single-account updates are spawned
//! as soon as they are enqueued, while global updates (from the poll timer or
//! [`EthUpdaterHandle::update_all`]) never overlap. Global triggers arriving during a running
//! update collapse into one follow-up run. The timer is re-armed only after a global update
//! completed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use itertools::Itertools;
use num_bigint::BigInt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use super::account::EthAccount;
use super::etherscan::BalanceFetcher;
use crate::shutdown::ShutdownSignal;

/// Default time between two global updates.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// The work the scheduling loop runs.
#[async_trait]
pub trait BalanceUpdate: Send + Sync + 'static {
	type Account: Send + 'static;

	/// Updates every account.
	async fn update_all(&self);

	/// Updates one account out of schedule.
	async fn update_account(&self, account: Self::Account);
}

/// Sending side of an [`EthUpdater`]. Cheap to clone.
pub struct EthUpdaterHandle<A> {
	enqueue_tx: mpsc::UnboundedSender<A>,
	update_all_tx: mpsc::Sender<()>,
	quit: ShutdownSignal,
}

impl<A> Clone for EthUpdaterHandle<A> {
	fn clone(&self) -> Self {
		Self {
			enqueue_tx: self.enqueue_tx.clone(),
			update_all_tx: self.update_all_tx.clone(),
			quit: self.quit.clone(),
		}
	}
}

impl<A> EthUpdaterHandle<A> {
	/// Requests an immediate update of one account.
	pub fn enqueue(&self, account: A) {
		if self.enqueue_tx.send(account).is_err() {
			debug!("Updater stopped, dropping enqueued account");
		}
	}

	/// Requests a global update. A request already waiting absorbs this one.
	pub fn update_all(&self) {
		if let Err(mpsc::error::TrySendError::Closed(())) = self.update_all_tx.try_send(()) {
			debug!("Updater stopped, dropping update request");
		}
	}

	/// Stops the scheduling loop. Running updates finish on their own.
	pub fn close(&self) {
		self.quit.send();
	}
}

pub struct EthUpdater<U: BalanceUpdate> {
	updater: Arc<U>,
	interval: Duration,
	enqueue_rx: mpsc::UnboundedReceiver<U::Account>,
	update_all_rx: mpsc::Receiver<()>,
	quit: ShutdownSignal,
}

impl<U: BalanceUpdate> EthUpdater<U> {
	pub fn new(updater: U, interval: Duration) -> (Self, EthUpdaterHandle<U::Account>) {
		let (enqueue_tx, enqueue_rx) = mpsc::unbounded_channel();
		let (update_all_tx, update_all_rx) = mpsc::channel(1);
		let quit = ShutdownSignal::new();
		let handle = EthUpdaterHandle {
			enqueue_tx,
			update_all_tx,
			quit: quit.clone(),
		};
		let updater = Self {
			updater: Arc::new(updater),
			interval,
			enqueue_rx,
			update_all_rx,
			quit,
		};
		(updater, handle)
	}

	/// Runs until the handle is closed. The first global update starts right away.
	pub async fn poll_balances(mut self) {
		info!(interval = ?self.interval, "Starting balance updater");
		let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
		let mut in_flight = false;
		let mut pending = false;
		let timer = sleep(Duration::ZERO);
		tokio::pin!(timer);
		let mut timer_armed = true;

		loop {
			let trigger = tokio::select! {
				_ = self.quit.recv() => {
					info!("Stopping balance updater");
					return;
				}
				Some(account) = self.enqueue_rx.recv() => {
					let updater = self.updater.clone();
					tokio::spawn(async move {
						updater.update_account(account).await;
					});
					false
				}
				Some(()) = self.update_all_rx.recv() => true,
				() = &mut timer, if timer_armed => {
					timer_armed = false;
					true
				}
				Some(()) = done_rx.recv() => {
					in_flight = false;
					if pending {
						pending = false;
						true
					} else {
						timer.as_mut().reset(Instant::now() + self.interval);
						timer_armed = true;
						false
					}
				}
			};
			if !trigger {
				continue;
			}
			if in_flight {
				debug!("Global update running, coalescing trigger");
				pending = true;
				continue;
			}
			in_flight = true;
			// Re-armed once this run is done.
			timer_armed = false;
			let updater = self.updater.clone();
			let done_tx = done_tx.clone();
			tokio::spawn(async move {
				updater.update_all().await;
				let _ = done_tx.send(()).await;
			});
		}
	}
}

/// Updates Ethereum accounts against the balance fetcher of their chain.
#[derive(Clone)]
pub struct EthBalanceUpdater {
	accounts: Arc<RwLock<Vec<Arc<EthAccount>>>>,
	fetchers: Arc<HashMap<u64, Arc<dyn BalanceFetcher>>>,
}

impl EthBalanceUpdater {
	/// `fetchers` maps a chain id to the fetcher serving it.
	pub fn new(fetchers: HashMap<u64, Arc<dyn BalanceFetcher>>) -> Self {
		Self {
			accounts: Arc::new(RwLock::new(Vec::new())),
			fetchers: Arc::new(fetchers),
		}
	}

	pub fn add_account(&self, account: Arc<EthAccount>) {
		self.accounts.write().push(account);
	}

	pub fn accounts(&self) -> Vec<Arc<EthAccount>> {
		self.accounts.read().clone()
	}

	fn fetcher(&self, chain_id: u64) -> Option<Arc<dyn BalanceFetcher>> {
		self.fetchers.get(&chain_id).cloned()
	}
}

/// One update pass over accounts of the same chain.
///
/// Native balances come from one batched call; token balances are read from their contract.
/// An account whose balance can't be obtained is put offline, the others are updated.
pub async fn update_balances_and_block_number(
	accounts: &[Arc<EthAccount>],
	fetcher: &dyn BalanceFetcher,
) {
	let accounts: Vec<&Arc<EthAccount>> =
		accounts.iter().filter(|account| !account.base().closed()).collect();
	if accounts.is_empty() {
		return;
	}

	let native: Vec<_> = accounts
		.iter()
		.filter(|account| !account.is_erc20())
		.map(|account| *account.address())
		.collect();
	let batch = if native.is_empty() {
		Ok(HashMap::new())
	} else {
		fetcher.balances(&native).await.map_err(|e| {
			error!("Batched balance fetch failed: {}", e);
			e.to_string()
		})
	};

	let block_number = match fetcher.block_number().await {
		Ok(block_number) => block_number,
		Err(e) => {
			error!("Failed to fetch the block number: {}", e);
			for account in &accounts {
				account.set_offline(Some(e.to_string()));
			}
			return;
		}
	};

	for account in accounts {
		let balance: Result<BigInt, String> = match account.erc20_contract() {
			Some(contract) => account
				.client()
				.erc20_balance(account.address(), &contract)
				.await
				.map_err(|e| e.to_string()),
			None => match &batch {
				Ok(balances) => balances
					.get(account.address())
					.cloned()
					.ok_or_else(|| format!("no balance reported for {}", account.address())),
				Err(e) => Err(e.clone()),
			},
		};
		let result = match balance {
			Ok(balance) => account.update(balance, block_number).await.map_err(|e| e.to_string()),
			Err(e) => Err(e),
		};
		match result {
			Ok(()) => account.set_offline(None),
			Err(e) => {
				warn!(account = %account.base().code(), "Account update failed: {}", e);
				account.set_offline(Some(e));
			}
		}
	}
}

#[async_trait]
impl BalanceUpdate for EthBalanceUpdater {
	type Account = Arc<EthAccount>;

	async fn update_all(&self) {
		self.accounts.write().retain(|account| !account.base().closed());
		let by_chain = self
			.accounts()
			.into_iter()
			.into_group_map_by(|account| account.chain_id());
		// Chains don't share a fetcher, so they are updated concurrently.
		join_all(by_chain.into_iter().map(|(chain_id, accounts)| async move {
			match self.fetcher(chain_id) {
				Some(fetcher) => update_balances_and_block_number(&accounts, fetcher.as_ref()).await,
				None => {
					for account in accounts {
						account.set_offline(Some(format!("no balance fetcher for chain {}", chain_id)));
					}
				}
			}
		}))
		.await;
	}

	async fn update_account(&self, account: Arc<EthAccount>) {
		debug!(account = %account.base().code(), "Extraordinary account update");
		match self.fetcher(account.chain_id()) {
			Some(fetcher) => update_balances_and_block_number(&[account], fetcher.as_ref()).await,
			None => {
				let chain_id = account.chain_id();
				account.set_offline(Some(format!("no balance fetcher for chain {}", chain_id)));
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tokio::sync::Notify;
	use tokio::time::timeout;

	/// Counts global runs; the first run blocks on `gate` when set.
	#[derive(Default)]
	struct CountingUpdater {
		runs: AtomicUsize,
		completed: AtomicUsize,
		in_flight: AtomicUsize,
		peak: AtomicUsize,
		gate: Option<Arc<Notify>>,
		started: Option<mpsc::UnboundedSender<usize>>,
		work: Duration,
		single: AtomicUsize,
	}

	#[async_trait]
	impl BalanceUpdate for CountingUpdater {
		type Account = usize;

		async fn update_all(&self) {
			let run = self.runs.fetch_add(1, Ordering::SeqCst);
			let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(current, Ordering::SeqCst);
			if let Some(started) = &self.started {
				let _ = started.send(run);
			}
			if run == 0 {
				if let Some(gate) = &self.gate {
					gate.notified().await;
				}
			}
			if !self.work.is_zero() {
				sleep(self.work).await;
			}
			self.in_flight.fetch_sub(1, Ordering::SeqCst);
			self.completed.fetch_add(1, Ordering::SeqCst);
		}

		async fn update_account(&self, _account: usize) {
			self.single.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[tokio::test]
	async fn test_triggers_during_update_coalesce() {
		let gate = Arc::new(Notify::new());
		let (started_tx, mut started_rx) = mpsc::unbounded_channel();
		let (updater, handle) = EthUpdater::new(
			CountingUpdater {
				gate: Some(gate.clone()),
				started: Some(started_tx),
				..Default::default()
			},
			Duration::from_secs(3600),
		);
		let counter = updater.updater.clone();
		let task = tokio::spawn(updater.poll_balances());

		assert_eq!(started_rx.recv().await, Some(0));
		for _ in 0..3 {
			handle.update_all();
			tokio::task::yield_now().await;
		}
		gate.notify_one();

		let second = timeout(Duration::from_secs(5), started_rx.recv()).await.unwrap();
		assert_eq!(second, Some(1));
		timeout(Duration::from_secs(5), async {
			while counter.completed.load(Ordering::SeqCst) < 2 {
				tokio::task::yield_now().await;
			}
		})
		.await
		.unwrap();
		sleep(Duration::from_millis(100)).await;
		assert_eq!(counter.runs.load(Ordering::SeqCst), 2);

		handle.close();
		timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_global_updates_never_overlap() {
		let (updater, handle) = EthUpdater::new(
			CountingUpdater {
				work: Duration::from_millis(50),
				..Default::default()
			},
			Duration::from_millis(10),
		);
		let counter = updater.updater.clone();
		tokio::spawn(updater.poll_balances());

		for _ in 0..20 {
			handle.update_all();
			sleep(Duration::from_millis(7)).await;
		}
		sleep(Duration::from_secs(1)).await;
		handle.close();

		assert_eq!(counter.peak.load(Ordering::SeqCst), 1);
		assert!(counter.runs.load(Ordering::SeqCst) >= 5);
	}

	#[tokio::test]
	async fn test_enqueued_accounts_run_immediately() {
		let gate = Arc::new(Notify::new());
		let (updater, handle) = EthUpdater::new(
			CountingUpdater {
				gate: Some(gate.clone()),
				..Default::default()
			},
			Duration::from_secs(3600),
		);
		let counter = updater.updater.clone();
		tokio::spawn(updater.poll_balances());

		// The first global update is still blocked.
		handle.enqueue(1);
		handle.enqueue(2);
		timeout(Duration::from_secs(5), async {
			while counter.single.load(Ordering::SeqCst) < 2 {
				tokio::task::yield_now().await;
			}
		})
		.await
		.unwrap();
		assert_eq!(counter.completed.load(Ordering::SeqCst), 0);
		gate.notify_one();
		handle.close();
	}
}
