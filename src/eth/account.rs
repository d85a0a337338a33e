//! An account-based account: one address, a polled balance and locally tracked outgoing
//! transactions.
//!
//! Balances are pushed in by the [`EthBalanceUpdater`](super::updater::EthBalanceUpdater)
//! through [`EthAccount::update`], which also refreshes the transaction list, the next nonce and
//! the gas price. Sent transactions are persisted in a [`PendingStore`] until the transactions
//! source reports them.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use bitcoin::bip32::ChildNumber;
use bitcoin::secp256k1::Secp256k1;
use chrono::Utc;
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::address::EthAddress;
use super::client::{EthClient, erc20_transfer_data};
use super::etherscan::TransactionsSource;
use super::pending::PendingStore;
use super::types::{CallMsg, EthError, EthTxRequest, NUM_CONFIRMATIONS_COMPLETE, PendingTransaction};
use super::updater::EthUpdaterHandle;
use crate::accounts::base::{AccountConfig, BaseAccount};
use crate::accounts::transaction::{
	AddressAndAmount, OrderedTransactions, TransactionData, TxStatus, TxType,
};
use crate::accounts::types::{
	AccountError, AddressInfo, Balance, FeeTarget, ProposalResult, TxProposalArgs,
};
use crate::coin::{Amount, FeeTargetCode};
use crate::keystore::Keystore;
use crate::observable::{AccountEventKind, EventsBus};
use crate::signing::{AbsoluteKeypath, SigningConfiguration};
use crate::store::KvStore;
use crate::synchronizer::SyncGuard;

/// Decimals of a Gwei amount expressed in wei.
const GWEI_DECIMALS: u32 = 9;

pub struct EthAccountConfig {
	pub account: AccountConfig,
	/// Keypath and xpub of the account level. The address is derived at child 0.
	pub signing_configuration: SigningConfiguration,
}

/// Percentage of the suggested gas price behind an estimated fee target.
fn gas_price_percent(code: FeeTargetCode) -> Option<u32> {
	match code {
		FeeTargetCode::Low => Some(80),
		FeeTargetCode::Economy => Some(90),
		FeeTargetCode::Normal => Some(100),
		FeeTargetCode::High => Some(125),
		FeeTargetCode::Custom => None,
	}
}

#[derive(Default)]
struct EthState {
	/// In wei, or in token base units for ERC-20 accounts.
	balance: BigInt,
	block_number: u64,
	next_nonce: u64,
	transactions: Vec<TransactionData>,
	gas_price: Option<BigInt>,
}

#[derive(Clone)]
struct EthProposal {
	request: EthTxRequest,
	recipient: EthAddress,
	/// In the account's unit; differs from `request.value` for token transfers.
	value: BigInt,
}

/// View of a transaction we broadcast.
fn pending_to_transaction(
	tx: &PendingTransaction,
	block_number: u64,
	erc20: bool,
) -> TransactionData {
	let mined = tx.height > 0;
	let confirmations = if mined {
		block_number.saturating_sub(tx.height) + 1
	} else {
		0
	};
	// Until mined the whole gas limit may be charged.
	let gas = if mined { tx.gas_used } else { tx.gas_limit };
	let amount = Amount::new(tx.amount.clone());
	let to_self = tx.to == tx.from;
	TransactionData {
		tx_id: tx.hash.clone(),
		internal_id: tx.hash.clone(),
		tx_type: if to_self { TxType::SendSelf } else { TxType::Send },
		status: match (mined, tx.success) {
			(false, _) => TxStatus::Pending,
			(true, false) => TxStatus::Failed,
			(true, true) => TxStatus::Confirmed,
		},
		addresses: vec![AddressAndAmount {
			address: tx.to.to_checksum(),
			amount: amount.clone(),
			ours: to_self,
		}],
		amount,
		fee: Some(Amount::new(&tx.gas_price * BigInt::from(gas))),
		fee_is_different_unit: erc20,
		created_timestamp: Some(tx.created),
		height: tx.height as i64,
		num_confirmations: u32::try_from(confirmations).unwrap_or(u32::MAX),
		num_confirmations_complete: NUM_CONFIRMATIONS_COMPLETE,
		gas: Some(gas),
		nonce: Some(tx.nonce),
		..Default::default()
	}
}

pub struct EthAccount {
	base: BaseAccount,
	signing_configuration: SigningConfiguration,
	address: EthAddress,
	keypath: AbsoluteKeypath,
	chain_id: u64,
	erc20_contract: Option<EthAddress>,
	client: Arc<dyn EthClient>,
	transactions_source: Option<Arc<dyn TransactionsSource>>,
	pending: PendingStore,
	keystore: Arc<dyn Keystore>,
	updater: EthUpdaterHandle<Arc<EthAccount>>,
	state: RwLock<EthState>,
	proposal: Mutex<Option<EthProposal>>,
	/// Held from initialization until the first update or offline report.
	initial_sync: Mutex<Option<SyncGuard>>,
	weak_self: Weak<EthAccount>,
}

impl EthAccount {
	/// Creates the account and derives its address. Register it with the balance updater to
	/// have it polled.
	pub fn new(
		config: EthAccountConfig,
		client: Arc<dyn EthClient>,
		transactions_source: Option<Arc<dyn TransactionsSource>>,
		store: KvStore,
		keystore: Arc<dyn Keystore>,
		updater: EthUpdaterHandle<Arc<EthAccount>>,
		events: EventsBus,
	) -> Result<Arc<Self>, AccountError> {
		fn fatal(e: impl std::fmt::Display) -> AccountError {
			AccountError::Fatal(e.to_string())
		}
		let child = ChildNumber::from_normal_idx(0).map_err(fatal)?;
		let xpub = config
			.signing_configuration
			.xpub
			.derive_pub(&Secp256k1::verification_only(), &[child])
			.map_err(fatal)?;
		let keypath = config.signing_configuration.keypath.child(0).map_err(fatal)?;
		let coin = &config.account.coin;
		let chain_id = coin.chain_id.unwrap_or(1);
		let erc20_contract = coin
			.erc20
			.as_ref()
			.map(|token| token.contract_address.parse::<EthAddress>())
			.transpose()
			.map_err(EthError::from)?;
		let pending = PendingStore::new(store, &config.account.code);
		let base = BaseAccount::new(config.account, events);

		Ok(Arc::new_cyclic(|weak: &Weak<EthAccount>| EthAccount {
			base,
			signing_configuration: config.signing_configuration,
			address: EthAddress::from_public_key(&xpub.public_key),
			keypath,
			chain_id,
			erc20_contract,
			client,
			transactions_source,
			pending,
			keystore,
			updater,
			state: RwLock::new(EthState::default()),
			proposal: Mutex::new(None),
			initial_sync: Mutex::new(None),
			weak_self: weak.clone(),
		}))
	}

	pub fn base(&self) -> &BaseAccount {
		&self.base
	}

	pub fn address(&self) -> &EthAddress {
		&self.address
	}

	pub fn chain_id(&self) -> u64 {
		self.chain_id
	}

	pub fn is_erc20(&self) -> bool {
		self.erc20_contract.is_some()
	}

	pub fn erc20_contract(&self) -> Option<EthAddress> {
		self.erc20_contract
	}

	pub fn client(&self) -> &Arc<dyn EthClient> {
		&self.client
	}

	/// Loads the notes and asks the updater for an immediate update. The account counts as
	/// syncing until that update or an offline report arrives.
	pub async fn initialize(self: &Arc<Self>) -> Result<(), AccountError> {
		if !self.base.initialize()? {
			return Ok(());
		}
		info!(account = %self.base.code(), address = %self.address, "Initializing account");
		*self.initial_sync.lock() = Some(self.base.synchronizer().inc_requests_counter());
		self.updater.enqueue(self.clone());
		Ok(())
	}

	fn release_initial_sync(&self) {
		if let Some(guard) = self.initial_sync.lock().take() {
			guard.done();
		}
	}

	/// Sets or clears the offline reason. Going offline ends a pending initial sync.
	pub fn set_offline(&self, offline: Option<String>) {
		let is_offline = offline.is_some();
		self.base.set_offline(offline);
		if is_offline {
			self.release_initial_sync();
		}
	}

	/// Applies a freshly fetched balance at `block_number` and refreshes everything else the
	/// account shows.
	pub async fn update(&self, balance: BigInt, block_number: u64) -> Result<(), AccountError> {
		if self.base.closed() {
			return Ok(());
		}
		let guard = self.base.synchronizer().inc_requests_counter();
		let result = self.update_state(balance, block_number).await;
		self.release_initial_sync();
		guard.done();
		result
	}

	async fn update_state(&self, balance: BigInt, block_number: u64) -> Result<(), AccountError> {
		let mut pending = self.pending.load()?;
		self.update_outgoing(&mut pending, block_number).await?;
		let local_next_nonce = pending.first().map(|tx| tx.nonce + 1).unwrap_or(0);

		let mut transactions = match &self.transactions_source {
			Some(source) => {
				source
					.transactions(&self.address, block_number, self.erc20_contract.as_ref())
					.await?
			}
			None => Vec::new(),
		};
		let remote: HashSet<&str> = transactions.iter().map(|tx| tx.tx_id.as_str()).collect();
		let (reported, outgoing): (Vec<_>, Vec<_>) = pending
			.into_iter()
			.partition(|tx| remote.contains(tx.hash.as_str()));
		for tx in &reported {
			debug!(account = %self.base.code(), hash = %tx.hash, "Outgoing transaction reported by source");
			self.pending.remove(tx.nonce)?;
		}
		let erc20 = self.is_erc20();
		transactions.extend(
			outgoing
				.iter()
				.map(|tx| pending_to_transaction(tx, block_number, erc20)),
		);

		let next_nonce = self
			.client
			.pending_nonce_at(&self.address)
			.await?
			.max(local_next_nonce);
		let gas_price = match self.client.suggest_gas_price().await {
			Ok(price) => Some(price),
			Err(e) => {
				warn!(account = %self.base.code(), "Failed to fetch the gas price: {}", e);
				None
			}
		};

		let mut state = self.state.write();
		state.balance = balance;
		state.block_number = block_number;
		state.next_nonce = next_nonce;
		state.transactions = transactions;
		if gas_price.is_some() {
			state.gas_price = gas_price;
		}
		drop(state);
		self.base.notify(AccountEventKind::StatusChanged);
		Ok(())
	}

	/// Refreshes the receipts of outgoing transactions that are not final yet.
	async fn update_outgoing(
		&self,
		pending: &mut [PendingTransaction],
		block_number: u64,
	) -> Result<(), AccountError> {
		for tx in pending.iter_mut() {
			let settled = tx.height > 0
				&& block_number.saturating_sub(tx.height) + 1 >= u64::from(NUM_CONFIRMATIONS_COMPLETE);
			if settled {
				continue;
			}
			let receipt = self.client.transaction_receipt(&tx.hash).await?;
			let (height, gas_used, success) = match receipt {
				Some(receipt) => (receipt.block_number, receipt.gas_used, receipt.success),
				// Not mined, or reorged out.
				None => (0, 0, true),
			};
			if (height, gas_used, success) != (tx.height, tx.gas_used, tx.success) {
				debug!(account = %self.base.code(), hash = %tx.hash, height, success, "Outgoing transaction changed");
				tx.height = height;
				tx.gas_used = gas_used;
				tx.success = success;
				self.pending.put(tx)?;
			}
		}
		Ok(())
	}

	/// Fee targets in wei per gas and the default selection.
	pub fn fee_targets(&self) -> (Vec<FeeTarget>, FeeTargetCode) {
		let gas_price = self.state.read().gas_price.clone();
		let targets = FeeTargetCode::ALL_ESTIMATED
			.iter()
			.map(|code| FeeTarget {
				code: *code,
				fee_rate: gas_price.as_ref().zip(gas_price_percent(*code)).and_then(
					|(price, percent)| (price * BigInt::from(percent) / BigInt::from(100)).to_u64(),
				),
			})
			.collect();
		(targets, FeeTargetCode::default())
	}

	fn gas_price(&self, args: &TxProposalArgs) -> Result<BigInt, AccountError> {
		let code = if args.use_highest_fee {
			FeeTargetCode::High
		} else {
			args.fee_target
		};
		if code == FeeTargetCode::Custom {
			let custom = args.custom_fee.as_deref().unwrap_or_default().trim();
			let wei = Amount::parse(custom, GWEI_DECIMALS)?;
			if wei.is_negative() || wei.is_zero() {
				return Err(AccountError::InvalidAmount(format!("bad gas price {:?}", custom)));
			}
			return Ok(wei.into_bigint());
		}
		let (targets, _) = self.fee_targets();
		targets
			.iter()
			.find(|target| target.code == code)
			.and_then(|target| target.fee_rate)
			.map(BigInt::from)
			.ok_or(AccountError::FeesNotAvailable)
	}

	/// Builds an unsigned transaction and keeps it for [`EthAccount::send_tx`].
	///
	/// Token transfers call the contract with zero value; their fee is paid in the native coin
	/// and not part of the total.
	pub async fn tx_proposal(&self, args: &TxProposalArgs) -> Result<ProposalResult, AccountError> {
		self.base.ensure_synced()?;
		let recipient: EthAddress = args
			.recipient
			.trim()
			.parse()
			.map_err(|_| AccountError::InvalidAddress)?;
		let gas_price = self.gas_price(args)?;
		let (balance, nonce) = {
			let state = self.state.read();
			(state.balance.clone(), state.next_nonce)
		};

		let send_all = args.amount.send_all();
		let mut value = if send_all {
			balance.clone()
		} else {
			args.amount
				.amount(self.base.coin().decimals, !args.data.is_empty())?
				.into_bigint()
		};

		let (to, tx_value, data) = match self.erc20_contract {
			Some(contract) => {
				if !args.data.is_empty() {
					return Err(AccountError::UnsupportedFeature(
						"contract data in token transfers".to_string(),
					));
				}
				if !send_all && value > balance {
					return Err(AccountError::InsufficientFunds);
				}
				(contract, BigInt::zero(), erc20_transfer_data(&recipient, &value)?)
			}
			None => (recipient, value.clone(), args.data.clone()),
		};

		let gas_limit = self
			.client
			.estimate_gas(&CallMsg {
				from: self.address,
				to,
				gas_price: Some(gas_price.clone()),
				value: tx_value.clone(),
				data: data.clone(),
			})
			.await?;
		let fee = &gas_price * BigInt::from(gas_limit);

		let (tx_value, total) = if self.is_erc20() {
			(tx_value, value.clone())
		} else {
			if send_all {
				value = &balance - &fee;
				if value < BigInt::zero() {
					return Err(AccountError::InsufficientFunds);
				}
			} else if &value + &fee > balance {
				return Err(AccountError::InsufficientFunds);
			}
			(value.clone(), &value + &fee)
		};

		let request = EthTxRequest {
			chain_id: self.chain_id,
			nonce,
			gas_price,
			gas_limit,
			to,
			value: tx_value,
			data,
		};
		let result = ProposalResult {
			amount: Amount::new(value.clone()),
			fee: Amount::new(fee),
			total: Amount::new(total),
		};
		*self.proposal.lock() = Some(EthProposal {
			request,
			recipient,
			value,
		});
		Ok(result)
	}

	/// Signs and broadcasts the last proposal. Returns the transaction hash.
	pub async fn send_tx(&self) -> Result<String, AccountError> {
		self.base.ensure_synced()?;
		let proposal = self.proposal.lock().clone().ok_or(AccountError::NoProposal)?;
		let raw = self
			.keystore
			.sign_eth_transaction(self.base.coin(), &proposal.request, &self.keypath)
			.await?;
		let hash = self.client.send_raw_transaction(&raw).await?;
		info!(account = %self.base.code(), %hash, nonce = proposal.request.nonce, "Broadcast transaction");

		let pending = PendingTransaction {
			hash: hash.clone(),
			nonce: proposal.request.nonce,
			from: self.address,
			to: proposal.recipient,
			amount: proposal.value,
			gas_limit: proposal.request.gas_limit,
			gas_price: proposal.request.gas_price,
			height: 0,
			gas_used: 0,
			success: true,
			created: Utc::now(),
		};
		self.pending.put(&pending)?;
		{
			let mut state = self.state.write();
			state.next_nonce = state.next_nonce.max(pending.nonce + 1);
			let view = pending_to_transaction(&pending, state.block_number, self.is_erc20());
			state.transactions.push(view);
		}
		*self.proposal.lock() = None;
		let note = self.base.take_proposed_tx_note();
		if !note.is_empty() {
			self.base.set_tx_note(&hash, &note)?;
		}
		self.base.notify(AccountEventKind::StatusChanged);
		if let Some(account) = self.weak_self.upgrade() {
			self.updater.enqueue(account);
		}
		Ok(hash)
	}

	pub async fn balance(&self) -> Result<Balance, AccountError> {
		self.base.ensure_usable()?;
		self.base.synchronizer().wait_synchronized().await;
		Ok(Balance {
			available: Amount::new(self.state.read().balance.clone()),
			incoming: Amount::zero(),
		})
	}

	pub async fn transactions(&self) -> Result<OrderedTransactions, AccountError> {
		self.base.ensure_usable()?;
		self.base.synchronizer().wait_synchronized().await;
		Ok(OrderedTransactions::new(self.state.read().transactions.clone()))
	}

	/// The single address, keyed by its checksum encoding.
	pub fn unused_receive_addresses(&self) -> Result<Vec<AddressInfo>, AccountError> {
		self.base.ensure_usable()?;
		let address = self.address.to_checksum();
		Ok(vec![AddressInfo {
			id: address.clone(),
			address,
			keypath: self.keypath.to_string(),
		}])
	}

	pub async fn verify_address(&self, address_id: &str) -> Result<bool, AccountError> {
		self.base.ensure_usable()?;
		if !self.keystore.can_verify_address(self.base.coin()) {
			return Ok(false);
		}
		let address: EthAddress = address_id.parse().map_err(|_| AccountError::InvalidAddress)?;
		if address != self.address {
			return Err(AccountError::InvalidAddress);
		}
		self.keystore
			.verify_address(self.base.coin(), &self.signing_configuration, &self.keypath)
			.await?;
		Ok(true)
	}

	/// The updater drops closed accounts on its next pass.
	pub fn close(&self) {
		*self.proposal.lock() = None;
		self.base.close();
		self.release_initial_sync();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	use async_trait::async_trait;
	use bitcoin::Transaction;

	use crate::btc::address::tests::test_xpub;
	use crate::btc::maketx::TxProposal;
	use crate::coin::{Coin, SendAmount};
	use crate::eth::types::TxReceipt;
	use crate::eth::updater::{EthBalanceUpdater, EthUpdater, POLL_INTERVAL};
	use crate::keystore::KeystoreError;

	const GAS_PRICE: u64 = 20_000_000_000;
	const ETH: u64 = 1_000_000_000_000_000_000;
	const TOKEN: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";
	const RECIPIENT: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

	#[derive(Default)]
	struct MockClient {
		pending_nonce: Mutex<u64>,
		receipts: Mutex<HashMap<String, TxReceipt>>,
		estimates: Mutex<Vec<CallMsg>>,
		sent: Mutex<Vec<Vec<u8>>>,
	}

	#[async_trait]
	impl EthClient for MockClient {
		async fn block_number(&self) -> Result<u64, EthError> {
			Ok(100)
		}

		async fn balance_at(&self, _address: &EthAddress, _block: Option<u64>) -> Result<BigInt, EthError> {
			Ok(BigInt::zero())
		}

		async fn pending_nonce_at(&self, _address: &EthAddress) -> Result<u64, EthError> {
			Ok(*self.pending_nonce.lock())
		}

		async fn suggest_gas_price(&self) -> Result<BigInt, EthError> {
			Ok(BigInt::from(GAS_PRICE))
		}

		async fn estimate_gas(&self, call: &CallMsg) -> Result<u64, EthError> {
			self.estimates.lock().push(call.clone());
			Ok(if call.data.is_empty() { 21_000 } else { 50_000 })
		}

		async fn erc20_balance(&self, _owner: &EthAddress, _token: &EthAddress) -> Result<BigInt, EthError> {
			Ok(BigInt::from(1_000))
		}

		async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, EthError> {
			self.sent.lock().push(raw.to_vec());
			Ok(format!("0x{:064x}", raw[0]))
		}

		async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, EthError> {
			Ok(self.receipts.lock().get(tx_hash).cloned())
		}
	}

	#[derive(Default)]
	struct MockSource {
		transactions: Mutex<Vec<TransactionData>>,
	}

	#[async_trait]
	impl TransactionsSource for MockSource {
		async fn transactions(
			&self,
			_address: &EthAddress,
			_end_block: u64,
			_erc20_token: Option<&EthAddress>,
		) -> Result<Vec<TransactionData>, EthError> {
			Ok(self.transactions.lock().clone())
		}
	}

	/// "Signs" by returning the nonce as the raw transaction.
	struct NonceKeystore;

	#[async_trait]
	impl Keystore for NonceKeystore {
		fn name(&self) -> &str {
			"nonce"
		}

		fn can_verify_address(&self, _coin: &Coin) -> bool {
			true
		}

		async fn verify_address(
			&self,
			_coin: &Coin,
			_configuration: &SigningConfiguration,
			keypath: &AbsoluteKeypath,
		) -> Result<(), KeystoreError> {
			assert_eq!(keypath.to_string(), "m/44'/60'/0'/0/0");
			Ok(())
		}

		async fn sign_btc_transaction(
			&self,
			_coin: &Coin,
			_proposal: &TxProposal,
			_input_keypaths: &[AbsoluteKeypath],
		) -> Result<Transaction, KeystoreError> {
			Err(KeystoreError::UnsupportedFeature("btc".to_string()))
		}

		async fn sign_eth_transaction(
			&self,
			_coin: &Coin,
			request: &EthTxRequest,
			_keypath: &AbsoluteKeypath,
		) -> Result<Vec<u8>, KeystoreError> {
			Ok(vec![request.nonce as u8])
		}
	}

	struct Fixture {
		account: Arc<EthAccount>,
		client: Arc<MockClient>,
		source: Arc<MockSource>,
		_updater: EthUpdater<EthBalanceUpdater>,
		_dir: tempfile::TempDir,
	}

	fn fixture(coin: Coin) -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let client = Arc::new(MockClient::default());
		let source = Arc::new(MockSource::default());
		let (updater, handle) = EthUpdater::new(EthBalanceUpdater::new(HashMap::new()), POLL_INTERVAL);
		let config = EthAccountConfig {
			account: AccountConfig {
				code: format!("v0-{}-0", coin.code),
				name: coin.unit.clone(),
				coin,
				notes_dir: dir.path().to_path_buf(),
			},
			signing_configuration: SigningConfiguration::new(
				crate::signing::ScriptType::P2wpkh,
				"m/44'/60'/0'/0".parse().unwrap(),
				test_xpub(),
			),
		};
		let account = EthAccount::new(
			config,
			client.clone(),
			Some(source.clone()),
			KvStore::temporary().unwrap(),
			Arc::new(NonceKeystore),
			handle,
			EventsBus::new(),
		)
		.unwrap();
		Fixture {
			account,
			client,
			source,
			_updater: updater,
			_dir: dir,
		}
	}

	fn send_args(amount: &str) -> TxProposalArgs {
		TxProposalArgs {
			recipient: RECIPIENT.to_string(),
			amount: SendAmount::new(amount),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn test_initial_update_syncs_account() {
		let f = fixture(Coin::eth());
		assert!(matches!(f.account.balance().await, Err(AccountError::SyncInProgress)));
		f.account.initialize().await.unwrap();
		assert!(!f.account.base().synced());

		f.account.update(BigInt::from(ETH), 100).await.unwrap();
		assert!(f.account.base().synced());
		let balance = f.account.balance().await.unwrap();
		assert_eq!(balance.available, Amount::new(BigInt::from(ETH)));
		assert_eq!(balance.incoming, Amount::zero());

		let (targets, default) = f.account.fee_targets();
		assert_eq!(default, FeeTargetCode::Normal);
		let rates: Vec<_> = targets.iter().map(|target| target.fee_rate).collect();
		assert_eq!(
			rates,
			vec![
				Some(16_000_000_000),
				Some(18_000_000_000),
				Some(20_000_000_000),
				Some(25_000_000_000)
			]
		);
	}

	#[tokio::test]
	async fn test_offline_ends_initial_sync() {
		let f = fixture(Coin::eth());
		f.account.initialize().await.unwrap();
		f.account.set_offline(Some("etherscan down".to_string()));
		assert!(f.account.base().synced());
		assert_eq!(f.account.base().offline().as_deref(), Some("etherscan down"));
		assert_eq!(f.account.balance().await.unwrap().available, Amount::zero());
	}

	#[tokio::test]
	async fn test_proposals() {
		let f = fixture(Coin::eth());
		f.account.initialize().await.unwrap();
		f.account.update(BigInt::from(ETH), 100).await.unwrap();

		let fee = BigInt::from(GAS_PRICE) * BigInt::from(21_000);
		let result = f.account.tx_proposal(&send_args("0.5")).await.unwrap();
		assert_eq!(result.amount, Amount::new(BigInt::from(ETH / 2)));
		assert_eq!(result.fee, Amount::new(fee.clone()));
		assert_eq!(result.total, Amount::new(BigInt::from(ETH / 2) + &fee));

		let mut args = send_args("");
		args.amount = SendAmount::All;
		let result = f.account.tx_proposal(&args).await.unwrap();
		assert_eq!(result.amount, Amount::new(BigInt::from(ETH) - &fee));
		assert_eq!(result.total, Amount::new(BigInt::from(ETH)));

		let mut args = send_args("0.1");
		args.fee_target = FeeTargetCode::Custom;
		args.custom_fee = Some("30".to_string());
		let result = f.account.tx_proposal(&args).await.unwrap();
		assert_eq!(result.fee, Amount::new(BigInt::from(30_000_000_000u64 * 21_000)));

		assert!(matches!(
			f.account.tx_proposal(&send_args("1")).await,
			Err(AccountError::InsufficientFunds)
		));
		let mut args = send_args("0.1");
		args.recipient = "0x1234".to_string();
		assert!(matches!(f.account.tx_proposal(&args).await, Err(AccountError::InvalidAddress)));
		assert!(matches!(
			f.account.tx_proposal(&send_args("0")).await,
			Err(AccountError::InvalidAmount(_))
		));
	}

	#[tokio::test]
	async fn test_erc20_proposal() {
		let f = fixture(Coin::erc20("eth-erc20-usdt", "USDT", TOKEN, 6));
		f.account.initialize().await.unwrap();
		f.account.update(BigInt::from(1_000), 100).await.unwrap();

		let result = f.account.tx_proposal(&send_args("0.001")).await.unwrap();
		assert_eq!(result.amount, Amount::from_u64(1_000));
		assert_eq!(result.total, Amount::from_u64(1_000));
		assert_eq!(result.fee, Amount::new(BigInt::from(GAS_PRICE) * BigInt::from(50_000)));

		let call = f.client.estimates.lock().last().cloned().unwrap();
		assert_eq!(call.to.to_lower_hex(), TOKEN);
		assert!(call.value.is_zero());
		assert_eq!(hex::encode(&call.data[..4]), "a9059cbb");

		assert!(matches!(
			f.account.tx_proposal(&send_args("0.002")).await,
			Err(AccountError::InsufficientFunds)
		));
	}

	#[tokio::test]
	async fn test_send_tracks_pending_until_reported() {
		let f = fixture(Coin::eth());
		*f.client.pending_nonce.lock() = 7;
		f.account.initialize().await.unwrap();
		f.account.update(BigInt::from(ETH), 100).await.unwrap();

		f.account.tx_proposal(&send_args("0.5")).await.unwrap();
		f.account.base().propose_tx_note("coffee");
		let hash = f.account.send_tx().await.unwrap();
		assert_eq!(f.client.sent.lock().clone(), vec![vec![7u8]]);
		assert_eq!(f.account.base().tx_note(&hash), "coffee");
		assert!(matches!(f.account.send_tx().await, Err(AccountError::NoProposal)));

		let txs = f.account.transactions().await.unwrap().into_inner();
		assert_eq!(txs.len(), 1);
		assert_eq!(txs[0].status, TxStatus::Pending);
		assert_eq!(txs[0].tx_type, TxType::Send);
		assert_eq!(txs[0].nonce, Some(7));

		// The node hasn't seen it yet, the next proposal still uses the next nonce.
		f.account.update(BigInt::from(ETH), 100).await.unwrap();
		f.account.tx_proposal(&send_args("0.1")).await.unwrap();
		f.account.send_tx().await.unwrap();
		assert_eq!(f.client.sent.lock().last().cloned(), Some(vec![8u8]));

		// Mined and reverted.
		f.client.receipts.lock().insert(
			hash.clone(),
			TxReceipt {
				block_number: 101,
				gas_used: 20_000,
				success: false,
			},
		);
		f.account.update(BigInt::from(ETH), 105).await.unwrap();
		let txs = f.account.transactions().await.unwrap().into_inner();
		let mined = txs.iter().find(|tx| tx.tx_id == hash).unwrap();
		assert_eq!(mined.status, TxStatus::Failed);
		assert_eq!(mined.num_confirmations, 5);
		assert_eq!(mined.fee, Some(Amount::new(BigInt::from(GAS_PRICE) * BigInt::from(20_000))));

		// Once the source reports it, only the reported version is shown.
		f.source.transactions.lock().push(TransactionData {
			tx_id: hash.clone(),
			internal_id: hash.clone(),
			tx_type: TxType::Send,
			status: TxStatus::Failed,
			height: 101,
			..Default::default()
		});
		f.account.update(BigInt::from(ETH), 106).await.unwrap();
		let txs = f.account.transactions().await.unwrap().into_inner();
		assert_eq!(txs.len(), 2);
		assert_eq!(txs.iter().filter(|tx| tx.tx_id == hash).count(), 1);
		assert_eq!(f.account.pending.load().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_addresses_and_close() {
		let f = fixture(Coin::eth());
		f.account.initialize().await.unwrap();
		f.account.update(BigInt::zero(), 1).await.unwrap();

		let addresses = f.account.unused_receive_addresses().unwrap();
		assert_eq!(addresses.len(), 1);
		assert_eq!(addresses[0].address, f.account.address().to_checksum());
		assert_eq!(addresses[0].keypath, "m/44'/60'/0'/0/0");
		assert!(f.account.verify_address(&addresses[0].id).await.unwrap());
		assert!(matches!(
			f.account.verify_address(RECIPIENT).await,
			Err(AccountError::InvalidAddress)
		));

		f.account.close();
		assert!(matches!(f.account.balance().await, Err(AccountError::Closed)));
		f.account.update(BigInt::from(5), 2).await.unwrap();
		assert_eq!(f.account.base().synchronizer().pending_requests(), 0);
	}
}
