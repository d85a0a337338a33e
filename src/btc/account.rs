//! A UTXO account: two address chains kept in sync with the chain backend.
//!
//! Every address is subscribed at the backend. A status notification triggers a history
//! download, the history feeds the [`TxIndex`] and the address chains, and the chains derive
//! new addresses until the gap limit holds again. All of it runs under sync requests, so the
//! account reports `SyncDone` exactly when the whole cascade settled.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network, OutPoint, Txid};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::address::AccountAddress;
use super::address_chain::{AddressChain, AddressChainError};
use super::blockchain::{ChainBackend, ChainError, HeaderCallback, ScriptHashHex, StatusCallback};
use super::maketx::{MakeTxError, TxProposal, new_tx, new_tx_spend_all};
use super::tx_index::{SpendableOutput, TxIndex};
use crate::accounts::base::{AccountConfig, BaseAccount};
use crate::accounts::transaction::OrderedTransactions;
use crate::accounts::types::{
	AccountError, AddressInfo, Balance, FeeTarget, ProposalResult, TxProposalArgs,
};
use crate::coin::{Amount, FeeTargetCode};
use crate::keystore::Keystore;
use crate::observable::{AccountEventKind, EventsBus};
use crate::signing::SigningConfiguration;

/// Number of unused addresses kept at the end of each chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapLimits {
	pub receive: usize,
	pub change: usize,
}

impl Default for GapLimits {
	fn default() -> Self {
		Self {
			receive: 20,
			change: 6,
		}
	}
}

pub struct BtcAccountConfig {
	pub account: AccountConfig,
	pub network: Network,
	pub signing_configuration: SigningConfiguration,
	pub gap_limits: GapLimits,
}

/// Confirmation target in blocks of an estimated fee target.
fn target_blocks(code: FeeTargetCode) -> Option<u32> {
	match code {
		FeeTargetCode::Low => Some(24),
		FeeTargetCode::Economy => Some(12),
		FeeTargetCode::Normal => Some(6),
		FeeTargetCode::High => Some(2),
		FeeTargetCode::Custom => None,
	}
}

/// Upper bound of a custom fee rate, in sat/vB.
const MAX_CUSTOM_FEE_SAT_PER_VBYTE: f64 = 100_000.0;

impl From<AddressChainError> for AccountError {
	fn from(error: AddressChainError) -> Self {
		AccountError::Fatal(error.to_string())
	}
}

impl From<MakeTxError> for AccountError {
	fn from(error: MakeTxError) -> Self {
		match error {
			MakeTxError::InsufficientFunds => AccountError::InsufficientFunds,
			MakeTxError::ZeroAmount | MakeTxError::FeeOverflow(_) => {
				AccountError::InvalidAmount(error.to_string())
			}
		}
	}
}

pub struct BtcAccount {
	base: BaseAccount,
	network: Network,
	signing_configuration: SigningConfiguration,
	receive: AddressChain,
	change: AddressChain,
	backend: Arc<dyn ChainBackend>,
	index: TxIndex,
	keystore: Arc<dyn Keystore>,
	fee_targets: RwLock<Vec<FeeTarget>>,
	proposal: Mutex<Option<TxProposal>>,
	/// Serializes address discovery, which awaits subscriptions between derivations.
	discovery: tokio::sync::Mutex<()>,
	weak_self: Weak<BtcAccount>,
}

impl BtcAccount {
	/// Creates the account. Nothing touches the network before [`BtcAccount::initialize`].
	pub fn new(
		config: BtcAccountConfig,
		backend: Arc<dyn ChainBackend>,
		keystore: Arc<dyn Keystore>,
		events: EventsBus,
	) -> Result<Arc<Self>, AccountError> {
		let receive = AddressChain::new(
			config.signing_configuration.clone(),
			config.network,
			config.gap_limits.receive,
			0,
		)?;
		let change = AddressChain::new(
			config.signing_configuration.clone(),
			config.network,
			config.gap_limits.change,
			1,
		)?;
		let base = BaseAccount::new(config.account, events);
		let fee_targets = FeeTargetCode::ALL_ESTIMATED
			.iter()
			.map(|code| FeeTarget {
				code: *code,
				fee_rate: None,
			})
			.collect();

		Ok(Arc::new_cyclic(|weak: &Weak<BtcAccount>| {
			let on_error = {
				let weak = weak.clone();
				move |e: &ChainError| {
					if let Some(account) = weak.upgrade() {
						account.base.set_offline(Some(e.to_string()));
					}
				}
			};
			let index = TxIndex::new(
				backend.clone(),
				base.synchronizer().clone(),
				config.network,
				on_error,
			);
			BtcAccount {
				base,
				network: config.network,
				signing_configuration: config.signing_configuration,
				receive,
				change,
				backend,
				index,
				keystore,
				fee_targets: RwLock::new(fee_targets),
				proposal: Mutex::new(None),
				discovery: tokio::sync::Mutex::new(()),
				weak_self: weak.clone(),
			}
		}))
	}

	pub fn base(&self) -> &BaseAccount {
		&self.base
	}

	pub fn network(&self) -> Network {
		self.network
	}

	/// Loads the notes and starts the initial sync in the background.
	///
	/// The sync request is registered before this returns, so a following [`BtcAccount::balance`]
	/// waits for it. Connection failures put the account offline instead of failing here.
	pub async fn initialize(self: &Arc<Self>) -> Result<(), AccountError> {
		if !self.base.initialize()? {
			return Ok(());
		}
		info!(account = %self.base.code(), "Initializing account");
		let guard = self.base.synchronizer().inc_requests_counter();
		let account = self.clone();
		tokio::spawn(async move {
			if let Err(e) = account.initial_sync().await {
				error!(account = %account.base.code(), "Initial sync failed: {}", e);
				account.base.set_offline(Some(e.to_string()));
			}
			guard.done();
		});
		Ok(())
	}

	async fn initial_sync(&self) -> Result<(), AccountError> {
		let weak = self.weak_self.clone();
		let on_header: HeaderCallback = Arc::new(move |header| {
			if let Some(account) = weak.upgrade() {
				account.on_new_header(header.height);
			}
		});
		let tip = self.backend.headers_subscribe(on_header).await?;
		self.index.update_tip(tip.height);
		self.ensure_addresses().await?;
		self.update_fee_targets().await;
		self.base.set_offline(None);
		Ok(())
	}

	fn on_new_header(&self, height: u64) {
		if self.base.closed() {
			return;
		}
		debug!(account = %self.base.code(), height, "New block");
		self.index.update_tip(height);
		let Some(account) = self.weak_self.upgrade() else {
			return;
		};
		tokio::spawn(async move {
			account.index.sync_header_timestamps().await;
			account.update_fee_targets().await;
			account.base.set_offline(None);
			account.base.notify(AccountEventKind::StatusChanged);
		});
	}

	/// Derives and subscribes addresses until both chains end in their gap limit of unused
	/// addresses.
	async fn ensure_addresses(&self) -> Result<(), AccountError> {
		let _discovery = self.discovery.lock().await;
		self.extend_chains().await
	}

	/// [`BtcAccount::ensure_addresses`] for callers already holding `discovery`.
	async fn extend_chains(&self) -> Result<(), AccountError> {
		loop {
			let mut added = self.receive.ensure_addresses()?;
			added.extend(self.change.ensure_addresses()?);
			if added.is_empty() {
				return Ok(());
			}
			debug!(account = %self.base.code(), count = added.len(), "Subscribing new addresses");
			for address in added {
				self.subscribe_address(&address).await?;
			}
		}
	}

	async fn subscribe_address(&self, address: &Arc<AccountAddress>) -> Result<(), AccountError> {
		let weak = self.weak_self.clone();
		let on_status: StatusCallback = Arc::new(move |script_hash, _status| {
			if let Some(account) = weak.upgrade() {
				account.on_address_status(script_hash);
			}
		});
		let status = self
			.backend
			.script_hash_subscribe(address.script_hash(), on_status)
			.await?;
		if status.is_some() {
			self.update_address_history(address).await?;
		}
		Ok(())
	}

	async fn update_address_history(&self, address: &AccountAddress) -> Result<(), AccountError> {
		let history = self
			.backend
			.script_hash_get_history(address.script_hash())
			.await?;
		address.set_history(history.clone());
		self.index.update_address_history(address.script_hash(), history);
		Ok(())
	}

	/// Handles a status notification of one of our addresses.
	pub(crate) fn on_address_status(&self, script_hash: ScriptHashHex) {
		if self.base.closed() {
			return;
		}
		let Some(address) = self.lookup_address(&script_hash) else {
			warn!(account = %self.base.code(), %script_hash, "Status change of unknown address");
			return;
		};
		let Some(account) = self.weak_self.upgrade() else {
			return;
		};
		let guard = self.base.synchronizer().inc_requests_counter();
		tokio::spawn(async move {
			let result = async {
				// New history can shrink the unused tail, so it is only written while no
				// other task is extending the chains.
				let _discovery = account.discovery.lock().await;
				account.update_address_history(&address).await?;
				account.extend_chains().await
			}
			.await;
			if let Err(e) = result {
				error!(account = %account.base.code(), "Address update failed: {}", e);
				account.base.set_offline(Some(e.to_string()));
			}
			guard.done();
		});
	}

	fn lookup_address(&self, script_hash: &str) -> Option<Arc<AccountAddress>> {
		self.receive
			.lookup_by_script_hash(script_hash)
			.or_else(|| self.change.lookup_by_script_hash(script_hash))
	}

	async fn update_fee_targets(&self) {
		let relay_fee = match self.backend.relay_fee().await {
			Ok(fee) => fee,
			Err(e) => {
				warn!(account = %self.base.code(), "Failed to fetch relay fee: {}", e);
				0
			}
		};
		let mut targets = Vec::with_capacity(FeeTargetCode::ALL_ESTIMATED.len());
		for code in FeeTargetCode::ALL_ESTIMATED {
			let Some(blocks) = target_blocks(code) else {
				continue;
			};
			let fee_rate = match self.backend.estimate_fee(blocks).await {
				Ok(estimate) => estimate.map(|rate| rate.max(relay_fee)),
				Err(e) => {
					warn!(account = %self.base.code(), blocks, "Fee estimation failed: {}", e);
					None
				}
			};
			targets.push(FeeTarget {
				code,
				fee_rate,
			});
		}
		debug!(account = %self.base.code(), ?targets, "Updated fee targets");
		*self.fee_targets.write() = targets;
	}

	/// Fee targets in sat/kvB and the default selection.
	pub fn fee_targets(&self) -> (Vec<FeeTarget>, FeeTargetCode) {
		(self.fee_targets.read().clone(), FeeTargetCode::default())
	}

	fn fee_rate_per_kb(&self, args: &TxProposalArgs) -> Result<u64, AccountError> {
		let code = if args.use_highest_fee {
			FeeTargetCode::High
		} else {
			args.fee_target
		};
		if code == FeeTargetCode::Custom {
			let custom = args.custom_fee.as_deref().unwrap_or_default();
			let sat_per_vbyte: f64 = custom
				.trim()
				.parse()
				.map_err(|_| AccountError::InvalidAmount(format!("bad fee rate {:?}", custom)))?;
			if !sat_per_vbyte.is_finite()
				|| sat_per_vbyte <= 0.0
				|| sat_per_vbyte > MAX_CUSTOM_FEE_SAT_PER_VBYTE
			{
				return Err(AccountError::InvalidAmount(format!("bad fee rate {:?}", custom)));
			}
			return Ok((sat_per_vbyte * 1000.0).round() as u64);
		}
		self.fee_targets
			.read()
			.iter()
			.find(|target| target.code == code)
			.and_then(|target| target.fee_rate)
			.ok_or(AccountError::FeesNotAvailable)
	}

	fn parse_recipient(&self, recipient: &str) -> Result<Address, AccountError> {
		Address::<NetworkUnchecked>::from_str(recipient.trim())
			.map_err(|_| AccountError::InvalidAddress)?
			.require_network(self.network)
			.map_err(|_| AccountError::InvalidAddress)
	}

	/// Outputs a replacement of `tx_id` must spend, and the fee rate it paid in sat/kvB.
	fn replaced_inputs(
		&self,
		tx_id: &str,
	) -> Result<(Vec<SpendableOutput>, u64), AccountError> {
		let unknown = || AccountError::InvalidAmount(format!("unknown transaction {}", tx_id));
		let txid = Txid::from_str(tx_id).map_err(|_| unknown())?;
		let tx = self.index.transaction(&txid).ok_or_else(unknown)?;
		let outpoints: Vec<OutPoint> = tx.input.iter().map(|input| input.previous_output).collect();
		let previous = self.index.owned_outputs(&outpoints);
		if previous.len() != outpoints.len() {
			return Err(AccountError::UnsupportedFeature(
				"replacing a transaction with foreign inputs".to_string(),
			));
		}
		let input_sum: u64 = previous.iter().map(|output| output.txout.value.to_sat()).sum();
		let output_sum: u64 = tx.output.iter().map(|output| output.value.to_sat()).sum();
		let vsize = (tx.vsize() as u64).max(1);
		let fee_rate = input_sum.saturating_sub(output_sum) * 1000 / vsize;
		Ok((previous, fee_rate))
	}

	/// Builds an unsigned transaction and keeps it for [`BtcAccount::send_tx`].
	pub fn tx_proposal(&self, args: &TxProposalArgs) -> Result<ProposalResult, AccountError> {
		self.base.ensure_synced()?;
		let recipient = self.parse_recipient(&args.recipient)?;
		let fee_per_kb = self.fee_rate_per_kb(args)?;

		let mut use_all_inputs = false;
		let spendable = match &args.rbf_tx_id {
			Some(tx_id) => {
				let (previous, replaced_rate) = self.replaced_inputs(tx_id)?;
				if fee_per_kb <= replaced_rate {
					return Err(AccountError::FeeTooLow);
				}
				use_all_inputs = true;
				previous
			}
			None => {
				let mut spendable = self.index.spendable_outputs();
				if !args.selected_utxos.is_empty() {
					let selected = args
						.selected_utxos
						.iter()
						.map(|outpoint| {
							OutPoint::from_str(outpoint).map_err(|_| {
								AccountError::InvalidAmount(format!("bad outpoint {}", outpoint))
							})
						})
						.collect::<Result<HashSet<OutPoint>, _>>()?;
					spendable.retain(|output| selected.contains(&output.outpoint));
				}
				spendable
			}
		};

		let script_type = self.signing_configuration.script_type;
		let proposal = if args.amount.send_all() {
			new_tx_spend_all(script_type, &spendable, recipient.script_pubkey(), fee_per_kb)?
		} else {
			let amount = args.amount.amount(self.base.coin().decimals, false)?;
			let amount = amount
				.to_u64()
				.ok_or_else(|| AccountError::InvalidAmount(amount.to_string()))?;
			// The tail is short while a notification extends the chain.
			let change = self
				.change
				.unused_addresses()
				.map_err(|_| AccountError::SyncInProgress)?
				.into_iter()
				.next()
				.ok_or(AccountError::SyncInProgress)?;
			new_tx(
				script_type,
				&spendable,
				recipient.script_pubkey(),
				amount,
				fee_per_kb,
				change,
				use_all_inputs,
				&mut rand::rng(),
			)?
		};

		let result = ProposalResult {
			amount: Amount::from_u64(proposal.amount),
			fee: Amount::from_u64(proposal.fee),
			total: Amount::from_u64(proposal.total()),
		};
		*self.proposal.lock() = Some(proposal);
		Ok(result)
	}

	/// Signs and broadcasts the last proposal. Returns the txid.
	pub async fn send_tx(&self) -> Result<String, AccountError> {
		self.base.ensure_synced()?;
		let proposal = self.proposal.lock().clone().ok_or(AccountError::NoProposal)?;
		let keypaths = proposal
			.previous_outputs
			.iter()
			.map(|output| {
				self.lookup_address(&output.script_hash)
					.map(|address| address.keypath().clone())
					.ok_or_else(|| AccountError::Fatal(format!("no keypath for input {}", output.outpoint)))
			})
			.collect::<Result<Vec<_>, _>>()?;

		let signed = self
			.keystore
			.sign_btc_transaction(self.base.coin(), &proposal, &keypaths)
			.await?;
		let txid = self.backend.transaction_broadcast(&signed).await?;
		if txid != signed.compute_txid() {
			warn!(%txid, computed = %signed.compute_txid(), "Backend reported a different txid");
		}
		info!(account = %self.base.code(), %txid, "Broadcast transaction");

		self.index
			.record_outgoing(&signed, |script_hash| self.lookup_address(script_hash).is_some());
		*self.proposal.lock() = None;
		let note = self.base.take_proposed_tx_note();
		if !note.is_empty() {
			self.base.set_tx_note(&txid.to_string(), &note)?;
		}
		self.base.notify(AccountEventKind::StatusChanged);
		Ok(txid.to_string())
	}

	pub async fn balance(&self) -> Result<Balance, AccountError> {
		self.base.ensure_usable()?;
		Ok(self.index.balance().await)
	}

	pub async fn transactions(&self) -> Result<OrderedTransactions, AccountError> {
		self.base.ensure_usable()?;
		let txs = self
			.index
			.transactions(|script_hash| self.change.lookup_by_script_hash(script_hash).is_some())
			.await;
		Ok(OrderedTransactions::new(txs))
	}

	pub fn unused_receive_addresses(&self) -> Result<Vec<AddressInfo>, AccountError> {
		self.base.ensure_usable()?;
		Ok(self
			.receive
			.unused_addresses()?
			.iter()
			.map(|address| AddressInfo {
				id: address.id().to_string(),
				address: address.encode_for_humans(),
				keypath: address.keypath().to_string(),
			})
			.collect())
	}

	/// Shows a receive address on the keystore. Returns `false` if it can't display addresses.
	pub async fn verify_address(&self, address_id: &str) -> Result<bool, AccountError> {
		self.base.ensure_usable()?;
		if !self.keystore.can_verify_address(self.base.coin()) {
			return Ok(false);
		}
		let address = self
			.receive
			.lookup_by_script_hash(address_id)
			.ok_or(AccountError::InvalidAddress)?;
		self.keystore
			.verify_address(self.base.coin(), &self.signing_configuration, address.keypath())
			.await?;
		Ok(true)
	}

	pub fn receive_chain(&self) -> &AddressChain {
		&self.receive
	}

	pub fn change_chain(&self) -> &AddressChain {
		&self.change
	}

	/// Stops reacting to notifications. The backend is shared and stays open.
	pub fn close(&self) {
		*self.proposal.lock() = None;
		self.base.close();
	}
}
