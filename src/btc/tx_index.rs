//! Index of the transactions touching a UTXO account.
//!
//! The index is fed exclusively through [`TxIndex::update_address_history`] with the history the
//! chain backend reports per address. Missing transactions are downloaded in the background, at
//! most one request per transaction hash at a time. Every input of every indexed transaction is
//! recorded, ours or not, so the final state does not depend on the order in which funding and
//! spending transactions arrive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitcoin::{Address, Network, OutPoint, Transaction, TxOut, Txid};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use super::blockchain::{ChainBackend, ChainError, ScriptHashHex, TxHistoryEntry, script_hash_hex};
use crate::accounts::Balance;
use crate::accounts::transaction::{AddressAndAmount, TransactionData, TxStatus, TxType};
use crate::coin::Amount;
use crate::synchronizer::Synchronizer;

/// Confirmations after which a Bitcoin transaction is shown as complete.
pub const NUM_CONFIRMATIONS_COMPLETE: u32 = 6;

type ErrorHook = Box<dyn Fn(&ChainError) + Send + Sync>;

#[derive(Debug, Clone)]
struct IndexedTx {
	tx: Transaction,
	height: i64,
	addresses: HashSet<ScriptHashHex>,
}

#[derive(Default)]
struct IndexState {
	txs: HashMap<Txid, IndexedTx>,
	/// Outputs paying to one of our addresses.
	outputs: HashMap<OutPoint, TxOut>,
	/// Every input seen in an indexed tx, mapped to the tx spending it.
	inputs: HashMap<OutPoint, Txid>,
	address_histories: HashMap<ScriptHashHex, Vec<TxHistoryEntry>>,
	/// Local submission times of our own transactions.
	created: HashMap<Txid, DateTime<Utc>>,
	tip_height: u64,
	header_timestamps: HashMap<u64, DateTime<Utc>>,
}

/// An output we own that nothing spends yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableOutput {
	pub outpoint: OutPoint,
	pub txout: TxOut,
	pub height: i64,
	pub script_hash: ScriptHashHex,
}

impl IndexState {
	fn in_history(&self, script_hash: &str, txid: &Txid) -> bool {
		self.address_histories
			.get(script_hash)
			.is_some_and(|history| history.iter().any(|entry| entry.tx_hash == *txid))
	}

	fn all_inputs_ours(&self, tx: &Transaction) -> bool {
		tx.input
			.iter()
			.all(|input| self.outputs.contains_key(&input.previous_output))
	}

	fn process_tx_for_address(
		&mut self,
		script_hash: &str,
		txid: Txid,
		tx: &Transaction,
		height: i64,
	) {
		// The history may have changed while the tx was downloaded.
		if !self.in_history(script_hash, &txid) {
			return;
		}

		let entry = self.txs.entry(txid).or_insert_with(|| IndexedTx {
			tx: tx.clone(),
			height,
			addresses: HashSet::new(),
		});
		entry.height = height;
		entry.addresses.insert(script_hash.to_string());

		for input in &tx.input {
			if let Some(spending) = self.inputs.get(&input.previous_output) {
				if *spending != txid {
					warn!(
						outpoint = %input.previous_output,
						first = %spending,
						second = %txid,
						"Double spend detected"
					);
				}
			}
			self.inputs.insert(input.previous_output, txid);
		}

		for (vout, output) in tx.output.iter().enumerate() {
			if script_hash_hex(&output.script_pubkey) == script_hash {
				self.outputs.insert(
					OutPoint {
						txid,
						vout: vout as u32,
					},
					output.clone(),
				);
			}
		}
	}

	fn remove_tx_for_address(&mut self, script_hash: &str, txid: Txid) {
		let Some(entry) = self.txs.get_mut(&txid) else {
			return;
		};
		entry.addresses.remove(script_hash);
		let owned: Vec<OutPoint> = entry
			.tx
			.output
			.iter()
			.enumerate()
			.filter(|(_, output)| script_hash_hex(&output.script_pubkey) == script_hash)
			.map(|(vout, _)| OutPoint {
				txid,
				vout: vout as u32,
			})
			.collect();
		let orphaned = entry.addresses.is_empty();
		for outpoint in owned {
			self.outputs.remove(&outpoint);
		}

		if orphaned {
			debug!(%txid, "Dropping transaction no longer referenced by any address");
			if let Some(entry) = self.txs.remove(&txid) {
				for input in &entry.tx.input {
					if self.inputs.get(&input.previous_output) == Some(&txid) {
						self.inputs.remove(&input.previous_output);
					}
				}
			}
		}
	}
}

struct Inner {
	backend: Arc<dyn ChainBackend>,
	synchronizer: Synchronizer,
	network: Network,
	state: RwLock<IndexState>,
	requested: Mutex<HashSet<Txid>>,
	on_error: ErrorHook,
}

/// Cheap to clone; clones share the index.
#[derive(Clone)]
pub struct TxIndex {
	inner: Arc<Inner>,
}

impl TxIndex {
	/// `on_error` is called with every error of a background download.
	pub fn new(
		backend: Arc<dyn ChainBackend>,
		synchronizer: Synchronizer,
		network: Network,
		on_error: impl Fn(&ChainError) + Send + Sync + 'static,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				backend,
				synchronizer,
				network,
				state: RwLock::new(IndexState::default()),
				requested: Mutex::new(HashSet::new()),
				on_error: Box::new(on_error),
			}),
		}
	}

	/// Applies the history the server reports for one address.
	///
	/// Transactions that disappeared lose this address; a transaction referenced by no address is
	/// dropped. Transactions not yet downloaded are fetched in the background. Must be called from
	/// within a tokio runtime.
	pub fn update_address_history(&self, script_hash: &str, history: Vec<TxHistoryEntry>) {
		let mut to_fetch = Vec::new();
		{
			let mut state = self.inner.state.write();
			let new_hashes: HashSet<Txid> = history.iter().map(|entry| entry.tx_hash).collect();
			let removed: Vec<Txid> = state
				.address_histories
				.get(script_hash)
				.map(|old| {
					old.iter()
						.map(|entry| entry.tx_hash)
						.filter(|txid| !new_hashes.contains(txid))
						.collect()
				})
				.unwrap_or_default();
			for txid in removed {
				state.remove_tx_for_address(script_hash, txid);
			}
			state
				.address_histories
				.insert(script_hash.to_string(), history.clone());

			for entry in &history {
				let cached = state.txs.get(&entry.tx_hash).map(|indexed| indexed.tx.clone());
				match cached {
					Some(tx) => {
						state.process_tx_for_address(script_hash, entry.tx_hash, &tx, entry.height)
					}
					None => to_fetch.push(entry.tx_hash),
				}
			}
		}

		for txid in to_fetch {
			self.fetch_transaction(txid);
		}
	}

	fn fetch_transaction(&self, txid: Txid) {
		if !self.inner.requested.lock().insert(txid) {
			// Already in flight; the result is applied to every address referencing it.
			return;
		}
		let guard = self.inner.synchronizer.inc_requests_counter();
		let inner = self.inner.clone();
		tokio::spawn(async move {
			let result = inner.backend.transaction_get(txid).await;
			inner.requested.lock().remove(&txid);
			match result {
				Ok(tx) if tx.compute_txid() != txid => {
					error!(%txid, got = %tx.compute_txid(), "Server returned the wrong transaction");
					(inner.on_error)(&ChainError::InvalidResponse(format!(
						"transaction {} does not match its hash",
						txid
					)));
				}
				Ok(tx) => {
					let missing_header = inner.apply_transaction(txid, &tx);
					if let Some(height) = missing_header {
						inner.fetch_header_timestamp(height).await;
					}
				}
				Err(e) => {
					error!(%txid, "Failed to fetch transaction: {}", e);
					(inner.on_error)(&e);
				}
			}
			guard.done();
		});
	}

	/// Sets the chain tip height reported by the backend.
	pub fn update_tip(&self, height: u64) {
		self.inner.state.write().tip_height = height;
	}

	pub fn tip_height(&self) -> u64 {
		self.inner.state.read().tip_height
	}

	/// Heights of confirmed transactions whose block time is unknown.
	pub fn heights_missing_timestamps(&self) -> Vec<u64> {
		let state = self.inner.state.read();
		let mut heights: Vec<u64> = state
			.txs
			.values()
			.filter(|indexed| indexed.height > 0)
			.map(|indexed| indexed.height as u64)
			.filter(|height| !state.header_timestamps.contains_key(height))
			.collect();
		heights.sort_unstable();
		heights.dedup();
		heights
	}

	/// Downloads missing block times, holding a sync request while doing so.
	pub async fn sync_header_timestamps(&self) {
		let heights = self.heights_missing_timestamps();
		if heights.is_empty() {
			return;
		}
		let guard = self.inner.synchronizer.inc_requests_counter();
		for height in heights {
			self.inner.fetch_header_timestamp(height).await;
		}
		guard.done();
	}

	/// Records a transaction we broadcast ourselves, before the server reports it.
	pub fn record_outgoing(&self, tx: &Transaction, is_ours: impl Fn(&str) -> bool) {
		let txid = tx.compute_txid();
		let mut state = self.inner.state.write();
		state.created.insert(txid, Utc::now());

		let mut addresses = HashSet::new();
		for input in &tx.input {
			if let Some(spent) = state.outputs.get(&input.previous_output) {
				addresses.insert(script_hash_hex(&spent.script_pubkey));
			}
		}
		for output in &tx.output {
			let script_hash = script_hash_hex(&output.script_pubkey);
			if is_ours(&script_hash) {
				addresses.insert(script_hash);
			}
		}
		for script_hash in &addresses {
			let history = state
				.address_histories
				.entry(script_hash.clone())
				.or_default();
			if !history.iter().any(|entry| entry.tx_hash == txid) {
				history.push(TxHistoryEntry {
					tx_hash: txid,
					height: 0,
				});
			}
		}
		for script_hash in addresses {
			state.process_tx_for_address(&script_hash, txid, tx, 0);
		}
	}

	pub fn transaction(&self, txid: &Txid) -> Option<Transaction> {
		self.inner
			.state
			.read()
			.txs
			.get(txid)
			.map(|indexed| indexed.tx.clone())
	}

	/// Every output we own that no indexed transaction spends.
	pub fn unspent_outputs(&self) -> HashMap<OutPoint, TxOut> {
		let state = self.inner.state.read();
		state
			.outputs
			.iter()
			.filter(|(outpoint, _)| !state.inputs.contains_key(outpoint))
			.map(|(outpoint, txout)| (*outpoint, txout.clone()))
			.collect()
	}

	/// Unspent outputs that are confirmed or are change of our own transactions.
	pub fn spendable_outputs(&self) -> Vec<SpendableOutput> {
		let state = self.inner.state.read();
		let mut spendable: Vec<SpendableOutput> = state
			.outputs
			.iter()
			.filter(|(outpoint, _)| !state.inputs.contains_key(outpoint))
			.filter_map(|(outpoint, txout)| {
				let indexed = state.txs.get(&outpoint.txid)?;
				(indexed.height > 0 || state.all_inputs_ours(&indexed.tx)).then(|| {
					SpendableOutput {
						outpoint: *outpoint,
						txout: txout.clone(),
						height: indexed.height,
						script_hash: script_hash_hex(&txout.script_pubkey),
					}
				})
			})
			.collect();
		spendable.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
		spendable
	}

	/// Our outputs at `outpoints`, spent or not. Outpoints we don't own are skipped.
	pub fn owned_outputs(&self, outpoints: &[OutPoint]) -> Vec<SpendableOutput> {
		let state = self.inner.state.read();
		outpoints
			.iter()
			.filter_map(|outpoint| {
				let txout = state.outputs.get(outpoint)?;
				let height = state.txs.get(&outpoint.txid).map_or(0, |indexed| indexed.height);
				Some(SpendableOutput {
					outpoint: *outpoint,
					txout: txout.clone(),
					height,
					script_hash: script_hash_hex(&txout.script_pubkey),
				})
			})
			.collect()
	}

	/// Waits for pending downloads, then splits our unspent outputs into available and incoming.
	pub async fn balance(&self) -> Balance {
		self.inner.synchronizer.wait_synchronized().await;
		let state = self.inner.state.read();
		let mut available = 0u64;
		let mut incoming = 0u64;
		for (outpoint, txout) in &state.outputs {
			if state.inputs.contains_key(outpoint) {
				continue;
			}
			let Some(indexed) = state.txs.get(&outpoint.txid) else {
				continue;
			};
			let value = txout.value.to_sat();
			if indexed.height > 0 || state.all_inputs_ours(&indexed.tx) {
				available += value;
			} else {
				incoming += value;
			}
		}
		Balance {
			available: Amount::from_u64(available),
			incoming: Amount::from_u64(incoming),
		}
	}

	/// Waits for pending downloads, then classifies every indexed transaction.
	///
	/// `is_change` tells whether a script hash belongs to the change chain.
	pub async fn transactions(&self, is_change: impl Fn(&str) -> bool) -> Vec<TransactionData> {
		self.inner.synchronizer.wait_synchronized().await;
		let state = self.inner.state.read();
		state
			.txs
			.iter()
			.map(|(txid, indexed)| self.inner.tx_info(&state, *txid, indexed, &is_change))
			.collect()
	}

	#[cfg(test)]
	fn check_invariants(&self) {
		let state = self.inner.state.read();
		for spending in state.inputs.values() {
			assert!(state.txs.contains_key(spending));
		}
		for outpoint in state.outputs.keys() {
			assert!(state.txs.contains_key(&outpoint.txid));
		}
	}
}

impl Inner {
	/// Processes a downloaded tx for every address whose history references it. Returns the
	/// height whose block time still has to be fetched, if any.
	fn apply_transaction(&self, txid: Txid, tx: &Transaction) -> Option<u64> {
		let mut state = self.state.write();
		let referencing: Vec<(ScriptHashHex, i64)> = state
			.address_histories
			.iter()
			.filter_map(|(script_hash, history)| {
				history
					.iter()
					.find(|entry| entry.tx_hash == txid)
					.map(|entry| (script_hash.clone(), entry.height))
			})
			.collect();
		let mut missing_header = None;
		for (script_hash, height) in referencing {
			state.process_tx_for_address(&script_hash, txid, tx, height);
			if height > 0 && !state.header_timestamps.contains_key(&(height as u64)) {
				missing_header = Some(height as u64);
			}
		}
		missing_header
	}

	async fn fetch_header_timestamp(&self, height: u64) {
		match self.backend.header_timestamp(height).await {
			Ok(timestamp) => {
				self.state.write().header_timestamps.insert(height, timestamp);
			}
			Err(e) => {
				warn!(height, "Failed to fetch block header: {}", e);
			}
		}
	}

	fn output_address(&self, txout: &TxOut) -> String {
		Address::from_script(&txout.script_pubkey, self.network)
			.map(|address| address.to_string())
			.unwrap_or_else(|_| "<unknown address>".to_string())
	}

	fn tx_info(
		&self,
		state: &IndexState,
		txid: Txid,
		indexed: &IndexedTx,
		is_change: &impl Fn(&str) -> bool,
	) -> TransactionData {
		let tx = &indexed.tx;
		let mut sum_our_inputs = 0i64;
		let mut all_inputs_ours = true;
		for input in &tx.input {
			match state.outputs.get(&input.previous_output) {
				Some(spent) => sum_our_inputs += spent.value.to_sat() as i64,
				None => all_inputs_ours = false,
			}
		}

		let mut sum_all_outputs = 0i64;
		let mut sum_our_receive = 0i64;
		let mut sum_our_change = 0i64;
		let mut all_outputs_ours = true;
		let mut receive_addresses = Vec::new();
		let mut send_addresses = Vec::new();
		for (vout, output) in tx.output.iter().enumerate() {
			let value = output.value.to_sat() as i64;
			sum_all_outputs += value;
			let ours = state.outputs.contains_key(&OutPoint {
				txid,
				vout: vout as u32,
			});
			let address_and_amount = AddressAndAmount {
				address: self.output_address(output),
				amount: Amount::from_i64(value),
				ours,
			};
			if ours {
				if is_change(&script_hash_hex(&output.script_pubkey)) {
					sum_our_change += value;
				} else {
					sum_our_receive += value;
					receive_addresses.push(address_and_amount.clone());
					send_addresses.push(address_and_amount);
				}
			} else {
				all_outputs_ours = false;
				send_addresses.push(address_and_amount);
			}
		}

		let (tx_type, amount, fee, addresses) = if all_inputs_ours {
			let fee = Some(Amount::from_i64(sum_our_inputs - sum_all_outputs));
			if all_outputs_ours {
				(TxType::SendSelf, sum_our_receive, fee, send_addresses)
			} else {
				(
					TxType::Send,
					sum_all_outputs - sum_our_receive - sum_our_change,
					fee,
					send_addresses,
				)
			}
		} else {
			(
				TxType::Receive,
				sum_our_receive + sum_our_change - sum_our_inputs,
				None,
				receive_addresses,
			)
		};

		let height = indexed.height;
		let num_confirmations = if height > 0 && state.tip_height > 0 {
			(state.tip_height as i64 - height + 1).max(0) as u32
		} else {
			0
		};
		let timestamp = if height > 0 {
			state.header_timestamps.get(&(height as u64)).copied()
		} else {
			None
		};

		TransactionData {
			tx_id: txid.to_string(),
			internal_id: txid.to_string(),
			tx_type,
			status: if height > 0 {
				TxStatus::Confirmed
			} else {
				TxStatus::Pending
			},
			amount: Amount::from_i64(amount),
			fee,
			fee_is_different_unit: false,
			timestamp,
			created_timestamp: state.created.get(&txid).copied(),
			height,
			num_confirmations,
			num_confirmations_complete: NUM_CONFIRMATIONS_COMPLETE,
			addresses,
			size: Some(tx.total_size() as u64),
			vsize: Some(tx.vsize() as u64),
			weight: Some(tx.weight().to_wu()),
			gas: None,
			nonce: None,
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use async_trait::async_trait;
	use bitcoin::absolute::LockTime;
	use bitcoin::hashes::Hash;
	use bitcoin::transaction::Version;
	use bitcoin::{ScriptBuf, Sequence, TxIn, WPubkeyHash, Witness};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tokio::sync::Notify;

	use crate::btc::blockchain::{Header, HeaderCallback, StatusCallback};

	/// In-memory chain backend. Downloads block on `gate` when set, subscriptions on
	/// `subscribe_gate` while it is armed.
	#[derive(Default)]
	pub(crate) struct MockBackend {
		pub(crate) txs: Mutex<HashMap<Txid, Transaction>>,
		pub(crate) histories: Mutex<HashMap<ScriptHashHex, Vec<TxHistoryEntry>>>,
		pub(crate) broadcasts: Mutex<Vec<Transaction>>,
		pub(crate) gets: AtomicUsize,
		pub(crate) gate: Option<Arc<Notify>>,
		pub(crate) subscribe_gate: Mutex<Option<Arc<Notify>>>,
	}

	impl MockBackend {
		pub(crate) fn add_tx(&self, tx: Transaction) -> Txid {
			let txid = tx.compute_txid();
			self.txs.lock().insert(txid, tx);
			txid
		}
	}

	#[async_trait]
	impl ChainBackend for MockBackend {
		async fn script_hash_get_history(
			&self,
			script_hash: &str,
		) -> Result<Vec<TxHistoryEntry>, ChainError> {
			Ok(self.histories.lock().get(script_hash).cloned().unwrap_or_default())
		}

		async fn script_hash_subscribe(
			&self,
			script_hash: &str,
			_on_status_change: StatusCallback,
		) -> Result<Option<String>, ChainError> {
			let gate = self.subscribe_gate.lock().clone();
			if let Some(gate) = gate {
				gate.notified().await;
			}
			let used = self
				.histories
				.lock()
				.get(script_hash)
				.is_some_and(|history| !history.is_empty());
			Ok(used.then(|| "status".to_string()))
		}

		async fn transaction_get(&self, tx_hash: Txid) -> Result<Transaction, ChainError> {
			self.gets.fetch_add(1, Ordering::SeqCst);
			if let Some(gate) = &self.gate {
				gate.notified().await;
			}
			self.txs
				.lock()
				.get(&tx_hash)
				.cloned()
				.ok_or_else(|| ChainError::Rpc {
					code: 2,
					message: "unknown transaction".to_string(),
				})
		}

		async fn headers_subscribe(&self, _on_header: HeaderCallback) -> Result<Header, ChainError> {
			Ok(Header {
				height: 100,
				timestamp: DateTime::from_timestamp(1_600_000_000, 0).unwrap_or_default(),
			})
		}

		async fn header_timestamp(&self, height: u64) -> Result<DateTime<Utc>, ChainError> {
			Ok(DateTime::from_timestamp(1_600_000_000 + height as i64 * 600, 0).unwrap_or_default())
		}

		async fn transaction_broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
			self.broadcasts.lock().push(tx.clone());
			Ok(tx.compute_txid())
		}

		async fn estimate_fee(&self, blocks: u32) -> Result<Option<u64>, ChainError> {
			Ok(Some(20_000 / blocks as u64))
		}

		async fn relay_fee(&self) -> Result<u64, ChainError> {
			Ok(1000)
		}

		async fn close(&self) {}
	}

	pub(crate) fn script(seed: u8) -> ScriptBuf {
		ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([seed; 20]))
	}

	pub(crate) fn make_tx(inputs: &[OutPoint], outputs: &[(ScriptBuf, u64)]) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: inputs
				.iter()
				.map(|outpoint| TxIn {
					previous_output: *outpoint,
					script_sig: ScriptBuf::new(),
					sequence: Sequence::MAX,
					witness: Witness::new(),
				})
				.collect(),
			output: outputs
				.iter()
				.map(|(script_pubkey, value)| TxOut {
					value: bitcoin::Amount::from_sat(*value),
					script_pubkey: script_pubkey.clone(),
				})
				.collect(),
		}
	}

	fn external_outpoint(seed: u8) -> OutPoint {
		OutPoint {
			txid: Txid::from_byte_array([seed; 32]),
			vout: 0,
		}
	}

	fn index(backend: Arc<MockBackend>) -> TxIndex {
		let synchronizer = Synchronizer::new(|| {}, || {});
		TxIndex::new(backend, synchronizer, Network::Bitcoin, |_| {})
	}

	fn entry(txid: Txid, height: i64) -> TxHistoryEntry {
		TxHistoryEntry {
			tx_hash: txid,
			height,
		}
	}

	struct Fixture {
		ours: String,
		funding: Txid,
		spending: Txid,
	}

	fn fund_and_spend(backend: &MockBackend) -> Fixture {
		let funding = make_tx(&[external_outpoint(9)], &[(script(1), 50_000)]);
		let funding_txid = backend.add_tx(funding);
		let spending = make_tx(
			&[OutPoint {
				txid: funding_txid,
				vout: 0,
			}],
			&[(script(2), 49_000)],
		);
		let spending_txid = backend.add_tx(spending);
		Fixture {
			ours: script_hash_hex(&script(1)),
			funding: funding_txid,
			spending: spending_txid,
		}
	}

	#[tokio::test]
	async fn test_spend_before_funding() {
		let backend = Arc::new(MockBackend::default());
		let fixture = fund_and_spend(&backend);
		let index = index(backend);

		index.update_address_history(&fixture.ours, vec![entry(fixture.spending, 11)]);
		index.balance().await;
		index.update_address_history(
			&fixture.ours,
			vec![entry(fixture.funding, 10), entry(fixture.spending, 11)],
		);

		let balance = index.balance().await;
		assert_eq!(balance.available, Amount::zero());
		assert_eq!(balance.incoming, Amount::zero());
		assert!(index.unspent_outputs().is_empty());
		index.check_invariants();
	}

	#[tokio::test]
	async fn test_natural_order() {
		let backend = Arc::new(MockBackend::default());
		let fixture = fund_and_spend(&backend);
		let index = index(backend);

		index.update_address_history(&fixture.ours, vec![entry(fixture.funding, 10)]);
		assert_eq!(index.balance().await.available, Amount::from_u64(50_000));

		index.update_address_history(
			&fixture.ours,
			vec![entry(fixture.funding, 10), entry(fixture.spending, 11)],
		);
		assert_eq!(index.balance().await.available, Amount::zero());

		let mut txs = index.transactions(|_| false).await;
		txs.sort_by_key(|tx| tx.height);
		assert_eq!(txs[0].tx_type, TxType::Receive);
		assert_eq!(txs[0].amount, Amount::from_i64(50_000));
		assert_eq!(txs[1].tx_type, TxType::Send);
		assert_eq!(txs[1].amount, Amount::from_i64(49_000));
		assert_eq!(txs[1].fee, Some(Amount::from_i64(1_000)));
		assert!(txs[1].timestamp.is_some());
		index.check_invariants();
	}

	#[tokio::test]
	async fn test_unconfirmed_receive_is_incoming() {
		let backend = Arc::new(MockBackend::default());
		let fixture = fund_and_spend(&backend);
		let index = index(backend);

		index.update_address_history(&fixture.ours, vec![entry(fixture.funding, 0)]);
		let balance = index.balance().await;
		assert_eq!(balance.available, Amount::zero());
		assert_eq!(balance.incoming, Amount::from_u64(50_000));
		assert!(index.spendable_outputs().is_empty());
	}

	#[tokio::test]
	async fn test_removed_history_drops_tx() {
		let backend = Arc::new(MockBackend::default());
		let fixture = fund_and_spend(&backend);
		let index = index(backend);

		index.update_address_history(&fixture.ours, vec![entry(fixture.funding, 0)]);
		index.balance().await;
		assert!(index.transaction(&fixture.funding).is_some());

		index.update_address_history(&fixture.ours, vec![]);
		assert!(index.transaction(&fixture.funding).is_none());
		assert_eq!(index.balance().await.incoming, Amount::zero());
		index.check_invariants();
	}

	#[tokio::test]
	async fn test_fetches_are_deduplicated() {
		let gate = Arc::new(Notify::new());
		let backend = Arc::new(MockBackend {
			gate: Some(gate.clone()),
			..Default::default()
		});
		let fixture = fund_and_spend(&backend);
		let index = index(backend.clone());
		let other = script_hash_hex(&script(2));

		// Both addresses reference the spending tx while its download is still blocked.
		index.update_address_history(&fixture.ours, vec![entry(fixture.spending, 5)]);
		index.update_address_history(&other, vec![entry(fixture.spending, 5)]);
		tokio::task::yield_now().await;
		gate.notify_one();
		index.balance().await;

		assert_eq!(backend.gets.load(Ordering::SeqCst), 1);
		// The spending tx pays to the second address.
		assert_eq!(index.unspent_outputs().len(), 1);
	}

	#[tokio::test]
	async fn test_self_send_classification() {
		let backend = Arc::new(MockBackend::default());
		let funding = make_tx(&[external_outpoint(3)], &[(script(1), 10_000)]);
		let funding_txid = backend.add_tx(funding);
		let self_send = make_tx(
			&[OutPoint {
				txid: funding_txid,
				vout: 0,
			}],
			&[(script(4), 6_000), (script(5), 3_500)],
		);
		let self_send_txid = backend.add_tx(self_send);
		let index = index(backend);

		let receive = script_hash_hex(&script(1));
		let receive_2 = script_hash_hex(&script(4));
		let change = script_hash_hex(&script(5));
		index.update_address_history(&receive, vec![entry(funding_txid, 1), entry(self_send_txid, 2)]);
		index.update_address_history(&receive_2, vec![entry(self_send_txid, 2)]);
		index.update_address_history(&change, vec![entry(self_send_txid, 2)]);

		let change_for_closure = change.clone();
		let txs = index
			.transactions(move |script_hash| script_hash == change_for_closure)
			.await;
		let tx = txs
			.iter()
			.find(|tx| tx.tx_id == self_send_txid.to_string())
			.unwrap();
		assert_eq!(tx.tx_type, TxType::SendSelf);
		assert_eq!(tx.amount, Amount::from_i64(6_000));
		assert_eq!(tx.fee, Some(Amount::from_i64(500)));
		assert_eq!(index.balance().await.available, Amount::from_u64(9_500));
	}
}
