//! Coin selection and unsigned transaction construction.

use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount as BtcAmount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};

use super::address::AccountAddress;
use super::tx_index::SpendableOutput;
use crate::signing::ScriptType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MakeTxError {
	#[error("insufficient funds")]
	InsufficientFunds,

	#[error("amount must be positive")]
	ZeroAmount,

	#[error("fee rate {0} sat/kvB is out of range")]
	FeeOverflow(u64),
}

/// An unsigned transaction ready to be handed to the keystore.
#[derive(Debug, Clone)]
pub struct TxProposal {
	/// Value sent to the recipient, excluding the fee.
	pub amount: u64,
	pub fee: u64,
	pub fee_rate_per_kb: u64,
	pub tx: Transaction,
	/// Outputs spent by `tx`, in input order.
	pub previous_outputs: Vec<SpendableOutput>,
	pub change_address: Option<Arc<AccountAddress>>,
	pub input_script_type: ScriptType,
}

impl TxProposal {
	pub fn total(&self) -> u64 {
		self.amount + self.fee
	}
}

const SIGNATURE_SIZE: usize = 72;
const PUBKEY_SIZE: usize = 33;

fn var_int_size(value: usize) -> usize {
	match value {
		0..=0xfc => 1,
		0xfd..=0xffff => 3,
		0x10000..=0xffff_ffff => 5,
		_ => 9,
	}
}

fn witness_v0_size() -> usize {
	var_int_size(2) + var_int_size(SIGNATURE_SIZE) + SIGNATURE_SIZE + var_int_size(PUBKEY_SIZE) + PUBKEY_SIZE
}

/// Sizes of the signature script and of the witness needed to spend an input.
fn sig_script_witness_size(script_type: ScriptType) -> (usize, usize) {
	match script_type {
		ScriptType::P2pkh => (1 + SIGNATURE_SIZE + 1 + PUBKEY_SIZE, 0),
		// OP_0 <20 byte hash> pushed as redeem script.
		ScriptType::P2wpkhP2sh => (1 + 22, witness_v0_size()),
		ScriptType::P2wpkh => (0, witness_v0_size()),
	}
}

fn input_size(sig_script_size: usize) -> usize {
	32 + 4 + var_int_size(sig_script_size) + sig_script_size + 4
}

fn output_size(pk_script_size: usize) -> usize {
	if pk_script_size == 0 {
		return 0;
	}
	8 + var_int_size(pk_script_size) + pk_script_size
}

/// Virtual size of a tx spending `input_count` inputs of `script_type` to one output, plus a
/// change output unless `change_pk_script_size` is 0.
pub fn estimate_tx_vsize(
	input_count: usize,
	script_type: ScriptType,
	output_pk_script_size: usize,
	change_pk_script_size: usize,
) -> u64 {
	let output_count = if change_pk_script_size == 0 { 1 } else { 2 };
	const NON_WITNESS: usize = 4;
	let mut weight = NON_WITNESS
		* (4 + 4
			+ var_int_size(input_count)
			+ var_int_size(output_count)
			+ output_size(output_pk_script_size)
			+ output_size(change_pk_script_size));

	let (sig_script_size, witness_size) = sig_script_witness_size(script_type);
	weight += input_count * (NON_WITNESS * input_size(sig_script_size) + witness_size);
	if witness_size > 0 && input_count > 0 {
		// Segwit marker and flag.
		weight += 2;
	}
	weight.div_ceil(4) as u64
}

/// Fee for a tx of `vsize` virtual bytes at `fee_per_kb` sat/kvB. Never zero for a non-zero rate.
pub fn fee_for_serialize_size(fee_per_kb: u64, vsize: u64) -> Result<u64, MakeTxError> {
	let fee = fee_per_kb
		.checked_mul(vsize)
		.ok_or(MakeTxError::FeeOverflow(fee_per_kb))?
		/ 1000;
	if fee == 0 && fee_per_kb > 0 {
		return Ok(fee_per_kb);
	}
	Ok(fee)
}

/// Whether spending an output of `amount` would cost more than a third of its value.
pub fn is_dust_amount(amount: u64, pk_script_size: usize, script_type: ScriptType, fee_per_kb: u64) -> bool {
	let spend_input_size = if script_type.is_segwit() {
		32 + 4 + 1 + 107 / 4 + 4
	} else {
		32 + 4 + 1 + 107 + 4
	};
	let total_size = (output_size(pk_script_size) + spend_input_size) as u128;
	u128::from(amount) * 1000 < 3 * u128::from(fee_per_kb) * total_size
}

/// Picks outputs by descending value until `min_amount` is covered.
fn coin_selection(
	min_amount: u64,
	outputs: &[SpendableOutput],
) -> Result<(u64, Vec<SpendableOutput>), MakeTxError> {
	let mut sorted: Vec<&SpendableOutput> = outputs.iter().collect();
	sorted.sort_by(|a, b| {
		b.txout
			.value
			.cmp(&a.txout.value)
			.then_with(|| b.script_hash.cmp(&a.script_hash))
			.then_with(|| a.outpoint.cmp(&b.outpoint))
	});
	let mut selected = Vec::new();
	let mut sum = 0u64;
	for output in sorted {
		if sum >= min_amount {
			break;
		}
		sum += output.txout.value.to_sat();
		selected.push(output.clone());
	}
	if sum < min_amount {
		return Err(MakeTxError::InsufficientFunds);
	}
	Ok((sum, selected))
}

fn unsigned_tx(inputs: &[SpendableOutput], outputs: Vec<TxOut>) -> Transaction {
	Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: inputs
			.iter()
			.map(|output| TxIn {
				previous_output: output.outpoint,
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
				witness: Witness::new(),
			})
			.collect(),
		output: outputs,
	}
}

/// Builds a tx paying `amount` to `recipient`, adding a change output to `change_address` unless
/// the change would be dust.
///
/// With `use_all_inputs` every output in `spendable` is spent (used to replace a transaction).
#[allow(clippy::too_many_arguments)]
pub fn new_tx(
	script_type: ScriptType,
	spendable: &[SpendableOutput],
	recipient: ScriptBuf,
	amount: u64,
	fee_per_kb: u64,
	change_address: Arc<AccountAddress>,
	use_all_inputs: bool,
	rng: &mut impl Rng,
) -> Result<TxProposal, MakeTxError> {
	if amount == 0 {
		return Err(MakeTxError::ZeroAmount);
	}
	let change_pk_script_size = change_address.script_pubkey().len();
	let estimated = estimate_tx_vsize(1, script_type, recipient.len(), change_pk_script_size);
	let mut target_fee = fee_for_serialize_size(fee_per_kb, estimated)?;
	loop {
		let target = amount
			.checked_add(target_fee)
			.ok_or(MakeTxError::InsufficientFunds)?;
		let (selected_sum, selected) = if use_all_inputs {
			let sum: u64 = spendable.iter().map(|output| output.txout.value.to_sat()).sum();
			if sum < target {
				return Err(MakeTxError::InsufficientFunds);
			}
			(sum, spendable.to_vec())
		} else {
			coin_selection(target, spendable)?
		};

		let vsize = estimate_tx_vsize(
			selected.len(),
			script_type,
			recipient.len(),
			change_pk_script_size,
		);
		let required_fee = fee_for_serialize_size(fee_per_kb, vsize)?;
		if selected_sum - amount < required_fee {
			target_fee = required_fee;
			continue;
		}

		let change_amount = selected_sum - amount - required_fee;
		let change_is_dust = is_dust_amount(
			change_amount,
			change_pk_script_size,
			change_address.script_type(),
			fee_per_kb,
		);
		let mut outputs = vec![TxOut {
			value: BtcAmount::from_sat(amount),
			script_pubkey: recipient.clone(),
		}];
		let (fee, change_address) = if change_amount == 0 || change_is_dust {
			if change_is_dust {
				info!(change_amount, "Change is dust, adding it to the fee");
			}
			(selected_sum - amount, None)
		} else {
			let position = rng.random_range(0..=outputs.len());
			outputs.insert(
				position,
				TxOut {
					value: BtcAmount::from_sat(change_amount),
					script_pubkey: change_address.script_pubkey().clone(),
				},
			);
			(required_fee, Some(change_address))
		};

		debug!(fee, inputs = selected.len(), "Prepared transaction");
		return Ok(TxProposal {
			amount,
			fee,
			fee_rate_per_kb: fee_per_kb,
			tx: unsigned_tx(&selected, outputs),
			previous_outputs: selected,
			change_address,
			input_script_type: script_type,
		});
	}
}

/// Builds a tx sending every spendable output to `recipient`, minus the fee.
pub fn new_tx_spend_all(
	script_type: ScriptType,
	spendable: &[SpendableOutput],
	recipient: ScriptBuf,
	fee_per_kb: u64,
) -> Result<TxProposal, MakeTxError> {
	let sum: u64 = spendable.iter().map(|output| output.txout.value.to_sat()).sum();
	let vsize = estimate_tx_vsize(spendable.len(), script_type, recipient.len(), 0);
	let fee = fee_for_serialize_size(fee_per_kb, vsize)?;
	if spendable.is_empty() || sum <= fee {
		return Err(MakeTxError::InsufficientFunds);
	}
	let amount = sum - fee;
	debug!(fee, inputs = spendable.len(), "Prepared transaction spending all outputs");
	Ok(TxProposal {
		amount,
		fee,
		fee_rate_per_kb: fee_per_kb,
		tx: unsigned_tx(
			spendable,
			vec![TxOut {
				value: BtcAmount::from_sat(amount),
				script_pubkey: recipient,
			}],
		),
		previous_outputs: spendable.to_vec(),
		change_address: None,
		input_script_type: script_type,
	})
}
