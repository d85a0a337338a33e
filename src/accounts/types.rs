//!
//! Account-level types: errors, balances, fee targets and proposal arguments.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::btc::blockchain::ChainError;
use crate::coin::{Amount, AmountError, FeeTargetCode, SendAmount};
use crate::eth::types::EthError;
use crate::keystore::KeystoreError;
use crate::store::StoreError;

use super::notes::NotesError;

/// Errors surfaced by account operations
#[derive(Debug, Error)]
pub enum AccountError {
	#[error("invalid address")]
	InvalidAddress,

	#[error("invalid amount: {0}")]
	InvalidAmount(String),

	#[error("insufficient funds")]
	InsufficientFunds,

	#[error("sync in progress")]
	SyncInProgress,

	#[error("unsupported feature: {0}")]
	UnsupportedFeature(String),

	#[error("fee rates are not available")]
	FeesNotAvailable,

	#[error("fee rate must be higher than the fee rate of the replaced transaction")]
	FeeTooLow,

	#[error("no transaction proposal to send")]
	NoProposal,

	#[error("account offline: {0}")]
	Offline(String),

	#[error("account in fatal state: {0}")]
	Fatal(String),

	#[error("account closed")]
	Closed,

	#[error("chain backend error: {0}")]
	Chain(#[from] ChainError),

	#[error("ethereum client error: {0}")]
	Eth(#[from] EthError),

	#[error("store error: {0}")]
	Store(#[from] StoreError),

	#[error("keystore error: {0}")]
	Keystore(#[from] KeystoreError),

	#[error("notes error: {0}")]
	Notes(#[from] NotesError),
}

impl From<AmountError> for AccountError {
	fn from(error: AmountError) -> Self {
		AccountError::InvalidAmount(error.to_string())
	}
}

/// Balance of an account in the smallest unit of its coin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
	/// Spendable now.
	pub available: Amount,
	/// Received but not spendable yet.
	pub incoming: Amount,
}

/// Fee rate behind a fee target. Unit is sat/kvB for UTXO coins and wei per gas for Ethereum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTarget {
	pub code: FeeTargetCode,
	/// `None` when the backend has no estimate yet.
	pub fee_rate: Option<u64>,
}

/// Arguments of a transaction proposal.
#[derive(Debug, Clone, Default)]
pub struct TxProposalArgs {
	pub recipient: String,
	pub amount: SendAmount,
	pub fee_target: FeeTargetCode,
	/// Used with [`FeeTargetCode::Custom`]: sat/vB for UTXO coins, Gwei for Ethereum.
	pub custom_fee: Option<String>,
	/// Outpoints `txid:vout` to restrict coin selection to. Empty means any.
	pub selected_utxos: Vec<String>,
	/// Replace this unconfirmed transaction, spending exactly its inputs.
	pub rbf_tx_id: Option<String>,
	pub use_highest_fee: bool,
	/// Contract call data, Ethereum only.
	pub data: Vec<u8>,
}

/// Outcome of a proposal. `total` is what leaves the account in its own unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalResult {
	pub amount: Amount,
	pub fee: Amount,
	pub total: Amount,
}

/// A receive address handed to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressInfo {
	pub id: String,
	pub address: String,
	pub keypath: String,
}
