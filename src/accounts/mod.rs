//! Coin independent account plumbing
//!
//! [`Account`] is the handle the rest of the application works with; it dispatches to the
//! UTXO or the Ethereum implementation.

pub mod base;
pub mod export;
pub mod notes;
pub mod transaction;
pub mod types;

use std::io::Write;
use std::sync::Arc;

pub use base::{AccountConfig, BaseAccount};
pub use transaction::{OrderedTransactions, TransactionData, TxStatus, TxType};
pub use types::{AccountError, AddressInfo, Balance, FeeTarget, ProposalResult, TxProposalArgs};

use crate::btc::BtcAccount;
use crate::coin::FeeTargetCode;
use crate::eth::EthAccount;

#[derive(Clone)]
pub enum Account {
	Btc(Arc<BtcAccount>),
	Eth(Arc<EthAccount>),
}

impl Account {
	pub fn base(&self) -> &BaseAccount {
		match self {
			Account::Btc(account) => account.base(),
			Account::Eth(account) => account.base(),
		}
	}

	pub fn code(&self) -> &str {
		self.base().code()
	}

	pub async fn initialize(&self) -> Result<(), AccountError> {
		match self {
			Account::Btc(account) => account.initialize().await,
			Account::Eth(account) => account.initialize().await,
		}
	}

	pub async fn balance(&self) -> Result<Balance, AccountError> {
		match self {
			Account::Btc(account) => account.balance().await,
			Account::Eth(account) => account.balance().await,
		}
	}

	pub async fn transactions(&self) -> Result<OrderedTransactions, AccountError> {
		match self {
			Account::Btc(account) => account.transactions().await,
			Account::Eth(account) => account.transactions().await,
		}
	}

	pub fn fee_targets(&self) -> (Vec<FeeTarget>, FeeTargetCode) {
		match self {
			Account::Btc(account) => account.fee_targets(),
			Account::Eth(account) => account.fee_targets(),
		}
	}

	pub async fn tx_proposal(&self, args: &TxProposalArgs) -> Result<ProposalResult, AccountError> {
		match self {
			Account::Btc(account) => account.tx_proposal(args),
			Account::Eth(account) => account.tx_proposal(args).await,
		}
	}

	pub async fn send_tx(&self) -> Result<String, AccountError> {
		match self {
			Account::Btc(account) => account.send_tx().await,
			Account::Eth(account) => account.send_tx().await,
		}
	}

	pub fn unused_receive_addresses(&self) -> Result<Vec<AddressInfo>, AccountError> {
		match self {
			Account::Btc(account) => account.unused_receive_addresses(),
			Account::Eth(account) => account.unused_receive_addresses(),
		}
	}

	pub async fn verify_address(&self, address_id: &str) -> Result<bool, AccountError> {
		match self {
			Account::Btc(account) => account.verify_address(address_id).await,
			Account::Eth(account) => account.verify_address(address_id).await,
		}
	}

	/// Writes all transactions as CSV, newest first.
	pub async fn export_csv<W: Write>(&self, writer: &mut W) -> Result<(), AccountError> {
		let transactions = self.transactions().await?;
		self.base()
			.export_csv(writer, transactions.iter().map(|tx| &tx.tx))
	}

	pub fn close(&self) {
		match self {
			Account::Btc(account) => account.close(),
			Account::Eth(account) => account.close(),
		}
	}
}
