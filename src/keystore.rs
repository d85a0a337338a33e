//! The signing device boundary.
//!
//! Accounts never see private keys. They hand the keystore an unsigned transaction plus the
//! keypaths it needs and get a signed transaction back.

use async_trait::async_trait;
use bitcoin::Transaction;
use thiserror::Error;

use crate::btc::maketx::TxProposal;
use crate::coin::Coin;
use crate::eth::types::EthTxRequest;
use crate::signing::{AbsoluteKeypath, SigningConfiguration};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeystoreError {
	#[error("keystore does not support {0}")]
	UnsupportedFeature(String),

	#[error("aborted by the user")]
	UserAbort,

	#[error("keystore error: {0}")]
	Device(String),
}

#[async_trait]
pub trait Keystore: Send + Sync {
	fn name(&self) -> &str;

	/// Whether addresses of `coin` can be shown on the device.
	fn can_verify_address(&self, coin: &Coin) -> bool;

	/// Shows the address at `keypath` on the device for the user to compare.
	async fn verify_address(
		&self,
		coin: &Coin,
		configuration: &SigningConfiguration,
		keypath: &AbsoluteKeypath,
	) -> Result<(), KeystoreError>;

	/// Signs every input of the proposal. `input_keypaths` is in input order.
	async fn sign_btc_transaction(
		&self,
		coin: &Coin,
		proposal: &TxProposal,
		input_keypaths: &[AbsoluteKeypath],
	) -> Result<Transaction, KeystoreError>;

	/// Returns the raw signed transaction.
	async fn sign_eth_transaction(
		&self,
		coin: &Coin,
		request: &EthTxRequest,
		keypath: &AbsoluteKeypath,
	) -> Result<Vec<u8>, KeystoreError>;
}

/// Keystore of a watch-only account: knows the xpubs, can't sign or show anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct WatchOnly;

#[async_trait]
impl Keystore for WatchOnly {
	fn name(&self) -> &str {
		"watch-only"
	}

	fn can_verify_address(&self, _coin: &Coin) -> bool {
		false
	}

	async fn verify_address(
		&self,
		_coin: &Coin,
		_configuration: &SigningConfiguration,
		_keypath: &AbsoluteKeypath,
	) -> Result<(), KeystoreError> {
		Err(KeystoreError::UnsupportedFeature("address verification".to_string()))
	}

	async fn sign_btc_transaction(
		&self,
		_coin: &Coin,
		_proposal: &TxProposal,
		_input_keypaths: &[AbsoluteKeypath],
	) -> Result<Transaction, KeystoreError> {
		Err(KeystoreError::UnsupportedFeature("signing".to_string()))
	}

	async fn sign_eth_transaction(
		&self,
		_coin: &Coin,
		_request: &EthTxRequest,
		_keypath: &AbsoluteKeypath,
	) -> Result<Vec<u8>, KeystoreError> {
		Err(KeystoreError::UnsupportedFeature("signing".to_string()))
	}
}
