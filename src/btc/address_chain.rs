//! One derivation branch (receive or change) of a UTXO account.
//!
//! The chain always ends in exactly `gap_limit` unused addresses once
//! [`AddressChain::ensure_addresses`] has run. An address is unused while its history is empty.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::Network;
use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::Secp256k1;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use super::address::AccountAddress;
use super::blockchain::ScriptHashHex;
use crate::signing::{AbsoluteKeypath, SigningConfiguration, SigningError};

#[derive(Error, Debug)]
pub enum AddressChainError {
	#[error("addresses not synced: {unused} unused addresses at the tail, expected {gap_limit}")]
	NotSynced { unused: usize, gap_limit: usize },

	#[error("address derivation failed: {0}")]
	Derivation(#[from] SigningError),
}

#[derive(Default)]
struct ChainState {
	addresses: Vec<Arc<AccountAddress>>,
	by_script_hash: HashMap<ScriptHashHex, Arc<AccountAddress>>,
	by_encoded: HashMap<String, Arc<AccountAddress>>,
}

impl ChainState {
	fn unused_tail_count(&self) -> usize {
		self.addresses
			.iter()
			.rev()
			.take_while(|address| !address.is_used())
			.count()
	}
}

pub struct AddressChain {
	configuration: SigningConfiguration,
	network: Network,
	gap_limit: usize,
	chain_index: u32,
	branch_xpub: Xpub,
	branch_keypath: AbsoluteKeypath,
	state: RwLock<ChainState>,
}

impl AddressChain {
	/// Fails if the branch key can't be derived from the configured xpub.
	pub fn new(
		configuration: SigningConfiguration,
		network: Network,
		gap_limit: usize,
		chain_index: u32,
	) -> Result<Self, AddressChainError> {
		let secp = Secp256k1::verification_only();
		let child = ChildNumber::from_normal_idx(chain_index).map_err(SigningError::from)?;
		let branch_xpub = configuration
			.xpub
			.derive_pub(&secp, &[child])
			.map_err(SigningError::from)?;
		let branch_keypath = configuration.keypath.child(chain_index)?;
		Ok(Self {
			configuration,
			network,
			gap_limit,
			chain_index,
			branch_xpub,
			branch_keypath,
			state: RwLock::new(ChainState::default()),
		})
	}

	pub fn gap_limit(&self) -> usize {
		self.gap_limit
	}

	pub fn chain_index(&self) -> u32 {
		self.chain_index
	}

	pub fn len(&self) -> usize {
		self.state.read().addresses.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn addresses(&self) -> Vec<Arc<AccountAddress>> {
		self.state.read().addresses.clone()
	}

	/// Derives addresses until the chain ends in `gap_limit` unused ones and returns the new
	/// addresses. Calling it again without history changes adds nothing.
	pub fn ensure_addresses(&self) -> Result<Vec<Arc<AccountAddress>>, AddressChainError> {
		let mut state = self.state.write();
		let unused = state.unused_tail_count();
		let mut added = Vec::new();
		for _ in unused..self.gap_limit {
			let index = u32::try_from(state.addresses.len()).map_err(|_| {
				SigningError::InvalidKeypath(format!("{}/{}", self.branch_keypath, state.addresses.len()))
			})?;
			let address = Arc::new(AccountAddress::derive(
				&self.branch_xpub,
				&self.branch_keypath,
				index,
				self.configuration.script_type,
				self.network,
			)?);
			state.addresses.push(address.clone());
			state
				.by_script_hash
				.insert(address.script_hash().clone(), address.clone());
			state
				.by_encoded
				.insert(address.encode_for_humans(), address.clone());
			added.push(address);
		}
		if !added.is_empty() {
			debug!(
				chain_index = self.chain_index,
				added = added.len(),
				total = state.addresses.len(),
				"Extended address chain"
			);
		}
		Ok(added)
	}

	/// The unused tail of the chain, oldest first.
	pub fn unused_addresses(&self) -> Result<Vec<Arc<AccountAddress>>, AddressChainError> {
		let state = self.state.read();
		let unused = state.unused_tail_count();
		if unused < self.gap_limit || unused == 0 {
			return Err(AddressChainError::NotSynced {
				unused,
				gap_limit: self.gap_limit,
			});
		}
		Ok(state.addresses[state.addresses.len() - unused..].to_vec())
	}

	/// The first address of the unused tail, at position `len - gap_limit`.
	///
	/// # Panics
	///
	/// Panics if the chain does not end in `gap_limit` unused addresses; call
	/// [`AddressChain::ensure_addresses`] first.
	pub fn get_unused(&self) -> Arc<AccountAddress> {
		let state = self.state.read();
		let unused = state.unused_tail_count();
		assert!(
			unused >= self.gap_limit && self.gap_limit > 0,
			"concurrency error: addresses not synced correctly ({} unused, gap limit {})",
			unused,
			self.gap_limit
		);
		state.addresses[state.addresses.len() - self.gap_limit].clone()
	}

	/// Whether the human-readable address belongs to this chain.
	pub fn contains(&self, address: &str) -> bool {
		self.state.read().by_encoded.contains_key(address)
	}

	pub fn lookup_by_script_hash(&self, script_hash: &str) -> Option<Arc<AccountAddress>> {
		self.state.read().by_script_hash.get(script_hash).cloned()
	}

	pub fn lookup_by_keypath(&self, keypath: &AbsoluteKeypath) -> Option<Arc<AccountAddress>> {
		self.state
			.read()
			.addresses
			.iter()
			.find(|address| address.keypath() == keypath)
			.cloned()
	}
}
