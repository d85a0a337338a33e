use std::sync::LazyLock;

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Address, CompressedPublicKey, Network, ScriptBuf, ScriptHash};
use parking_lot::RwLock;

use super::blockchain::{ScriptHashHex, TxHistoryEntry, script_hash_hex};
use crate::signing::{AbsoluteKeypath, ScriptType, SigningError};

static SECP: LazyLock<Secp256k1<VerifyOnly>> = LazyLock::new(Secp256k1::verification_only);

/// Address derived at `xpub/chain_index/address_index`, together with its last known history.
#[derive(Debug)]
pub struct AccountAddress {
	address: Address,
	script_pubkey: ScriptBuf,
	script_hash: ScriptHashHex,
	script_type: ScriptType,
	keypath: AbsoluteKeypath,
	public_key: CompressedPublicKey,
	history: RwLock<Vec<TxHistoryEntry>>,
}

impl AccountAddress {
	/// Derives the child `index` of `branch_xpub`, whose keypath is `branch_keypath`.
	pub fn derive(
		branch_xpub: &Xpub,
		branch_keypath: &AbsoluteKeypath,
		index: u32,
		script_type: ScriptType,
		network: Network,
	) -> Result<Self, SigningError> {
		let child = ChildNumber::from_normal_idx(index)?;
		let xpub = branch_xpub.derive_pub(&SECP, &[child])?;
		Self::from_public_key(
			CompressedPublicKey(xpub.public_key),
			branch_keypath.child(index)?,
			script_type,
			network,
		)
	}

	pub fn from_public_key(
		public_key: CompressedPublicKey,
		keypath: AbsoluteKeypath,
		script_type: ScriptType,
		network: Network,
	) -> Result<Self, SigningError> {
		let script_pubkey = match script_type {
			ScriptType::P2pkh => ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
			ScriptType::P2wpkh => ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash()),
			ScriptType::P2wpkhP2sh => {
				let redeem_script = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
				ScriptBuf::new_p2sh(&ScriptHash::hash(redeem_script.as_bytes()))
			}
		};
		let address = Address::from_script(&script_pubkey, network)
			.map_err(|e| SigningError::InvalidKeypath(format!("{}: {}", keypath, e)))?;
		let script_hash = script_hash_hex(&script_pubkey);
		Ok(Self {
			address,
			script_pubkey,
			script_hash,
			script_type,
			keypath,
			public_key,
			history: RwLock::new(Vec::new()),
		})
	}

	/// Stable id of the address, the Electrum script hash.
	pub fn id(&self) -> &str {
		&self.script_hash
	}

	pub fn script_hash(&self) -> &ScriptHashHex {
		&self.script_hash
	}

	pub fn encode_for_humans(&self) -> String {
		self.address.to_string()
	}

	pub fn address(&self) -> &Address {
		&self.address
	}

	pub fn script_pubkey(&self) -> &ScriptBuf {
		&self.script_pubkey
	}

	pub fn script_type(&self) -> ScriptType {
		self.script_type
	}

	pub fn keypath(&self) -> &AbsoluteKeypath {
		&self.keypath
	}

	pub fn public_key(&self) -> &CompressedPublicKey {
		&self.public_key
	}

	pub fn history(&self) -> Vec<TxHistoryEntry> {
		self.history.read().clone()
	}

	pub fn set_history(&self, history: Vec<TxHistoryEntry>) {
		*self.history.write() = history;
	}

	pub fn is_used(&self) -> bool {
		!self.history.read().is_empty()
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use bitcoin::bip32::Xpriv;

	/// Account xpub of a fixed test seed, with keypath `m/84'/0'/0'`.
	pub(crate) fn test_xpub() -> Xpub {
		let secp = Secp256k1::new();
		let master = Xpriv::new_master(Network::Bitcoin, &[7u8; 32]).unwrap();
		let path: bitcoin::bip32::DerivationPath = "84'/0'/0'".parse().unwrap();
		let account = master.derive_priv(&secp, &path).unwrap();
		Xpub::from_priv(&secp, &account)
	}

	fn derive(script_type: ScriptType, index: u32) -> AccountAddress {
		let keypath: AbsoluteKeypath = "m/84'/0'/0'/0".parse().unwrap();
		let receive_xpub = test_xpub()
			.derive_pub(&SECP, &[ChildNumber::from_normal_idx(0).unwrap()])
			.unwrap();
		AccountAddress::derive(&receive_xpub, &keypath, index, script_type, Network::Bitcoin)
			.unwrap()
	}

	#[test]
	fn test_derive_script_types() {
		let native = derive(ScriptType::P2wpkh, 0);
		assert!(native.encode_for_humans().starts_with("bc1q"));
		assert!(native.script_pubkey().is_p2wpkh());
		assert_eq!(native.keypath().to_string(), "m/84'/0'/0'/0/0");

		let wrapped = derive(ScriptType::P2wpkhP2sh, 0);
		assert!(wrapped.encode_for_humans().starts_with('3'));
		assert!(wrapped.script_pubkey().is_p2sh());

		let legacy = derive(ScriptType::P2pkh, 0);
		assert!(legacy.encode_for_humans().starts_with('1'));
		assert_eq!(native.public_key(), legacy.public_key());
	}

	#[test]
	fn test_derivation_is_deterministic() {
		let first = derive(ScriptType::P2wpkh, 3);
		let again = derive(ScriptType::P2wpkh, 3);
		let other = derive(ScriptType::P2wpkh, 4);
		assert_eq!(first.id(), again.id());
		assert_ne!(first.id(), other.id());
		assert_eq!(first.id(), script_hash_hex(first.script_pubkey()));
	}

	#[test]
	fn test_history_marks_used() {
		let address = derive(ScriptType::P2wpkh, 0);
		assert!(!address.is_used());
		address.set_history(vec![TxHistoryEntry {
			tx_hash: bitcoin::Txid::all_zeros(),
			height: 10,
		}]);
		assert!(address.is_used());
	}
}
