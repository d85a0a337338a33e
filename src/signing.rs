use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SigningError {
	#[error("invalid keypath {0}")]
	InvalidKeypath(String),

	#[error("invalid extended public key: {0}")]
	InvalidXpub(#[from] bitcoin::bip32::Error),

	#[error("unknown script type {0}")]
	UnknownScriptType(String),
}

/// Output script type an account derives its addresses for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
	/// Legacy pay-to-pubkey-hash.
	P2pkh,
	/// Native segwit v0.
	P2wpkh,
	/// Segwit v0 wrapped in pay-to-script-hash.
	P2wpkhP2sh,
}

impl ScriptType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ScriptType::P2pkh => "p2pkh",
			ScriptType::P2wpkh => "p2wpkh",
			ScriptType::P2wpkhP2sh => "p2wpkh-p2sh",
		}
	}

	pub fn is_segwit(&self) -> bool {
		!matches!(self, ScriptType::P2pkh)
	}
}

impl FromStr for ScriptType {
	type Err = SigningError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"p2pkh" => Ok(ScriptType::P2pkh),
			"p2wpkh" => Ok(ScriptType::P2wpkh),
			"p2wpkh-p2sh" => Ok(ScriptType::P2wpkhP2sh),
			other => Err(SigningError::UnknownScriptType(other.to_string())),
		}
	}
}

impl fmt::Display for ScriptType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A keypath starting at the master key, e.g. `m/84'/0'/0'/1/7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbsoluteKeypath(DerivationPath);

impl AbsoluteKeypath {
	pub fn new(path: DerivationPath) -> Self {
		Self(path)
	}

	pub fn child(&self, index: u32) -> Result<Self, SigningError> {
		let child = ChildNumber::from_normal_idx(index)
			.map_err(|_| SigningError::InvalidKeypath(format!("{}/{}", self, index)))?;
		Ok(Self(self.0.child(child)))
	}

	pub fn path(&self) -> &DerivationPath {
		&self.0
	}
}

impl FromStr for AbsoluteKeypath {
	type Err = SigningError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		DerivationPath::from_str(s)
			.map(Self)
			.map_err(|_| SigningError::InvalidKeypath(s.to_string()))
	}
}

impl fmt::Display for AbsoluteKeypath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// DerivationPath displays without the `m/` prefix.
		if self.0.is_empty() {
			f.write_str("m")
		} else {
			write!(f, "m/{}", self.0)
		}
	}
}

/// Everything needed to derive the addresses of one UTXO account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningConfiguration {
	pub script_type: ScriptType,
	/// Keypath of `xpub`.
	pub keypath: AbsoluteKeypath,
	pub xpub: Xpub,
}

impl SigningConfiguration {
	pub fn new(script_type: ScriptType, keypath: AbsoluteKeypath, xpub: Xpub) -> Self {
		Self {
			script_type,
			keypath,
			xpub,
		}
	}

	pub fn from_strings(script_type: &str, keypath: &str, xpub: &str) -> Result<Self, SigningError> {
		Ok(Self {
			script_type: script_type.parse()?,
			keypath: keypath.parse()?,
			xpub: xpub.parse()?,
		})
	}
}
