//! Ethereum addresses with EIP-55 checksum encoding.

use std::fmt;
use std::str::FromStr;

use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
	#[error("address must be 0x followed by 40 hex characters")]
	Malformed,

	#[error("address checksum mismatch")]
	BadChecksum,
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
	let mut out = [0u8; 32];
	out.copy_from_slice(&Keccak256::digest(data));
	out
}

/// A 20 byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EthAddress([u8; 20]);

impl EthAddress {
	pub fn from_bytes(bytes: [u8; 20]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 20] {
		&self.0
	}

	/// Address of a public key: the last 20 bytes of the Keccak-256 hash of the uncompressed
	/// key without its prefix byte.
	pub fn from_public_key(public_key: &PublicKey) -> Self {
		let uncompressed = public_key.serialize_uncompressed();
		let hash = keccak256(&uncompressed[1..]);
		let mut bytes = [0u8; 20];
		bytes.copy_from_slice(&hash[12..]);
		Self(bytes)
	}

	/// EIP-55 mixed-case encoding.
	pub fn to_checksum(&self) -> String {
		let lower = hex::encode(self.0);
		let hash = keccak256(lower.as_bytes());
		let mut out = String::with_capacity(42);
		out.push_str("0x");
		for (i, c) in lower.chars().enumerate() {
			let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
			if c.is_ascii_alphabetic() && nibble >= 8 {
				out.push(c.to_ascii_uppercase());
			} else {
				out.push(c);
			}
		}
		out
	}

	/// Lowercase hex with `0x` prefix, the form used in API requests.
	pub fn to_lower_hex(&self) -> String {
		format!("0x{}", hex::encode(self.0))
	}
}

impl FromStr for EthAddress {
	type Err = AddressError;

	/// Accepts all-lowercase and all-uppercase hex without checking; mixed case must carry a
	/// valid EIP-55 checksum.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let digits = s
			.strip_prefix("0x")
			.or_else(|| s.strip_prefix("0X"))
			.ok_or(AddressError::Malformed)?;
		if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
			return Err(AddressError::Malformed);
		}
		let mut bytes = [0u8; 20];
		hex::decode_to_slice(digits, &mut bytes).map_err(|_| AddressError::Malformed)?;
		let address = Self(bytes);

		let has_lower = digits.chars().any(|c| c.is_ascii_lowercase());
		let has_upper = digits.chars().any(|c| c.is_ascii_uppercase());
		if has_lower && has_upper && address.to_checksum()[2..] != *digits {
			return Err(AddressError::BadChecksum);
		}
		Ok(address)
	}
}

impl fmt::Display for EthAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_checksum())
	}
}

impl fmt::Debug for EthAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "EthAddress({})", self.to_checksum())
	}
}

impl Serialize for EthAddress {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_checksum())
	}
}

impl<'de> Deserialize<'de> for EthAddress {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		// Server responses are lowercase; only our own encoding is mixed case.
		s.parse().map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::secp256k1::{Secp256k1, SecretKey};

	const CHECKSUMMED: [&str; 4] = [
		"0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
		"0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
		"0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
		"0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
	];

	#[test]
	fn test_checksum_roundtrip() {
		for encoded in CHECKSUMMED {
			let address: EthAddress = encoded.parse().unwrap();
			assert_eq!(address.to_checksum(), encoded);
			let lower: EthAddress = encoded.to_lowercase().parse().unwrap();
			assert_eq!(lower, address);
		}
	}

	#[test]
	fn test_rejects_bad_addresses() {
		assert_eq!(
			"0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAeD".parse::<EthAddress>(),
			Err(AddressError::BadChecksum)
		);
		assert_eq!(
			"5aaeb6053f3e94c9b9a09f33669435e7ef1beaed".parse::<EthAddress>(),
			Err(AddressError::Malformed)
		);
		assert_eq!("0x1234".parse::<EthAddress>(), Err(AddressError::Malformed));
		assert_eq!(
			"0xzaaeb6053f3e94c9b9a09f33669435e7ef1beaed".parse::<EthAddress>(),
			Err(AddressError::Malformed)
		);
	}

	#[test]
	fn test_address_of_public_key() {
		let secp = Secp256k1::new();
		let mut secret = [0u8; 32];
		secret[31] = 1;
		let public_key = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&secret).unwrap());
		assert_eq!(
			EthAddress::from_public_key(&public_key).to_checksum(),
			"0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
		);
	}
}
