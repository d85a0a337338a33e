//!
//! The Ethereum node interface accounts consume, and ERC-20 call encoding.

use async_trait::async_trait;
use num_bigint::{BigInt, Sign};

use super::address::{EthAddress, keccak256};
use super::types::{CallMsg, EthError, TxReceipt};

/// Ethereum node operations used by accounts
#[async_trait]
pub trait EthClient: Send + Sync {
	async fn block_number(&self) -> Result<u64, EthError>;

	/// Balance in wei at `block_number`, or at the latest block if `None`.
	async fn balance_at(
		&self,
		address: &EthAddress,
		block_number: Option<u64>,
	) -> Result<BigInt, EthError>;

	/// Nonce of the next transaction, counting pending ones.
	async fn pending_nonce_at(&self, address: &EthAddress) -> Result<u64, EthError>;

	async fn suggest_gas_price(&self) -> Result<BigInt, EthError>;

	async fn estimate_gas(&self, call: &CallMsg) -> Result<u64, EthError>;

	/// Token balance of `owner` in the token's base units.
	async fn erc20_balance(&self, owner: &EthAddress, token: &EthAddress) -> Result<BigInt, EthError>;

	/// Broadcasts a signed transaction and returns its hash.
	async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, EthError>;

	/// `None` while the transaction is not mined.
	async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, EthError>;
}

/// First four bytes of the Keccak-256 hash of a function signature.
pub fn function_selector(signature: &str) -> [u8; 4] {
	let hash = keccak256(signature.as_bytes());
	[hash[0], hash[1], hash[2], hash[3]]
}

fn push_address_word(data: &mut Vec<u8>, address: &EthAddress) {
	data.extend_from_slice(&[0u8; 12]);
	data.extend_from_slice(address.as_bytes());
}

fn push_uint_word(data: &mut Vec<u8>, value: &BigInt) -> Result<(), EthError> {
	let (sign, bytes) = value.to_bytes_be();
	if sign == Sign::Minus || bytes.len() > 32 {
		return Err(EthError::InvalidResponse(format!("{} does not fit in uint256", value)));
	}
	data.extend(std::iter::repeat_n(0u8, 32 - bytes.len()));
	data.extend_from_slice(&bytes);
	Ok(())
}

/// Call data of `balanceOf(owner)`.
pub fn erc20_balance_of_data(owner: &EthAddress) -> Vec<u8> {
	let mut data = function_selector("balanceOf(address)").to_vec();
	push_address_word(&mut data, owner);
	data
}

/// Call data of `transfer(to, amount)`.
pub fn erc20_transfer_data(to: &EthAddress, amount: &BigInt) -> Result<Vec<u8>, EthError> {
	let mut data = function_selector("transfer(address,uint256)").to_vec();
	push_address_word(&mut data, to);
	push_uint_word(&mut data, amount)?;
	Ok(data)
}

/// Decodes a single `uint256` return value.
pub fn parse_uint256(data: &[u8]) -> Result<BigInt, EthError> {
	if data.len() != 32 {
		return Err(EthError::InvalidResponse(format!(
			"expected 32 bytes, got {}",
			data.len()
		)));
	}
	Ok(BigInt::from_bytes_be(Sign::Plus, data))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_selectors() {
		assert_eq!(function_selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
		assert_eq!(function_selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
	}

	#[test]
	fn test_transfer_data() {
		let to: EthAddress = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
		let data = erc20_transfer_data(&to, &BigInt::from(1000)).unwrap();
		assert_eq!(data.len(), 4 + 32 + 32);
		assert_eq!(&data[16..36], to.as_bytes());
		assert_eq!(parse_uint256(&data[36..]).unwrap(), BigInt::from(1000));
		assert!(erc20_transfer_data(&to, &BigInt::from(-1)).is_err());

		let balance_of = erc20_balance_of_data(&to);
		assert_eq!(hex::encode(&balance_of[..4]), "70a08231");
		assert_eq!(balance_of.len(), 36);
	}
}
