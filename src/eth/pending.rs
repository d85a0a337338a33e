//! Outgoing transactions we broadcast, persisted until the transactions source reports them.
//!
//! One bucket per account, keyed by the big-endian nonce.

use crate::store::{KvStore, StoreError, be_u64};

use super::types::PendingTransaction;

#[derive(Clone)]
pub struct PendingStore {
	store: KvStore,
	bucket: String,
}

impl PendingStore {
	pub fn new(store: KvStore, account_code: &str) -> Self {
		Self {
			store,
			bucket: format!("pending-{}", account_code),
		}
	}

	pub fn bucket(&self) -> &str {
		&self.bucket
	}

	/// Stores `tx`, replacing any stored transaction with the same nonce.
	pub fn put(&self, tx: &PendingTransaction) -> Result<(), StoreError> {
		let mut store_tx = self.store.begin(&self.bucket)?;
		store_tx.put(be_u64(tx.nonce).to_vec(), bincode::serialize(tx)?);
		store_tx.commit()
	}

	pub fn remove(&self, nonce: u64) -> Result<(), StoreError> {
		let mut store_tx = self.store.begin(&self.bucket)?;
		store_tx.delete(be_u64(nonce).to_vec());
		store_tx.commit()
	}

	/// All stored transactions, highest nonce first.
	pub fn load(&self) -> Result<Vec<PendingTransaction>, StoreError> {
		let mut txs = self
			.store
			.entries(&self.bucket)?
			.iter()
			.map(|(_, value)| bincode::deserialize::<PendingTransaction>(value))
			.collect::<Result<Vec<_>, _>>()?;
		txs.reverse();
		Ok(txs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use num_bigint::BigInt;

	fn pending(nonce: u64) -> PendingTransaction {
		PendingTransaction {
			hash: format!("0x{:064x}", nonce),
			nonce,
			from: Default::default(),
			to: Default::default(),
			amount: BigInt::from(1_000_000u64) * BigInt::from(nonce),
			gas_limit: 21_000,
			gas_price: BigInt::from(20_000_000_000u64),
			height: 0,
			gas_used: 0,
			success: true,
			created: Utc::now(),
		}
	}

	#[test]
	fn test_load_descending_by_nonce() {
		let store = PendingStore::new(KvStore::temporary().unwrap(), "v0-eth-0");
		for nonce in [3, 256, 1] {
			store.put(&pending(nonce)).unwrap();
		}
		let nonces: Vec<u64> = store.load().unwrap().iter().map(|tx| tx.nonce).collect();
		assert_eq!(nonces, vec![256, 3, 1]);

		store.remove(3).unwrap();
		let loaded = store.load().unwrap();
		assert_eq!(loaded.len(), 2);
		assert_eq!(loaded[0].amount, pending(256).amount);
		assert_eq!(loaded[1].hash, pending(1).hash);
	}

	#[test]
	fn test_put_replaces_same_nonce() {
		let store = PendingStore::new(KvStore::temporary().unwrap(), "v0-eth-0");
		let mut tx = pending(5);
		store.put(&tx).unwrap();
		tx.height = 42;
		tx.success = false;
		store.put(&tx).unwrap();
		let loaded = store.load().unwrap();
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0].height, 42);
		assert!(!loaded[0].success);
	}
}
