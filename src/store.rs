//! Bucketed key-value persistence on top of sled.
//!
//! Every bucket is a `sled::Tree`. Keys that encode numbers are written big-endian so that the
//! natural iteration order of a tree is ascending by value. Writes go through [`StoreTx`], which
//! stages operations in memory and applies them as one atomic `sled::Batch` on commit.

use std::path::Path;

use sled::{Batch, Db, IVec, Tree};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
	#[error("database error: {0}")]
	Db(#[from] sled::Error),

	#[error("encoding error: {0}")]
	Encoding(#[from] bincode::Error),

	#[error("corrupt entry in bucket {bucket}: {reason}")]
	Corrupt { bucket: String, reason: String },
}

/// Handle to the on-disk database. Cheap to clone.
#[derive(Clone)]
pub struct KvStore {
	db: Db,
}

impl KvStore {
	/// Opens (or creates) the database at `path`.
	pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		let db = sled::open(path.as_ref())?;
		debug!("Opened key-value store at {:?}", path.as_ref());
		Ok(Self { db })
	}

	/// An in-memory database that is removed when dropped.
	pub fn temporary() -> Result<Self, StoreError> {
		let db = sled::Config::new().temporary(true).open()?;
		Ok(Self { db })
	}

	fn tree(&self, bucket: &str) -> Result<Tree, StoreError> {
		Ok(self.db.open_tree(bucket)?)
	}

	/// Starts a write transaction on one bucket.
	pub fn begin(&self, bucket: &str) -> Result<StoreTx, StoreError> {
		Ok(StoreTx {
			bucket: bucket.to_string(),
			tree: self.tree(bucket)?,
			ops: Vec::new(),
			clear: false,
		})
	}

	pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<IVec>, StoreError> {
		Ok(self.tree(bucket)?.get(key)?)
	}

	/// All entries of a bucket in ascending key order.
	pub fn entries(&self, bucket: &str) -> Result<Vec<(IVec, IVec)>, StoreError> {
		let tree = self.tree(bucket)?;
		let mut entries = Vec::with_capacity(tree.len());
		for entry in tree.iter() {
			entries.push(entry?);
		}
		Ok(entries)
	}

	pub fn bucket_names(&self) -> Vec<String> {
		self.db
			.tree_names()
			.into_iter()
			.map(|name| String::from_utf8_lossy(&name).into_owned())
			.collect()
	}

	pub fn flush(&self) -> Result<(), StoreError> {
		self.db.flush()?;
		Ok(())
	}
}

enum Op {
	Put(Vec<u8>, Vec<u8>),
	Delete(Vec<u8>),
}

/// Staged writes to one bucket. Dropping without [`StoreTx::commit`] discards them.
pub struct StoreTx {
	bucket: String,
	tree: Tree,
	ops: Vec<Op>,
	clear: bool,
}

impl StoreTx {
	pub fn bucket(&self) -> &str {
		&self.bucket
	}

	pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
		self.ops.push(Op::Put(key.into(), value.into()));
	}

	pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
		self.ops.push(Op::Delete(key.into()));
	}

	/// Removes every existing entry of the bucket before the staged operations apply.
	pub fn clear(&mut self) {
		self.clear = true;
		self.ops.clear();
	}

	/// Reads the committed value, ignoring staged writes.
	pub fn get(&self, key: &[u8]) -> Result<Option<IVec>, StoreError> {
		Ok(self.tree.get(key)?)
	}

	pub fn commit(self) -> Result<(), StoreError> {
		let mut batch = Batch::default();
		if self.clear {
			for key in self.tree.iter().keys() {
				batch.remove(key?);
			}
		}
		let count = self.ops.len();
		for op in self.ops {
			match op {
				Op::Put(key, value) => batch.insert(key, value),
				Op::Delete(key) => batch.remove(key),
			}
		}
		self.tree.apply_batch(batch)?;
		debug!("Committed {} operations to bucket {}", count, self.bucket);
		Ok(())
	}

	pub fn rollback(self) {
		debug!(
			"Rolled back {} operations on bucket {}",
			self.ops.len(),
			self.bucket
		);
	}
}

pub fn be_u64(value: u64) -> [u8; 8] {
	value.to_be_bytes()
}

pub fn from_be_u64(bucket: &str, bytes: &[u8]) -> Result<u64, StoreError> {
	let array: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Corrupt {
		bucket: bucket.to_string(),
		reason: format!("expected 8 bytes, got {}", bytes.len()),
	})?;
	Ok(u64::from_be_bytes(array))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_commit_and_ascending_iteration() {
		let dir = tempfile::tempdir().unwrap();
		let store = KvStore::open(dir.path().join("db")).unwrap();

		let mut tx = store.begin("numbers").unwrap();
		for n in [300u64, 2, 70_000, 1] {
			tx.put(be_u64(n).to_vec(), n.to_string().into_bytes());
		}
		tx.commit().unwrap();

		let keys: Vec<u64> = store
			.entries("numbers")
			.unwrap()
			.iter()
			.map(|(key, _)| from_be_u64("numbers", key).unwrap())
			.collect();
		assert_eq!(keys, vec![1, 2, 300, 70_000]);
	}

	#[test]
	fn test_rollback_discards() {
		let store = KvStore::temporary().unwrap();
		let mut tx = store.begin("b").unwrap();
		tx.put(b"k".to_vec(), b"v".to_vec());
		tx.rollback();
		assert!(store.get("b", b"k").unwrap().is_none());
	}

	#[test]
	fn test_clear_replaces_bucket() {
		let store = KvStore::temporary().unwrap();
		let mut tx = store.begin("b").unwrap();
		tx.put(b"a".to_vec(), b"1".to_vec());
		tx.put(b"b".to_vec(), b"2".to_vec());
		tx.commit().unwrap();

		let mut tx = store.begin("b").unwrap();
		tx.clear();
		tx.put(b"c".to_vec(), b"3".to_vec());
		tx.commit().unwrap();

		let entries = store.entries("b").unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].0.as_ref(), b"c");
	}

	#[test]
	fn test_reopen_persists() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("db");
		{
			let store = KvStore::open(&path).unwrap();
			let mut tx = store.begin("b").unwrap();
			tx.put(b"k".to_vec(), b"v".to_vec());
			tx.commit().unwrap();
			store.flush().unwrap();
		}
		let store = KvStore::open(&path).unwrap();
		assert_eq!(store.get("b", b"k").unwrap().unwrap().as_ref(), b"v");
	}
}
