//! Ordered key-value persistence on rocksdb: one column family per record
//! family, lexicographic key order, atomic cross-family batches, snapshot
//! iterators.
//!
//! Keys are canonical encodings produced by the ledger layer; this crate
//! only sees bytes. A [`StoreBatch`] either persists entirely or not at all;
//! rocksdb's write-ahead log brings the store back to the last flushed batch
//! after a crash.

use std::path::Path;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};

/// Transient write errors are retried this many times before giving up.
const WRITE_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("store io error: {0}")]
	Io(String),
	#[error("store corruption: {0}")]
	Corruption(String),
}

impl From<rocksdb::Error> for StoreError {
	fn from(e: rocksdb::Error) -> Self {
		StoreError::Io(e.into_string())
	}
}

pub type KeyValue = (Box<[u8]>, Box<[u8]>);

enum BatchOp {
	Put { column: &'static str, key: Vec<u8>, value: Vec<u8> },
	Delete { column: &'static str, key: Vec<u8> },
}

/// A set of puts and deletes applied atomically across column families.
/// Ops are kept in insertion order; later writes to the same key win.
#[derive(Default)]
pub struct StoreBatch {
	ops: Vec<BatchOp>,
}

impl StoreBatch {
	pub fn put(&mut self, column: &'static str, key: Vec<u8>, value: Vec<u8>) {
		self.ops.push(BatchOp::Put { column, key, value });
	}

	pub fn delete(&mut self, column: &'static str, key: Vec<u8>) {
		self.ops.push(BatchOp::Delete { column, key });
	}

	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}

	pub fn len(&self) -> usize {
		self.ops.len()
	}
}

pub struct Store {
	db: DB,
}

impl Store {
	/// Open (or create) the store at `path` with the given column families.
	pub fn open(path: &Path, columns: &[&str]) -> Result<Store, StoreError> {
		let mut options = Options::default();
		options.create_if_missing(true);
		options.create_missing_column_families(true);

		let descriptors = columns
			.iter()
			.map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
			.collect::<Vec<_>>();

		let db = DB::open_cf_descriptors(&options, path, descriptors)?;
		Ok(Store { db })
	}

	fn cf(&self, column: &str) -> Result<&ColumnFamily, StoreError> {
		self.db
			.cf_handle(column)
			.ok_or_else(|| StoreError::Corruption(format!("missing column family: {column}")))
	}

	pub fn get(&self, column: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
		Ok(self.db.get_cf(self.cf(column)?, key)?)
	}

	/// Commit a batch atomically. Transient errors are retried a bounded
	/// number of times, then surfaced as fatal.
	pub fn write(&self, batch: StoreBatch) -> Result<(), StoreError> {
		let mut attempt = 0;
		loop {
			let mut inner = WriteBatch::default();
			for op in &batch.ops {
				match op {
					BatchOp::Put { column, key, value } =>
						inner.put_cf(self.cf(column)?, key, value),
					BatchOp::Delete { column, key } => inner.delete_cf(self.cf(column)?, key),
				}
			}
			match self.db.write(inner) {
				Ok(()) => return Ok(()),
				Err(e) => {
					attempt += 1;
					if attempt >= WRITE_RETRIES {
						return Err(e.into())
					}
					tracing::warn!("store write failed (attempt {attempt}): {e}");
				},
			}
		}
	}

	/// Forward scan from the start of the column, in key order.
	pub fn iter(
		&self,
		column: &str,
	) -> Result<impl Iterator<Item = Result<KeyValue, StoreError>> + '_, StoreError> {
		Ok(self
			.db
			.iterator_cf(self.cf(column)?, IteratorMode::Start)
			.map(|item| item.map_err(Into::into)))
	}

	/// Forward scan from the first key ≥ `key`.
	pub fn iter_from(
		&self,
		column: &str,
		key: &[u8],
	) -> Result<impl Iterator<Item = Result<KeyValue, StoreError>> + '_, StoreError> {
		Ok(self
			.db
			.iterator_cf(self.cf(column)?, IteratorMode::From(key, Direction::Forward))
			.map(|item| item.map_err(Into::into)))
	}

	/// Reverse scan from the first key ≤ `key`, moving toward the start.
	pub fn iter_rev_from(
		&self,
		column: &str,
		key: &[u8],
	) -> Result<impl Iterator<Item = Result<KeyValue, StoreError>> + '_, StoreError> {
		Ok(self
			.db
			.iterator_cf(self.cf(column)?, IteratorMode::From(key, Direction::Reverse))
			.map(|item| item.map_err(Into::into)))
	}

	/// First entry with key ≥ `key`.
	pub fn lower_bound(&self, column: &str, key: &[u8]) -> Result<Option<KeyValue>, StoreError> {
		self.iter_from(column, key)?.next().transpose()
	}

	/// Last entry with key strictly < `key`.
	pub fn prev(&self, column: &str, key: &[u8]) -> Result<Option<KeyValue>, StoreError> {
		let mut it = self.db.raw_iterator_cf(self.cf(column)?);
		it.seek_for_prev(key);
		if it.valid() && it.key() == Some(key) {
			it.prev();
		}
		match (it.key(), it.value()) {
			(Some(k), Some(v)) => Ok(Some((k.into(), v.into()))),
			_ => {
				it.status()?;
				Ok(None)
			},
		}
	}

	pub fn first(&self, column: &str) -> Result<Option<KeyValue>, StoreError> {
		self.iter(column)?.next().transpose()
	}

	pub fn last(&self, column: &str) -> Result<Option<KeyValue>, StoreError> {
		let mut it = self.db.raw_iterator_cf(self.cf(column)?);
		it.seek_to_last();
		match (it.key(), it.value()) {
			(Some(k), Some(v)) => Ok(Some((k.into(), v.into()))),
			_ => {
				it.status()?;
				Ok(None)
			},
		}
	}
}
