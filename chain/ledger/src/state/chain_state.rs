use std::path::Path;

use obol_store::{Store, StoreBatch};

use crate::{error::ChainError, family::Family};

use super::{pending::WriteSets, ChainRead};

/// The canonical committed state: a typed view over the store. Mutated only
/// by committing a block-level [`WriteSets`](super::WriteSets), which lands
/// as one atomic batch.
pub struct ChainState {
	store: Store,
}

impl ChainState {
	pub fn open(path: &Path) -> Result<ChainState, ChainError> {
		Ok(ChainState { store: Store::open(path, &Family::columns())? })
	}

	/// Apply a write set atomically. The caller is responsible for having
	/// journaled undo information first if the writes must be reversible.
	pub fn commit_writes(&self, writes: WriteSets) -> Result<(), ChainError> {
		let mut batch = StoreBatch::default();
		for (family, set) in writes.iter_families() {
			for (key, value) in set {
				match value {
					Some(value) => batch.put(family.column(), key.clone(), value.clone()),
					None => batch.delete(family.column(), key.clone()),
				}
			}
		}
		self.store.write(batch)?;
		Ok(())
	}
}

impl ChainRead for ChainState {
	fn get_raw(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
		Ok(self.store.get(family.column(), key)?)
	}

	fn lower_bound_raw(
		&self,
		family: Family,
		key: &[u8],
	) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError> {
		Ok(self
			.store
			.lower_bound(family.column(), key)?
			.map(|(k, v)| (k.into_vec(), v.into_vec())))
	}

	fn prev_raw(
		&self,
		family: Family,
		key: &[u8],
	) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError> {
		Ok(self.store.prev(family.column(), key)?.map(|(k, v)| (k.into_vec(), v.into_vec())))
	}
}
