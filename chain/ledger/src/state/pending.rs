use std::collections::BTreeMap;

use obol_codec::CanonicalEncode;

use crate::{error::ChainError, family::Family};

use super::ChainRead;

type WriteSet = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// One write map per record family. `None` is a tombstone.
#[derive(Clone)]
pub struct WriteSets {
	sets: [WriteSet; Family::COUNT],
}

impl Default for WriteSets {
	fn default() -> Self {
		Self { sets: std::array::from_fn(|_| WriteSet::new()) }
	}
}

impl WriteSets {
	fn set(&self, family: Family) -> &WriteSet {
		&self.sets[family.index()]
	}

	pub fn put(&mut self, family: Family, key: Vec<u8>, value: Vec<u8>) {
		self.sets[family.index()].insert(key, Some(value));
	}

	pub fn delete(&mut self, family: Family, key: Vec<u8>) {
		self.sets[family.index()].insert(key, None);
	}

	pub fn is_empty(&self) -> bool {
		self.sets.iter().all(|set| set.is_empty())
	}

	pub fn iter_families(
		&self,
	) -> impl Iterator<Item = (Family, &BTreeMap<Vec<u8>, Option<Vec<u8>>>)> {
		Family::ALL.iter().map(|family| (*family, self.set(*family)))
	}

	/// Later write sets win key-by-key.
	pub fn merge(&mut self, other: WriteSets) {
		for (set, other_set) in self.sets.iter_mut().zip(other.sets) {
			set.extend(other_set);
		}
	}
}

/// A copy-on-write overlay over a parent state. Reads consult the local
/// write set first; the parent is never touched until the caller takes the
/// writes and commits them. Dropping the overlay discards it.
///
/// Overlays nest: block evaluation holds one, each transaction evaluates in
/// a child, each market pair in another.
pub struct PendingState<'a> {
	parent: &'a dyn ChainRead,
	writes: WriteSets,
}

impl<'a> PendingState<'a> {
	pub fn new(parent: &'a dyn ChainRead) -> PendingState<'a> {
		PendingState { parent, writes: WriteSets::default() }
	}

	pub fn put(&mut self, family: Family, key: Vec<u8>, value: Vec<u8>) {
		self.writes.put(family, key, value);
	}

	pub fn put_record<T: CanonicalEncode>(&mut self, family: Family, key: Vec<u8>, record: &T) {
		self.writes.put(family, key, record.to_bytes());
	}

	pub fn delete(&mut self, family: Family, key: Vec<u8>) {
		self.writes.delete(family, key);
	}

	/// Commit: hand the accumulated writes to the caller, who merges them
	/// into the parent (or into a store batch at the root).
	pub fn into_writes(self) -> WriteSets {
		self.writes
	}

	/// Merge a child's committed writes into this overlay.
	pub fn absorb(&mut self, writes: WriteSets) {
		self.writes.merge(writes);
	}
}

impl ChainRead for PendingState<'_> {
	fn get_raw(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
		match self.writes.set(family).get(key) {
			Some(value) => Ok(value.clone()),
			None => self.parent.get_raw(family, key),
		}
	}

	fn lower_bound_raw(
		&self,
		family: Family,
		key: &[u8],
	) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError> {
		let set = self.writes.set(family);
		let mut probe = key.to_vec();
		loop {
			let local = set.range(probe.clone()..).next();
			let parent = self.parent.lower_bound_raw(family, &probe)?;
			let candidate = match (&local, &parent) {
				(None, None) => return Ok(None),
				(Some((k, _)), None) => (*k).clone(),
				(None, Some((k, _))) => k.clone(),
				(Some((lk, _)), Some((pk, _))) => (*lk).clone().min(pk.clone()),
			};
			match set.get(&candidate) {
				// The write set shadows the parent for this key.
				Some(Some(value)) => return Ok(Some((candidate, value.clone()))),
				Some(None) => {
					// Tombstone: step past it and look again.
					probe = candidate;
					probe.push(0);
				},
				None => {
					// Candidate came from the parent untouched.
					return Ok(parent)
				},
			}
		}
	}

	fn prev_raw(
		&self,
		family: Family,
		key: &[u8],
	) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError> {
		let set = self.writes.set(family);
		let mut probe = key.to_vec();
		loop {
			let local = set.range(..probe.clone()).next_back();
			let parent = self.parent.prev_raw(family, &probe)?;
			let candidate = match (&local, &parent) {
				(None, None) => return Ok(None),
				(Some((k, _)), None) => (*k).clone(),
				(None, Some((k, _))) => k.clone(),
				(Some((lk, _)), Some((pk, _))) => (*lk).clone().max(pk.clone()),
			};
			match set.get(&candidate) {
				Some(Some(value)) => return Ok(Some((candidate, value.clone()))),
				Some(None) => {
					// Tombstone: it is now the exclusive upper bound.
					probe = candidate;
				},
				None => return Ok(parent),
			}
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	/// A bare in-memory root so overlay semantics can be tested without a
	/// store on disk.
	#[derive(Default)]
	pub struct MemoryState {
		sets: BTreeMap<(usize, Vec<u8>), Vec<u8>>,
	}

	impl MemoryState {
		pub fn put(&mut self, family: Family, key: &[u8], value: &[u8]) {
			self.sets.insert((family.index(), key.to_vec()), value.to_vec());
		}
	}

	impl ChainRead for MemoryState {
		fn get_raw(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
			Ok(self.sets.get(&(family.index(), key.to_vec())).cloned())
		}

		fn lower_bound_raw(
			&self,
			family: Family,
			key: &[u8],
		) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError> {
			Ok(self
				.sets
				.range((family.index(), key.to_vec())..)
				.next()
				.filter(|((f, _), _)| *f == family.index())
				.map(|((_, k), v)| (k.clone(), v.clone())))
		}

		fn prev_raw(
			&self,
			family: Family,
			key: &[u8],
		) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError> {
			Ok(self
				.sets
				.range(..(family.index(), key.to_vec()))
				.next_back()
				.filter(|((f, _), _)| *f == family.index())
				.map(|((_, k), v)| (k.clone(), v.clone())))
		}
	}

	const F: Family = Family::Balances;

	#[test]
	fn reads_fall_through_to_parent() {
		let mut root = MemoryState::default();
		root.put(F, b"a", b"1");
		let pending = PendingState::new(&root);
		assert_eq!(pending.get_raw(F, b"a").unwrap(), Some(b"1".to_vec()));
		assert_eq!(pending.get_raw(F, b"b").unwrap(), None);
	}

	#[test]
	fn writes_shadow_parent_until_commit() {
		let mut root = MemoryState::default();
		root.put(F, b"a", b"old");
		let mut pending = PendingState::new(&root);
		pending.put(F, b"a".to_vec(), b"new".to_vec());
		pending.delete(F, b"b".to_vec());
		assert_eq!(pending.get_raw(F, b"a").unwrap(), Some(b"new".to_vec()));
		// Parent untouched.
		assert_eq!(root.get_raw(F, b"a").unwrap(), Some(b"old".to_vec()));
	}

	#[test]
	fn tombstones_hide_parent_entries_from_scans() {
		let mut root = MemoryState::default();
		root.put(F, b"a", b"1");
		root.put(F, b"b", b"2");
		root.put(F, b"c", b"3");
		let mut pending = PendingState::new(&root);
		pending.delete(F, b"b".to_vec());
		assert_eq!(pending.get_raw(F, b"b").unwrap(), None);
		assert_eq!(pending.lower_bound_raw(F, b"b").unwrap().unwrap().0, b"c".to_vec());
		assert_eq!(pending.prev_raw(F, b"c").unwrap().unwrap().0, b"a".to_vec());
	}

	#[test]
	fn scans_merge_local_and_parent_in_key_order() {
		let mut root = MemoryState::default();
		root.put(F, b"b", b"parent");
		root.put(F, b"d", b"parent");
		let mut pending = PendingState::new(&root);
		pending.put(F, b"a".to_vec(), b"local".to_vec());
		pending.put(F, b"c".to_vec(), b"local".to_vec());
		pending.put(F, b"d".to_vec(), b"local".to_vec());

		let mut seen = Vec::new();
		let mut probe = Vec::new();
		while let Some((key, value)) = pending.lower_bound_raw(F, &probe).unwrap() {
			seen.push((key.clone(), value));
			probe = key;
			probe.push(0);
		}
		assert_eq!(
			seen,
			vec![
				(b"a".to_vec(), b"local".to_vec()),
				(b"b".to_vec(), b"parent".to_vec()),
				(b"c".to_vec(), b"local".to_vec()),
				(b"d".to_vec(), b"local".to_vec()),
			]
		);
	}

	#[test]
	fn nested_overlays_commit_inward_only() {
		let mut root = MemoryState::default();
		root.put(F, b"a", b"0");
		let mut block = PendingState::new(&root);
		block.put(F, b"a".to_vec(), b"1".to_vec());

		{
			let mut tx = PendingState::new(&block);
			tx.put(F, b"a".to_vec(), b"2".to_vec());
			// Discarded: writes vanish.
		}
		assert_eq!(block.get_raw(F, b"a").unwrap(), Some(b"1".to_vec()));

		let tx_writes = {
			let mut tx = PendingState::new(&block);
			tx.put(F, b"a".to_vec(), b"3".to_vec());
			tx.into_writes()
		};
		block.absorb(tx_writes);
		assert_eq!(block.get_raw(F, b"a").unwrap(), Some(b"3".to_vec()));
		assert_eq!(root.get_raw(F, b"a").unwrap(), Some(b"0".to_vec()));
	}

	#[test]
	fn last_sees_local_tail() {
		let mut root = MemoryState::default();
		root.put(F, b"m", b"parent");
		let mut pending = PendingState::new(&root);
		pending.put(F, b"z".to_vec(), b"local".to_vec());
		assert_eq!(pending.last_raw(F).unwrap().unwrap().0, b"z".to_vec());
		pending.delete(F, b"z".to_vec());
		assert_eq!(pending.last_raw(F).unwrap().unwrap().0, b"m".to_vec());
	}
}
