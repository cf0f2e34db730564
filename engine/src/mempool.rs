//! Unconfirmed transactions, deduplicated by id, ordered by fee density for
//! draining, re-evaluated whenever the head moves.

use std::collections::BTreeMap;

use itertools::Itertools;
use obol_ledger::{
	evaluate_transaction, records::SignedTransaction, state::WriteSets, ChainDatabase,
	ChainError, PendingState,
};
use obol_primitives::{ShareAmount, Timestamp, TransactionId};

struct PoolEntry {
	tx: SignedTransaction,
	expiration: Timestamp,
	fee: ShareAmount,
	size: usize,
	/// Writes from admission evaluation; replayed to give later arrivals a
	/// view that includes the queue.
	writes: WriteSets,
}

impl PoolEntry {
	/// Fee density in fee units per 1024 bytes, the drain ordering.
	fn fee_per_kb(&self) -> ShareAmount {
		self.fee.saturating_mul(1024) / self.size.max(1) as ShareAmount
	}
}

pub struct MemPool {
	entries: BTreeMap<TransactionId, PoolEntry>,
	/// Admission order; the queue view replays writes in this order.
	order: Vec<TransactionId>,
	max_bytes: usize,
	total_bytes: usize,
}

impl MemPool {
	pub fn new(max_bytes: usize) -> MemPool {
		MemPool { entries: BTreeMap::new(), order: Vec::new(), max_bytes, total_bytes: 0 }
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn contains(&self, id: &TransactionId) -> bool {
		self.entries.contains_key(id)
	}

	/// Admit a transaction that must already have passed evaluation against
	/// the head plus this queue. Evicts the thinnest fee payers when over
	/// budget; returns false if the newcomer itself is the thinnest.
	pub fn insert(
		&mut self,
		tx: SignedTransaction,
		fee: ShareAmount,
		size: usize,
		writes: WriteSets,
	) -> bool {
		let id = tx.id();
		if self.entries.contains_key(&id) {
			return false
		}
		let entry =
			PoolEntry { expiration: tx.transaction.expiration, tx, fee, size, writes };

		while self.total_bytes + entry.size > self.max_bytes {
			let Some(thinnest) = self
				.entries
				.iter()
				.min_by_key(|(id, e)| (e.fee_per_kb(), std::cmp::Reverse(**id)))
				.map(|(id, _)| *id)
			else {
				return false
			};
			if self.entries[&thinnest].fee_per_kb() >= entry.fee_per_kb() {
				return false
			}
			self.remove(&thinnest);
		}

		self.total_bytes += entry.size;
		self.entries.insert(id, entry);
		self.order.push(id);
		true
	}

	pub fn remove(&mut self, id: &TransactionId) {
		if let Some(entry) = self.entries.remove(id) {
			self.total_bytes -= entry.size;
			self.order.retain(|other| other != id);
		}
	}

	/// The head state overlaid with every queued transaction's writes, the
	/// view a new submission must evaluate against.
	pub fn queue_view<'a>(&self, db: &'a ChainDatabase) -> PendingState<'a> {
		let mut view = PendingState::new(db.state());
		for id in &self.order {
			if let Some(entry) = self.entries.get(id) {
				view.absorb(entry.writes.clone());
			}
		}
		view
	}

	/// Highest fee density first; ties broken by id so draining is
	/// deterministic.
	pub fn drain_order(&self) -> Vec<SignedTransaction> {
		self.entries
			.values()
			.sorted_by(|a, b| {
				b.fee_per_kb().cmp(&a.fee_per_kb()).then(a.tx.id().cmp(&b.tx.id()))
			})
			.map(|entry| entry.tx.clone())
			.collect()
	}

	pub fn pending(&self) -> Vec<SignedTransaction> {
		self.order
			.iter()
			.filter_map(|id| self.entries.get(id).map(|e| e.tx.clone()))
			.collect()
	}

	/// Drop what was included in a block.
	pub fn drop_included(&mut self, ids: impl IntoIterator<Item = TransactionId>) {
		for id in ids {
			self.remove(&id);
		}
	}

	/// Re-run every queued transaction against the new head, evicting any
	/// that now fail or have expired. Restarts from scratch, in admission
	/// order, so surviving entries carry fresh write sets.
	pub fn reevaluate(&mut self, db: &ChainDatabase, now: Timestamp) {
		let order = std::mem::take(&mut self.order);
		let mut entries = std::mem::take(&mut self.entries);
		self.total_bytes = 0;

		let mut view = PendingState::new(db.state());
		for id in order {
			let Some(mut entry) = entries.remove(&id) else { continue };
			match evaluate_transaction(&view, db.config(), now, &entry.tx) {
				Ok((writes, summary)) => {
					view.absorb(writes.clone());
					entry.writes = writes;
					entry.fee = summary.fee;
					self.total_bytes += entry.size;
					self.order.push(id);
					self.entries.insert(id, entry);
				},
				Err(e) => {
					tracing::debug!("evicting tx {id} from mempool: {e}");
				},
			}
		}
	}

	/// Evict entries whose expiration has passed without re-evaluating.
	pub fn prune_expired(&mut self, now: Timestamp) {
		let expired: Vec<TransactionId> = self
			.entries
			.iter()
			.filter(|(_, e)| now >= e.expiration)
			.map(|(id, _)| *id)
			.collect();
		for id in expired {
			self.remove(&id);
		}
	}
}

/// Evaluate a candidate against the head plus the queue, for admission.
pub fn admit(
	mempool: &mut MemPool,
	db: &ChainDatabase,
	now: Timestamp,
	tx: SignedTransaction,
) -> Result<TransactionId, ChainError> {
	let id = tx.id();
	if mempool.contains(&id) {
		return Err(ChainError::DuplicateTransaction)
	}
	let view = mempool.queue_view(db);
	let (writes, summary) = evaluate_transaction(&view, db.config(), now, &tx)?;
	if !mempool.insert(tx, summary.fee, summary.encoded_size, writes) {
		return Err(ChainError::InsufficientFee)
	}
	Ok(id)
}
