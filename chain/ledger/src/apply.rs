//! Block application: header and slot validation, transaction evaluation,
//! market execution, reward distribution, undo journaling and fork choice.

use std::collections::BTreeSet;
use std::path::Path;

use obol_codec::id_hash;
use obol_primitives::{
	AccountId, BlockId, BlockNumber, ChainConfig, ShareAmount, Timestamp, TransactionId,
	NATIVE_ASSET_ID,
};

use crate::{
	error::ChainError,
	eval::evaluate_transaction,
	family::Family,
	genesis::{self, GenesisConfig},
	market::{execute_market, EngineRevision},
	records::{
		AccountRecord, AssetRecord, Block, ChainHead, MarketPair, MarketStatus,
		MarketTransaction, SlotRecord, TransactionLocation, UndoEntry, UndoRecord,
	},
	state::{
		ChainRead, ChainReadExt, ChainState, PendingState, WriteSets, META_HEAD,
	},
};

#[derive(Clone, Debug)]
pub struct TxOutcome {
	pub id: TransactionId,
	pub fee: ShareAmount,
	/// Present when the transaction was included but failed evaluation.
	pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct BlockOutcome {
	pub block_id: BlockId,
	pub block_number: BlockNumber,
	pub tx_outcomes: Vec<TxOutcome>,
	/// One entry per executed pair; `Err` text when the pair was rolled
	/// back.
	pub market_outcomes: Vec<(MarketPair, Result<usize, String>)>,
	pub market_transactions: Vec<MarketTransaction>,
}

/// What happened to a submitted block.
#[derive(Debug)]
pub enum BlockDisposition {
	/// Extended the head.
	Applied(BlockOutcome),
	/// Valid-looking but on a chain we do not prefer (yet).
	SideChain,
	AlreadyKnown,
	/// A better fork appeared; the chain rewound and replayed.
	Switched { outcomes: Vec<BlockOutcome> },
}

/// The canonical chain plus the rules frozen at genesis. All mutation goes
/// through [`ChainDatabase::submit_block`].
pub struct ChainDatabase {
	state: ChainState,
	config: ChainConfig,
}

impl ChainDatabase {
	/// Open an existing database, or seed a fresh one from `genesis`.
	pub fn open(path: &Path, genesis: &GenesisConfig) -> Result<ChainDatabase, ChainError> {
		let state = ChainState::open(path)?;
		if state.head()?.is_none() {
			genesis::initialize(&state, genesis)?;
		}
		let config = state.chain_config()?;
		Ok(ChainDatabase { state, config })
	}

	pub fn config(&self) -> &ChainConfig {
		&self.config
	}

	pub fn state(&self) -> &ChainState {
		&self.state
	}

	pub fn head(&self) -> Result<ChainHead, ChainError> {
		self.state
			.head()?
			.ok_or_else(|| ChainError::ProtocolViolation("uninitialized state".into()))
	}

	/// The delegate owning the slot at `timestamp`, by round-robin over the
	/// active set.
	pub fn slot_delegate(
		&self,
		timestamp: Timestamp,
		active: &[AccountId],
	) -> Result<AccountId, ChainError> {
		if active.is_empty() {
			return Err(ChainError::ProtocolViolation("empty delegate set".into()))
		}
		let slot = timestamp.slot_number(self.config.block_interval_secs);
		Ok(active[(slot % active.len() as u64) as usize])
	}

	pub fn active_delegates(&self) -> Result<Vec<AccountId>, ChainError> {
		self.state.active_delegates(self.config.num_delegates)
	}

	/// Accept a block from the producer or the network: apply it if it
	/// extends the head, otherwise consider it as a fork candidate.
	pub fn submit_block(&mut self, block: Block) -> Result<BlockDisposition, ChainError> {
		let id = block.id();
		if self.state.get_block(&id)?.is_some() || self.state.get_side_block(&id)?.is_some() {
			return Ok(BlockDisposition::AlreadyKnown)
		}

		let head = self.head()?;
		if block.header().previous == head.id {
			let outcome = self.apply_block(&block)?;
			return Ok(BlockDisposition::Applied(outcome))
		}

		// Cache the candidate, then see whether its chain now beats ours.
		let mut writes = WriteSets::default();
		writes.put(Family::SideBlocks, Block::key_by_id(&id), obol_codec::CanonicalEncode::to_bytes(&block));
		self.state.commit_writes(writes)?;

		match self.fork_path(&block)? {
			Some((ancestor_number, path)) if Self::chain_beats(&block, &head) => {
				let outcomes = self.switch_to_fork(ancestor_number, path, &head)?;
				Ok(BlockDisposition::Switched { outcomes })
			},
			_ => Ok(BlockDisposition::SideChain),
		}
	}

	/// Fork choice: greatest block number, then earliest tip timestamp,
	/// then lowest tip id.
	fn chain_beats(candidate: &Block, head: &ChainHead) -> bool {
		use std::cmp::Ordering;
		let header = candidate.header();
		match header.block_number.cmp(&head.number) {
			Ordering::Greater => true,
			Ordering::Less => false,
			Ordering::Equal => match header.timestamp.cmp(&head.timestamp) {
				Ordering::Less => true,
				Ordering::Greater => false,
				Ordering::Equal => candidate.id() < head.id,
			},
		}
	}

	/// Walk the candidate's ancestry through the side cache back to a block
	/// on the main chain (or genesis). Returns the common ancestor's number
	/// and the blocks to apply, oldest first; `None` when ancestry is
	/// incomplete.
	fn fork_path(&self, tip: &Block) -> Result<Option<(BlockNumber, Vec<Block>)>, ChainError> {
		let mut path = vec![tip.clone()];
		let mut previous = tip.header().previous;
		loop {
			if path.len() as u32 > self.config.max_fork_depth {
				return Err(ChainError::ForkTooDeep)
			}
			if Some(previous) == self.state.block_id_by_num(0)? {
				path.reverse();
				return Ok(Some((0, path)))
			}
			if let Some(block) = self.state.get_block(&previous)? {
				let number = block.header().block_number;
				if self.state.block_id_by_num(number)? == Some(previous) {
					path.reverse();
					return Ok(Some((number, path)))
				}
			}
			match self.state.get_side_block(&previous)? {
				Some(block) => {
					previous = block.header().previous;
					path.push(block);
				},
				None => return Ok(None),
			}
		}
	}

	fn switch_to_fork(
		&mut self,
		ancestor_number: BlockNumber,
		path: Vec<Block>,
		head: &ChainHead,
	) -> Result<Vec<BlockOutcome>, ChainError> {
		if head.number.saturating_sub(ancestor_number) > self.config.max_fork_depth {
			return Err(ChainError::ForkTooDeep)
		}

		// Keep the blocks being undone so the switch can be reverted if
		// the fork turns out to be invalid.
		let mut original = Vec::new();
		for number in (ancestor_number + 1)..=head.number {
			let id = self.state.block_id_by_num(number)?.ok_or_else(|| {
				ChainError::ProtocolViolation(format!("missing main-chain block {number}"))
			})?;
			let block = self.state.get_block(&id)?.ok_or_else(|| {
				ChainError::ProtocolViolation(format!("missing block body {id}"))
			})?;
			original.push(block);
		}

		while self.head()?.number > ancestor_number {
			self.rewind_one()?;
		}

		let mut outcomes = Vec::new();
		for block in &path {
			match self.apply_block(block) {
				Ok(outcome) => outcomes.push(outcome),
				Err(e) => {
					tracing::warn!("fork block {} invalid during switch: {e}", block.id());
					// Roll the partial fork back and restore the original
					// chain; it applied before, so it applies again.
					while self.head()?.number > ancestor_number {
						self.rewind_one()?;
					}
					for block in &original {
						self.apply_block(block)?;
					}
					return Err(e)
				},
			}
		}
		Ok(outcomes)
	}

	/// Undo the head block using its journal, parking it in the side cache.
	fn rewind_one(&mut self) -> Result<(), ChainError> {
		let head = self.head()?;
		if head.number == 0 {
			return Err(ChainError::ForkTooDeep)
		}
		let undo = self.state.get_undo(head.number)?.ok_or_else(|| {
			ChainError::ProtocolViolation(format!("missing undo journal for {}", head.number))
		})?;
		let block = self.state.get_block(&head.id)?;

		let mut writes = WriteSets::default();
		for UndoEntry { family, key, previous } in undo.entries {
			let family = Family::from_index(family).ok_or_else(|| {
				ChainError::ProtocolViolation("undo entry names unknown family".into())
			})?;
			match previous {
				Some(value) => writes.put(family, key, value),
				None => writes.delete(family, key),
			}
		}
		writes.delete(Family::Undo, UndoRecord::key(head.number));
		if let Some(block) = block {
			writes.put(
				Family::SideBlocks,
				Block::key_by_id(&head.id),
				obol_codec::CanonicalEncode::to_bytes(&block),
			);
		}
		self.state.commit_writes(writes)?;
		Ok(())
	}

	/// Validate and apply a block that extends the current head, committing
	/// atomically with its undo journal.
	pub fn apply_block(&mut self, block: &Block) -> Result<BlockOutcome, ChainError> {
		let head = self.head()?;
		let header = block.header();
		let block_id = block.id();
		let span =
			tracing::info_span!("apply_block", number = header.block_number, id = %block_id);
		let _enter = span.enter();

		// ---- header validation ----
		if header.previous != head.id {
			return Err(ChainError::InvalidBlock("previous id does not match head".into()))
		}
		if header.block_number != head.number + 1 {
			return Err(ChainError::InvalidBlock("block number not sequential".into()))
		}
		if !header.timestamp.is_on_grid(self.config.block_interval_secs) {
			return Err(ChainError::InvalidBlock("timestamp off the slot grid".into()))
		}
		if header.timestamp <= head.timestamp {
			return Err(ChainError::InvalidBlock("timestamp not after head".into()))
		}
		if Block::transaction_digest(&block.transactions) != header.transaction_digest {
			return Err(ChainError::InvalidBlock("transaction digest mismatch".into()))
		}
		if obol_codec::CanonicalEncode::encoded_size(block) > self.config.max_block_size {
			return Err(ChainError::InvalidBlock("block exceeds size limit".into()))
		}

		// ---- slot and signature ----
		let active = self.active_delegates()?;
		let delegate_id = self.slot_delegate(header.timestamp, &active)?;
		let delegate = self
			.state
			.get_account(delegate_id)?
			.ok_or(ChainError::UnknownAccount)?;
		let signer = block.signed_header.signer()?;
		if signer != delegate.active_key {
			return Err(ChainError::InvalidBlock(format!(
				"slot belongs to {} but block signed by another key",
				delegate.name
			)))
		}
		let stats = delegate.delegate.clone().ok_or_else(|| {
			ChainError::ProtocolViolation("slot delegate has no stats".into())
		})?;
		if let Some(expected) = stats.next_secret_hash {
			if id_hash(&header.previous_secret.0) != expected.0 {
				return Err(ChainError::InvalidBlock("secret reveal mismatch".into()))
			}
		}

		let mut pending = PendingState::new(&self.state);
		let now = header.timestamp;

		// ---- missed slots ----
		let interval = self.config.block_interval_secs;
		// First grid point strictly after the head (the genesis timestamp
		// need not be on the grid).
		let mut slot = Timestamp((head.timestamp.0 / interval + 1) * interval);
		while slot < header.timestamp {
			let missed_id = self.slot_delegate(slot, &active)?;
			pending.put_record(
				Family::Slots,
				SlotRecord::key(slot),
				&SlotRecord { delegate: missed_id, block_id: None },
			);
			if let Some(mut account) = pending.get_account(missed_id)? {
				if let Some(stats) = account.delegate.as_mut() {
					stats.blocks_missed += 1;
				}
				pending.put_record(Family::Accounts, AccountRecord::key(missed_id), &account);
			}
			slot = slot.saturating_add_secs(interval);
		}

		// ---- transactions ----
		let mut tx_outcomes = Vec::with_capacity(block.transactions.len());
		let mut total_fees: ShareAmount = 0;
		for (index, tx) in block.transactions.iter().enumerate() {
			match evaluate_transaction(&pending, &self.config, now, tx) {
				Ok((writes, summary)) => {
					pending.absorb(writes);
					pending.put_record(
						Family::TxIndex,
						summary.id.0.to_vec(),
						&TransactionLocation {
							block_number: header.block_number,
							index: index as u32,
						},
					);
					total_fees += summary.fee;
					tx_outcomes.push(TxOutcome { id: summary.id, fee: summary.fee, error: None });
				},
				Err(e) => {
					tracing::debug!("tx {index} failed in block: {e}");
					tx_outcomes.push(TxOutcome {
						id: tx.id(),
						fee: 0,
						error: Some(e.kind().to_string()),
					});
				},
			}
		}

		// ---- markets ----
		let revision = EngineRevision::for_height(header.block_number);
		let active_set: BTreeSet<AccountId> = active.iter().copied().collect();
		let mut market_outcomes = Vec::new();
		let mut market_transactions = Vec::new();
		for pair in pending.market_pairs()? {
			match execute_market(
				&pending,
				&self.config,
				pair,
				header.block_number,
				now,
				&active_set,
				revision,
			) {
				Ok((writes, mtrxs)) => {
					pending.absorb(writes);
					market_outcomes.push((pair, Ok(mtrxs.len())));
					market_transactions.extend(mtrxs);
				},
				Err(e) => {
					tracing::debug!("market {:?} rolled back: {e}", pair);
					let mut status = pending
						.get_market_status(&pair)?
						.unwrap_or_else(|| MarketStatus::new(pair));
					status.last_error = Some(e.kind().to_string());
					status.updated_block = header.block_number;
					pending.put_record(
						Family::MarketStatus,
						MarketStatus::key(&pair),
						&status,
					);
					market_outcomes.push((pair, Err(e.kind().to_string())));
				},
			}
		}

		// ---- reward and secret rotation ----
		// Transaction fees stay in the native fee pool; the delegate is
		// paid the freshly issued block reward.
		let mut native = pending
			.get_asset(NATIVE_ASSET_ID)?
			.ok_or(ChainError::UnknownAsset)?;
		let reward =
			self.config.block_reward.min(native.maximum_supply - native.current_supply);
		native.current_supply += reward;
		pending.put_record(Family::Assets, AssetRecord::key(NATIVE_ASSET_ID), &native);

		let mut delegate = pending
			.get_account(delegate_id)?
			.ok_or(ChainError::UnknownAccount)?;
		{
			let stats = delegate
				.delegate
				.as_mut()
				.ok_or_else(|| ChainError::ProtocolViolation("delegate lost stats".into()))?;
			stats.pay_balance += reward;
			stats.blocks_produced += 1;
			stats.last_block_produced = Some(header.block_number);
			stats.next_secret_hash = Some(header.next_secret_hash);
		}
		pending.put_record(Family::Accounts, AccountRecord::key(delegate_id), &delegate);

		// ---- block bookkeeping ----
		pending.put_record(
			Family::Slots,
			SlotRecord::key(header.timestamp),
			&SlotRecord { delegate: delegate_id, block_id: Some(block_id) },
		);
		pending.put(
			Family::BlocksById,
			Block::key_by_id(&block_id),
			obol_codec::CanonicalEncode::to_bytes(block),
		);
		pending.put_record(
			Family::BlocksByNum,
			Block::key_by_num(header.block_number),
			&block_id,
		);
		pending.put_record(
			Family::Meta,
			META_HEAD.to_vec(),
			&ChainHead {
				number: header.block_number,
				id: block_id,
				timestamp: header.timestamp,
			},
		);
		// A candidate that was parked in the side cache is canonical now.
		pending.delete(Family::SideBlocks, Block::key_by_id(&block_id));

		// ---- journal and commit ----
		let mut writes = pending.into_writes();
		let mut undo = UndoRecord::default();
		for (family, set) in writes.iter_families() {
			if family == Family::Undo {
				continue
			}
			for key in set.keys() {
				undo.entries.push(UndoEntry {
					family: family.index() as u8,
					key: key.clone(),
					previous: self.state.get_raw(family, key)?,
				});
			}
		}
		writes.put(
			Family::Undo,
			UndoRecord::key(header.block_number),
			obol_codec::CanonicalEncode::to_bytes(&undo),
		);
		// Journals beyond the rewind horizon are dead weight.
		if header.block_number > self.config.max_fork_depth {
			writes.delete(
				Family::Undo,
				UndoRecord::key(header.block_number - self.config.max_fork_depth),
			);
		}
		self.state.commit_writes(writes)?;

		tracing::info!(
			txs = tx_outcomes.len(),
			fees = total_fees,
			delegate = %delegate.name,
			"applied block"
		);
		Ok(BlockOutcome {
			block_id,
			block_number: header.block_number,
			tx_outcomes,
			market_outcomes,
			market_transactions,
		})
	}
}
