//! Block production: when one of our delegate keys owns the next slot,
//! drain the mempool into a candidate, reveal the previous secret, commit
//! the next one, sign and hand the block over for application + broadcast.

use obol_codec::{id_hash, key_address, CanonicalEncode, PublicKey, SecretKey, SECP256K1};
use obol_ledger::{
	evaluate_transaction,
	records::{Block, BlockHeader, SignedBlockHeader, SignedTransaction},
	ChainDatabase, ChainError, ChainReadExt, PendingState,
};
use obol_primitives::{AccountId, BlockNumber, SecretHash, Timestamp};

use crate::mempool::MemPool;

/// A delegate identity this node can sign for.
struct DelegateKey {
	account: AccountId,
	secret: SecretKey,
}

pub struct Producer {
	keys: Vec<DelegateKey>,
}

/// Deterministic per-block production secret, so a restarted node can still
/// reveal what it committed: the delegate key is the only state needed.
fn production_secret(secret: &SecretKey, block_number: BlockNumber) -> SecretHash {
	let mut bytes = secret.secret_bytes().to_vec();
	bytes.extend_from_slice(&block_number.to_le_bytes());
	SecretHash(id_hash(&bytes))
}

impl Producer {
	/// Resolve signing secrets to delegate accounts. Keys that match no
	/// registered delegate are reported and skipped.
	pub fn new(db: &ChainDatabase, secrets: &[SecretKey]) -> Result<Producer, ChainError> {
		let mut keys = Vec::new();
		for secret in secrets {
			let public: PublicKey = secret.public_key(SECP256K1);
			let address = key_address(&public);
			match db.state().get_account_by_key(&address)? {
				Some(account) if account.is_delegate() => {
					tracing::info!("producing for delegate {}", account.name);
					keys.push(DelegateKey { account: account.id, secret: *secret });
				},
				_ => tracing::warn!("delegate key {address} matches no registered delegate"),
			}
		}
		Ok(Producer { keys })
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// Does one of our delegates own the slot at `timestamp`?
	fn key_for_slot(
		&self,
		db: &ChainDatabase,
		timestamp: Timestamp,
		active: &[AccountId],
	) -> Result<Option<&DelegateKey>, ChainError> {
		let owner = db.slot_delegate(timestamp, active)?;
		Ok(self.keys.iter().find(|key| key.account == owner))
	}

	/// Build and sign a candidate for the slot at `slot_time`, or `None`
	/// when the slot is not ours (or production is disabled).
	pub fn produce(
		&self,
		db: &ChainDatabase,
		mempool: &MemPool,
		slot_time: Timestamp,
	) -> Result<Option<Block>, ChainError> {
		if self.keys.is_empty() {
			return Ok(None)
		}
		let head = db.head()?;
		if slot_time <= head.timestamp ||
			!slot_time.is_on_grid(db.config().block_interval_secs)
		{
			return Ok(None)
		}
		let active = db.active_delegates()?;
		let Some(key) = self.key_for_slot(db, slot_time, &active)? else { return Ok(None) };

		// Fill the candidate: highest fee density first, skipping anything
		// that no longer evaluates, stopping at the size limit. A few bytes
		// of margin cover the growth of the length prefix itself.
		let mut pending = PendingState::new(db.state());
		let mut included: Vec<SignedTransaction> = Vec::new();
		let max_bytes = db.config().max_block_size.saturating_sub(9);
		let mut block_bytes = empty_block_size();
		for tx in mempool.drain_order() {
			let tx_size = tx.encoded_size();
			if block_bytes + tx_size > max_bytes {
				continue
			}
			match evaluate_transaction(&pending, db.config(), slot_time, &tx) {
				Ok((writes, _)) => {
					pending.absorb(writes);
					block_bytes += tx_size;
					included.push(tx);
				},
				Err(e) => {
					tracing::debug!("leaving tx out of candidate: {e}");
				},
			}
		}

		// Reveal the secret committed by our previous block; the first
		// block a delegate signs reveals a placeholder nobody checks.
		let stats = db
			.state()
			.get_account(key.account)?
			.and_then(|account| account.delegate)
			.ok_or_else(|| ChainError::ProtocolViolation("producing for non-delegate".into()))?;
		let previous_secret = match stats.last_block_produced {
			Some(number) if stats.next_secret_hash.is_some() =>
				production_secret(&key.secret, number),
			_ => SecretHash([0; 20]),
		};
		let block_number = head.number + 1;
		let next_secret_hash =
			SecretHash(id_hash(&production_secret(&key.secret, block_number).0));

		let header = BlockHeader {
			previous: head.id,
			block_number,
			timestamp: slot_time,
			transaction_digest: Block::transaction_digest(&included),
			next_secret_hash,
			previous_secret,
		};
		Ok(Some(Block {
			signed_header: SignedBlockHeader::sign(header, &key.secret),
			transactions: included,
		}))
	}
}

/// Encoded size of a block with no transactions; the budget baseline.
fn empty_block_size() -> usize {
	Block {
		signed_header: SignedBlockHeader {
			header: BlockHeader {
				previous: Default::default(),
				block_number: 0,
				timestamp: Timestamp(0),
				transaction_digest: [0; 20],
				next_secret_hash: SecretHash([0; 20]),
				previous_secret: SecretHash([0; 20]),
			},
			delegate_signature: obol_codec::CompactSignature([0; 65]),
		},
		transactions: vec![],
	}
	.encoded_size()
}
