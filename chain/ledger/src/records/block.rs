use obol_codec::{
	canonical_struct, id_hash, recover, sha256, CanonicalEncode, CodecError, CompactSignature,
	PublicKey, SecretKey,
};
use obol_primitives::{AccountId, BlockId, BlockNumber, SecretHash, Timestamp};

use super::transaction::SignedTransaction;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
	pub previous: BlockId,
	pub block_number: BlockNumber,
	pub timestamp: Timestamp,
	/// Digest over the ordered transaction encodings.
	pub transaction_digest: [u8; 20],
	/// Commitment to the secret this delegate will reveal next time.
	pub next_secret_hash: SecretHash,
	/// Reveal of the secret committed in this delegate's previous block.
	pub previous_secret: SecretHash,
}

canonical_struct!(BlockHeader {
	previous,
	block_number,
	timestamp,
	transaction_digest,
	next_secret_hash,
	previous_secret,
});

impl BlockHeader {
	pub fn digest(&self) -> [u8; 32] {
		sha256(&self.to_bytes())
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedBlockHeader {
	pub header: BlockHeader,
	pub delegate_signature: CompactSignature,
}

canonical_struct!(SignedBlockHeader { header, delegate_signature });

impl SignedBlockHeader {
	pub fn sign(header: BlockHeader, secret: &SecretKey) -> SignedBlockHeader {
		let delegate_signature = obol_codec::sign_compact(secret, &header.digest());
		SignedBlockHeader { header, delegate_signature }
	}

	pub fn signer(&self) -> Result<PublicKey, CodecError> {
		recover(&self.delegate_signature, &self.header.digest())
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
	pub signed_header: SignedBlockHeader,
	pub transactions: Vec<SignedTransaction>,
}

canonical_struct!(Block { signed_header, transactions });

impl Block {
	pub fn id(&self) -> BlockId {
		BlockId(id_hash(&self.to_bytes()))
	}

	pub fn header(&self) -> &BlockHeader {
		&self.signed_header.header
	}

	/// Order-sensitive digest of the transaction set, committed to by the
	/// header.
	pub fn transaction_digest(transactions: &[SignedTransaction]) -> [u8; 20] {
		let mut bytes = Vec::new();
		for tx in transactions {
			tx.encode(&mut bytes);
		}
		id_hash(&bytes)
	}

	pub fn key_by_num(number: BlockNumber) -> Vec<u8> {
		number.to_be_bytes().to_vec()
	}

	pub fn key_by_id(id: &BlockId) -> Vec<u8> {
		id.0.to_vec()
	}
}

/// Head-of-chain pointer stored under the meta family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainHead {
	pub number: BlockNumber,
	pub id: BlockId,
	pub timestamp: Timestamp,
}

canonical_struct!(ChainHead { number, id, timestamp });

/// One elapsed slot: who should have produced, and the block if they did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRecord {
	pub delegate: AccountId,
	pub block_id: Option<BlockId>,
}

canonical_struct!(SlotRecord { delegate, block_id });

impl SlotRecord {
	pub fn key(timestamp: Timestamp) -> Vec<u8> {
		timestamp.0.to_be_bytes().to_vec()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionLocation {
	pub block_number: BlockNumber,
	pub index: u32,
}

canonical_struct!(TransactionLocation { block_number, index });

/// The previous value (or absence) of one key overwritten by a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UndoEntry {
	pub family: u8,
	pub key: Vec<u8>,
	pub previous: Option<Vec<u8>>,
}

impl CanonicalEncode for UndoEntry {
	fn encode(&self, out: &mut Vec<u8>) {
		self.family.encode(out);
		(self.key.len() as u32).encode(out);
		out.extend_from_slice(&self.key);
		match &self.previous {
			None => out.push(0),
			Some(value) => {
				out.push(1);
				(value.len() as u32).encode(out);
				out.extend_from_slice(value);
			},
		}
	}
}

impl obol_codec::CanonicalDecode for UndoEntry {
	fn decode(r: &mut obol_codec::ByteReader) -> Result<Self, CodecError> {
		use obol_codec::CanonicalDecode;
		let family = u8::decode(r)?;
		let key_len = u32::decode(r)? as usize;
		let key = r.take(key_len)?.to_vec();
		let previous = match r.take(1)?[0] {
			0 => None,
			1 => {
				let len = u32::decode(r)? as usize;
				Some(r.take(len)?.to_vec())
			},
			_ => return Err(CodecError::MalformedEncoding),
		};
		Ok(UndoEntry { family, key, previous })
	}
}

/// Everything needed to rewind one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UndoRecord {
	pub entries: Vec<UndoEntry>,
}

canonical_struct!(UndoRecord { entries });

impl UndoRecord {
	pub fn key(number: BlockNumber) -> Vec<u8> {
		number.to_be_bytes().to_vec()
	}
}
