//! Wire items exchanged with the network layer. The gossip protocol itself
//! lives outside the core; these are the payloads it carries, in the chain's
//! canonical codec.

use obol_codec::{ByteReader, CanonicalDecode, CanonicalEncode, CodecError};
use obol_ledger::records::{Block, SignedTransaction};

/// Inventory item kinds referenced by ids in the sync protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemKind {
	Block,
	Transaction,
}

impl CanonicalEncode for ItemKind {
	fn encode(&self, out: &mut Vec<u8>) {
		out.push(match self {
			ItemKind::Block => 0,
			ItemKind::Transaction => 1,
		});
	}
}

impl CanonicalDecode for ItemKind {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		Ok(match r.take(1)?[0] {
			0 => ItemKind::Block,
			1 => ItemKind::Transaction,
			_ => return Err(CodecError::MalformedEncoding),
		})
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
	/// A block accepted into our head, broadcast to peers.
	Block(Block),
	/// A transaction admitted to our mempool, broadcast to peers.
	Transaction(SignedTransaction),
	/// Ids a peer may want to fetch.
	InventoryAdvertisement { kind: ItemKind, ids: Vec<[u8; 20]> },
	ItemRequest { kind: ItemKind, id: [u8; 20] },
	/// Page request for ids after `since` (exclusive); `None` = from start.
	ItemIdsRequest { kind: ItemKind, since: Option<[u8; 20]>, limit: u32 },
	ItemIdsReply { kind: ItemKind, ids: Vec<[u8; 20]>, remaining: u32 },
}

impl CanonicalEncode for WireMessage {
	fn encode(&self, out: &mut Vec<u8>) {
		match self {
			WireMessage::Block(block) => {
				out.push(0);
				block.encode(out);
			},
			WireMessage::Transaction(tx) => {
				out.push(1);
				tx.encode(out);
			},
			WireMessage::InventoryAdvertisement { kind, ids } => {
				out.push(2);
				kind.encode(out);
				ids.encode(out);
			},
			WireMessage::ItemRequest { kind, id } => {
				out.push(3);
				kind.encode(out);
				id.encode(out);
			},
			WireMessage::ItemIdsRequest { kind, since, limit } => {
				out.push(4);
				kind.encode(out);
				since.encode(out);
				limit.encode(out);
			},
			WireMessage::ItemIdsReply { kind, ids, remaining } => {
				out.push(5);
				kind.encode(out);
				ids.encode(out);
				remaining.encode(out);
			},
		}
	}
}

impl CanonicalDecode for WireMessage {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		Ok(match r.take(1)?[0] {
			0 => WireMessage::Block(CanonicalDecode::decode(r)?),
			1 => WireMessage::Transaction(CanonicalDecode::decode(r)?),
			2 => WireMessage::InventoryAdvertisement {
				kind: CanonicalDecode::decode(r)?,
				ids: CanonicalDecode::decode(r)?,
			},
			3 => WireMessage::ItemRequest {
				kind: CanonicalDecode::decode(r)?,
				id: CanonicalDecode::decode(r)?,
			},
			4 => WireMessage::ItemIdsRequest {
				kind: CanonicalDecode::decode(r)?,
				since: CanonicalDecode::decode(r)?,
				limit: CanonicalDecode::decode(r)?,
			},
			5 => WireMessage::ItemIdsReply {
				kind: CanonicalDecode::decode(r)?,
				ids: CanonicalDecode::decode(r)?,
				remaining: CanonicalDecode::decode(r)?,
			},
			_ => return Err(CodecError::MalformedEncoding),
		})
	}
}
