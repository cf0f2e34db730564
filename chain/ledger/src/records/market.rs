use obol_codec::{canonical_struct, ByteReader, CanonicalDecode, CanonicalEncode, CodecError};
use obol_primitives::{
	AccountId, Address, AssetId, BlockNumber, Price, ShareAmount, Timestamp,
};
use serde::{Deserialize, Serialize};

/// A market is always quoted higher-asset-id per lower-asset-id, so each
/// unordered asset pair has exactly one book.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketPair {
	pub quote: AssetId,
	pub base: AssetId,
}

canonical_struct!(MarketPair { quote, base });

impl MarketPair {
	pub fn new(quote: AssetId, base: AssetId) -> Option<MarketPair> {
		(quote > base).then_some(MarketPair { quote, base })
	}

	pub fn of_price(price: &Price) -> MarketPair {
		MarketPair { quote: price.quote_asset_id, base: price.base_asset_id }
	}

	/// Order-book key prefix shared by every record of the pair.
	pub fn prefix(&self) -> Vec<u8> {
		let mut key = Vec::with_capacity(8);
		key.extend_from_slice(&self.quote.0.to_be_bytes());
		key.extend_from_slice(&self.base.0.to_be_bytes());
		key
	}
}

/// Position of an order within a book: pair, then price, then owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketIndex {
	pub price: Price,
	pub owner: Address,
}

canonical_struct!(MarketIndex { price, owner });

impl MarketIndex {
	pub fn pair(&self) -> MarketPair {
		MarketPair::of_price(&self.price)
	}

	/// Big-endian order-book key; lexicographic byte order matches
	/// `(quote, base, ratio, owner)` order.
	pub fn key(&self) -> Vec<u8> {
		let mut key = self.pair().prefix();
		key.extend_from_slice(&self.price.ratio.to_be_bytes());
		key.extend_from_slice(&self.owner.0);
		key
	}

	pub fn from_key(key: &[u8]) -> Result<MarketIndex, CodecError> {
		if key.len() != 44 {
			return Err(CodecError::MalformedEncoding)
		}
		let be = |bytes: &[u8]| -> [u8; 4] { bytes.try_into().unwrap_or([0; 4]) };
		let mut ratio = [0u8; 16];
		ratio.copy_from_slice(&key[8..24]);
		let mut owner = [0u8; 20];
		owner.copy_from_slice(&key[24..44]);
		Ok(MarketIndex {
			price: Price::new(
				u128::from_be_bytes(ratio),
				AssetId(u32::from_be_bytes(be(&key[0..4]))),
				AssetId(u32::from_be_bytes(be(&key[4..8]))),
			),
			owner: Address(owner),
		})
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
	Bid,
	Ask,
	Short,
	Cover,
}

impl CanonicalEncode for OrderKind {
	fn encode(&self, out: &mut Vec<u8>) {
		out.push(match self {
			OrderKind::Bid => 0,
			OrderKind::Ask => 1,
			OrderKind::Short => 2,
			OrderKind::Cover => 3,
		});
	}
}

impl CanonicalDecode for OrderKind {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		Ok(match r.take(1)?[0] {
			0 => OrderKind::Bid,
			1 => OrderKind::Ask,
			2 => OrderKind::Short,
			3 => OrderKind::Cover,
			_ => return Err(CodecError::MalformedEncoding),
		})
	}
}

/// A standing bid, ask or short. Bids hold quote, asks hold base, shorts
/// hold native collateral; `limit` is only meaningful for shorts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
	pub balance: ShareAmount,
	pub limit: Option<Price>,
	pub last_update: Timestamp,
}

canonical_struct!(OrderRecord { balance, limit, last_update });

/// An open cover position: native collateral held against quote debt. The
/// index price of the record is the call price.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralRecord {
	pub collateral: ShareAmount,
	pub debt: ShareAmount,
	pub expiration: Timestamp,
}

canonical_struct!(CollateralRecord { collateral, debt, expiration });

/// One delegate's published price observation for an asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
	pub price: Price,
	pub last_update: Timestamp,
}

canonical_struct!(FeedRecord { price, last_update });

impl FeedRecord {
	/// Keyed asset-first so the per-asset median is one prefix scan.
	pub fn key(asset: AssetId, delegate: AccountId) -> Vec<u8> {
		let mut key = Vec::with_capacity(8);
		key.extend_from_slice(&asset.0.to_be_bytes());
		key.extend_from_slice(&delegate.0.to_be_bytes());
		key
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketStatus {
	pub pair: MarketPair,
	pub center_price: Price,
	/// Base-denominated liquidity on each side.
	pub bid_depth: ShareAmount,
	pub ask_depth: ShareAmount,
	pub last_error: Option<String>,
	pub updated_block: BlockNumber,
}

canonical_struct!(MarketStatus { pair, center_price, bid_depth, ask_depth, last_error, updated_block });

impl MarketStatus {
	pub fn new(pair: MarketPair) -> MarketStatus {
		MarketStatus {
			pair,
			center_price: Price::new(0, pair.quote, pair.base),
			bid_depth: 0,
			ask_depth: 0,
			last_error: None,
			updated_block: 0,
		}
	}

	/// Margin calls may not execute below this price; walking the book
	/// further would let a buyer strip collateral.
	pub fn minimum_ask(&self) -> Price {
		self.center_price.scaled(9, 10).unwrap_or(self.center_price)
	}

	pub fn maximum_bid(&self) -> Price {
		self.center_price.scaled(10, 9).unwrap_or(self.center_price)
	}

	pub fn key(pair: &MarketPair) -> Vec<u8> {
		pair.prefix()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
	PerBlock,
	PerHour,
	PerDay,
}

impl Granularity {
	pub fn bucket_secs(self) -> u32 {
		match self {
			Granularity::PerBlock => 1,
			Granularity::PerHour => 60 * 60,
			Granularity::PerDay => 60 * 60 * 24,
		}
	}

	fn tag(self) -> u8 {
		match self {
			Granularity::PerBlock => 0,
			Granularity::PerHour => 1,
			Granularity::PerDay => 2,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketHistoryKey {
	pub pair: MarketPair,
	pub granularity: Granularity,
	pub bucket_start: Timestamp,
}

impl MarketHistoryKey {
	pub fn key(&self) -> Vec<u8> {
		let mut key = self.pair.prefix();
		key.push(self.granularity.tag());
		key.extend_from_slice(&self.bucket_start.0.to_be_bytes());
		key
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketHistoryRecord {
	pub highest_bid: Price,
	pub lowest_ask: Price,
	pub opening_price: Price,
	pub closing_price: Price,
	pub base_volume: ShareAmount,
	pub quote_volume: ShareAmount,
}

canonical_struct!(MarketHistoryRecord {
	highest_bid,
	lowest_ask,
	opening_price,
	closing_price,
	base_volume,
	quote_volume,
});

/// One executed match, emitted for diagnostics and the query API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketTransaction {
	pub bid_owner: Address,
	pub ask_owner: Address,
	pub bid_kind: OrderKind,
	pub ask_kind: OrderKind,
	pub bid_price: Price,
	pub ask_price: Price,
	pub bid_paid: obol_primitives::AssetAmount,
	pub bid_received: obol_primitives::AssetAmount,
	pub ask_paid: obol_primitives::AssetAmount,
	pub ask_received: obol_primitives::AssetAmount,
	/// Native collateral debited from a short bid.
	pub short_collateral: Option<obol_primitives::AssetAmount>,
	/// Collateral returned to the owner on a full cover close.
	pub returned_collateral: Option<ShareAmount>,
	pub quote_fees: ShareAmount,
	pub base_fees: ShareAmount,
}

canonical_struct!(MarketTransaction {
	bid_owner,
	ask_owner,
	bid_kind,
	ask_kind,
	bid_price,
	ask_price,
	bid_paid,
	bid_received,
	ask_paid,
	ask_received,
	short_collateral,
	returned_collateral,
	quote_fees,
	base_fees,
});

#[cfg(test)]
mod tests {
	use super::*;

	const XTS: AssetId = AssetId(0);
	const USD: AssetId = AssetId(1);

	#[test]
	fn pair_requires_quote_above_base() {
		assert!(MarketPair::new(USD, XTS).is_some());
		assert!(MarketPair::new(XTS, USD).is_none());
		assert!(MarketPair::new(XTS, XTS).is_none());
	}

	#[test]
	fn index_key_orders_by_pair_price_owner() {
		let index = |ratio: u128, owner: u8| {
			MarketIndex { price: Price::new(ratio, USD, XTS), owner: Address([owner; 20]) }
		};
		let low = index(10, 9).key();
		let high = index(20, 1).key();
		let other_pair =
			MarketIndex { price: Price::new(1, AssetId(2), XTS), owner: Address([0; 20]) }.key();
		assert!(low < high);
		assert!(high < other_pair);
		assert!(index(10, 1).key() < index(10, 2).key());
	}

	#[test]
	fn index_key_round_trips() {
		let index =
			MarketIndex { price: Price::new(123_456_789, USD, XTS), owner: Address([7; 20]) };
		assert_eq!(MarketIndex::from_key(&index.key()).unwrap(), index);
		assert!(MarketIndex::from_key(&[0; 10]).is_err());
	}

	#[test]
	fn clamp_band_brackets_center() {
		let status = MarketStatus {
			center_price: Price::new(90, USD, XTS),
			..MarketStatus::new(MarketPair::new(USD, XTS).unwrap())
		};
		assert_eq!(status.minimum_ask().ratio, 81);
		assert_eq!(status.maximum_bid().ratio, 100);
	}

	#[test]
	fn history_key_groups_by_granularity() {
		let pair = MarketPair::new(USD, XTS).unwrap();
		let block = MarketHistoryKey {
			pair,
			granularity: Granularity::PerBlock,
			bucket_start: Timestamp(60),
		};
		let hour = MarketHistoryKey { granularity: Granularity::PerHour, ..block };
		assert!(block.key() < hour.key());
	}
}
