use std::collections::BTreeSet;

use obol_codec::CanonicalDecode;
use obol_primitives::{
	AccountId, Address, AssetId, BlockId, BlockNumber, ChainConfig, Price, Timestamp,
	TransactionId,
};

use crate::{
	error::ChainError,
	family::Family,
	records::{
		AccountRecord, AssetRecord, BalanceRecord, Block, ChainHead, CollateralRecord, FeedRecord,
		MarketHistoryKey, MarketHistoryRecord, MarketIndex, MarketPair, MarketStatus, OrderKind,
		OrderRecord, SlotRecord, TransactionLocation, UndoRecord,
	},
};

use super::ChainRead;

pub const META_HEAD: &[u8] = b"head";
pub const META_CONFIG: &[u8] = b"config";
pub const META_DELEGATES: &[u8] = b"delegates";

/// Feeds older than this do not contribute to the median.
pub const FEED_MAX_AGE_SECS: u32 = 60 * 60 * 24;

pub fn order_family(kind: OrderKind) -> Family {
	match kind {
		OrderKind::Bid => Family::Bids,
		OrderKind::Ask => Family::Asks,
		OrderKind::Short => Family::Shorts,
		OrderKind::Cover => Family::Collateral,
	}
}

/// Typed accessors over the raw byte interface. Implemented for every
/// [`ChainRead`], so the same facade serves the canonical state and any
/// overlay depth.
pub trait ChainReadExt: ChainRead {
	fn get_record<T: CanonicalDecode>(
		&self,
		family: Family,
		key: &[u8],
	) -> Result<Option<T>, ChainError> {
		self.get_raw(family, key)?
			.map(|bytes| T::from_bytes(&bytes).map_err(Into::into))
			.transpose()
	}

	fn scan_prefix(
		&self,
		family: Family,
		prefix: &[u8],
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
		let mut entries = Vec::new();
		let mut probe = prefix.to_vec();
		while let Some((key, value)) = self.lower_bound_raw(family, &probe)? {
			if !key.starts_with(prefix) {
				break
			}
			probe = key.clone();
			probe.push(0);
			entries.push((key, value));
		}
		Ok(entries)
	}

	// ---- accounts ----

	fn get_account(&self, id: AccountId) -> Result<Option<AccountRecord>, ChainError> {
		self.get_record(Family::Accounts, &AccountRecord::key(id))
	}

	fn account_id_by_name(&self, name: &str) -> Result<Option<AccountId>, ChainError> {
		self.get_record(Family::AccountIndexByName, &AccountRecord::name_key(name))
	}

	fn get_account_by_name(&self, name: &str) -> Result<Option<AccountRecord>, ChainError> {
		match self.account_id_by_name(name)? {
			Some(id) => self.get_account(id),
			None => Ok(None),
		}
	}

	fn account_id_by_key(&self, address: &Address) -> Result<Option<AccountId>, ChainError> {
		self.get_record(Family::AccountIndexByKey, &address.0)
	}

	fn get_account_by_key(&self, address: &Address) -> Result<Option<AccountRecord>, ChainError> {
		match self.account_id_by_key(address)? {
			Some(id) => self.get_account(id),
			None => Ok(None),
		}
	}

	fn delegate_ids(&self) -> Result<Vec<AccountId>, ChainError> {
		Ok(self.get_record(Family::Meta, META_DELEGATES)?.unwrap_or_default())
	}

	/// The top `num` delegates by net votes, ordered by descending votes
	/// then ascending id. This ordering is consensus-critical: it decides
	/// slot ownership.
	fn active_delegates(&self, num: u32) -> Result<Vec<AccountId>, ChainError> {
		let mut ranked = Vec::new();
		for id in self.delegate_ids()? {
			let account = self
				.get_account(id)?
				.ok_or_else(|| ChainError::ProtocolViolation(format!("missing delegate {id:?}")))?;
			ranked.push((account.net_votes(), id));
		}
		ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
		Ok(ranked.into_iter().take(num as usize).map(|(_, id)| id).collect())
	}

	// ---- assets ----

	fn get_asset(&self, id: AssetId) -> Result<Option<AssetRecord>, ChainError> {
		self.get_record(Family::Assets, &AssetRecord::key(id))
	}

	fn asset_id_by_symbol(&self, symbol: &str) -> Result<Option<AssetId>, ChainError> {
		self.get_record(Family::AssetIndexBySymbol, &AssetRecord::symbol_key(symbol))
	}

	fn get_asset_by_symbol(&self, symbol: &str) -> Result<Option<AssetRecord>, ChainError> {
		match self.asset_id_by_symbol(symbol)? {
			Some(id) => self.get_asset(id),
			None => Ok(None),
		}
	}

	/// Allocate the next asset id: one past the highest registered.
	fn next_asset_id(&self) -> Result<AssetId, ChainError> {
		Ok(match self.last_raw(Family::Assets)? {
			Some((key, _)) => AssetId(
				u32::from_be_bytes(
					key.as_slice().try_into().map_err(|_| ChainError::MalformedEncoding)?,
				) + 1,
			),
			None => AssetId(0),
		})
	}

	/// Account ids start at 1; id 0 is the reserved network account.
	fn next_account_id(&self) -> Result<AccountId, ChainError> {
		Ok(match self.last_raw(Family::Accounts)? {
			Some((key, _)) => AccountId(
				u32::from_be_bytes(
					key.as_slice().try_into().map_err(|_| ChainError::MalformedEncoding)?,
				) + 1,
			),
			None => AccountId(1),
		})
	}

	// ---- balances ----

	fn get_balance(&self, id: &Address) -> Result<Option<BalanceRecord>, ChainError> {
		self.get_record(Family::Balances, &BalanceRecord::key(id))
	}

	// ---- order books ----

	fn get_order(
		&self,
		kind: OrderKind,
		index: &MarketIndex,
	) -> Result<Option<OrderRecord>, ChainError> {
		self.get_record(order_family(kind), &index.key())
	}

	fn get_collateral(&self, index: &MarketIndex) -> Result<Option<CollateralRecord>, ChainError> {
		self.get_record(Family::Collateral, &index.key())
	}

	/// Every pair with at least one record in any of the four books, in
	/// ascending `(quote, base)` order.
	fn market_pairs(&self) -> Result<BTreeSet<MarketPair>, ChainError> {
		let mut pairs = BTreeSet::new();
		for family in [Family::Bids, Family::Asks, Family::Shorts, Family::Collateral] {
			let mut probe = Vec::new();
			while let Some((key, _)) = self.lower_bound_raw(family, &probe)? {
				let index = MarketIndex::from_key(&key)?;
				let pair = index.pair();
				pairs.insert(pair);
				// Skip to the first key past this pair.
				probe = pair.prefix();
				let mut carry = true;
				for byte in probe.iter_mut().rev() {
					if carry {
						let (next, overflow) = byte.overflowing_add(1);
						*byte = next;
						carry = overflow;
					}
				}
				if carry {
					break
				}
			}
		}
		Ok(pairs)
	}

	// ---- feeds ----

	fn get_feed(
		&self,
		asset: AssetId,
		delegate: AccountId,
	) -> Result<Option<FeedRecord>, ChainError> {
		self.get_record(Family::Feeds, &FeedRecord::key(asset, delegate))
	}

	fn feeds_for_asset(
		&self,
		asset: AssetId,
	) -> Result<Vec<(AccountId, FeedRecord)>, ChainError> {
		self.scan_prefix(Family::Feeds, &asset.0.to_be_bytes())?
			.into_iter()
			.map(|(key, value)| {
				let bytes = key.get(4..8).ok_or(ChainError::MalformedEncoding)?;
				let delegate = AccountId(u32::from_be_bytes(
					bytes.try_into().map_err(|_| ChainError::MalformedEncoding)?,
				));
				Ok((delegate, FeedRecord::from_bytes(&value)?))
			})
			.collect()
	}

	/// Median of fresh feeds published by currently active delegates.
	/// `None` when no active delegate has a live feed.
	fn median_feed_price(
		&self,
		asset: AssetId,
		active: &BTreeSet<AccountId>,
		now: Timestamp,
	) -> Result<Option<Price>, ChainError> {
		let mut prices = self
			.feeds_for_asset(asset)?
			.into_iter()
			.filter(|(delegate, feed)| {
				active.contains(delegate) &&
					now.secs_since(feed.last_update) <= FEED_MAX_AGE_SECS
			})
			.map(|(_, feed)| feed.price)
			.collect::<Vec<_>>();
		if prices.is_empty() {
			return Ok(None)
		}
		prices.sort();
		Ok(Some(prices[prices.len() / 2]))
	}

	// ---- market status & history ----

	fn get_market_status(&self, pair: &MarketPair) -> Result<Option<MarketStatus>, ChainError> {
		self.get_record(Family::MarketStatus, &MarketStatus::key(pair))
	}

	fn get_market_history(
		&self,
		key: &MarketHistoryKey,
	) -> Result<Option<MarketHistoryRecord>, ChainError> {
		self.get_record(Family::MarketHistory, &key.key())
	}

	// ---- blocks, slots, transactions ----

	fn head(&self) -> Result<Option<ChainHead>, ChainError> {
		self.get_record(Family::Meta, META_HEAD)
	}

	fn chain_config(&self) -> Result<ChainConfig, ChainError> {
		let bytes = self
			.get_raw(Family::Meta, META_CONFIG)?
			.ok_or_else(|| ChainError::ProtocolViolation("chain config missing".into()))?;
		serde_json::from_slice(&bytes)
			.map_err(|e| ChainError::ProtocolViolation(format!("chain config corrupt: {e}")))
	}

	fn get_slot(&self, timestamp: Timestamp) -> Result<Option<SlotRecord>, ChainError> {
		self.get_record(Family::Slots, &SlotRecord::key(timestamp))
	}

	fn block_id_by_num(&self, number: BlockNumber) -> Result<Option<BlockId>, ChainError> {
		self.get_record(Family::BlocksByNum, &Block::key_by_num(number))
	}

	fn get_block(&self, id: &BlockId) -> Result<Option<Block>, ChainError> {
		self.get_record(Family::BlocksById, &Block::key_by_id(id))
	}

	fn get_side_block(&self, id: &BlockId) -> Result<Option<Block>, ChainError> {
		self.get_record(Family::SideBlocks, &Block::key_by_id(id))
	}

	fn tx_location(
		&self,
		id: &TransactionId,
	) -> Result<Option<TransactionLocation>, ChainError> {
		self.get_record(Family::TxIndex, &id.0)
	}

	fn get_undo(&self, number: BlockNumber) -> Result<Option<UndoRecord>, ChainError> {
		self.get_record(Family::Undo, &UndoRecord::key(number))
	}
}

impl<T: ChainRead + ?Sized> ChainReadExt for T {}
