//! Read-only projections over the committed head, consumed by wallets, RPC
//! and light clients. Raw integer amounts always travel with their asset id
//! and get a precision-formatted string only here, at the display boundary.

use obol_ledger::{
	records::{
		AccountRecord, AssetRecord, Block, Granularity, MarketHistoryKey, MarketIndex,
		MarketPair, MarketStatus, OrderKind, SlotRecord,
	},
	ChainDatabase, ChainError, ChainRead, ChainReadExt, Family,
};
use obol_primitives::{
	AccountId, Address, AssetId, BlockId, BlockNumber, Price, ShareAmount, Timestamp,
	TransactionId,
};
use serde::Serialize;

use crate::mempool::MemPool;

pub fn format_amount(amount: ShareAmount, precision: u64) -> String {
	let precision = precision.max(1) as i128;
	let value = amount as i128;
	let whole = (value / precision).unsigned_abs();
	let frac = (value % precision).unsigned_abs();
	let width = (precision as f64).log10().round() as usize;
	let sign = if value < 0 { "-" } else { "" };
	format!("{sign}{whole}.{frac:0width$}")
}

#[derive(Clone, Debug, Serialize)]
pub struct AmountView {
	pub amount: ShareAmount,
	pub asset_id: AssetId,
	pub display: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct HeadView {
	pub number: BlockNumber,
	pub id: BlockId,
	pub timestamp: Timestamp,
}

#[derive(Clone, Debug, Serialize)]
pub struct BlockView {
	pub id: BlockId,
	pub number: BlockNumber,
	pub timestamp: Timestamp,
	pub previous: BlockId,
	pub delegate: Option<String>,
	pub transaction_ids: Vec<TransactionId>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TransactionView {
	pub id: TransactionId,
	pub block_number: BlockNumber,
	pub index: u32,
	pub expiration: Timestamp,
	pub operation_count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct BalanceView {
	pub balance_id: Address,
	pub amount: AmountView,
	pub vote: i32,
	pub last_update: Timestamp,
}

#[derive(Clone, Debug, Serialize)]
pub struct AccountView {
	pub id: AccountId,
	pub name: String,
	pub owner_key: String,
	pub active_key: String,
	pub registration_date: Timestamp,
	pub delegate: Option<DelegateView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DelegateView {
	pub votes_for: ShareAmount,
	pub votes_against: ShareAmount,
	pub pay_balance: ShareAmount,
	pub blocks_produced: u32,
	pub blocks_missed: u32,
	pub last_block_produced: Option<BlockNumber>,
	pub active: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct AssetView {
	pub id: AssetId,
	pub symbol: String,
	pub name: String,
	pub issuer: Option<AccountId>,
	pub market_issued: bool,
	pub precision: u64,
	pub current_supply: AmountView,
	pub maximum_supply: AmountView,
	pub collected_fees: AmountView,
}

#[derive(Clone, Debug, Serialize)]
pub struct OrderView {
	pub price: Price,
	pub owner: Address,
	pub balance: ShareAmount,
	pub collateral: Option<ShareAmount>,
}

#[derive(Clone, Debug, Serialize)]
pub struct OrderBookView {
	pub bids: Vec<OrderView>,
	pub asks: Vec<OrderView>,
	pub shorts: Vec<OrderView>,
	pub covers: Vec<OrderView>,
	pub status: Option<MarketStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FeedView {
	pub delegate: AccountId,
	pub price: Price,
	pub last_update: Timestamp,
}

#[derive(Clone, Debug, Serialize)]
pub struct SlotView {
	pub timestamp: Timestamp,
	pub delegate: AccountId,
	pub block_id: Option<BlockId>,
}

/// All queries answer from the committed head; the core task is the only
/// writer, so a projection never sees half a block.
pub struct QueryApi<'a> {
	db: &'a ChainDatabase,
}

impl<'a> QueryApi<'a> {
	pub fn new(db: &'a ChainDatabase) -> QueryApi<'a> {
		QueryApi { db }
	}

	fn amount(&self, amount: ShareAmount, asset_id: AssetId) -> Result<AmountView, ChainError> {
		let precision = self
			.db
			.state()
			.get_asset(asset_id)?
			.map(|asset| asset.precision)
			.unwrap_or(1);
		Ok(AmountView { amount, asset_id, display: format_amount(amount, precision) })
	}

	pub fn head(&self) -> Result<HeadView, ChainError> {
		let head = self.db.head()?;
		Ok(HeadView { number: head.number, id: head.id, timestamp: head.timestamp })
	}

	fn block_view(&self, block: Block) -> Result<BlockView, ChainError> {
		let header = block.header();
		let delegate = self
			.db
			.state()
			.get_slot(header.timestamp)?
			.and_then(|slot| self.db.state().get_account(slot.delegate).ok().flatten())
			.map(|account| account.name);
		Ok(BlockView {
			id: block.id(),
			number: header.block_number,
			timestamp: header.timestamp,
			previous: header.previous,
			delegate,
			transaction_ids: block.transactions.iter().map(|tx| tx.id()).collect(),
		})
	}

	pub fn block_by_number(&self, number: BlockNumber) -> Result<Option<BlockView>, ChainError> {
		match self.db.state().block_id_by_num(number)? {
			Some(id) => self.block_by_id(&id),
			None => Ok(None),
		}
	}

	pub fn block_by_id(&self, id: &BlockId) -> Result<Option<BlockView>, ChainError> {
		self.db.state().get_block(id)?.map(|block| self.block_view(block)).transpose()
	}

	pub fn blocks_in_range(
		&self,
		first: BlockNumber,
		limit: usize,
	) -> Result<Vec<BlockView>, ChainError> {
		let mut blocks = Vec::new();
		for number in first.. {
			if blocks.len() >= limit.min(1_000) {
				break
			}
			match self.block_by_number(number)? {
				Some(view) => blocks.push(view),
				None => break,
			}
		}
		Ok(blocks)
	}

	pub fn transaction(
		&self,
		id: &TransactionId,
	) -> Result<Option<TransactionView>, ChainError> {
		let Some(location) = self.db.state().tx_location(id)? else { return Ok(None) };
		let block = self
			.db
			.state()
			.block_id_by_num(location.block_number)?
			.and_then(|block_id| self.db.state().get_block(&block_id).ok().flatten());
		let Some(block) = block else { return Ok(None) };
		let Some(tx) = block.transactions.get(location.index as usize) else {
			return Ok(None)
		};
		Ok(Some(TransactionView {
			id: *id,
			block_number: location.block_number,
			index: location.index,
			expiration: tx.transaction.expiration,
			operation_count: tx.transaction.operations.len(),
		}))
	}

	pub fn balance(&self, id: &Address) -> Result<Option<BalanceView>, ChainError> {
		let Some(record) = self.db.state().get_balance(id)? else { return Ok(None) };
		Ok(Some(BalanceView {
			balance_id: *id,
			amount: self.amount(record.balance, record.asset_id())?,
			vote: record.condition.vote_id.0,
			last_update: record.last_update,
		}))
	}

	fn account_view(&self, account: AccountRecord) -> Result<AccountView, ChainError> {
		let active = self.db.active_delegates()?;
		Ok(AccountView {
			id: account.id,
			name: account.name.clone(),
			owner_key: hex::encode(account.owner_key.serialize()),
			active_key: hex::encode(account.active_key.serialize()),
			registration_date: account.registration_date,
			delegate: account.delegate.map(|stats| DelegateView {
				votes_for: stats.votes_for,
				votes_against: stats.votes_against,
				pay_balance: stats.pay_balance,
				blocks_produced: stats.blocks_produced,
				blocks_missed: stats.blocks_missed,
				last_block_produced: stats.last_block_produced,
				active: active.contains(&account.id),
			}),
		})
	}

	pub fn account_by_id(&self, id: AccountId) -> Result<Option<AccountView>, ChainError> {
		self.db.state().get_account(id)?.map(|a| self.account_view(a)).transpose()
	}

	pub fn account_by_name(&self, name: &str) -> Result<Option<AccountView>, ChainError> {
		self.db.state().get_account_by_name(name)?.map(|a| self.account_view(a)).transpose()
	}

	pub fn account_by_key(&self, key: &Address) -> Result<Option<AccountView>, ChainError> {
		self.db.state().get_account_by_key(key)?.map(|a| self.account_view(a)).transpose()
	}

	/// Page through accounts by name, starting at `first` inclusive.
	pub fn list_accounts(
		&self,
		first: &str,
		limit: usize,
	) -> Result<Vec<AccountView>, ChainError> {
		let mut views = Vec::new();
		let mut probe = AccountRecord::name_key(first);
		while views.len() < limit.min(1_000) {
			let Some((key, value)) =
				self.db.state().lower_bound_raw(Family::AccountIndexByName, &probe)?
			else {
				break
			};
			let id: AccountId = obol_codec::CanonicalDecode::from_bytes(&value)
				.map_err(ChainError::from)?;
			if let Some(view) = self.account_by_id(id)? {
				views.push(view);
			}
			probe = key;
			probe.push(0);
		}
		Ok(views)
	}

	fn asset_view(&self, asset: AssetRecord) -> Result<AssetView, ChainError> {
		Ok(AssetView {
			id: asset.id,
			symbol: asset.symbol.clone(),
			name: asset.name.clone(),
			issuer: (!asset.is_market_issued()).then_some(asset.issuer),
			market_issued: asset.is_market_issued(),
			precision: asset.precision,
			current_supply: self.amount(asset.current_supply, asset.id)?,
			maximum_supply: self.amount(asset.maximum_supply, asset.id)?,
			collected_fees: self.amount(asset.collected_fees, asset.id)?,
		})
	}

	pub fn asset_by_id(&self, id: AssetId) -> Result<Option<AssetView>, ChainError> {
		self.db.state().get_asset(id)?.map(|a| self.asset_view(a)).transpose()
	}

	pub fn asset_by_symbol(&self, symbol: &str) -> Result<Option<AssetView>, ChainError> {
		self.db.state().get_asset_by_symbol(symbol)?.map(|a| self.asset_view(a)).transpose()
	}

	pub fn list_assets(&self, limit: usize) -> Result<Vec<AssetView>, ChainError> {
		let mut views = Vec::new();
		for id in 0.. {
			if views.len() >= limit.min(1_000) {
				break
			}
			match self.asset_by_id(AssetId(id))? {
				Some(view) => views.push(view),
				None => break,
			}
		}
		Ok(views)
	}

	/// A bounded slice of all four books for one pair, best priced first on
	/// each side.
	pub fn order_book(
		&self,
		quote: AssetId,
		base: AssetId,
		limit: usize,
	) -> Result<Option<OrderBookView>, ChainError> {
		let Some(pair) = MarketPair::new(quote, base) else { return Ok(None) };
		let limit = limit.min(1_000);
		let state = self.db.state();

		let slice = |kind: OrderKind, best_first_desc: bool| -> Result<Vec<OrderView>, ChainError> {
			let family = match kind {
				OrderKind::Bid => Family::Bids,
				OrderKind::Ask => Family::Asks,
				OrderKind::Short => Family::Shorts,
				OrderKind::Cover => Family::Collateral,
			};
			let mut views = Vec::new();
			let prefix = pair.prefix();
			if best_first_desc {
				let mut probe = prefix.clone();
				probe.extend_from_slice(&[0xff; 37]);
				while views.len() < limit {
					let Some((key, value)) = state.prev_raw(family, &probe)? else { break };
					if !key.starts_with(&prefix) {
						break
					}
					views.push(order_view(kind, &key, &value)?);
					probe = key;
				}
			} else {
				let mut probe = prefix.clone();
				while views.len() < limit {
					let Some((key, value)) = state.lower_bound_raw(family, &probe)? else {
						break
					};
					if !key.starts_with(&prefix) {
						break
					}
					views.push(order_view(kind, &key, &value)?);
					probe = key;
					probe.push(0);
				}
			}
			Ok(views)
		};

		Ok(Some(OrderBookView {
			bids: slice(OrderKind::Bid, true)?,
			asks: slice(OrderKind::Ask, false)?,
			shorts: slice(OrderKind::Short, false)?,
			covers: slice(OrderKind::Cover, false)?,
			status: state.get_market_status(&pair)?,
		}))
	}

	pub fn market_history(
		&self,
		quote: AssetId,
		base: AssetId,
		granularity: Granularity,
		from: Timestamp,
		to: Timestamp,
		limit: usize,
	) -> Result<Vec<(Timestamp, obol_ledger::records::MarketHistoryRecord)>, ChainError> {
		let Some(pair) = MarketPair::new(quote, base) else { return Ok(vec![]) };
		let mut points = Vec::new();
		let mut probe =
			MarketHistoryKey { pair, granularity, bucket_start: from }.key();
		let end = MarketHistoryKey { pair, granularity, bucket_start: to }.key();
		while points.len() < limit.min(10_000) {
			let Some((key, value)) =
				self.db.state().lower_bound_raw(Family::MarketHistory, &probe)?
			else {
				break
			};
			if key > end {
				break
			}
			let bucket = key
				.get(9..13)
				.and_then(|b| b.try_into().ok())
				.map(u32::from_be_bytes)
				.ok_or(ChainError::MalformedEncoding)?;
			points.push((
				Timestamp(bucket),
				obol_codec::CanonicalDecode::from_bytes(&value).map_err(ChainError::from)?,
			));
			probe = key;
			probe.push(0);
		}
		Ok(points)
	}

	pub fn feeds(&self, asset: AssetId) -> Result<Vec<FeedView>, ChainError> {
		Ok(self
			.db
			.state()
			.feeds_for_asset(asset)?
			.into_iter()
			.map(|(delegate, feed)| FeedView {
				delegate,
				price: feed.price,
				last_update: feed.last_update,
			})
			.collect())
	}

	pub fn median_feed(&self, asset: AssetId) -> Result<Option<Price>, ChainError> {
		let active = self.db.active_delegates()?.into_iter().collect();
		let head = self.db.head()?;
		self.db.state().median_feed_price(asset, &active, head.timestamp)
	}

	pub fn delegates(&self) -> Result<Vec<AccountView>, ChainError> {
		let mut views = Vec::new();
		for id in self.db.state().delegate_ids()? {
			if let Some(view) = self.account_by_id(id)? {
				views.push(view);
			}
		}
		views.sort_by(|a, b| {
			let votes = |v: &AccountView| {
				v.delegate.as_ref().map(|d| d.votes_for - d.votes_against).unwrap_or(0)
			};
			votes(b).cmp(&votes(a)).then(a.id.cmp(&b.id))
		});
		Ok(views)
	}

	pub fn slot(&self, timestamp: Timestamp) -> Result<Option<SlotView>, ChainError> {
		Ok(self.db.state().get_slot(timestamp)?.map(|SlotRecord { delegate, block_id }| {
			SlotView { timestamp, delegate, block_id }
		}))
	}

	pub fn pending_transactions(&self, mempool: &MemPool) -> Vec<TransactionId> {
		mempool.pending().iter().map(|tx| tx.id()).collect()
	}
}

fn order_view(kind: OrderKind, key: &[u8], value: &[u8]) -> Result<OrderView, ChainError> {
	let index = MarketIndex::from_key(key)?;
	Ok(match kind {
		OrderKind::Cover => {
			let record: obol_ledger::records::CollateralRecord =
				obol_codec::CanonicalDecode::from_bytes(value).map_err(ChainError::from)?;
			OrderView {
				price: index.price,
				owner: index.owner,
				balance: record.debt,
				collateral: Some(record.collateral),
			}
		},
		_ => {
			let record: obol_ledger::records::OrderRecord =
				obol_codec::CanonicalDecode::from_bytes(value).map_err(ChainError::from)?;
			OrderView {
				price: index.price,
				owner: index.owner,
				balance: record.balance,
				collateral: None,
			}
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn amounts_format_at_asset_precision() {
		assert_eq!(format_amount(123_450, 100_000), "1.23450");
		assert_eq!(format_amount(5, 100_000), "0.00005");
		assert_eq!(format_amount(-123_450, 100_000), "-1.23450");
		assert_eq!(format_amount(7, 1), "7.0");
	}
}
