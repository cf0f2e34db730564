//! The per-block double auction: bids, asks, short offers and forced margin
//! covers over one `(quote, base)` pair, priced under a feed-anchored moving
//! center.
//!
//! The engine runs in its own overlay; an error discards the whole pair's
//! work and is recorded in the market status while other pairs proceed.

use std::collections::BTreeSet;

use obol_primitives::{
	AccountId, AssetAmount, BlockNumber, ChainConfig, Price, ShareAmount, Timestamp,
	NATIVE_ASSET_ID, PRECISION,
};

use crate::{
	error::ChainError,
	family::Family,
	records::{
		AssetRecord, BalanceCondition, BalanceRecord, CollateralRecord, Granularity,
		MarketHistoryKey, MarketHistoryRecord, MarketIndex, MarketPair, MarketStatus,
		MarketTransaction, OrderKind, OrderRecord,
	},
	state::{ChainRead, ChainReadExt, PendingState, WriteSets},
};

/// Covers opened by short execution run for a year before expiring.
const COVER_LIFETIME_SECS: u32 = 60 * 60 * 24 * 365;

/// Market rule-set revisions, selected by block height. Chains started on
/// the current rules run [`EngineRevision::V4`] from genesis; the earlier
/// revisions only differ in how the center price moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineRevision {
	V1,
	V3,
	V4,
}

impl EngineRevision {
	pub fn for_height(_height: BlockNumber) -> EngineRevision {
		EngineRevision::V4
	}
}

/// Execute one pair. On success returns the pair's writes (to absorb into
/// the block overlay) and the emitted market transactions; on error all of
/// the pair's work is discarded.
#[allow(clippy::too_many_arguments)]
pub fn execute_market(
	parent: &dyn ChainRead,
	config: &ChainConfig,
	pair: MarketPair,
	block_num: BlockNumber,
	now: Timestamp,
	active_delegates: &BTreeSet<AccountId>,
	revision: EngineRevision,
) -> Result<(WriteSets, Vec<MarketTransaction>), ChainError> {
	let mut engine = MarketEngine::new(parent, config, pair, block_num, now, revision)?;
	engine.median_feed = if engine.quote_asset.is_market_issued() {
		parent.median_feed_price(pair.quote, active_delegates, now)?
	} else {
		None
	};
	engine.execute()?;
	let MarketEngine { pending, transactions, .. } = engine;
	Ok((pending.into_writes(), transactions))
}

/// The side currently under the cursor. `balance` is live: payment methods
/// decrement it as they write records, so exhaustion checks see the truth.
#[derive(Clone, Debug)]
struct MarketOrder {
	kind: OrderKind,
	index: MarketIndex,
	/// Order balance; for covers, the remaining debt.
	balance: ShareAmount,
	/// Remaining collateral of a cover.
	collateral: ShareAmount,
	limit: Option<Price>,
}

impl MarketOrder {
	fn price(&self) -> Price {
		self.index.price
	}

	fn owner(&self) -> obol_primitives::Address {
		self.index.owner
	}

	/// Base-denominated quantity remaining.
	fn quantity(&self, pair: &MarketPair) -> Result<ShareAmount, ChainError> {
		Ok(match self.kind {
			OrderKind::Bid => AssetAmount::new(self.balance, pair.quote)
				.checked_mul_price(&self.price())?
				.amount,
			OrderKind::Ask | OrderKind::Short => self.balance,
			OrderKind::Cover => self.collateral,
		})
	}

	/// Quote-denominated quantity remaining.
	fn quote_quantity(&self, pair: &MarketPair) -> Result<ShareAmount, ChainError> {
		Ok(match self.kind {
			OrderKind::Bid | OrderKind::Cover => self.balance,
			OrderKind::Ask => AssetAmount::new(self.balance, pair.base)
				.checked_mul_price(&self.price())?
				.amount,
			OrderKind::Short => self.balance,
		})
	}
}

struct MarketEngine<'a> {
	/// Snapshot the cursors scan: the state as of this block's transaction
	/// evaluation. The engine's own writes (fresh covers, shrunken orders)
	/// go to `pending` and are deliberately invisible to the cursors, so a
	/// cover opened by a match this block cannot itself be margin-called
	/// until the next block.
	parent: &'a dyn ChainRead,
	pending: PendingState<'a>,
	/// Shorts cancelled by the staleness sweep; the bid cursor must not
	/// resurrect them from the snapshot.
	swept_shorts: std::collections::BTreeSet<Vec<u8>>,
	config: &'a ChainConfig,
	pair: MarketPair,
	block_num: BlockNumber,
	now: Timestamp,
	revision: EngineRevision,
	quote_asset: AssetRecord,
	base_asset: AssetRecord,
	status: MarketStatus,
	median_feed: Option<Price>,
	/// Exclusive upper bound for the descending bid scan.
	bid_cursor: Vec<u8>,
	/// Last consumed key of the ascending scans (empty = before first).
	ask_cursor: Vec<u8>,
	short_cursor: Vec<u8>,
	collateral_cursor: Vec<u8>,
	current_bid: Option<MarketOrder>,
	current_ask: Option<MarketOrder>,
	orders_filled: i64,
	transactions: Vec<MarketTransaction>,
}

impl<'a> MarketEngine<'a> {
	fn new(
		parent: &'a dyn ChainRead,
		config: &'a ChainConfig,
		pair: MarketPair,
		block_num: BlockNumber,
		now: Timestamp,
		revision: EngineRevision,
	) -> Result<MarketEngine<'a>, ChainError> {
		let quote_asset = parent.get_asset(pair.quote)?.ok_or(ChainError::UnknownAsset)?;
		let base_asset = parent.get_asset(pair.base)?.ok_or(ChainError::UnknownAsset)?;
		let status =
			parent.get_market_status(&pair)?.unwrap_or_else(|| MarketStatus::new(pair));

		let mut past_pair = pair.prefix();
		past_pair.extend_from_slice(&[0xff; 37]);

		Ok(MarketEngine {
			parent,
			pending: PendingState::new(parent),
			swept_shorts: std::collections::BTreeSet::new(),
			config,
			pair,
			block_num,
			now,
			revision,
			quote_asset,
			base_asset,
			status,
			median_feed: None,
			bid_cursor: past_pair,
			ask_cursor: Vec::new(),
			short_cursor: Vec::new(),
			collateral_cursor: Vec::new(),
			current_bid: None,
			current_ask: None,
			orders_filled: 0,
			transactions: Vec::new(),
		})
	}

	fn is_feed_market(&self) -> bool {
		self.pair.base == NATIVE_ASSET_ID && self.quote_asset.is_market_issued()
	}

	fn execute(&mut self) -> Result<(), ChainError> {
		if self.is_feed_market() && self.status.center_price.ratio == 0 {
			// Bootstrapping: nothing can trade until delegates publish.
			if self.median_feed.is_none() {
				return Err(ChainError::InsufficientFeeds)
			}
		}
		// A live median anchors execution immediately; the windowed
		// average only smooths feedless stretches.
		if let Some(median) = self.median_feed {
			self.status.center_price = median;
		}

		self.sweep_stale_shorts()?;

		let mut opening_price: Option<Price> = None;
		let mut closing_price: Option<Price> = None;
		let mut highest_price: Option<Price> = None;
		let mut lowest_price: Option<Price> = None;
		let mut base_volume: ShareAmount = 0;
		let mut quote_volume: ShareAmount = 0;
		let mut order_did_execute = false;
		let mut last_orders_filled = -1;

		// Prime both cursors twice: the first ask pick depends on the bid
		// under the cursor and vice versa.
		self.next_bid()?;
		self.next_ask()?;
		self.next_bid()?;
		self.next_ask()?;

		while self.next_bid()? && self.next_ask()? {
			if self.orders_filled == last_orders_filled {
				return Err(ChainError::ProtocolViolation(
					"order matching made no progress".into(),
				))
			}
			last_orders_filled = self.orders_filled;

			let bid = self.current_bid.clone().ok_or_else(no_order)?;
			let ask = self.current_ask.clone().ok_or_else(no_order)?;

			// Shorts always execute at the center price.
			let bid_price = match bid.kind {
				OrderKind::Short => self.status.center_price,
				_ => bid.price(),
			};

			let mtrx = match (ask.kind, bid.kind) {
				(OrderKind::Cover, OrderKind::Short) => {
					// The call must be reached at the execution price.
					if bid_price < ask.price() {
						break
					}
					if self.short_is_limited(&bid, &bid_price) {
						self.current_bid = None;
						continue
					}
					match self.execute_short(&bid, bid_price, bid_price, true)? {
						Some(mtrx) => mtrx,
						None => continue,
					}
				},
				(OrderKind::Cover, OrderKind::Bid) => {
					if bid_price < ask.price() {
						break
					}
					// Executing a margin call too far under the center
					// would let one bid walk the book for its collateral.
					if bid_price < self.status.minimum_ask() {
						self.current_ask = None;
						continue
					}
					self.execute_cover_against_bid(&bid, bid_price)?
				},
				(OrderKind::Ask, OrderKind::Short) => {
					if bid_price < ask.price() {
						break
					}
					if self.short_is_limited(&bid, &bid_price) {
						self.current_bid = None;
						continue
					}
					match self.execute_short(&bid, bid_price, ask.price(), false)? {
						Some(mtrx) => mtrx,
						None => continue,
					}
				},
				(OrderKind::Ask, OrderKind::Bid) => {
					if bid_price < ask.price() {
						break
					}
					self.execute_bid_against_ask(&bid, &ask)?
				},
				_ => {
					return Err(ChainError::ProtocolViolation(format!(
						"impossible order pairing {:?}/{:?}",
						ask.kind, bid.kind
					)))
				},
			};

			self.push_market_transaction(&mtrx)?;

			base_volume += mtrx.bid_received.amount;
			quote_volume += mtrx.ask_received.amount;
			opening_price.get_or_insert(mtrx.bid_price);
			closing_price = Some(mtrx.bid_price);
			if highest_price.map(|p| p < mtrx.bid_price).unwrap_or(true) {
				highest_price = Some(mtrx.bid_price);
			}
			if lowest_price.map(|p| p > mtrx.ask_price).unwrap_or(true) {
				lowest_price = Some(mtrx.ask_price);
			}
			self.quote_asset.collected_fees += mtrx.quote_fees;
			self.base_asset.collected_fees += mtrx.base_fees;
			order_did_execute = true;
		}

		if self.is_feed_market() &&
			order_did_execute &&
			(self.status.bid_depth < self.config.market_depth_requirement ||
				self.status.ask_depth < self.config.market_depth_requirement)
		{
			return Err(ChainError::InsufficientDepth)
		}

		self.update_center_price(order_did_execute)?;

		self.pending.put_record(
			Family::Assets,
			AssetRecord::key(self.pair.quote),
			&self.quote_asset,
		);
		self.pending.put_record(
			Family::Assets,
			AssetRecord::key(self.pair.base),
			&self.base_asset,
		);

		self.status.last_error = None;
		self.status.updated_block = self.block_num;
		self.pending.put_record(
			Family::MarketStatus,
			MarketStatus::key(&self.pair),
			&self.status,
		);

		self.update_market_history(
			base_volume,
			quote_volume,
			opening_price,
			closing_price,
			highest_price,
			lowest_price,
		)?;
		Ok(())
	}

	fn short_is_limited(&self, bid: &MarketOrder, execution_price: &Price) -> bool {
		matches!(&bid.limit, Some(limit) if limit < execution_price)
	}

	/// Collateral per quote for a short: its own offered ratio, but never
	/// looser than the center.
	fn collateral_rate(&self, bid: &MarketOrder) -> Price {
		bid.price().min(self.status.center_price)
	}

	/// short ↔ cover (`against_cover`) and short ↔ ask share everything but
	/// the asked quantity and the receiving side. Returns `None` when the
	/// short must be skipped.
	fn execute_short(
		&mut self,
		bid: &MarketOrder,
		bid_price: Price,
		ask_price: Price,
		against_cover: bool,
	) -> Result<Option<MarketTransaction>, ChainError> {
		if !self.is_feed_market() {
			return Err(ChainError::ProtocolViolation(
				"short execution on a non-feed market".into(),
			))
		}
		let ask = self.current_ask.clone().ok_or_else(no_order)?;
		let rate = self.collateral_rate(bid);

		let ask_quantity_usd = ask.quote_quantity(&self.pair)?;
		let short_quantity_usd = AssetAmount::new(bid.balance, self.pair.base)
			.checked_mul_price(&rate)?
			.amount;
		let traded_usd = short_quantity_usd.min(ask_quantity_usd);

		let ask_received = AssetAmount::new(traded_usd, self.pair.quote);
		let bid_paid = ask_received;
		let ask_paid = ask_received.checked_mul_price(&ask_price)?;
		let bid_received = ask_paid;

		let mut short_collateral = bid_paid.checked_mul_price(&rate)?.amount;
		// Within one precision unit of the whole balance the difference is
		// rounding; absorb it into the collateral.
		if bid.balance - short_collateral < PRECISION {
			short_collateral = bid.balance;
		}
		if short_collateral < ask_paid.amount {
			// Too little collateral at this price.
			self.current_bid = None;
			return Ok(None)
		}

		let mut mtrx = MarketTransaction {
			bid_owner: bid.owner(),
			ask_owner: ask.owner(),
			bid_kind: OrderKind::Short,
			ask_kind: ask.kind,
			bid_price,
			ask_price: bid_price,
			bid_paid,
			bid_received,
			ask_paid,
			ask_received,
			short_collateral: Some(AssetAmount::new(short_collateral, self.pair.base)),
			returned_collateral: None,
			quote_fees: 0,
			base_fees: 0,
		};
		if !against_cover {
			mtrx.ask_price = ask_price;
		}

		self.pay_current_short(&mtrx, short_collateral)?;
		if against_cover {
			self.pay_current_cover(&mut mtrx)?;
		} else {
			self.pay_current_ask(&mtrx)?;
		}

		self.status.bid_depth -= short_collateral;
		self.status.ask_depth += short_collateral;
		Ok(Some(mtrx))
	}

	fn execute_cover_against_bid(
		&mut self,
		bid: &MarketOrder,
		bid_price: Price,
	) -> Result<MarketTransaction, ChainError> {
		let ask = self.current_ask.clone().ok_or_else(no_order)?;

		let max_usd_purchase = AssetAmount::new(ask.collateral, self.pair.base)
			.checked_mul_price(&bid_price)?
			.amount;
		let usd_exchanged = bid.balance.min(max_usd_purchase).min(ask.balance);

		let ask_received = AssetAmount::new(usd_exchanged, self.pair.quote);
		let bid_paid = ask_received;
		// A purchase of the whole collateral takes it exactly; anything
		// less converts at the bid.
		let ask_paid = if usd_exchanged == max_usd_purchase {
			AssetAmount::new(ask.collateral, self.pair.base)
		} else {
			ask_received.checked_mul_price(&bid_price)?
		};
		let bid_received = ask_paid;

		let mut mtrx = MarketTransaction {
			bid_owner: bid.owner(),
			ask_owner: ask.owner(),
			bid_kind: OrderKind::Bid,
			ask_kind: OrderKind::Cover,
			bid_price,
			ask_price: bid_price,
			bid_paid,
			bid_received,
			ask_paid,
			ask_received,
			short_collateral: None,
			returned_collateral: None,
			quote_fees: 0,
			base_fees: 0,
		};

		self.pay_current_bid(&mtrx)?;
		self.pay_current_cover(&mut mtrx)?;

		self.status.ask_depth -= mtrx.ask_paid.amount;
		Ok(mtrx)
	}

	fn execute_bid_against_ask(
		&mut self,
		bid: &MarketOrder,
		ask: &MarketOrder,
	) -> Result<MarketTransaction, ChainError> {
		let bid_quantity = bid.quantity(&self.pair)?;
		let quantity = bid_quantity.min(ask.quantity(&self.pair)?);

		// Everyone gets the price they asked for; the spread is the
		// network's.
		let ask_received =
			AssetAmount::new(quantity, self.pair.base).checked_mul_price(&ask.price())?;
		let mut bid_paid =
			AssetAmount::new(quantity, self.pair.base).checked_mul_price(&bid.price())?;
		let ask_paid = AssetAmount::new(quantity, self.pair.base);
		let bid_received = ask_paid;

		if quantity == bid_quantity {
			// Rounding remainder of the bid is part of the payment.
			bid_paid = AssetAmount::new(bid.balance, self.pair.quote);
		}

		let mtrx = MarketTransaction {
			bid_owner: bid.owner(),
			ask_owner: ask.owner(),
			bid_kind: OrderKind::Bid,
			ask_kind: OrderKind::Ask,
			bid_price: bid.price(),
			ask_price: ask.price(),
			bid_paid,
			bid_received,
			ask_paid,
			ask_received,
			short_collateral: None,
			returned_collateral: None,
			quote_fees: bid_paid.amount - ask_received.amount,
			base_fees: 0,
		};

		self.pay_current_bid(&mtrx)?;
		self.pay_current_ask(&mtrx)?;

		self.status.ask_depth -= mtrx.ask_paid.amount;
		Ok(mtrx)
	}

	// ---- payment legs ----

	/// Debit the short's collateral and open (or extend) the owner's cover.
	fn pay_current_short(
		&mut self,
		mtrx: &MarketTransaction,
		short_collateral: ShareAmount,
	) -> Result<(), ChainError> {
		let bid = self.current_bid.as_mut().ok_or_else(no_order)?;
		if mtrx.ask_paid.amount > short_collateral {
			return Err(ChainError::ProtocolViolation(
				"short paid more base than its debited collateral".into(),
			))
		}

		// Newly issued quote against the short's debt.
		self.quote_asset.current_supply += mtrx.bid_paid.amount;

		let collateral = short_collateral + mtrx.ask_paid.amount;
		let call_collateral = collateral * 2 / 3;
		let call_price = AssetAmount::new(mtrx.bid_paid.amount, self.pair.quote)
			.checked_div(AssetAmount::new(call_collateral, self.pair.base))?;

		let cover_index = MarketIndex { price: call_price, owner: bid.owner() };
		let mut cover = self
			.pending
			.get_collateral(&cover_index)?
			.unwrap_or(CollateralRecord { collateral: 0, debt: 0, expiration: Timestamp(0) });
		cover.collateral += collateral;
		cover.debt += mtrx.bid_paid.amount;
		cover.expiration = self.now.saturating_add_secs(COVER_LIFETIME_SECS);
		self.pending
			.put_record(Family::Collateral, cover_index.key(), &cover);

		bid.balance -= short_collateral;
		if bid.balance < 0 {
			return Err(ChainError::ProtocolViolation("short balance went negative".into()))
		}
		let key = bid.index.key();
		if bid.balance == 0 {
			self.pending.delete(Family::Shorts, key);
		} else {
			self.pending.put_record(
				Family::Shorts,
				key,
				&OrderRecord {
					balance: bid.balance,
					limit: bid.limit,
					last_update: self.now,
				},
			);
		}
		Ok(())
	}

	fn pay_current_bid(&mut self, mtrx: &MarketTransaction) -> Result<(), ChainError> {
		let bid = self.current_bid.as_mut().ok_or_else(no_order)?;
		bid.balance -= mtrx.bid_paid.amount;
		if bid.balance < 0 {
			return Err(ChainError::ProtocolViolation("bid balance went negative".into()))
		}

		deposit_to(&mut self.pending, bid.owner(), mtrx.bid_received, self.now)?;

		// A remainder too small to ever trade is flushed into the fee pool.
		let mut record = OrderRecord {
			balance: bid.balance,
			limit: bid.limit,
			last_update: self.now,
		};
		let residual_quantity = AssetAmount::new(bid.balance, self.pair.quote)
			.checked_mul_price(&bid.price())?
			.amount;
		if residual_quantity == 0 && bid.balance > 0 {
			self.quote_asset.collected_fees += bid.balance;
			bid.balance = 0;
			record.balance = 0;
		}

		let key = bid.index.key();
		if record.balance == 0 {
			self.pending.delete(Family::Bids, key);
		} else {
			self.pending.put_record(Family::Bids, key, &record);
		}
		Ok(())
	}

	fn pay_current_ask(&mut self, mtrx: &MarketTransaction) -> Result<(), ChainError> {
		let ask = self.current_ask.as_mut().ok_or_else(no_order)?;
		ask.balance -= mtrx.ask_paid.amount;
		if ask.balance < 0 {
			return Err(ChainError::ProtocolViolation("ask balance went negative".into()))
		}

		deposit_to(&mut self.pending, ask.owner(), mtrx.ask_received, self.now)?;

		let mut record = OrderRecord {
			balance: ask.balance,
			limit: ask.limit,
			last_update: self.now,
		};
		let residual_value = AssetAmount::new(ask.balance, self.pair.base)
			.checked_mul_price(&ask.price())?
			.amount;
		if residual_value == 0 && ask.balance > 0 {
			self.base_asset.collected_fees += ask.balance;
			ask.balance = 0;
			record.balance = 0;
		}

		let key = ask.index.key();
		if record.balance == 0 {
			self.pending.delete(Family::Asks, key);
		} else {
			self.pending.put_record(Family::Asks, key, &record);
		}
		Ok(())
	}

	/// Reduce the margin-called cover: burn the repaid debt, pay out the
	/// purchased collateral, and settle the record.
	fn pay_current_cover(&mut self, mtrx: &mut MarketTransaction) -> Result<(), ChainError> {
		let ask = self.current_ask.as_mut().ok_or_else(no_order)?;
		ask.balance -= mtrx.bid_paid.amount;
		ask.collateral -= mtrx.ask_paid.amount;
		if ask.balance < 0 || ask.collateral < 0 {
			return Err(ChainError::ProtocolViolation("cover overdrawn".into()))
		}

		self.quote_asset.current_supply -= mtrx.ask_received.amount;

		if ask.collateral == 0 && ask.balance > 0 {
			// Collateral exhausted: the residual debt is written off
			// against the quote fee pool.
			self.quote_asset.collected_fees -= ask.balance;
			ask.balance = 0;
		}

		if ask.balance == 0 && ask.collateral > 0 {
			// Fully covered: the remainder goes home, less the
			// margin-call fee the network keeps.
			let fee = ask.collateral * self.config.margin_call_fee_permille / 1000;
			let returned = ask.collateral - fee;
			mtrx.base_fees += fee;
			mtrx.returned_collateral = Some(returned);
			deposit_to(
				&mut self.pending,
				ask.owner(),
				AssetAmount::new(returned, self.pair.base),
				self.now,
			)?;
			self.status.ask_depth -= ask.collateral;
			ask.collateral = 0;
		}

		let key = ask.index.key();
		if ask.balance == 0 && ask.collateral == 0 {
			self.pending.delete(Family::Collateral, key);
		} else {
			self.pending.put_record(
				Family::Collateral,
				key,
				&CollateralRecord {
					collateral: ask.collateral,
					debt: ask.balance,
					expiration: self.now.saturating_add_secs(COVER_LIFETIME_SECS),
				},
			);
		}
		Ok(())
	}

	// ---- cursors ----

	/// Advance to the next bid-side order if the current one is exhausted.
	/// Shorts take priority over plain bids while the ask side is at or
	/// under the center price.
	fn next_bid(&mut self) -> Result<bool, ChainError> {
		if let Some(bid) = &self.current_bid {
			if bid.quantity(&self.pair)? > 0 {
				return Ok(true)
			}
		}
		self.orders_filled += 1;
		self.current_bid = None;

		let shorts_have_priority = self.is_feed_market() &&
			matches!(&self.current_ask, Some(ask) if ask.price() <= self.status.center_price);
		if shorts_have_priority {
			let mut probe = if self.short_cursor.is_empty() {
				self.pair.prefix()
			} else {
				let mut probe = self.short_cursor.clone();
				probe.push(0);
				probe
			};
			while let Some((key, value)) = self.parent.lower_bound_raw(Family::Shorts, &probe)? {
				if !key.starts_with(&self.pair.prefix()) {
					break
				}
				if self.swept_shorts.contains(&key) {
					probe = key;
					probe.push(0);
					continue
				}
				let record = OrderRecord::from_bytes_checked(&value)?;
				self.short_cursor = key.clone();
				self.current_bid = Some(MarketOrder {
					kind: OrderKind::Short,
					index: MarketIndex::from_key(&key)?,
					balance: record.balance,
					collateral: 0,
					limit: record.limit,
				});
				return Ok(true)
			}
		}

		if let Some((key, value)) = self.parent.prev_raw(Family::Bids, &self.bid_cursor)? {
			if key.starts_with(&self.pair.prefix()) {
				let record = OrderRecord::from_bytes_checked(&value)?;
				self.bid_cursor = key.clone();
				self.current_bid = Some(MarketOrder {
					kind: OrderKind::Bid,
					index: MarketIndex::from_key(&key)?,
					balance: record.balance,
					collateral: 0,
					limit: record.limit,
				});
			}
		}
		Ok(self.current_bid.is_some())
	}

	/// Advance the ask side. Triggered margin calls (bid price at or above
	/// the call price) take priority over plain asks.
	fn next_ask(&mut self) -> Result<bool, ChainError> {
		if let Some(ask) = &self.current_ask {
			let alive = match ask.kind {
				OrderKind::Cover => ask.balance > 0 && ask.collateral > 0,
				_ => ask.balance > 0,
			};
			if alive {
				return Ok(true)
			}
		}
		self.orders_filled += 1;
		self.current_ask = None;

		if self.is_feed_market() {
			if let Some(bid) = &self.current_bid {
				let bid_execution_price = match bid.kind {
					OrderKind::Short => self.status.center_price,
					_ => bid.price(),
				};
				let probe = if self.collateral_cursor.is_empty() {
					self.pair.prefix()
				} else {
					let mut probe = self.collateral_cursor.clone();
					probe.push(0);
					probe
				};
				if let Some((key, value)) =
					self.parent.lower_bound_raw(Family::Collateral, &probe)?
				{
					if key.starts_with(&self.pair.prefix()) {
						let index = MarketIndex::from_key(&key)?;
						// Covers are scanned lowest call price first; once
						// one fails to trigger, none further can.
						if bid_execution_price >= index.price {
							let record = CollateralRecord::from_bytes_checked(&value)?;
							self.collateral_cursor = key;
							self.current_ask = Some(MarketOrder {
								kind: OrderKind::Cover,
								index,
								balance: record.debt,
								collateral: record.collateral,
								limit: None,
							});
							return Ok(true)
						}
					}
				}
			}
		}

		let probe = if self.ask_cursor.is_empty() {
			self.pair.prefix()
		} else {
			let mut probe = self.ask_cursor.clone();
			probe.push(0);
			probe
		};
		if let Some((key, value)) = self.parent.lower_bound_raw(Family::Asks, &probe)? {
			if key.starts_with(&self.pair.prefix()) {
				let record = OrderRecord::from_bytes_checked(&value)?;
				self.ask_cursor = key.clone();
				self.current_ask = Some(MarketOrder {
					kind: OrderKind::Ask,
					index: MarketIndex::from_key(&key)?,
					balance: record.balance,
					collateral: 0,
					limit: record.limit,
				});
			}
		}
		Ok(self.current_ask.is_some())
	}

	// ---- bookkeeping ----

	fn push_market_transaction(&mut self, mtrx: &MarketTransaction) -> Result<(), ChainError> {
		if mtrx.bid_paid.amount < 0 ||
			mtrx.bid_received.amount < 0 ||
			mtrx.ask_paid.amount < 0 ||
			mtrx.ask_received.amount < 0 ||
			mtrx.bid_paid.amount < mtrx.ask_received.amount ||
			mtrx.ask_paid.amount < mtrx.bid_received.amount
		{
			return Err(ChainError::ProtocolViolation(format!(
				"conservation violated in market transaction: {mtrx:?}"
			)))
		}
		self.transactions.push(mtrx.clone());
		Ok(())
	}

	/// Windowed average of the center price, anchored to the feed median
	/// when one exists. V1/V3 ran the same window without the clamp band.
	fn update_center_price(&mut self, order_did_execute: bool) -> Result<(), ChainError> {
		// Even a quiet market re-anchors periodically.
		let order_did_execute = order_did_execute || self.block_num % 6 == 0;
		let (Some(bid), Some(ask)) = (&self.current_bid, &self.current_ask) else {
			return Ok(())
		};
		if !order_did_execute {
			return Ok(())
		}

		if let Some(median) = self.median_feed {
			self.status.center_price = median;
			return Ok(())
		}
		if bid.kind == OrderKind::Short {
			// Short offers carry a collateral ratio, not an opinion on
			// price.
			return Ok(())
		}

		let revision = self.revision;
		let clamp = |price: Price, status: &MarketStatus| match revision {
			EngineRevision::V4 =>
				price.ratio.clamp(status.minimum_ask().ratio, status.maximum_bid().ratio),
			EngineRevision::V1 | EngineRevision::V3 => price.ratio,
		};
		let window = self.config.blocks_per_hour();
		let mut ratio = self.status.center_price.ratio.saturating_mul(window - 1);
		ratio = ratio.saturating_add(clamp(bid.price(), &self.status));
		ratio = ratio.saturating_add(clamp(ask.price(), &self.status));
		self.status.center_price.ratio = ratio / (window + 1);
		Ok(())
	}

	/// Shorts untouched past the staleness horizon are cancelled with an
	/// automatic market transaction refunding their collateral.
	fn sweep_stale_shorts(&mut self) -> Result<(), ChainError> {
		let horizon = self.now.saturating_sub_secs(self.config.short_staleness_secs);
		let mut probe = self.pair.prefix();
		loop {
			let Some((key, value)) = self.parent.lower_bound_raw(Family::Shorts, &probe)?
			else {
				break
			};
			if !key.starts_with(&self.pair.prefix()) {
				break
			}
			probe = key.clone();
			probe.push(0);

			let record = OrderRecord::from_bytes_checked(&value)?;
			if record.last_update >= horizon {
				continue
			}
			let index = MarketIndex::from_key(&key)?;
			deposit_to(
				&mut self.pending,
				index.owner,
				AssetAmount::new(record.balance, self.pair.base),
				self.now,
			)?;
			self.pending.delete(Family::Shorts, key.clone());
			self.swept_shorts.insert(key);
			self.status.bid_depth -= record.balance;
			self.transactions.push(MarketTransaction {
				bid_owner: index.owner,
				ask_owner: index.owner,
				bid_kind: OrderKind::Short,
				ask_kind: OrderKind::Short,
				bid_price: index.price,
				ask_price: index.price,
				bid_paid: AssetAmount::zero(self.pair.quote),
				bid_received: AssetAmount::new(record.balance, self.pair.base),
				ask_paid: AssetAmount::zero(self.pair.base),
				ask_received: AssetAmount::zero(self.pair.quote),
				short_collateral: None,
				returned_collateral: Some(record.balance),
				quote_fees: 0,
				base_fees: 0,
			});
		}
		Ok(())
	}

	fn update_market_history(
		&mut self,
		base_volume: ShareAmount,
		quote_volume: ShareAmount,
		opening_price: Option<Price>,
		closing_price: Option<Price>,
		highest_price: Option<Price>,
		lowest_price: Option<Price>,
	) -> Result<(), ChainError> {
		if base_volume == 0 && quote_volume == 0 {
			return Ok(())
		}
		let (Some(opening), Some(closing), Some(highest), Some(lowest)) =
			(opening_price, closing_price, highest_price, lowest_price)
		else {
			return Ok(())
		};

		let fresh = MarketHistoryRecord {
			highest_bid: highest,
			lowest_ask: lowest,
			opening_price: opening,
			closing_price: closing,
			base_volume,
			quote_volume,
		};

		let block_key = MarketHistoryKey {
			pair: self.pair,
			granularity: Granularity::PerBlock,
			bucket_start: self.now,
		};
		self.pending
			.put_record(Family::MarketHistory, block_key.key(), &fresh);

		for granularity in [Granularity::PerHour, Granularity::PerDay] {
			let key = MarketHistoryKey {
				pair: self.pair,
				granularity,
				bucket_start: self.now.truncated_to(granularity.bucket_secs()),
			};
			let merged = match self.pending.get_market_history(&key)? {
				Some(mut bucket) => {
					bucket.base_volume += fresh.base_volume;
					bucket.quote_volume += fresh.quote_volume;
					bucket.highest_bid = bucket.highest_bid.max(fresh.highest_bid);
					bucket.lowest_ask = bucket.lowest_ask.min(fresh.lowest_ask);
					bucket.closing_price = fresh.closing_price;
					bucket
				},
				None => fresh,
			};
			self.pending
				.put_record(Family::MarketHistory, key.key(), &merged);
		}
		Ok(())
	}
}

fn no_order() -> ChainError {
	ChainError::ProtocolViolation("cursor lost its order mid-match".into())
}

/// Credit market proceeds to the owner's plain signature balance (no vote).
fn deposit_to(
	pending: &mut PendingState,
	owner: obol_primitives::Address,
	amount: AssetAmount,
	now: Timestamp,
) -> Result<(), ChainError> {
	let condition = BalanceCondition::signature(
		owner,
		amount.asset_id,
		obol_primitives::DelegateVoteId(0),
	);
	let balance_id = condition.balance_id();
	let mut record = pending
		.get_balance(&balance_id)?
		.unwrap_or_else(|| BalanceRecord::new(condition, now));
	record.balance = record
		.balance
		.checked_add(amount.amount)
		.ok_or(obol_primitives::ArithmeticError::AdditionOverflow)?;
	record.last_update = now;
	record.deposit_date = now;
	pending.put_record(Family::Balances, BalanceRecord::key(&balance_id), &record);
	Ok(())
}

trait FromBytesChecked: Sized {
	fn from_bytes_checked(bytes: &[u8]) -> Result<Self, ChainError>;
}

impl<T: obol_codec::CanonicalDecode> FromBytesChecked for T {
	fn from_bytes_checked(bytes: &[u8]) -> Result<Self, ChainError> {
		T::from_bytes(bytes).map_err(Into::into)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use obol_primitives::{Address, AssetId, DelegateVoteId, Price, PRICE_ONE};

	use crate::state::pending::tests::MemoryState;

	const XTS: AssetId = AssetId(0);
	const GLD: AssetId = AssetId(1);

	fn pair() -> MarketPair {
		MarketPair::new(GLD, XTS).unwrap()
	}

	fn price(units: u128) -> Price {
		Price::new(units * PRICE_ONE, GLD, XTS)
	}

	fn asset(id: AssetId, issuer: AccountId) -> AssetRecord {
		AssetRecord {
			id,
			symbol: if id == XTS { "XTS".into() } else { "GLD".into() },
			name: String::new(),
			description: String::new(),
			issuer,
			precision: PRECISION as u64,
			registration_date: Timestamp(0),
			last_update: Timestamp(0),
			current_supply: 1_000_000_000,
			maximum_supply: i64::MAX / 2,
			collected_fees: 0,
		}
	}

	fn put<T: obol_codec::CanonicalEncode>(
		root: &mut MemoryState,
		family: Family,
		key: Vec<u8>,
		record: &T,
	) {
		root.put(family, &key, &record.to_bytes());
	}

	/// Plain (non-feed) market: an issued quote asset so shorts and covers
	/// stay out of the way.
	fn issued_market_fixture() -> MemoryState {
		let mut root = MemoryState::default();
		put(&mut root, Family::Assets, AssetRecord::key(XTS), &asset(XTS, AccountId(0)));
		put(&mut root, Family::Assets, AssetRecord::key(GLD), &asset(GLD, AccountId(0)));
		root
	}

	fn order(balance: ShareAmount) -> OrderRecord {
		OrderRecord { balance, limit: None, last_update: Timestamp(50) }
	}

	fn index(price_units: u128, owner_seed: u8) -> MarketIndex {
		MarketIndex { price: price(price_units), owner: Address([owner_seed; 20]) }
	}

	fn run(root: &MemoryState) -> (WriteSets, Vec<MarketTransaction>) {
		execute_market(
			root,
			&ChainConfig::default(),
			pair(),
			7,
			Timestamp(1_000),
			&BTreeSet::new(),
			EngineRevision::V4,
		)
		.unwrap()
	}

	#[test]
	fn bid_and_ask_match_at_their_own_limits() {
		let mut root = issued_market_fixture();
		// Bid 300 GLD at 3 GLD/XTS; ask 100 XTS at 2 GLD/XTS.
		put(&mut root, Family::Bids, index(3, 1).key(), &order(300 * PRECISION));
		put(&mut root, Family::Asks, index(2, 2).key(), &order(100 * PRECISION));

		let (writes, mtrxs) = run(&root);
		assert_eq!(mtrxs.len(), 1);
		let m = &mtrxs[0];
		// 100 XTS trade: bid pays 300 GLD (its whole balance, absorbed),
		// ask receives 200 GLD, spread of 100 GLD is the network fee.
		assert_eq!(m.ask_paid.amount, 100 * PRECISION);
		assert_eq!(m.bid_received.amount, 100 * PRECISION);
		assert_eq!(m.ask_received.amount, 200 * PRECISION);
		assert_eq!(m.bid_paid.amount, 300 * PRECISION);
		assert_eq!(m.quote_fees, 100 * PRECISION);

		let mut after = PendingState::new(&root);
		after.absorb(writes);
		// Both orders consumed.
		assert!(after.get_order(OrderKind::Bid, &index(3, 1)).unwrap().is_none());
		assert!(after.get_order(OrderKind::Ask, &index(2, 2)).unwrap().is_none());
		// Proceeds deposited.
		let ask_payout = BalanceCondition::signature(
			Address([2; 20]),
			GLD,
			DelegateVoteId(0),
		)
		.balance_id();
		assert_eq!(
			after.get_balance(&ask_payout).unwrap().unwrap().balance,
			200 * PRECISION
		);
		// Spread landed in the quote fee pool.
		assert_eq!(
			after.get_asset(GLD).unwrap().unwrap().collected_fees,
			100 * PRECISION
		);
	}

	#[test]
	fn bid_below_ask_does_not_match() {
		let mut root = issued_market_fixture();
		put(&mut root, Family::Bids, index(2, 1).key(), &order(100 * PRECISION));
		put(&mut root, Family::Asks, index(3, 2).key(), &order(100 * PRECISION));
		let (_, mtrxs) = run(&root);
		assert!(mtrxs.is_empty());
	}

	#[test]
	fn bid_exactly_at_ask_matches() {
		let mut root = issued_market_fixture();
		put(&mut root, Family::Bids, index(2, 1).key(), &order(200 * PRECISION));
		put(&mut root, Family::Asks, index(2, 2).key(), &order(100 * PRECISION));
		let (_, mtrxs) = run(&root);
		assert_eq!(mtrxs.len(), 1);
		assert_eq!(mtrxs[0].quote_fees, 0);
	}

	#[test]
	fn highest_bid_trades_first() {
		let mut root = issued_market_fixture();
		put(&mut root, Family::Bids, index(5, 1).key(), &order(5 * PRECISION));
		put(&mut root, Family::Bids, index(4, 2).key(), &order(4 * PRECISION));
		put(&mut root, Family::Asks, index(1, 3).key(), &order(100 * PRECISION));
		let (_, mtrxs) = run(&root);
		assert_eq!(mtrxs.len(), 2);
		assert_eq!(mtrxs[0].bid_owner, Address([1; 20]));
		assert_eq!(mtrxs[1].bid_owner, Address([2; 20]));
	}

	#[test]
	fn stale_shorts_are_swept() {
		let mut root = issued_market_fixture();
		// Make the quote market-issued so the pair is a feed market.
		put(
			&mut root,
			Family::Assets,
			AssetRecord::key(GLD),
			&asset(GLD, obol_primitives::MARKET_ISSUED),
		);
		put(
			&mut root,
			Family::MarketStatus,
			MarketStatus::key(&pair()),
			&MarketStatus {
				center_price: price(1),
				bid_depth: 77,
				..MarketStatus::new(pair())
			},
		);
		put(
			&mut root,
			Family::Shorts,
			index(1, 4).key(),
			&OrderRecord { balance: 77, limit: None, last_update: Timestamp(10) },
		);

		let config = ChainConfig { short_staleness_secs: 100, ..Default::default() };
		let (writes, mtrxs) = execute_market(
			&root,
			&config,
			pair(),
			7,
			Timestamp(10_000),
			&BTreeSet::new(),
			EngineRevision::V4,
		)
		.unwrap();
		assert_eq!(mtrxs.len(), 1);
		assert_eq!(mtrxs[0].returned_collateral, Some(77));

		let mut after = PendingState::new(&root);
		after.absorb(writes);
		assert!(after.get_order(OrderKind::Short, &index(1, 4)).unwrap().is_none());
		let refund = BalanceCondition::signature(Address([4; 20]), XTS, DelegateVoteId(0))
			.balance_id();
		assert_eq!(after.get_balance(&refund).unwrap().unwrap().balance, 77);
	}

	#[test]
	fn feed_market_without_feeds_errors() {
		let mut root = issued_market_fixture();
		put(
			&mut root,
			Family::Assets,
			AssetRecord::key(GLD),
			&asset(GLD, obol_primitives::MARKET_ISSUED),
		);
		put(&mut root, Family::Bids, index(1, 1).key(), &order(PRECISION));
		let result = execute_market(
			&root,
			&ChainConfig::default(),
			pair(),
			7,
			Timestamp(1_000),
			&BTreeSet::new(),
			EngineRevision::V4,
		);
		assert!(matches!(result, Err(ChainError::InsufficientFeeds)));
	}
}
