//! Transaction evaluation: semantic checks, delta accounting and signature
//! gathering for one signed transaction against a pending overlay.
//!
//! Every operation applies its writes immediately to the transaction's own
//! [`PendingState`]; any rule violation aborts with those writes dropped,
//! leaving sibling transactions untouched.

use std::collections::{BTreeMap, BTreeSet};

use obol_codec::ripemd160;
use obol_primitives::{
	AccountId, Address, AssetAmount, AssetId, ChainConfig, DelegateVoteId, Price, ShareAmount,
	Timestamp, TransactionId, MARKET_ISSUED, MAX_SYMBOL_LEN, MIN_SYMBOL_LEN, NATIVE_ASSET_ID,
};

use crate::{
	error::ChainError,
	family::Family,
	records::{
		AccountRecord, AssetRecord, BalanceCondition, BalanceRecord, DelegateStats, FeedRecord,
		MarketIndex, MarketPair, MarketStatus, Operation, OrderKind, OrderRecord,
		SignedTransaction, WithdrawCondition,
	},
	state::{order_family, ChainRead, ChainReadExt, PendingState, WriteSets, META_DELEGATES},
};

#[derive(Clone, Debug)]
pub struct TxSummary {
	pub id: TransactionId,
	/// Native shares left unclaimed by the operations; collected as the fee.
	pub fee: ShareAmount,
	pub encoded_size: usize,
}

/// Evaluate one transaction in a fresh overlay on `parent`. On success the
/// overlay's writes are returned for the caller to absorb; on failure they
/// are dropped with the error.
pub fn evaluate_transaction(
	parent: &dyn ChainRead,
	config: &ChainConfig,
	now: Timestamp,
	tx: &SignedTransaction,
) -> Result<(WriteSets, TxSummary), ChainError> {
	let id = tx.id();
	if parent.tx_location(&id)?.is_some() {
		return Err(ChainError::DuplicateTransaction)
	}
	if now >= tx.transaction.expiration ||
		tx.transaction.expiration.secs_since(now) > config.max_transaction_ttl_secs
	{
		return Err(ChainError::ExpiredOrTooFarFuture)
	}

	let mut evaluator = Evaluator {
		pending: PendingState::new(parent),
		config,
		now,
		vote_id: tx.transaction.vote_id,
		signed: tx.signers()?,
		required_sigs: BTreeSet::new(),
		deltas: BTreeMap::new(),
		provided_deposits: BTreeMap::new(),
		required_deposits: BTreeMap::new(),
		net_votes: BTreeMap::new(),
		extra_required_fee: 0,
	};

	for op in &tx.transaction.operations {
		evaluator.evaluate_operation(op)?;
	}

	let encoded_size = tx.encoded_size();
	let fee = evaluator.post_evaluate(encoded_size)?;
	Ok((evaluator.pending.into_writes(), TxSummary { id, fee, encoded_size }))
}

struct Evaluator<'a> {
	pending: PendingState<'a>,
	config: &'a ChainConfig,
	now: Timestamp,
	vote_id: DelegateVoteId,
	signed: BTreeSet<Address>,
	required_sigs: BTreeSet<Address>,
	/// Per-asset shares withdrawn minus deposited; the native remainder is
	/// the fee.
	deltas: BTreeMap<AssetId, ShareAmount>,
	provided_deposits: BTreeMap<Address, ShareAmount>,
	required_deposits: BTreeMap<Address, ShareAmount>,
	net_votes: BTreeMap<AccountId, (ShareAmount, ShareAmount)>,
	/// Registration charges folded into the minimum fee so the whole
	/// remainder still lands in the fee pool.
	extra_required_fee: ShareAmount,
}

impl Evaluator<'_> {
	fn check_signature(&self, address: &Address) -> bool {
		self.signed.contains(address)
	}

	fn require_signature(&mut self, address: Address) {
		self.required_sigs.insert(address);
	}

	fn add_delta(&mut self, asset_id: AssetId, amount: ShareAmount) -> Result<(), ChainError> {
		let entry = self.deltas.entry(asset_id).or_insert(0);
		*entry = entry
			.checked_add(amount)
			.ok_or(obol_primitives::ArithmeticError::AdditionOverflow)?;
		Ok(())
	}

	fn add_vote(&mut self, vote_id: DelegateVoteId, amount: ShareAmount) {
		if vote_id.is_none() {
			return
		}
		let entry = self.net_votes.entry(vote_id.delegate()).or_insert((0, 0));
		if vote_id.is_for() {
			entry.0 += amount;
		} else {
			entry.1 += amount;
		}
	}

	fn evaluate_operation(&mut self, op: &Operation) -> Result<(), ChainError> {
		match op {
			Operation::Withdraw { balance_id, amount, claim_input } =>
				self.evaluate_withdraw(balance_id, *amount, claim_input),
			Operation::Deposit { amount, condition } => self.evaluate_deposit(*amount, condition),
			Operation::RegisterAccount { name, owner_key, active_key, as_delegate } =>
				self.evaluate_register_account(name, owner_key, active_key, *as_delegate),
			Operation::UpdateAccount { account_id, active_key } =>
				self.evaluate_update_account(*account_id, active_key.as_ref()),
			Operation::CreateAsset {
				symbol,
				name,
				description,
				issuer,
				precision,
				maximum_supply,
			} => self.evaluate_create_asset(
				symbol,
				name,
				description,
				*issuer,
				*precision,
				*maximum_supply,
			),
			Operation::UpdateAsset { asset_id, description, issuer } =>
				self.evaluate_update_asset(*asset_id, description.as_ref(), *issuer),
			Operation::IssueAsset { amount } => self.evaluate_issue_asset(*amount),
			Operation::Bid { amount, index } => self.evaluate_order(OrderKind::Bid, *amount, index),
			Operation::Ask { amount, index } => self.evaluate_order(OrderKind::Ask, *amount, index),
			Operation::Short { amount, index, limit } =>
				self.evaluate_short(*amount, index, *limit),
			Operation::Cover { amount, index } => self.evaluate_cover(*amount, index),
			Operation::PublishFeed { delegate, asset_id, price } =>
				self.evaluate_publish_feed(*delegate, *asset_id, price),
		}
	}

	fn evaluate_withdraw(
		&mut self,
		balance_id: &Address,
		amount: ShareAmount,
		claim_input: &[u8],
	) -> Result<(), ChainError> {
		let mut record =
			self.pending.get_balance(balance_id)?.ok_or(ChainError::InsufficientFunds)?;
		if amount <= 0 || amount > record.balance {
			return Err(ChainError::InsufficientFunds)
		}

		match record.condition.condition.clone() {
			WithdrawCondition::Signature { owner } => self.require_signature(owner),
			WithdrawCondition::MultiSig { required, owners } => {
				let valid = owners.iter().filter(|owner| self.check_signature(owner)).count();
				if valid < required as usize {
					return Err(ChainError::MissingRequiredSignature)
				}
			},
			WithdrawCondition::Password { payor, payee, password_hash } => {
				let mut count = usize::from(self.check_signature(&payor)) +
					usize::from(self.check_signature(&payee));
				if count < 2 && !claim_input.is_empty() {
					count += usize::from(ripemd160(claim_input) == password_hash);
				}
				if count < 2 {
					return Err(ChainError::MissingRequiredSignature)
				}
			},
			WithdrawCondition::Option { optionor, optionee, strike_price, expiration } => {
				if self.now > expiration {
					self.require_signature(optionor);
				} else {
					// Exercising early: the optionee takes the balance and
					// must pay the optionor the strike value under the
					// transaction's vote.
					self.require_signature(optionee);
					let pay = AssetAmount::new(amount, record.asset_id())
						.checked_mul_price(&strike_price)?;
					let pay_to = BalanceCondition::signature(
						optionor,
						pay.asset_id,
						self.vote_id,
					)
					.balance_id();
					*self.required_deposits.entry(pay_to).or_insert(0) += pay.amount;
				}
			},
		}

		record.balance -= amount;
		record.last_update = self.now;
		self.add_delta(record.asset_id(), amount)?;
		if record.asset_id() == NATIVE_ASSET_ID {
			self.add_vote(record.condition.vote_id, -amount);
		}
		self.pending
			.put_record(Family::Balances, BalanceRecord::key(balance_id), &record);
		Ok(())
	}

	fn evaluate_deposit(
		&mut self,
		amount: ShareAmount,
		condition: &BalanceCondition,
	) -> Result<(), ChainError> {
		if amount <= 0 {
			return Err(ChainError::InsufficientFunds)
		}
		if !condition.vote_id.is_none() {
			let delegate = self
				.pending
				.get_account(condition.vote_id.delegate())?
				.ok_or(ChainError::UnknownAccount)?;
			if !delegate.is_delegate() {
				return Err(ChainError::UnknownAccount)
			}
		}

		let balance_id = condition.balance_id();
		let mut record = self
			.pending
			.get_balance(&balance_id)?
			.unwrap_or_else(|| BalanceRecord::new(condition.clone(), self.now));
		record.balance =
			record.balance.checked_add(amount).ok_or(ChainError::InsufficientFunds)?;
		record.last_update = self.now;
		record.deposit_date = self.now;

		self.add_delta(condition.asset_id, -amount)?;
		*self.provided_deposits.entry(balance_id).or_insert(0) += amount;
		if condition.asset_id == NATIVE_ASSET_ID {
			self.add_vote(condition.vote_id, amount);
		}
		self.pending.put_record(Family::Balances, BalanceRecord::key(&balance_id), &record);
		Ok(())
	}

	fn evaluate_register_account(
		&mut self,
		name: &str,
		owner_key: &obol_codec::PublicKey,
		active_key: &obol_codec::PublicKey,
		as_delegate: bool,
	) -> Result<(), ChainError> {
		if !AccountRecord::is_valid_name(name) {
			return Err(ChainError::MalformedEncoding)
		}
		if let Some(existing) = self.pending.get_account_by_name(name)? {
			// Names become reclaimable one year after their last update.
			if self.now.secs_since(existing.last_update) <
				obol_primitives::config::ONE_YEAR_SECS
			{
				return Err(ChainError::NameAlreadyRegistered)
			}
		}

		let id = self.pending.next_account_id()?;
		let record = AccountRecord {
			id,
			name: name.to_string(),
			owner_key: *owner_key,
			active_key: *active_key,
			registration_date: self.now,
			last_update: self.now,
			delegate: as_delegate.then(DelegateStats::default),
		};
		if as_delegate {
			self.extra_required_fee += self.config.delegate_registration_fee;
			let mut delegates = self.pending.delegate_ids()?;
			delegates.push(id);
			self.pending.put_record(Family::Meta, META_DELEGATES.to_vec(), &delegates);
		}

		self.pending.put_record(Family::Accounts, AccountRecord::key(id), &record);
		self.pending
			.put_record(Family::AccountIndexByName, AccountRecord::name_key(name), &id);
		self.pending.put_record(
			Family::AccountIndexByKey,
			obol_codec::key_address(owner_key).0.to_vec(),
			&id,
		);
		self.pending.put_record(
			Family::AccountIndexByKey,
			obol_codec::key_address(active_key).0.to_vec(),
			&id,
		);
		Ok(())
	}

	fn evaluate_update_account(
		&mut self,
		account_id: AccountId,
		active_key: Option<&obol_codec::PublicKey>,
	) -> Result<(), ChainError> {
		let mut record =
			self.pending.get_account(account_id)?.ok_or(ChainError::UnknownAccount)?;

		match active_key {
			Some(new_key) if *new_key != record.active_key => {
				// Rotating the active key needs the owner key.
				self.require_signature(obol_codec::key_address(&record.owner_key));
				record.active_key = *new_key;
				self.pending.put_record(
					Family::AccountIndexByKey,
					obol_codec::key_address(new_key).0.to_vec(),
					&account_id,
				);
			},
			_ => self.require_signature(obol_codec::key_address(&record.active_key)),
		}

		record.last_update = self.now;
		self.pending.put_record(Family::Accounts, AccountRecord::key(account_id), &record);
		Ok(())
	}

	fn evaluate_create_asset(
		&mut self,
		symbol: &str,
		name: &str,
		description: &str,
		issuer: AccountId,
		precision: u64,
		maximum_supply: ShareAmount,
	) -> Result<(), ChainError> {
		if !(MIN_SYMBOL_LEN..=MAX_SYMBOL_LEN).contains(&symbol.len()) ||
			!symbol.chars().all(|c| c.is_ascii_uppercase())
		{
			return Err(ChainError::MalformedEncoding)
		}
		if maximum_supply <= 0 || precision == 0 {
			return Err(ChainError::MalformedEncoding)
		}
		if self.pending.asset_id_by_symbol(symbol)?.is_some() {
			return Err(ChainError::AssetAlreadyRegistered)
		}
		// Market-issued assets have no issuer; supply only moves through
		// short/cover execution, so no signature guards creation.
		if issuer != MARKET_ISSUED {
			let issuer_record =
				self.pending.get_account(issuer)?.ok_or(ChainError::UnknownAccount)?;
			self.require_signature(obol_codec::key_address(&issuer_record.active_key));
		}

		// Short symbols are scarce: the fee scales with how much of the
		// namespace the symbol takes.
		let scale = (MAX_SYMBOL_LEN + 1 - symbol.len()) as ShareAmount;
		self.extra_required_fee += self.config.asset_registration_fee * scale;

		let id = self.pending.next_asset_id()?;
		let record = AssetRecord {
			id,
			symbol: symbol.to_string(),
			name: name.to_string(),
			description: description.to_string(),
			issuer,
			precision,
			registration_date: self.now,
			last_update: self.now,
			current_supply: 0,
			maximum_supply,
			collected_fees: 0,
		};
		self.pending.put_record(Family::Assets, AssetRecord::key(id), &record);
		self.pending
			.put_record(Family::AssetIndexBySymbol, AssetRecord::symbol_key(symbol), &id);
		Ok(())
	}

	fn evaluate_update_asset(
		&mut self,
		asset_id: AssetId,
		description: Option<&String>,
		issuer: Option<AccountId>,
	) -> Result<(), ChainError> {
		let mut record = self.pending.get_asset(asset_id)?.ok_or(ChainError::UnknownAsset)?;
		let current_issuer =
			self.pending.get_account(record.issuer)?.ok_or(ChainError::UnknownAccount)?;
		self.require_signature(obol_codec::key_address(&current_issuer.active_key));

		if let Some(new_issuer) = issuer {
			if new_issuer != record.issuer {
				let new_issuer_record =
					self.pending.get_account(new_issuer)?.ok_or(ChainError::UnknownAccount)?;
				self.require_signature(obol_codec::key_address(&new_issuer_record.active_key));
				record.issuer = new_issuer;
			}
		}
		if let Some(description) = description {
			record.description = description.clone();
		}
		record.last_update = self.now;
		self.pending.put_record(Family::Assets, AssetRecord::key(asset_id), &record);
		Ok(())
	}

	fn evaluate_issue_asset(&mut self, amount: AssetAmount) -> Result<(), ChainError> {
		let mut record =
			self.pending.get_asset(amount.asset_id)?.ok_or(ChainError::UnknownAsset)?;
		let issuer =
			self.pending.get_account(record.issuer)?.ok_or(ChainError::UnknownAccount)?;
		self.require_signature(obol_codec::key_address(&issuer.active_key));

		if amount.amount <= 0 {
			return Err(ChainError::MalformedEncoding)
		}
		if record.available_shares() < amount.amount {
			return Err(ChainError::SupplyExceeded)
		}
		record.current_supply += amount.amount;
		self.add_delta(amount.asset_id, amount.amount)?;
		self.pending.put_record(Family::Assets, AssetRecord::key(amount.asset_id), &record);
		Ok(())
	}

	/// Bids and asks share one shape: positive amounts fund the order,
	/// negative amounts cancel back to the transaction's pool.
	fn evaluate_order(
		&mut self,
		kind: OrderKind,
		amount: ShareAmount,
		index: &MarketIndex,
	) -> Result<(), ChainError> {
		let pair = self.validated_pair(index)?;
		let funding_asset = match kind {
			OrderKind::Bid => pair.quote,
			OrderKind::Ask => pair.base,
			_ => return Err(ChainError::ProtocolViolation("not an order kind".into())),
		};
		self.mutate_order(kind, index, amount, funding_asset, None)?;

		// Depth is tracked in base units on both sides.
		let base_equivalent = match kind {
			OrderKind::Ask => amount,
			_ => AssetAmount::new(amount, funding_asset)
				.checked_mul_price(&index.price)?
				.amount,
		};
		match kind {
			OrderKind::Bid => self.adjust_depth(pair, base_equivalent, 0)?,
			OrderKind::Ask => self.adjust_depth(pair, 0, base_equivalent)?,
			_ => {},
		}
		Ok(())
	}

	fn evaluate_short(
		&mut self,
		amount: ShareAmount,
		index: &MarketIndex,
		limit: Option<Price>,
	) -> Result<(), ChainError> {
		let pair = self.validated_pair(index)?;
		if pair.base != NATIVE_ASSET_ID {
			return Err(ChainError::ProtocolViolation("short collateral must be native".into()))
		}
		let quote = self.pending.get_asset(pair.quote)?.ok_or(ChainError::UnknownAsset)?;
		if !quote.is_market_issued() {
			return Err(ChainError::ProtocolViolation(
				"shorts require a market-issued quote asset".into(),
			))
		}
		self.mutate_order(OrderKind::Short, index, amount, NATIVE_ASSET_ID, limit)?;
		self.adjust_depth(pair, amount, 0)
	}

	/// Insert/top-up (`amount > 0`) or cancel (`amount < 0`) an order
	/// record, moving funds between the order and the transaction pool.
	fn mutate_order(
		&mut self,
		kind: OrderKind,
		index: &MarketIndex,
		amount: ShareAmount,
		funding_asset: AssetId,
		limit: Option<Price>,
	) -> Result<(), ChainError> {
		if amount == 0 {
			return Err(ChainError::InvalidCancel)
		}
		let family = order_family(kind);
		let key = index.key();
		let mut record = self
			.pending
			.get_order(kind, index)?
			.unwrap_or(OrderRecord { balance: 0, limit: None, last_update: self.now });

		if amount < 0 {
			// Cancels need the order owner, and cannot take more than the
			// order holds.
			self.require_signature(index.owner);
			if record.balance < -amount {
				return Err(ChainError::InvalidCancel)
			}
		}
		record.balance = record
			.balance
			.checked_add(amount)
			.ok_or(obol_primitives::ArithmeticError::AdditionOverflow)?;
		record.last_update = self.now;
		if limit.is_some() {
			record.limit = limit;
		}
		self.add_delta(funding_asset, -amount)?;

		if record.balance == 0 {
			self.pending.delete(family, key);
		} else {
			self.pending.put_record(family, key, &record);
		}
		Ok(())
	}

	fn evaluate_cover(
		&mut self,
		amount: ShareAmount,
		index: &MarketIndex,
	) -> Result<(), ChainError> {
		let pair = self.validated_pair(index)?;
		let mut cover =
			self.pending.get_collateral(index)?.ok_or(ChainError::InvalidCancel)?;
		self.require_signature(index.owner);
		if amount <= 0 || amount > cover.debt {
			return Err(ChainError::InvalidCancel)
		}

		// Paying down debt burns market-issued supply.
		let mut quote = self.pending.get_asset(pair.quote)?.ok_or(ChainError::UnknownAsset)?;
		quote.current_supply -= amount;
		self.pending.put_record(Family::Assets, AssetRecord::key(pair.quote), &quote);
		self.add_delta(pair.quote, -amount)?;

		cover.debt -= amount;
		self.pending.delete(Family::Collateral, index.key());
		if cover.debt == 0 {
			// Position closed: collateral comes home.
			self.add_delta(NATIVE_ASSET_ID, cover.collateral)?;
			self.adjust_depth(pair, 0, -cover.collateral)?;
		} else {
			// The call price moves with the debt.
			let call_price = AssetAmount::new(cover.debt, pair.quote)
				.checked_div(AssetAmount::new(cover.collateral * 2 / 3, pair.base))?;
			let new_index = MarketIndex { price: call_price, owner: index.owner };
			self.pending.put_record(Family::Collateral, new_index.key(), &cover);
		}
		Ok(())
	}

	fn evaluate_publish_feed(
		&mut self,
		delegate: AccountId,
		asset_id: AssetId,
		price: &Price,
	) -> Result<(), ChainError> {
		let account = self.pending.get_account(delegate)?.ok_or(ChainError::UnknownAccount)?;
		if !account.is_delegate() {
			return Err(ChainError::UnknownAccount)
		}
		self.require_signature(obol_codec::key_address(&account.active_key));

		if self.pending.get_asset(asset_id)?.is_none() {
			return Err(ChainError::UnknownAsset)
		}
		if price.quote_asset_id != asset_id || price.base_asset_id != NATIVE_ASSET_ID {
			return Err(ChainError::MalformedEncoding)
		}

		self.pending.put_record(
			Family::Feeds,
			FeedRecord::key(asset_id, delegate),
			&FeedRecord { price: *price, last_update: self.now },
		);
		Ok(())
	}

	fn validated_pair(&self, index: &MarketIndex) -> Result<MarketPair, ChainError> {
		if index.price.ratio == 0 {
			return Err(ChainError::MalformedEncoding)
		}
		MarketPair::new(index.price.quote_asset_id, index.price.base_asset_id)
			.ok_or(ChainError::MalformedEncoding)
	}

	fn adjust_depth(
		&mut self,
		pair: MarketPair,
		bid_delta: ShareAmount,
		ask_delta: ShareAmount,
	) -> Result<(), ChainError> {
		let mut status = self
			.pending
			.get_market_status(&pair)?
			.unwrap_or_else(|| MarketStatus::new(pair));
		status.bid_depth += bid_delta;
		status.ask_depth += ask_delta;
		self.pending
			.put_record(Family::MarketStatus, MarketStatus::key(&pair), &status);
		Ok(())
	}

	/// Fees, required signatures and deposits, vote caps.
	fn post_evaluate(&mut self, encoded_size: usize) -> Result<ShareAmount, ChainError> {
		for (asset_id, delta) in self.deltas.clone() {
			if delta < 0 {
				return Err(ChainError::InsufficientFunds)
			}
			if delta > 0 {
				// The remainder of every asset is collected as fees.
				let mut asset =
					self.pending.get_asset(asset_id)?.ok_or(ChainError::UnknownAsset)?;
				asset.collected_fees += delta;
				self.pending.put_record(Family::Assets, AssetRecord::key(asset_id), &asset);
			}
		}

		let fee = self.deltas.get(&NATIVE_ASSET_ID).copied().unwrap_or(0);
		if fee < self.config.min_fee(encoded_size) + self.extra_required_fee {
			return Err(ChainError::InsufficientFee)
		}

		for required in &self.required_sigs {
			if !self.signed.contains(required) {
				return Err(ChainError::MissingRequiredSignature)
			}
		}
		for (balance_id, required) in &self.required_deposits {
			if self.provided_deposits.get(balance_id).copied().unwrap_or(0) < *required {
				return Err(ChainError::MissingRequiredDeposit)
			}
		}

		self.update_delegate_votes()?;
		Ok(fee)
	}

	fn update_delegate_votes(&mut self) -> Result<(), ChainError> {
		if self.net_votes.is_empty() {
			return Ok(())
		}
		let native = self
			.pending
			.get_asset(NATIVE_ASSET_ID)?
			.ok_or(ChainError::UnknownAsset)?;
		let max_votes = 2 * (native.current_supply / self.config.num_delegates as ShareAmount);

		for (delegate_id, (for_delta, against_delta)) in self.net_votes.clone() {
			let mut account =
				self.pending.get_account(delegate_id)?.ok_or(ChainError::UnknownAccount)?;
			let stats = account.delegate.as_mut().ok_or(ChainError::UnknownAccount)?;
			stats.votes_for += for_delta;
			stats.votes_against += against_delta;
			if stats.votes_for < 0 || stats.votes_against < 0 {
				return Err(ChainError::ProtocolViolation("negative vote tally".into()))
			}
			if stats.votes_for > max_votes || stats.votes_against > max_votes {
				return Err(ChainError::DelegateVoteLimit)
			}
			self.pending
				.put_record(Family::Accounts, AccountRecord::key(delegate_id), &account);
		}
		Ok(())
	}
}
