//! End-to-end ledger scenarios: a real store on disk, signed transactions,
//! produced blocks, and the conservation invariants checked after every
//! block.

use std::collections::BTreeMap;

use obol_codec::{id_hash, key_address, CanonicalDecode, PublicKey, SecretKey, SECP256K1};
use obol_ledger::{
	records::{
		AssetRecord, BalanceCondition, BalanceRecord, Block, BlockHeader, CollateralRecord,
		MarketIndex, Operation, OrderRecord, SignedBlockHeader, SignedTransaction, Transaction,
	},
	BlockDisposition, BlockOutcome, ChainDatabase, ChainRead, ChainReadExt, Family,
	GenesisConfig,
};
use obol_primitives::{
	AccountId, Address, AssetId, ChainConfig, DelegateVoteId, Price, SecretHash, ShareAmount,
	Timestamp, NATIVE_ASSET_ID, PRECISION, PRICE_ONE,
};

const INTERVAL: u32 = 10;
const GENESIS_TIME: u32 = 1_000_000_000;
const NUM_DELEGATES: u32 = 5;

fn secret(seed: u8) -> SecretKey {
	SecretKey::from_slice(&[seed; 32]).unwrap()
}

fn public(seed: u8) -> PublicKey {
	secret(seed).public_key(SECP256K1)
}

fn address(seed: u8) -> Address {
	key_address(&public(seed))
}

fn test_config() -> ChainConfig {
	ChainConfig {
		fee_rate: 0,
		block_interval_secs: INTERVAL,
		num_delegates: NUM_DELEGATES,
		block_reward: 0,
		delegate_registration_fee: 100,
		asset_registration_fee: 10,
		margin_call_fee_permille: 50,
		market_depth_requirement: 0,
		max_fork_depth: 100,
		max_transaction_ttl_secs: 3_600,
		..Default::default()
	}
}

struct TestChain {
	_dir: tempfile::TempDir,
	db: ChainDatabase,
	/// Delegate account id -> signing key seed.
	delegate_seeds: BTreeMap<AccountId, u8>,
}

/// Deterministic production secret, recomputable from (seed, number) so
/// forks reveal correctly.
fn production_secret(seed: u8, number: u32) -> SecretHash {
	let mut bytes = vec![seed];
	bytes.extend_from_slice(&number.to_le_bytes());
	SecretHash(id_hash(&bytes))
}

impl TestChain {
	/// Five delegates (key seeds 1..=5), plus funded user accounts:
	/// `(name, key seed, native amount)`.
	fn new(funded: &[(&str, u8, ShareAmount)]) -> TestChain {
		Self::with_config(test_config(), funded)
	}

	fn with_config(chain: ChainConfig, funded: &[(&str, u8, ShareAmount)]) -> TestChain {
		let mut accounts = Vec::new();
		let mut delegate_seeds = BTreeMap::new();
		for i in 0..NUM_DELEGATES {
			let seed = (i + 1) as u8;
			accounts.push(obol_ledger::genesis::GenesisAccount {
				name: format!("init{i}"),
				owner_key: hex::encode(public(seed).serialize()),
				is_delegate: true,
			});
			// Genesis account ids start at 1.
			delegate_seeds.insert(AccountId(i + 1), seed);
		}
		let mut balances = Vec::new();
		for (name, seed, amount) in funded {
			accounts.push(obol_ledger::genesis::GenesisAccount {
				name: name.to_string(),
				owner_key: hex::encode(public(*seed).serialize()),
				is_delegate: false,
			});
			balances.push(obol_ledger::genesis::GenesisBalance {
				account: name.to_string(),
				amount: *amount,
			});
		}
		let genesis = GenesisConfig {
			timestamp: Timestamp(GENESIS_TIME),
			chain,
			native_symbol: "XTS".into(),
			native_name: "obol native".into(),
			native_precision: PRECISION as u64,
			native_maximum_supply: i64::MAX / 4,
			accounts,
			balances,
		};
		let dir = tempfile::tempdir().unwrap();
		let db = ChainDatabase::open(dir.path(), &genesis).unwrap();
		TestChain { _dir: dir, db, delegate_seeds }
	}

	fn next_slot(&self) -> Timestamp {
		let head = self.db.head().unwrap();
		Timestamp((head.timestamp.0 / INTERVAL + 1) * INTERVAL)
	}

	fn build_block_at(&self, timestamp: Timestamp, txs: Vec<SignedTransaction>) -> Block {
		let head = self.db.head().unwrap();
		let active = self.db.active_delegates().unwrap();
		let delegate = self.db.slot_delegate(timestamp, &active).unwrap();
		let seed = self.delegate_seeds[&delegate];
		let stats = self
			.db
			.state()
			.get_account(delegate)
			.unwrap()
			.unwrap()
			.delegate
			.unwrap();
		let previous_secret = match (stats.last_block_produced, stats.next_secret_hash) {
			(Some(number), Some(_)) => production_secret(seed, number),
			_ => SecretHash([0; 20]),
		};
		let number = head.number + 1;
		let header = BlockHeader {
			previous: head.id,
			block_number: number,
			timestamp,
			transaction_digest: Block::transaction_digest(&txs),
			next_secret_hash: SecretHash(id_hash(&production_secret(seed, number).0)),
			previous_secret,
		};
		Block {
			signed_header: SignedBlockHeader::sign(header, &secret(seed)),
			transactions: txs,
		}
	}

	/// Produce and apply a block at the next slot; panics unless applied.
	fn advance(&mut self, txs: Vec<SignedTransaction>) -> BlockOutcome {
		let block = self.build_block_at(self.next_slot(), txs);
		match self.db.submit_block(block).unwrap() {
			BlockDisposition::Applied(outcome) => {
				self.check_invariants();
				outcome
			},
			other => panic!("block not applied: {other:?}"),
		}
	}

	fn now(&self) -> Timestamp {
		self.db.head().unwrap().timestamp
	}

	fn sign(&self, operations: Vec<Operation>, signer_seeds: &[u8]) -> SignedTransaction {
		let mut tx = SignedTransaction {
			transaction: Transaction {
				expiration: self.now().saturating_add_secs(600),
				vote_id: DelegateVoteId(0),
				operations,
			},
			signatures: vec![],
		};
		for seed in signer_seeds {
			tx.sign(&secret(*seed));
		}
		tx
	}

	fn balance_id(&self, seed: u8, asset: AssetId, vote: i32) -> Address {
		BalanceCondition::signature(address(seed), asset, DelegateVoteId(vote)).balance_id()
	}

	fn balance_of(&self, seed: u8, asset: AssetId, vote: i32) -> ShareAmount {
		self.db
			.state()
			.get_balance(&self.balance_id(seed, asset, vote))
			.unwrap()
			.map(|record| record.balance)
			.unwrap_or(0)
	}

	fn withdraw_native(&self, seed: u8, amount: ShareAmount) -> Operation {
		Operation::Withdraw {
			balance_id: self.balance_id(seed, NATIVE_ASSET_ID, 0),
			amount,
			claim_input: vec![],
		}
	}

	fn deposit_native(&self, seed: u8, amount: ShareAmount) -> Operation {
		Operation::Deposit {
			amount,
			condition: BalanceCondition::signature(
				address(seed),
				NATIVE_ASSET_ID,
				DelegateVoteId(0),
			),
		}
	}

	fn transfer_ops(
		&self,
		from_seed: u8,
		to_seed: u8,
		amount: ShareAmount,
		fee: ShareAmount,
	) -> Vec<Operation> {
		vec![
			self.withdraw_native(from_seed, amount + fee),
			self.deposit_native(to_seed, amount),
		]
	}

	/// Conservation: for every asset, balances + order balances +
	/// collateral + fee pool + delegate pay must equal the recorded supply.
	fn check_invariants(&self) {
		let state = self.db.state();
		let mut holdings: BTreeMap<AssetId, ShareAmount> = BTreeMap::new();

		for (_, value) in scan(state, Family::Balances) {
			let record = BalanceRecord::from_bytes(&value).unwrap();
			assert!(record.balance >= 0);
			*holdings.entry(record.asset_id()).or_insert(0) += record.balance;
		}
		for family in [Family::Bids, Family::Asks, Family::Shorts] {
			for (key, value) in scan(state, family) {
				let index = MarketIndex::from_key(&key).unwrap();
				let record = OrderRecord::from_bytes(&value).unwrap();
				assert!(record.balance > 0, "zero-balance order survived commit");
				let funding = match family {
					Family::Bids => index.price.quote_asset_id,
					Family::Asks => index.price.base_asset_id,
					_ => NATIVE_ASSET_ID,
				};
				*holdings.entry(funding).or_insert(0) += record.balance;
			}
		}
		for (_, value) in scan(state, Family::Collateral) {
			let record = CollateralRecord::from_bytes(&value).unwrap();
			assert!(record.debt > 0, "zero-debt cover survived commit");
			assert!(record.collateral >= 0);
			*holdings.entry(NATIVE_ASSET_ID).or_insert(0) += record.collateral;
		}
		for id in self.db.state().delegate_ids().unwrap() {
			let account = state.get_account(id).unwrap().unwrap();
			let stats = account.delegate.unwrap();
			*holdings.entry(NATIVE_ASSET_ID).or_insert(0) += stats.pay_balance;
			// Invariant: vote tallies stay within the cap.
			let native = state.get_asset(NATIVE_ASSET_ID).unwrap().unwrap();
			let cap = 2 * (native.current_supply / NUM_DELEGATES as ShareAmount);
			assert!(stats.votes_for <= cap && stats.votes_against <= cap);
		}

		for (_, value) in scan(state, Family::Assets) {
			let asset = AssetRecord::from_bytes(&value).unwrap();
			let held = holdings.get(&asset.id).copied().unwrap_or(0);
			assert_eq!(
				held + asset.collected_fees,
				asset.current_supply,
				"supply mismatch for asset {:?}",
				asset.id
			);
			assert!(asset.current_supply <= asset.maximum_supply);
		}
	}
}

fn scan(
	state: &obol_ledger::ChainState,
	family: Family,
) -> Vec<(Vec<u8>, Vec<u8>)> {
	let mut out = Vec::new();
	let mut probe = Vec::new();
	while let Some((key, value)) = state.lower_bound_raw(family, &probe).unwrap() {
		probe = key.clone();
		probe.push(0);
		out.push((key, value));
	}
	out
}

// ---- scenario 1: genesis + simple transfer ----

#[test]
fn genesis_and_simple_transfer() {
	let mut chain = TestChain::new(&[("alice", 10, 1_000_000)]);
	assert_eq!(chain.balance_of(10, NATIVE_ASSET_ID, 0), 1_000_000);

	let tx = chain.sign(chain.transfer_ops(10, 11, 500, 10), &[10]);
	let outcome = chain.advance(vec![tx]);
	assert!(outcome.tx_outcomes[0].error.is_none());
	assert_eq!(outcome.tx_outcomes[0].fee, 10);

	assert_eq!(chain.balance_of(10, NATIVE_ASSET_ID, 0), 999_490);
	assert_eq!(chain.balance_of(11, NATIVE_ASSET_ID, 0), 500);
	let native = chain.db.state().get_asset(NATIVE_ASSET_ID).unwrap().unwrap();
	assert_eq!(native.collected_fees, 10);
	assert_eq!(native.current_supply, 1_000_000);
}

// ---- scenario 2: double spend inside one block ----

#[test]
fn double_spend_in_one_block() {
	let mut chain = TestChain::new(&[("alice", 10, 1_000_000)]);

	let spend_all = chain.sign(chain.transfer_ops(10, 11, 999_990, 10), &[10]);
	let mut second = SignedTransaction {
		transaction: Transaction {
			// Different expiration so the id differs from the first spend.
			expiration: chain.now().saturating_add_secs(601),
			vote_id: DelegateVoteId(0),
			operations: chain.transfer_ops(10, 12, 999_990, 10),
		},
		signatures: vec![],
	};
	second.sign(&secret(10));

	let outcome = chain.advance(vec![spend_all, second]);
	assert!(outcome.tx_outcomes[0].error.is_none());
	assert_eq!(
		outcome.tx_outcomes[1].error.as_deref(),
		Some("insufficient_funds"),
	);
	assert_eq!(chain.balance_of(10, NATIVE_ASSET_ID, 0), 0);
	assert_eq!(chain.balance_of(11, NATIVE_ASSET_ID, 0), 999_990);
	assert_eq!(chain.balance_of(12, NATIVE_ASSET_ID, 0), 0);
}

// ---- scenarios 3 + 4: short/cover round trip and the margin-call fee ----

const USD: AssetId = AssetId(1);

fn usd_price(milli: u128) -> Price {
	Price::new(milli * (PRICE_ONE / 1000), USD, NATIVE_ASSET_ID)
}

fn feed_txs(chain: &TestChain, milli: u128) -> Vec<SignedTransaction> {
	(0..3u8)
		.map(|i| {
			chain.sign(
				vec![Operation::PublishFeed {
					delegate: AccountId(i as u32 + 1),
					asset_id: USD,
					price: usd_price(milli),
				}],
				&[i + 1],
			)
		})
		.collect()
}

/// Block 1 registers the market-issued USD; block 2 publishes feeds at
/// 1.000, shorts 100 XTS (alice) against an ask of 50 XTS (bob), leaving a
/// cover of 100 XTS collateral against 50 USD debt and 50 XTS of the short
/// still on the book.
fn setup_margin_market() -> (TestChain, MarketIndex) {
	let funding = 1_000 * PRECISION;
	let mut chain = TestChain::new(&[("alice", 10, funding), ("bob", 11, funding)]);

	let create = chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(10, NATIVE_ASSET_ID, 0),
				amount: 10 * 6, // symbol length 3 of 8: fee is 10 * (8 + 1 - 3)
				claim_input: vec![],
			},
			Operation::CreateAsset {
				symbol: "USD".into(),
				name: "usd".into(),
				description: String::new(),
				issuer: obol_primitives::MARKET_ISSUED,
				precision: PRECISION as u64,
				maximum_supply: i64::MAX / 4,
			},
		],
		&[10],
	);
	let outcome = chain.advance(vec![create]);
	assert!(outcome.tx_outcomes[0].error.is_none());
	assert!(chain.db.state().get_asset(USD).unwrap().unwrap().is_market_issued());

	let mut txs = feed_txs(&chain, 1_000);
	let short_index = MarketIndex { price: usd_price(1_000), owner: address(10) };
	txs.push(chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(10, NATIVE_ASSET_ID, 0),
				amount: 100 * PRECISION,
				claim_input: vec![],
			},
			Operation::Short { amount: 100 * PRECISION, index: short_index, limit: None },
		],
		&[10],
	));
	let ask_index = MarketIndex { price: usd_price(1_000), owner: address(11) };
	txs.push(chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(11, NATIVE_ASSET_ID, 0),
				amount: 50 * PRECISION,
				claim_input: vec![],
			},
			Operation::Ask { amount: 50 * PRECISION, index: ask_index },
		],
		&[11],
	));
	let outcome = chain.advance(txs);
	for tx in &outcome.tx_outcomes {
		assert!(tx.error.is_none(), "{:?}", tx);
	}
	// The short and ask matched at the center price.
	assert_eq!(outcome.market_transactions.len(), 1);
	let m = &outcome.market_transactions[0];
	assert_eq!(m.ask_received.amount, 50 * PRECISION); // 50 USD to bob
	assert_eq!(m.short_collateral.map(|c| c.amount), Some(50 * PRECISION));

	(chain, short_index)
}

#[test]
fn short_cover_round_trip_with_margin_call_fee() {
	let (mut chain, short_index) = setup_margin_market();

	// Bob holds the freshly issued USD; a cover exists for alice.
	assert_eq!(chain.balance_of(11, USD, 0), 50 * PRECISION);
	assert_eq!(chain.db.state().get_asset(USD).unwrap().unwrap().current_supply, 50 * PRECISION);
	let covers = scan(chain.db.state(), Family::Collateral);
	assert_eq!(covers.len(), 1);
	let cover = CollateralRecord::from_bytes(&covers[0].1).unwrap();
	assert_eq!(cover.collateral, 100 * PRECISION);
	assert_eq!(cover.debt, 50 * PRECISION);
	// Half the short offer remains on the book.
	assert_eq!(
		chain
			.db
			.state()
			.get_order(obol_ledger::records::OrderKind::Short, &short_index)
			.unwrap()
			.unwrap()
			.balance,
		50 * PRECISION
	);

	// The feed drops to 0.750: the cover's call price (≈0.75) is reached
	// by bob's bid at 0.800, which buys the whole debt.
	let mut txs = feed_txs(&chain, 750);
	let bid_index = MarketIndex { price: usd_price(800), owner: address(11) };
	txs.push(chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(11, USD, 0),
				amount: 50 * PRECISION,
				claim_input: vec![],
			},
			Operation::Bid { amount: 50 * PRECISION, index: bid_index },
		],
		&[11],
	));
	let before_fees = chain
		.db
		.state()
		.get_asset(NATIVE_ASSET_ID)
		.unwrap()
		.unwrap()
		.collected_fees;
	let outcome = chain.advance(txs);
	for tx in &outcome.tx_outcomes {
		assert!(tx.error.is_none(), "{:?}", tx);
	}
	assert_eq!(outcome.market_transactions.len(), 1);
	let m = &outcome.market_transactions[0];
	assert_eq!(m.ask_received.amount, 50 * PRECISION); // full debt repaid
	// 50 USD at 0.8 buys 62.5 XTS of the collateral.
	assert_eq!(m.bid_received.amount, 6_250_000);
	// Margin-call fee: exactly floor(remaining · 50/1000).
	let remaining = 100 * PRECISION - 6_250_000;
	let fee = remaining * 50 / 1000;
	assert_eq!(m.base_fees, fee);
	assert_eq!(m.returned_collateral, Some(remaining - fee));

	// The round trip destroyed the USD again and closed the cover.
	assert_eq!(chain.db.state().get_asset(USD).unwrap().unwrap().current_supply, 0);
	assert_eq!(chain.balance_of(11, USD, 0), 0);
	assert!(scan(chain.db.state(), Family::Collateral).is_empty());
	let native = chain.db.state().get_asset(NATIVE_ASSET_ID).unwrap().unwrap();
	assert_eq!(native.collected_fees, before_fees + fee);
}

// ---- boundary: depth requirement ----

#[test]
fn depth_requirement_boundary() {
	let run = |requirement: ShareAmount| -> BlockOutcome {
		let funding = 1_000 * PRECISION;
		let mut chain = TestChain::with_config(
			ChainConfig { market_depth_requirement: requirement, ..test_config() },
			&[("alice", 10, funding), ("bob", 11, funding)],
		);
		let create = chain.sign(
			vec![
				Operation::Withdraw {
					balance_id: chain.balance_id(10, NATIVE_ASSET_ID, 0),
					amount: 60,
					claim_input: vec![],
				},
				Operation::CreateAsset {
					symbol: "USD".into(),
					name: "usd".into(),
					description: String::new(),
					issuer: obol_primitives::MARKET_ISSUED,
					precision: PRECISION as u64,
					maximum_supply: i64::MAX / 4,
				},
			],
			&[10],
		);
		chain.advance(vec![create]);

		let mut txs = feed_txs(&chain, 1_000);
		txs.push(chain.sign(
			vec![
				Operation::Withdraw {
					balance_id: chain.balance_id(10, NATIVE_ASSET_ID, 0),
					amount: 100 * PRECISION,
					claim_input: vec![],
				},
				Operation::Short {
					amount: 100 * PRECISION,
					index: MarketIndex { price: usd_price(1_000), owner: address(10) },
					limit: None,
				},
			],
			&[10],
		));
		txs.push(chain.sign(
			vec![
				Operation::Withdraw {
					balance_id: chain.balance_id(11, NATIVE_ASSET_ID, 0),
					amount: 50 * PRECISION,
					claim_input: vec![],
				},
				Operation::Ask {
					amount: 50 * PRECISION,
					index: MarketIndex { price: usd_price(1_000), owner: address(11) },
				},
			],
			&[11],
		));
		chain.advance(txs)
	};

	// After the match: bid depth 50, ask depth 100 (in XTS shares).
	let exactly = run(50 * PRECISION);
	assert_eq!(exactly.market_transactions.len(), 1);
	assert!(exactly.market_outcomes.iter().all(|(_, r)| r.is_ok()));

	// One share unit more and the whole pair rolls back.
	let short = run(50 * PRECISION + 1);
	assert!(short.market_transactions.is_empty());
	assert_eq!(
		short.market_outcomes[0].1.as_ref().err().map(String::as_str),
		Some("insufficient_depth")
	);
}

// ---- short ↔ cover execution ----

#[test]
fn triggered_cover_absorbs_a_new_short() {
	let (mut chain, short_index) = setup_margin_market();
	let supply_before =
		chain.db.state().get_asset(USD).unwrap().unwrap().current_supply;

	// Alice cancels her leftover short so the fresh one is alone on the
	// book; a tiny ask at the center primes the ask side, and once it
	// fills the standing cover (call ≈ 0.75 ≤ center 1.0) becomes the
	// effective ask for the new short.
	let mut txs = Vec::new();
	txs.push(chain.sign(
		vec![
			Operation::Short { amount: -(50 * PRECISION), index: short_index, limit: None },
			chain.deposit_native(10, 50 * PRECISION),
		],
		&[10],
	));
	let short2 = MarketIndex { price: usd_price(1_000), owner: address(12) };
	txs.push(chain.sign(
		vec![
			chain.withdraw_native(10, 200 * PRECISION),
			Operation::Deposit {
				amount: 200 * PRECISION,
				condition: BalanceCondition::signature(
					address(12),
					NATIVE_ASSET_ID,
					DelegateVoteId(0),
				),
			},
		],
		&[10],
	));
	txs.push(chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(12, NATIVE_ASSET_ID, 0),
				amount: 200 * PRECISION,
				claim_input: vec![],
			},
			Operation::Short { amount: 200 * PRECISION, index: short2, limit: None },
		],
		&[12],
	));
	txs.push(chain.sign(
		vec![
			chain.withdraw_native(11, PRECISION),
			Operation::Ask {
				amount: PRECISION,
				index: MarketIndex { price: usd_price(1_000), owner: address(11) },
			},
		],
		&[11],
	));

	let outcome = chain.advance(txs);
	for tx in &outcome.tx_outcomes {
		assert!(tx.error.is_none(), "{:?}", tx);
	}
	// First the plain ask fills against the short, then the short takes
	// out the margin-called cover.
	assert_eq!(outcome.market_transactions.len(), 2);
	let cover_match = &outcome.market_transactions[1];
	assert_eq!(cover_match.ask_kind, obol_ledger::records::OrderKind::Cover);
	assert_eq!(cover_match.bid_kind, obol_ledger::records::OrderKind::Short);
	// The whole 50 USD debt was repurchased at the center price.
	assert_eq!(cover_match.ask_received.amount, 50 * PRECISION);
	assert_eq!(cover_match.ask_paid.amount, 50 * PRECISION);
	// The closed cover paid the margin-call fee on its remainder and the
	// rest went home to alice.
	let remaining = 50 * PRECISION;
	assert_eq!(cover_match.base_fees, remaining * 50 / 1000);
	assert_eq!(
		cover_match.returned_collateral,
		Some(remaining - remaining * 50 / 1000)
	);

	// Alice's cover died; the new short now backs two fresh cover records
	// (one per execution price level), and supply only grew by the small
	// ask fill.
	let covers = scan(chain.db.state(), Family::Collateral);
	assert_eq!(covers.len(), 2);
	let mut total_debt = 0;
	let mut total_collateral = 0;
	for (key, value) in &covers {
		assert_eq!(MarketIndex::from_key(key).unwrap().owner, address(12));
		let record = CollateralRecord::from_bytes(value).unwrap();
		total_debt += record.debt;
		total_collateral += record.collateral;
	}
	assert_eq!(total_debt, 51 * PRECISION);
	assert_eq!(total_collateral, 102 * PRECISION);
	let supply_after = chain.db.state().get_asset(USD).unwrap().unwrap().current_supply;
	assert_eq!(supply_after, supply_before + PRECISION);
}

#[test]
fn short_limit_price_blocks_execution() {
	let funding = 1_000 * PRECISION;
	let mut chain = TestChain::new(&[("alice", 10, funding), ("bob", 11, funding)]);
	let create = chain.sign(
		vec![
			chain.withdraw_native(10, 60),
			Operation::CreateAsset {
				symbol: "USD".into(),
				name: "usd".into(),
				description: String::new(),
				issuer: obol_primitives::MARKET_ISSUED,
				precision: PRECISION as u64,
				maximum_supply: i64::MAX / 4,
			},
		],
		&[10],
	);
	chain.advance(vec![create]);

	// The short's price limit (0.5) is below the center execution price
	// (1.0), so the engine must skip it: no match.
	let mut txs = feed_txs(&chain, 1_000);
	txs.push(chain.sign(
		vec![
			chain.withdraw_native(10, 100 * PRECISION),
			Operation::Short {
				amount: 100 * PRECISION,
				index: MarketIndex { price: usd_price(1_000), owner: address(10) },
				limit: Some(usd_price(500)),
			},
		],
		&[10],
	));
	txs.push(chain.sign(
		vec![
			chain.withdraw_native(11, 50 * PRECISION),
			Operation::Ask {
				amount: 50 * PRECISION,
				index: MarketIndex { price: usd_price(1_000), owner: address(11) },
			},
		],
		&[11],
	));
	let outcome = chain.advance(txs);
	assert!(outcome.market_transactions.is_empty());
	// Both orders stay on the book untouched.
	assert_eq!(scan(chain.db.state(), Family::Shorts).len(), 1);
	assert_eq!(scan(chain.db.state(), Family::Asks).len(), 1);
}

// ---- manual cover operation ----

#[test]
fn manual_cover_partial_then_full() {
	let (mut chain, _) = setup_margin_market();
	let covers = scan(chain.db.state(), Family::Collateral);
	let cover_index = MarketIndex::from_key(&covers[0].0).unwrap();

	// Alice buys 20 USD from bob off-book, then pays down 20 of her 50 debt.
	let buy = chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(11, USD, 0),
				amount: 20 * PRECISION,
				claim_input: vec![],
			},
			Operation::Deposit {
				amount: 20 * PRECISION,
				condition: BalanceCondition::signature(address(10), USD, DelegateVoteId(0)),
			},
		],
		&[11],
	);
	let partial = chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(10, USD, 0),
				amount: 20 * PRECISION,
				claim_input: vec![],
			},
			Operation::Cover { amount: 20 * PRECISION, index: cover_index },
		],
		&[10],
	);
	let outcome = chain.advance(vec![buy, partial]);
	for tx in &outcome.tx_outcomes {
		assert!(tx.error.is_none(), "{:?}", tx);
	}
	// Debt shrank, the record moved to a lower call price, supply burned.
	let covers = scan(chain.db.state(), Family::Collateral);
	assert_eq!(covers.len(), 1);
	let moved = CollateralRecord::from_bytes(&covers[0].1).unwrap();
	assert_eq!(moved.debt, 30 * PRECISION);
	assert_eq!(moved.collateral, 100 * PRECISION);
	let new_index = MarketIndex::from_key(&covers[0].0).unwrap();
	assert!(new_index.price < cover_index.price);
	assert_eq!(
		chain.db.state().get_asset(USD).unwrap().unwrap().current_supply,
		30 * PRECISION
	);

	// Covering the rest returns the collateral in full (no margin call, no
	// fee) and deletes the record.
	let buy_rest = chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(11, USD, 0),
				amount: 30 * PRECISION,
				claim_input: vec![],
			},
			Operation::Deposit {
				amount: 30 * PRECISION,
				condition: BalanceCondition::signature(address(10), USD, DelegateVoteId(0)),
			},
		],
		&[11],
	);
	let alice_native_before = chain.balance_of(10, NATIVE_ASSET_ID, 0);
	let full = chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(10, USD, 0),
				amount: 30 * PRECISION,
				claim_input: vec![],
			},
			Operation::Cover { amount: 30 * PRECISION, index: new_index },
			chain.deposit_native(10, 100 * PRECISION),
		],
		&[10],
	);
	let outcome = chain.advance(vec![buy_rest, full]);
	for tx in &outcome.tx_outcomes {
		assert!(tx.error.is_none(), "{:?}", tx);
	}
	assert!(scan(chain.db.state(), Family::Collateral).is_empty());
	assert_eq!(chain.db.state().get_asset(USD).unwrap().unwrap().current_supply, 0);
	assert_eq!(
		chain.balance_of(10, NATIVE_ASSET_ID, 0),
		alice_native_before + 100 * PRECISION
	);

	// Overpaying a dead position is an invalid cancel.
	let over = chain.sign(
		vec![Operation::Cover { amount: 1, index: new_index }],
		&[10],
	);
	let outcome = chain.advance(vec![over]);
	assert_eq!(outcome.tx_outcomes[0].error.as_deref(), Some("invalid_cancel"));
}

// ---- scenario 5: delegate vote cap ----

#[test]
fn delegate_vote_cap_rejected_in_block() {
	let mut chain = TestChain::new(&[("alice", 10, 1_000_000)]);
	// Cap is 2 * supply / num_delegates = 400_000.
	let over = chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(10, NATIVE_ASSET_ID, 0),
				amount: 500_000,
				claim_input: vec![],
			},
			Operation::Deposit {
				amount: 500_000,
				condition: BalanceCondition::signature(
					address(10),
					NATIVE_ASSET_ID,
					DelegateVoteId(1),
				),
			},
		],
		&[10],
	);
	let outcome = chain.advance(vec![over]);
	assert_eq!(
		outcome.tx_outcomes[0].error.as_deref(),
		Some("delegate_vote_limit")
	);

	// Under the cap the same deposit passes and moves the tally.
	let under = chain.sign(
		vec![
			Operation::Withdraw {
				balance_id: chain.balance_id(10, NATIVE_ASSET_ID, 0),
				amount: 300_000,
				claim_input: vec![],
			},
			Operation::Deposit {
				amount: 300_000,
				condition: BalanceCondition::signature(
					address(10),
					NATIVE_ASSET_ID,
					DelegateVoteId(1),
				),
			},
		],
		&[10],
	);
	let outcome = chain.advance(vec![under]);
	assert!(outcome.tx_outcomes[0].error.is_none());
	let stats = chain
		.db
		.state()
		.get_account(AccountId(1))
		.unwrap()
		.unwrap()
		.delegate
		.unwrap();
	assert_eq!(stats.votes_for, 300_000);
}

// ---- scenario 6: fork switch ----

#[test]
fn fork_switch_is_deterministic() {
	let build_chains = |apply_order_swapped: bool| {
		let mut chain = TestChain::new(&[("alice", 10, 1_000_000)]);
		let slot_a = chain.next_slot();
		let slot_b = Timestamp(slot_a.0 + INTERVAL);

		// Two competing height-1 blocks; A has the earlier timestamp.
		let block_a = chain.build_block_at(slot_a, vec![]);
		let block_b = chain.build_block_at(
			slot_b,
			vec![chain.sign(chain.transfer_ops(10, 11, 100, 0), &[10])],
		);

		let (first, second) =
			if apply_order_swapped { (&block_b, &block_a) } else { (&block_a, &block_b) };
		let first_disposition = chain.db.submit_block(first.clone()).unwrap();
		assert!(matches!(first_disposition, BlockDisposition::Applied(_)));
		let second_disposition = chain.db.submit_block(second.clone()).unwrap();
		match second_disposition {
			// The earlier-timestamp tip wins a same-height tie.
			BlockDisposition::SideChain => {},
			BlockDisposition::Switched { .. } => {},
			other => panic!("unexpected disposition: {other:?}"),
		}
		// Either way the head must now be the earlier block A.
		assert_eq!(chain.db.head().unwrap().id, block_a.id());

		// Extending B makes the B-chain longer: both nodes must switch.
		let head_before = chain.db.head().unwrap();
		let block_b2 = {
			// Build on top of B regardless of our current head: craft by
			// hand from B's header.
			let active = chain.db.active_delegates().unwrap();
			let slot = Timestamp(slot_b.0 + INTERVAL);
			let delegate = chain.db.slot_delegate(slot, &active).unwrap();
			let seed = chain.delegate_seeds[&delegate];
			let header = BlockHeader {
				previous: block_b.id(),
				block_number: 2,
				timestamp: slot,
				transaction_digest: Block::transaction_digest(&[]),
				next_secret_hash: SecretHash(id_hash(&production_secret(seed, 2).0)),
				previous_secret: SecretHash([0; 20]),
			};
			Block {
				signed_header: SignedBlockHeader::sign(header, &secret(seed)),
				transactions: vec![],
			}
		};
		assert_eq!(head_before.number, 1);
		match chain.db.submit_block(block_b2.clone()).unwrap() {
			BlockDisposition::Switched { outcomes } => {
				assert_eq!(outcomes.len(), 2);
			},
			other => panic!("expected switch, got {other:?}"),
		}
		assert_eq!(chain.db.head().unwrap().id, block_b2.id());
		// The B-chain transfer landed after the switch.
		assert_eq!(chain.balance_of(11, NATIVE_ASSET_ID, 0), 100);
		chain.db.head().unwrap().id
	};

	// Both arrival orders converge on the same head id (invariant 7).
	assert_eq!(build_chains(false), build_chains(true));
}

// ---- duplicate transaction across blocks ----

#[test]
fn duplicate_transaction_rejected() {
	let mut chain = TestChain::new(&[("alice", 10, 1_000_000)]);
	let tx = chain.sign(chain.transfer_ops(10, 11, 500, 10), &[10]);
	let outcome = chain.advance(vec![tx.clone()]);
	assert!(outcome.tx_outcomes[0].error.is_none());

	let outcome = chain.advance(vec![tx]);
	assert_eq!(
		outcome.tx_outcomes[0].error.as_deref(),
		Some("duplicate_transaction")
	);
}

// ---- missed slots are recorded ----

#[test]
fn missed_slots_are_recorded() {
	let mut chain = TestChain::new(&[("alice", 10, 1_000_000)]);
	// Skip two slots.
	let slot = Timestamp(chain.next_slot().0 + 2 * INTERVAL);
	let block = chain.build_block_at(slot, vec![]);
	assert!(matches!(
		chain.db.submit_block(block).unwrap(),
		BlockDisposition::Applied(_)
	));

	let missed = chain.db.state().get_slot(chain.next_slot().saturating_sub_secs(3 * INTERVAL));
	let first_missed = missed.unwrap().unwrap();
	assert!(first_missed.block_id.is_none());
	let produced = chain.db.state().get_slot(slot).unwrap().unwrap();
	assert!(produced.block_id.is_some());
}

// ---- header validation ----

#[test]
fn wrong_signer_or_grid_rejects_block() {
	let mut chain = TestChain::new(&[("alice", 10, 1_000_000)]);
	let slot = chain.next_slot();

	// Off-grid timestamp.
	let block = chain.build_block_at(Timestamp(slot.0 + 1), vec![]);
	assert!(chain.db.submit_block(block).is_err());

	// Signed by the wrong delegate key.
	let good = chain.build_block_at(slot, vec![]);
	let forged = Block {
		signed_header: SignedBlockHeader::sign(
			good.signed_header.header.clone(),
			&secret(99),
		),
		transactions: vec![],
	};
	assert!(chain.db.submit_block(forged).is_err());

	// The honest block still applies.
	assert!(matches!(
		chain.db.submit_block(good).unwrap(),
		BlockDisposition::Applied(_)
	));
}

// ---- secret reveal schedule ----

#[test]
fn secret_reveal_mismatch_rejects_block() {
	let mut chain = TestChain::new(&[("alice", 10, 1_000_000)]);
	// Advance enough blocks that every delegate has produced once.
	for _ in 0..NUM_DELEGATES {
		chain.advance(vec![]);
	}
	// Now forge a block with a bogus reveal.
	let slot = chain.next_slot();
	let mut block = chain.build_block_at(slot, vec![]);
	let active = chain.db.active_delegates().unwrap();
	let delegate = chain.db.slot_delegate(slot, &active).unwrap();
	let seed = chain.delegate_seeds[&delegate];
	let mut header = block.signed_header.header.clone();
	header.previous_secret = SecretHash([7; 20]);
	block.signed_header = SignedBlockHeader::sign(header, &secret(seed));
	assert!(chain.db.submit_block(block).is_err());

	// And the valid reveal still applies.
	chain.advance(vec![]);
}
