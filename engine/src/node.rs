//! The single-threaded core task. Everything that mutates the canonical
//! state (submits, block application, production) runs here, strictly in
//! message order; queries answer from the committed head between mutations.

use std::time::{SystemTime, UNIX_EPOCH};

use obol_codec::CanonicalDecode;
use obol_ledger::{
	records::{Block, Granularity, SignedTransaction},
	BlockDisposition, BlockOutcome, ChainDatabase, ChainError,
};
use obol_primitives::{
	AccountId, Address, AssetId, BlockId, BlockNumber, Timestamp, TransactionId,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::{
	constants::PRODUCE_DEADLINE_MS_PER_SECOND,
	mempool::{self, MemPool},
	producer::Producer,
	query::QueryApi,
	wire::WireMessage,
};

/// Injected time source: deployments use the wall clock, tests drive time
/// by hand.
pub trait Clock: Send {
	fn now(&self) -> Timestamp;
}

pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Timestamp {
		Timestamp(
			SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map(|d| d.as_secs() as u32)
				.unwrap_or(0),
		)
	}
}

/// Structured error returned by the submit endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct SubmitError {
	pub kind: String,
	pub detail: String,
}

impl From<ChainError> for SubmitError {
	fn from(e: ChainError) -> Self {
		SubmitError { kind: e.kind().to_string(), detail: e.to_string() }
	}
}

#[derive(Clone, Debug, Serialize)]
pub enum BlockAccepted {
	Applied { number: BlockNumber },
	SideChain,
	AlreadyKnown,
	Switched { new_head: BlockNumber },
}

#[derive(Debug)]
pub enum QueryRequest {
	Head,
	BlockByNumber(BlockNumber),
	BlockById(BlockId),
	BlocksInRange { first: BlockNumber, limit: usize },
	Transaction(TransactionId),
	Balance(Address),
	AccountById(AccountId),
	AccountByName(String),
	AccountByKey(Address),
	ListAccounts { first: String, limit: usize },
	AssetById(AssetId),
	AssetBySymbol(String),
	ListAssets { limit: usize },
	OrderBook { quote: AssetId, base: AssetId, limit: usize },
	MarketHistory {
		quote: AssetId,
		base: AssetId,
		granularity: Granularity,
		from: Timestamp,
		to: Timestamp,
		limit: usize,
	},
	Feeds(AssetId),
	MedianFeed(AssetId),
	Delegates,
	Slot(Timestamp),
	PendingTransactions,
}

pub enum CoreRequest {
	SubmitTransaction {
		bytes: Vec<u8>,
		reply: oneshot::Sender<Result<TransactionId, SubmitError>>,
	},
	SubmitBlock {
		bytes: Vec<u8>,
		reply: oneshot::Sender<Result<BlockAccepted, SubmitError>>,
	},
	Query {
		request: QueryRequest,
		reply: oneshot::Sender<Result<serde_json::Value, SubmitError>>,
	},
	ProduceTick,
	Shutdown,
}

pub struct Node {
	db: ChainDatabase,
	mempool: MemPool,
	producer: Producer,
	clock: Box<dyn Clock>,
	outbound: mpsc::Sender<WireMessage>,
	/// Highest slot we already produced for; one candidate per slot.
	produced_through: Timestamp,
}

impl Node {
	pub fn new(
		db: ChainDatabase,
		mempool: MemPool,
		producer: Producer,
		clock: Box<dyn Clock>,
		outbound: mpsc::Sender<WireMessage>,
	) -> Node {
		Node { db, mempool, producer, clock, outbound, produced_through: Timestamp(0) }
	}

	pub async fn run(mut self, mut requests: mpsc::Receiver<CoreRequest>) {
		tracing::info!("core task started");
		while let Some(request) = requests.recv().await {
			match request {
				CoreRequest::SubmitTransaction { bytes, reply } => {
					let _ = reply.send(self.on_submit_transaction(&bytes));
				},
				CoreRequest::SubmitBlock { bytes, reply } => {
					let _ = reply.send(self.on_submit_block(&bytes));
				},
				CoreRequest::Query { request, reply } => {
					let _ = reply.send(self.on_query(request));
				},
				CoreRequest::ProduceTick => self.on_produce_tick(),
				CoreRequest::Shutdown => break,
			}
		}
		tracing::info!("core task stopped");
	}

	fn broadcast(&self, message: WireMessage) {
		if self.outbound.try_send(message).is_err() {
			tracing::warn!("outbound channel full; dropping broadcast");
		}
	}

	fn on_submit_transaction(&mut self, bytes: &[u8]) -> Result<TransactionId, SubmitError> {
		let tx = SignedTransaction::from_bytes(bytes)
			.map_err(|e| SubmitError::from(ChainError::from(e)))?;
		let id = mempool::admit(&mut self.mempool, &self.db, self.clock.now(), tx.clone())?;
		tracing::debug!("admitted tx {id} to mempool");
		self.broadcast(WireMessage::Transaction(tx));
		Ok(id)
	}

	fn on_submit_block(&mut self, bytes: &[u8]) -> Result<BlockAccepted, SubmitError> {
		let block =
			Block::from_bytes(bytes).map_err(|e| SubmitError::from(ChainError::from(e)))?;
		let accepted = match self.db.submit_block(block.clone())? {
			BlockDisposition::Applied(outcome) => {
				self.after_new_head(std::slice::from_ref(&outcome));
				self.broadcast(WireMessage::Block(block));
				BlockAccepted::Applied { number: outcome.block_number }
			},
			BlockDisposition::Switched { outcomes } => {
				let new_head =
					outcomes.last().map(|o| o.block_number).unwrap_or_default();
				self.after_new_head(&outcomes);
				self.broadcast(WireMessage::Block(block));
				BlockAccepted::Switched { new_head }
			},
			BlockDisposition::SideChain => BlockAccepted::SideChain,
			BlockDisposition::AlreadyKnown => BlockAccepted::AlreadyKnown,
		};
		Ok(accepted)
	}

	/// Mempool hygiene after the head moved: drop what got included, then
	/// re-evaluate the remainder against the new head.
	fn after_new_head(&mut self, outcomes: &[BlockOutcome]) {
		for outcome in outcomes {
			self.mempool
				.drop_included(outcome.tx_outcomes.iter().map(|tx| tx.id));
		}
		let now = self.clock.now();
		self.mempool.prune_expired(now);
		self.mempool.reevaluate(&self.db, now);
	}

	fn on_produce_tick(&mut self) {
		if self.producer.is_empty() {
			return
		}
		let interval = self.db.config().block_interval_secs;
		let now = self.clock.now();
		let slot_time = now.truncated_to(interval);
		if slot_time <= self.produced_through {
			return
		}
		// Too deep into the slot: a block signed now would barely
		// propagate before the next delegate takes over.
		let elapsed_ms = (now.0.saturating_sub(slot_time.0) as u64) * 1000;
		if elapsed_ms > interval as u64 * PRODUCE_DEADLINE_MS_PER_SECOND {
			return
		}

		match self.producer.produce(&self.db, &self.mempool, slot_time) {
			Ok(Some(block)) => {
				self.produced_through = slot_time;
				// Deadline check after the (possibly slow) build.
				if self.clock.now().secs_since(slot_time) >= interval {
					tracing::warn!("abandoning candidate block: slot deadline passed");
					return
				}
				match self.db.submit_block(block.clone()) {
					Ok(BlockDisposition::Applied(outcome)) => {
						tracing::info!(
							number = outcome.block_number,
							txs = outcome.tx_outcomes.len(),
							"produced block"
						);
						self.after_new_head(std::slice::from_ref(&outcome));
						self.broadcast(WireMessage::Block(block));
					},
					Ok(disposition) => tracing::warn!(
						"own candidate not applied: {disposition:?}"
					),
					Err(e) => tracing::error!("own candidate rejected: {e}"),
				}
			},
			Ok(None) => {
				self.produced_through = slot_time;
			},
			Err(e) => tracing::error!("producer error: {e}"),
		}
	}

	fn on_query(&self, request: QueryRequest) -> Result<serde_json::Value, SubmitError> {
		let api = QueryApi::new(&self.db);
		match request {
			QueryRequest::Head => to_value(api.head()),
			QueryRequest::BlockByNumber(number) => to_value(api.block_by_number(number)),
			QueryRequest::BlockById(id) => to_value(api.block_by_id(&id)),
			QueryRequest::BlocksInRange { first, limit } =>
				to_value(api.blocks_in_range(first, limit)),
			QueryRequest::Transaction(id) => to_value(api.transaction(&id)),
			QueryRequest::Balance(address) => to_value(api.balance(&address)),
			QueryRequest::AccountById(id) => to_value(api.account_by_id(id)),
			QueryRequest::AccountByName(name) => to_value(api.account_by_name(&name)),
			QueryRequest::AccountByKey(key) => to_value(api.account_by_key(&key)),
			QueryRequest::ListAccounts { first, limit } =>
				to_value(api.list_accounts(&first, limit)),
			QueryRequest::AssetById(id) => to_value(api.asset_by_id(id)),
			QueryRequest::AssetBySymbol(symbol) => to_value(api.asset_by_symbol(&symbol)),
			QueryRequest::ListAssets { limit } => to_value(api.list_assets(limit)),
			QueryRequest::OrderBook { quote, base, limit } =>
				to_value(api.order_book(quote, base, limit)),
			QueryRequest::MarketHistory { quote, base, granularity, from, to, limit } =>
				to_value(api.market_history(quote, base, granularity, from, to, limit)),
			QueryRequest::Feeds(asset) => to_value(api.feeds(asset)),
			QueryRequest::MedianFeed(asset) => to_value(api.median_feed(asset)),
			QueryRequest::Delegates => to_value(api.delegates()),
			QueryRequest::Slot(timestamp) => to_value(api.slot(timestamp)),
			QueryRequest::PendingTransactions =>
				to_value(Ok(api.pending_transactions(&self.mempool))),
		}
	}
}

fn to_value<T: Serialize>(
	value: Result<T, ChainError>,
) -> Result<serde_json::Value, SubmitError> {
	value.map_err(SubmitError::from).and_then(|v| {
		serde_json::to_value(v)
			.map_err(|e| SubmitError { kind: "serialization".into(), detail: e.to_string() })
	})
}
