//! Persistent record types and their canonical encodings. Field order in
//! every struct here is consensus-critical.

pub mod account;
pub mod asset;
pub mod balance;
pub mod block;
pub mod market;
pub mod transaction;

pub use account::{AccountRecord, DelegateStats};
pub use asset::AssetRecord;
pub use balance::{BalanceCondition, BalanceRecord, WithdrawCondition};
pub use block::{
	Block, BlockHeader, ChainHead, SignedBlockHeader, SlotRecord, TransactionLocation, UndoEntry,
	UndoRecord,
};
pub use market::{
	CollateralRecord, FeedRecord, Granularity, MarketHistoryKey, MarketHistoryRecord, MarketIndex,
	MarketPair, MarketStatus, MarketTransaction, OrderKind, OrderRecord,
};
pub use transaction::{Operation, SignedTransaction, Transaction};
