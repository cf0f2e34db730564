//! The Obol ledger state machine.
//!
//! [`ChainDatabase`] owns the canonical state and applies blocks through a
//! [`PendingState`] overlay: one layer per block, one nested layer per
//! transaction, and one per market pair, so a failure at any level rolls
//! back exactly its own writes. All rules in here must be bit-for-bit
//! deterministic across replicas.

pub mod apply;
pub mod error;
pub mod eval;
pub mod family;
pub mod genesis;
pub mod market;
pub mod records;
pub mod state;

pub use apply::{BlockDisposition, BlockOutcome, ChainDatabase, TxOutcome};
pub use error::ChainError;
pub use eval::{evaluate_transaction, TxSummary};
pub use family::Family;
pub use genesis::GenesisConfig;
pub use market::EngineRevision;
pub use state::{ChainRead, ChainReadExt, ChainState, PendingState};
