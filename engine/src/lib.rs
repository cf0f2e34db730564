//! The Obol node runtime.
//!
//! One core task owns the canonical [`ChainDatabase`](obol_ledger::ChainDatabase)
//! and services submits, queries and production ticks strictly in order over
//! a bounded channel; timers and ingress run on their own tasks and only
//! talk to the core through messages, so a partially applied block is never
//! observable.

pub mod constants;
pub mod logging;
pub mod mempool;
pub mod node;
pub mod producer;
pub mod query;
pub mod settings;
pub mod wire;
