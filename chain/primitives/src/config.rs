use serde::{Deserialize, Serialize};

use crate::ShareAmount;

pub const ONE_YEAR_SECS: u32 = 60 * 60 * 24 * 365;

/// Consensus parameters. These are frozen into the genesis state so every
/// replica derives identical rules; node-local tuning lives in the engine
/// settings instead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
	/// Fee units charged per 1000 bytes of canonical transaction encoding.
	pub fee_rate: ShareAmount,
	pub max_block_size: usize,
	pub max_transaction_ttl_secs: u32,
	pub block_interval_secs: u32,
	pub num_delegates: u32,
	pub block_reward: ShareAmount,
	pub delegate_registration_fee: ShareAmount,
	pub asset_registration_fee: ShareAmount,
	/// Cut of the returned collateral taken on a full margin-call close,
	/// in 1/1000ths.
	pub margin_call_fee_permille: ShareAmount,
	/// Minimum bid and ask depth a market-issued pair must retain.
	pub market_depth_requirement: ShareAmount,
	pub max_fork_depth: u32,
	/// Shorts untouched for longer than this are swept off the book.
	pub short_staleness_secs: u32,
}

impl ChainConfig {
	pub fn blocks_per_hour(&self) -> u128 {
		(3_600 / self.block_interval_secs).max(1) as u128
	}

	pub fn min_fee(&self, encoded_size: usize) -> ShareAmount {
		self.fee_rate.saturating_mul(encoded_size as ShareAmount) / 1000
	}
}

impl Default for ChainConfig {
	fn default() -> Self {
		Self {
			fee_rate: 1_000,
			max_block_size: 256 * 1024,
			max_transaction_ttl_secs: 60 * 60 * 2,
			block_interval_secs: 30,
			num_delegates: 97,
			block_reward: 1_000_000,
			delegate_registration_fee: 10_000_000,
			asset_registration_fee: 50_000_000,
			margin_call_fee_permille: 50,
			market_depth_requirement: 100 * crate::PRECISION,
			max_fork_depth: 1_000,
			short_staleness_secs: ONE_YEAR_SECS / 12,
		}
	}
}
