use obol_codec::{canonical_struct, PublicKey};
use obol_primitives::{AccountId, BlockNumber, SecretHash, ShareAmount, Timestamp};

/// Present exactly when the account is a delegate; the delegate set is the
/// set of accounts carrying stats.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DelegateStats {
	pub votes_for: ShareAmount,
	pub votes_against: ShareAmount,
	/// Accumulated block rewards, withdrawable like a balance.
	pub pay_balance: ShareAmount,
	pub blocks_produced: u32,
	pub blocks_missed: u32,
	pub last_block_produced: Option<BlockNumber>,
	/// Commitment revealed by this delegate's next produced block.
	pub next_secret_hash: Option<SecretHash>,
}

canonical_struct!(DelegateStats {
	votes_for,
	votes_against,
	pay_balance,
	blocks_produced,
	blocks_missed,
	last_block_produced,
	next_secret_hash,
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountRecord {
	pub id: AccountId,
	pub name: String,
	pub owner_key: PublicKey,
	pub active_key: PublicKey,
	pub registration_date: Timestamp,
	pub last_update: Timestamp,
	pub delegate: Option<DelegateStats>,
}

canonical_struct!(AccountRecord {
	id,
	name,
	owner_key,
	active_key,
	registration_date,
	last_update,
	delegate,
});

impl AccountRecord {
	pub fn is_delegate(&self) -> bool {
		self.delegate.is_some()
	}

	pub fn net_votes(&self) -> ShareAmount {
		self.delegate
			.as_ref()
			.map(|stats| stats.votes_for - stats.votes_against)
			.unwrap_or(0)
	}

	pub fn key(id: AccountId) -> Vec<u8> {
		id.0.to_be_bytes().to_vec()
	}

	pub fn name_key(name: &str) -> Vec<u8> {
		name.as_bytes().to_vec()
	}

	/// Account names are lowercase alphanumeric plus `-`, start with a
	/// letter, and are bounded in length.
	pub fn is_valid_name(name: &str) -> bool {
		(1..=63).contains(&name.len()) &&
			name.starts_with(|c: char| c.is_ascii_lowercase()) &&
			name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
	}
}
