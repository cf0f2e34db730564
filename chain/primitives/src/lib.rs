//! Primitive types shared by every Obol chain crate: identifiers, share
//! amounts, fixed-point prices, timestamps and the frozen chain parameters.
//!
//! Everything in here is consensus-critical. Arithmetic is checked and
//! returns [`ArithmeticError`] instead of panicking or wrapping.

pub mod amount;
pub mod config;
pub mod price;
pub mod time;

pub use amount::{ArithmeticError, AssetAmount, ShareAmount};
pub use config::ChainConfig;
pub use price::{Price, PRICE_ONE};
pub use time::{SlotNumber, Timestamp};

use serde::{Deserialize, Serialize};

/// Number of share units making up one displayed unit of an asset with the
/// default precision.
pub const PRECISION: ShareAmount = 100_000;

/// Maximum length of an asset symbol. Registration fees scale inversely with
/// symbol length, so this also bounds the fee multiplier.
pub const MAX_SYMBOL_LEN: usize = 8;
pub const MIN_SYMBOL_LEN: usize = 3;

/// The native chain asset.
pub const NATIVE_ASSET_ID: AssetId = AssetId(0);

/// Issuer sentinel for assets whose supply only moves via short/cover
/// execution.
pub const MARKET_ISSUED: AccountId = AccountId(u32::MAX);

pub type BlockNumber = u32;

#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AssetId(pub u32);

#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AccountId(pub u32);

/// A delegate vote reference as stored on balances: the magnitude is the
/// delegate's account id, the sign is approval. Zero means "no vote".
#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DelegateVoteId(pub i32);

impl DelegateVoteId {
	pub fn delegate(self) -> AccountId {
		AccountId(self.0.unsigned_abs())
	}

	pub fn is_for(self) -> bool {
		self.0 > 0
	}

	pub fn is_none(self) -> bool {
		self.0 == 0
	}
}

macro_rules! digest_id {
	($name:ident) => {
		#[derive(
			Clone,
			Copy,
			Debug,
			Default,
			PartialEq,
			Eq,
			PartialOrd,
			Ord,
			Hash,
			Serialize,
			Deserialize,
		)]
		pub struct $name(pub [u8; 20]);

		impl std::fmt::Display for $name {
			fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
				write!(f, "{}", hex::encode(self.0))
			}
		}

		impl std::str::FromStr for $name {
			type Err = hex::FromHexError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let mut bytes = [0u8; 20];
				hex::decode_to_slice(s, &mut bytes)?;
				Ok(Self(bytes))
			}
		}
	};
}

digest_id!(Address);
digest_id!(TransactionId);
digest_id!(BlockId);
digest_id!(SecretHash);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn vote_id_sign_encodes_direction() {
		assert!(DelegateVoteId(7).is_for());
		assert!(!DelegateVoteId(-7).is_for());
		assert_eq!(DelegateVoteId(-7).delegate(), AccountId(7));
		assert!(DelegateVoteId(0).is_none());
	}

	#[test]
	fn address_hex_round_trip() {
		let addr = Address([0xab; 20]);
		let s = addr.to_string();
		assert_eq!(s.parse::<Address>().unwrap(), addr);
	}
}
