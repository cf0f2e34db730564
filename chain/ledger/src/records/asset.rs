use obol_codec::canonical_struct;
use obol_primitives::{AccountId, AssetId, ShareAmount, Timestamp, MARKET_ISSUED};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
	pub id: AssetId,
	pub symbol: String,
	pub name: String,
	pub description: String,
	/// `MARKET_ISSUED` for assets whose supply only moves through
	/// short/cover execution.
	pub issuer: AccountId,
	/// Decimal scale: shares per displayed unit.
	pub precision: u64,
	pub registration_date: Timestamp,
	pub last_update: Timestamp,
	pub current_supply: ShareAmount,
	pub maximum_supply: ShareAmount,
	pub collected_fees: ShareAmount,
}

canonical_struct!(AssetRecord {
	id,
	symbol,
	name,
	description,
	issuer,
	precision,
	registration_date,
	last_update,
	current_supply,
	maximum_supply,
	collected_fees,
});

impl AssetRecord {
	pub fn is_market_issued(&self) -> bool {
		self.issuer == MARKET_ISSUED
	}

	pub fn available_shares(&self) -> ShareAmount {
		self.maximum_supply - self.current_supply
	}

	pub fn key(id: AssetId) -> Vec<u8> {
		id.0.to_be_bytes().to_vec()
	}

	pub fn symbol_key(symbol: &str) -> Vec<u8> {
		symbol.as_bytes().to_vec()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use obol_codec::{CanonicalDecode, CanonicalEncode};

	#[test]
	fn encoding_round_trips() {
		let record = AssetRecord {
			id: AssetId(4),
			symbol: "USD".into(),
			name: "dollar".into(),
			description: String::new(),
			issuer: MARKET_ISSUED,
			precision: 100_000,
			registration_date: Timestamp(10),
			last_update: Timestamp(20),
			current_supply: 500,
			maximum_supply: 1_000,
			collected_fees: 3,
		};
		assert_eq!(AssetRecord::from_bytes(&record.to_bytes()).unwrap(), record);
		assert!(record.is_market_issued());
		assert_eq!(record.available_shares(), 500);
	}
}
