/// The record families of the persisted state. Each maps to one store
/// column; [`PendingState`](crate::PendingState) keeps one write set per
/// family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
	Meta,
	BlocksByNum,
	BlocksById,
	SideBlocks,
	Slots,
	Accounts,
	AccountIndexByName,
	AccountIndexByKey,
	Assets,
	AssetIndexBySymbol,
	Balances,
	Bids,
	Asks,
	Shorts,
	Collateral,
	Feeds,
	MarketStatus,
	MarketHistory,
	TxIndex,
	Undo,
}

impl Family {
	pub const ALL: [Family; 20] = [
		Family::Meta,
		Family::BlocksByNum,
		Family::BlocksById,
		Family::SideBlocks,
		Family::Slots,
		Family::Accounts,
		Family::AccountIndexByName,
		Family::AccountIndexByKey,
		Family::Assets,
		Family::AssetIndexBySymbol,
		Family::Balances,
		Family::Bids,
		Family::Asks,
		Family::Shorts,
		Family::Collateral,
		Family::Feeds,
		Family::MarketStatus,
		Family::MarketHistory,
		Family::TxIndex,
		Family::Undo,
	];

	pub const COUNT: usize = Self::ALL.len();

	pub fn column(self) -> &'static str {
		match self {
			Family::Meta => "meta",
			Family::BlocksByNum => "blocks_by_num",
			Family::BlocksById => "blocks_by_id",
			Family::SideBlocks => "side_blocks",
			Family::Slots => "slots",
			Family::Accounts => "accounts",
			Family::AccountIndexByName => "account_index_by_name",
			Family::AccountIndexByKey => "account_index_by_key",
			Family::Assets => "assets",
			Family::AssetIndexBySymbol => "asset_index_by_symbol",
			Family::Balances => "balances",
			Family::Bids => "bids",
			Family::Asks => "asks",
			Family::Shorts => "shorts",
			Family::Collateral => "collateral",
			Family::Feeds => "feeds",
			Family::MarketStatus => "market_status",
			Family::MarketHistory => "market_history",
			Family::TxIndex => "tx_index",
			Family::Undo => "undo",
		}
	}

	pub fn index(self) -> usize {
		self as usize
	}

	pub fn from_index(index: u8) -> Option<Family> {
		Self::ALL.get(index as usize).copied()
	}

	pub fn columns() -> Vec<&'static str> {
		Self::ALL.iter().map(|family| family.column()).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn indices_round_trip() {
		for family in Family::ALL {
			assert_eq!(Family::from_index(family.index() as u8), Some(family));
		}
		assert_eq!(Family::from_index(Family::COUNT as u8), None);
	}
}
