//! Canonical state and its copy-on-write overlays.

mod chain_state;
mod pending;
mod typed;

pub use chain_state::ChainState;
pub use pending::{PendingState, WriteSets};
pub use typed::{order_family, ChainReadExt, META_CONFIG, META_DELEGATES, META_HEAD};

use crate::{error::ChainError, family::Family};

/// Longer than any real key in any family; `prev` from here is `last`.
pub(crate) const MAX_KEY: [u8; 80] = [0xff; 80];

/// Raw ordered reads over the record families. Implemented by the canonical
/// [`ChainState`] and by [`PendingState`] overlays; everything typed is
/// derived from these three primitives in [`ChainReadExt`].
pub trait ChainRead {
	fn get_raw(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError>;

	/// First entry with key ≥ `key`.
	fn lower_bound_raw(
		&self,
		family: Family,
		key: &[u8],
	) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError>;

	/// Last entry with key strictly < `key`.
	fn prev_raw(
		&self,
		family: Family,
		key: &[u8],
	) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError>;

	fn last_raw(&self, family: Family) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError> {
		self.prev_raw(family, &MAX_KEY)
	}

	/// First entry with key strictly > `key`.
	fn next_raw(
		&self,
		family: Family,
		key: &[u8],
	) -> Result<Option<(Vec<u8>, Vec<u8>)>, ChainError> {
		let mut probe = key.to_vec();
		probe.push(0);
		self.lower_bound_raw(family, &probe)
	}
}
