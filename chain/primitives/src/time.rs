use serde::{Deserialize, Serialize};

/// Seconds since the unix epoch. Second resolution is what the slot grid and
/// expiry rules are defined over.
#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u32);

pub type SlotNumber = u64;

impl Timestamp {
	pub const fn from_secs(secs: u32) -> Self {
		Self(secs)
	}

	pub fn saturating_add_secs(self, secs: u32) -> Timestamp {
		Timestamp(self.0.saturating_add(secs))
	}

	pub fn saturating_sub_secs(self, secs: u32) -> Timestamp {
		Timestamp(self.0.saturating_sub(secs))
	}

	pub fn secs_since(self, earlier: Timestamp) -> u32 {
		self.0.saturating_sub(earlier.0)
	}

	/// Truncate to the start of the enclosing bucket (hour/day history
	/// buckets, slot grid).
	pub fn truncated_to(self, bucket_secs: u32) -> Timestamp {
		Timestamp(self.0 - self.0 % bucket_secs)
	}

	pub fn is_on_grid(self, interval_secs: u32) -> bool {
		self.0 % interval_secs == 0
	}

	pub fn slot_number(self, interval_secs: u32) -> SlotNumber {
		(self.0 / interval_secs) as SlotNumber
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}
