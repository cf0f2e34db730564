use serde::{Deserialize, Serialize};

use crate::AssetId;

/// Integer quantity of an asset's smallest unit. Signed so delta accounting
/// can go negative during evaluation.
pub type ShareAmount = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ArithmeticError {
	#[error("amount addition overflow")]
	AdditionOverflow,
	#[error("amount subtraction overflow")]
	SubtractionOverflow,
	#[error("price multiplication overflow")]
	PriceMultiplicationOverflow,
	#[error("price multiplication underflow")]
	PriceMultiplicationUnderflow,
	#[error("asset divided by zero")]
	AssetDivideByZero,
	#[error("asset divided by itself")]
	AssetDivideBySelf,
	#[error("asset type does not match price pair")]
	AssetTypeMismatch,
}

/// An amount tagged with the asset it is denominated in. Mixing assets in
/// add/sub is a type-mismatch error rather than a silent unit bug.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
	pub amount: ShareAmount,
	pub asset_id: AssetId,
}

impl AssetAmount {
	pub fn new(amount: ShareAmount, asset_id: AssetId) -> Self {
		Self { amount, asset_id }
	}

	pub fn zero(asset_id: AssetId) -> Self {
		Self { amount: 0, asset_id }
	}

	pub fn checked_add(self, other: AssetAmount) -> Result<AssetAmount, ArithmeticError> {
		if self.asset_id != other.asset_id {
			return Err(ArithmeticError::AssetTypeMismatch)
		}
		let amount = self
			.amount
			.checked_add(other.amount)
			.ok_or(ArithmeticError::AdditionOverflow)?;
		Ok(AssetAmount { amount, asset_id: self.asset_id })
	}

	pub fn checked_sub(self, other: AssetAmount) -> Result<AssetAmount, ArithmeticError> {
		if self.asset_id != other.asset_id {
			return Err(ArithmeticError::AssetTypeMismatch)
		}
		let amount = self
			.amount
			.checked_sub(other.amount)
			.ok_or(ArithmeticError::SubtractionOverflow)?;
		Ok(AssetAmount { amount, asset_id: self.asset_id })
	}

	pub fn min(self, other: AssetAmount) -> AssetAmount {
		if other.amount < self.amount {
			other
		} else {
			self
		}
	}
}

impl PartialOrd for AssetAmount {
	/// Amounts of different assets are unordered.
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		(self.asset_id == other.asset_id).then(|| self.amount.cmp(&other.amount))
	}
}

impl std::fmt::Display for AssetAmount {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{} [asset {}]", self.amount, self.asset_id.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const XTS: AssetId = AssetId(0);
	const USD: AssetId = AssetId(1);

	#[test]
	fn add_and_sub_are_checked() {
		let a = AssetAmount::new(i64::MAX, XTS);
		assert_eq!(
			a.checked_add(AssetAmount::new(1, XTS)),
			Err(ArithmeticError::AdditionOverflow)
		);
		assert_eq!(
			AssetAmount::new(i64::MIN, XTS).checked_sub(AssetAmount::new(1, XTS)),
			Err(ArithmeticError::SubtractionOverflow)
		);
		assert_eq!(
			AssetAmount::new(5, XTS).checked_add(AssetAmount::new(3, XTS)).unwrap().amount,
			8
		);
	}

	#[test]
	fn mixed_assets_do_not_combine() {
		assert_eq!(
			AssetAmount::new(1, XTS).checked_add(AssetAmount::new(1, USD)),
			Err(ArithmeticError::AssetTypeMismatch)
		);
		assert_eq!(AssetAmount::new(1, XTS).partial_cmp(&AssetAmount::new(1, USD)), None);
	}
}
