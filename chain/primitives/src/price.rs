use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::{
	amount::{ArithmeticError, AssetAmount},
	AssetId,
};

/// Fixed-point scale of a price ratio: one displayed unit of quote per base.
pub const PRICE_ONE: u128 = 1_000_000_000_000_000_000;

/// Quote units per base unit as a 128-bit fixed-point ratio. The pair is part
/// of the value; arithmetic across different pairs is a type mismatch.
///
/// Field order matters: derived ordering sorts by pair first, then ratio,
/// which is exactly the order-book key order.
#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Price {
	pub quote_asset_id: AssetId,
	pub base_asset_id: AssetId,
	pub ratio: u128,
}

impl Price {
	pub fn new(ratio: u128, quote_asset_id: AssetId, base_asset_id: AssetId) -> Self {
		Self { quote_asset_id, base_asset_id, ratio }
	}

	/// A ratio of exactly 1 quote/base.
	pub fn one(quote_asset_id: AssetId, base_asset_id: AssetId) -> Self {
		Self::new(PRICE_ONE, quote_asset_id, base_asset_id)
	}

	pub fn is_zero(&self) -> bool {
		self.ratio == 0
	}

	/// Ratio scaled by `num / den`, rounding down. Used for the clamp band
	/// and call-price derivations.
	pub fn scaled(&self, num: u128, den: u128) -> Result<Price, ArithmeticError> {
		let ratio = BigInt::from(self.ratio) * BigInt::from(num) / BigInt::from(den);
		Ok(Price {
			ratio: u128::try_from(ratio)
				.map_err(|_| ArithmeticError::PriceMultiplicationOverflow)?,
			..*self
		})
	}

	pub fn checked_mul(&self, other: &Price) -> Result<Price, ArithmeticError> {
		if self.quote_asset_id != other.quote_asset_id ||
			self.base_asset_id != other.base_asset_id
		{
			return Err(ArithmeticError::AssetTypeMismatch)
		}
		if self.ratio == 0 {
			return Ok(*self)
		}
		if other.ratio == 0 {
			return Ok(*other)
		}
		let product = BigInt::from(self.ratio) * BigInt::from(other.ratio) / BigInt::from(PRICE_ONE);
		if product == BigInt::from(0u8) {
			// Non-zero result too small to represent.
			return Err(ArithmeticError::PriceMultiplicationUnderflow)
		}
		let ratio =
			u128::try_from(product).map_err(|_| ArithmeticError::PriceMultiplicationOverflow)?;
		Ok(Price { ratio, ..*self })
	}
}

impl std::fmt::Display for Price {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let int = self.ratio / PRICE_ONE;
		let frac = self.ratio % PRICE_ONE;
		let frac = format!("{frac:018}");
		let frac = frac.trim_end_matches('0');
		write!(
			f,
			"{int}.{} {}/{}",
			if frac.is_empty() { "0" } else { frac },
			self.quote_asset_id.0,
			self.base_asset_id.0
		)
	}
}

impl AssetAmount {
	/// Convert across the pair at `price`, rounding down. A base amount
	/// yields the quote amount and vice versa; any other asset is a
	/// mismatch.
	pub fn checked_mul_price(self, price: &Price) -> Result<AssetAmount, ArithmeticError> {
		if self.asset_id == price.base_asset_id {
			let amount = BigInt::from(self.amount) * BigInt::from(price.ratio) /
				BigInt::from(PRICE_ONE);
			Ok(AssetAmount {
				amount: i64::try_from(amount).map_err(|_| ArithmeticError::AdditionOverflow)?,
				asset_id: price.quote_asset_id,
			})
		} else if self.asset_id == price.quote_asset_id {
			if price.ratio == 0 {
				return Err(ArithmeticError::AssetDivideByZero)
			}
			let amount = BigInt::from(self.amount) * BigInt::from(PRICE_ONE) /
				BigInt::from(price.ratio);
			Ok(AssetAmount {
				amount: i64::try_from(amount).map_err(|_| ArithmeticError::AdditionOverflow)?,
				asset_id: price.base_asset_id,
			})
		} else {
			Err(ArithmeticError::AssetTypeMismatch)
		}
	}

	/// Same conversion; kept as a distinct name so call sites read like the
	/// arithmetic they mirror.
	pub fn checked_div_price(self, price: &Price) -> Result<AssetAmount, ArithmeticError> {
		self.checked_mul_price(price)
	}

	/// Ratio of two amounts as a price. The asset with the higher id is
	/// always the quote side, so `usd/xts` and `xts/usd` produce the same
	/// pair.
	pub fn checked_div(self, other: AssetAmount) -> Result<Price, ArithmeticError> {
		if self.asset_id == other.asset_id {
			return Err(ArithmeticError::AssetDivideBySelf)
		}
		let (num, den) =
			if self.asset_id > other.asset_id { (self, other) } else { (other, self) };
		if den.amount == 0 {
			return Err(ArithmeticError::AssetDivideByZero)
		}
		let ratio = BigInt::from(num.amount) * BigInt::from(PRICE_ONE) / BigInt::from(den.amount);
		Ok(Price {
			quote_asset_id: num.asset_id,
			base_asset_id: den.asset_id,
			ratio: u128::try_from(ratio)
				.map_err(|_| ArithmeticError::PriceMultiplicationOverflow)?,
		})
	}
}
