use obol_primitives::{
	AccountId, Address, AssetAmount, AssetId, BlockId, DelegateVoteId, Price, SecretHash,
	Timestamp, TransactionId,
};

use crate::CodecError;

/// Append the canonical encoding of `self` to `out`. Integers are
/// little-endian fixed width; collection and string lengths are LEB128
/// varints; tagged variants write a one-byte discriminant first.
pub trait CanonicalEncode {
	fn encode(&self, out: &mut Vec<u8>);

	fn to_bytes(&self) -> Vec<u8> {
		let mut out = Vec::new();
		self.encode(&mut out);
		out
	}

	fn encoded_size(&self) -> usize {
		self.to_bytes().len()
	}
}

pub trait CanonicalDecode: Sized {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError>;

	/// Decode a complete value; trailing bytes are malformed.
	fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut r = ByteReader::new(bytes);
		let value = Self::decode(&mut r)?;
		if !r.is_empty() {
			return Err(CodecError::MalformedEncoding)
		}
		Ok(value)
	}
}

pub struct ByteReader<'a> {
	bytes: &'a [u8],
	pos: usize,
}

impl<'a> ByteReader<'a> {
	pub fn new(bytes: &'a [u8]) -> Self {
		Self { bytes, pos: 0 }
	}

	pub fn is_empty(&self) -> bool {
		self.pos == self.bytes.len()
	}

	pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
		let end = self.pos.checked_add(n).ok_or(CodecError::MalformedEncoding)?;
		let slice = self.bytes.get(self.pos..end).ok_or(CodecError::MalformedEncoding)?;
		self.pos = end;
		Ok(slice)
	}

	pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
		let mut array = [0u8; N];
		array.copy_from_slice(self.take(N)?);
		Ok(array)
	}

	pub fn read_varint(&mut self) -> Result<u64, CodecError> {
		let mut value = 0u64;
		for shift in (0..64).step_by(7) {
			let byte = self.take(1)?[0];
			value |= u64::from(byte & 0x7f)
				.checked_shl(shift)
				.ok_or(CodecError::MalformedEncoding)?;
			if byte & 0x80 == 0 {
				return Ok(value)
			}
		}
		Err(CodecError::MalformedEncoding)
	}
}

pub fn write_varint(mut value: u64, out: &mut Vec<u8>) {
	loop {
		let byte = (value & 0x7f) as u8;
		value >>= 7;
		if value == 0 {
			out.push(byte);
			return
		}
		out.push(byte | 0x80);
	}
}

/// Implement the canonical codec for a struct, field by field in
/// declaration order. Field order is consensus-critical; reordering fields
/// changes every digest derived from the type.
#[macro_export]
macro_rules! canonical_struct {
	($ty:ty { $($field:ident),* $(,)? }) => {
		impl $crate::CanonicalEncode for $ty {
			fn encode(&self, out: &mut Vec<u8>) {
				$($crate::CanonicalEncode::encode(&self.$field, out);)*
			}
		}

		impl $crate::CanonicalDecode for $ty {
			fn decode(r: &mut $crate::ByteReader) -> Result<Self, $crate::CodecError> {
				Ok(Self { $($field: $crate::CanonicalDecode::decode(r)?),* })
			}
		}
	};
}

macro_rules! impl_le_int {
	($($ty:ty),*) => {$(
		impl CanonicalEncode for $ty {
			fn encode(&self, out: &mut Vec<u8>) {
				out.extend_from_slice(&self.to_le_bytes());
			}
		}

		impl CanonicalDecode for $ty {
			fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
				Ok(<$ty>::from_le_bytes(r.take_array()?))
			}
		}
	)*};
}

impl_le_int!(u8, u16, u32, u64, u128, i32, i64);

impl CanonicalEncode for bool {
	fn encode(&self, out: &mut Vec<u8>) {
		out.push(u8::from(*self));
	}
}

impl CanonicalDecode for bool {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		match r.take(1)?[0] {
			0 => Ok(false),
			1 => Ok(true),
			_ => Err(CodecError::MalformedEncoding),
		}
	}
}

impl<const N: usize> CanonicalEncode for [u8; N] {
	fn encode(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(self);
	}
}

impl<const N: usize> CanonicalDecode for [u8; N] {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		r.take_array()
	}
}

impl CanonicalEncode for String {
	fn encode(&self, out: &mut Vec<u8>) {
		write_varint(self.len() as u64, out);
		out.extend_from_slice(self.as_bytes());
	}
}

impl CanonicalDecode for String {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		let len = usize::try_from(r.read_varint()?).map_err(|_| CodecError::MalformedEncoding)?;
		String::from_utf8(r.take(len)?.to_vec()).map_err(|_| CodecError::MalformedEncoding)
	}
}

impl<T: CanonicalEncode> CanonicalEncode for Vec<T> {
	fn encode(&self, out: &mut Vec<u8>) {
		write_varint(self.len() as u64, out);
		for item in self {
			item.encode(out);
		}
	}
}

impl<T: CanonicalDecode> CanonicalDecode for Vec<T> {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		let len = usize::try_from(r.read_varint()?).map_err(|_| CodecError::MalformedEncoding)?;
		// Bound preallocation by what the input could possibly hold.
		let mut items = Vec::with_capacity(len.min(r.bytes.len().saturating_sub(r.pos)));
		for _ in 0..len {
			items.push(T::decode(r)?);
		}
		Ok(items)
	}
}

impl<T: CanonicalEncode> CanonicalEncode for Option<T> {
	fn encode(&self, out: &mut Vec<u8>) {
		match self {
			None => out.push(0),
			Some(value) => {
				out.push(1);
				value.encode(out);
			},
		}
	}
}

impl<T: CanonicalDecode> CanonicalDecode for Option<T> {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		match r.take(1)?[0] {
			0 => Ok(None),
			1 => Ok(Some(T::decode(r)?)),
			_ => Err(CodecError::MalformedEncoding),
		}
	}
}

macro_rules! impl_newtype {
	($($ty:ty => $inner:ty),*) => {$(
		impl CanonicalEncode for $ty {
			fn encode(&self, out: &mut Vec<u8>) {
				self.0.encode(out);
			}
		}

		impl CanonicalDecode for $ty {
			fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
				Ok(Self(<$inner>::decode(r)?))
			}
		}
	)*};
}

impl_newtype!(
	AssetId => u32,
	AccountId => u32,
	DelegateVoteId => i32,
	Timestamp => u32,
	Address => [u8; 20],
	TransactionId => [u8; 20],
	BlockId => [u8; 20],
	SecretHash => [u8; 20]
);

impl CanonicalEncode for AssetAmount {
	fn encode(&self, out: &mut Vec<u8>) {
		self.amount.encode(out);
		self.asset_id.encode(out);
	}
}

impl CanonicalDecode for AssetAmount {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		Ok(Self { amount: i64::decode(r)?, asset_id: AssetId::decode(r)? })
	}
}

impl CanonicalEncode for Price {
	fn encode(&self, out: &mut Vec<u8>) {
		self.quote_asset_id.encode(out);
		self.base_asset_id.encode(out);
		self.ratio.encode(out);
	}
}

impl CanonicalDecode for Price {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		Ok(Self {
			quote_asset_id: AssetId::decode(r)?,
			base_asset_id: AssetId::decode(r)?,
			ratio: u128::decode(r)?,
		})
	}
}
