use obol_codec::{address_hash, canonical_struct, ByteReader, CanonicalDecode, CanonicalEncode, CodecError};
use obol_primitives::{Address, AssetId, DelegateVoteId, Price, ShareAmount, Timestamp};

/// The predicate that authorizes spending a balance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WithdrawCondition {
	Signature { owner: Address },
	MultiSig { required: u32, owners: Vec<Address> },
	Password { payor: Address, payee: Address, password_hash: [u8; 20] },
	/// Before `expiration` the optionee may claim at the strike price;
	/// afterwards the balance reverts to the optionor.
	Option { optionor: Address, optionee: Address, strike_price: Price, expiration: Timestamp },
}

impl CanonicalEncode for WithdrawCondition {
	fn encode(&self, out: &mut Vec<u8>) {
		match self {
			WithdrawCondition::Signature { owner } => {
				out.push(0);
				owner.encode(out);
			},
			WithdrawCondition::MultiSig { required, owners } => {
				out.push(1);
				required.encode(out);
				owners.encode(out);
			},
			WithdrawCondition::Password { payor, payee, password_hash } => {
				out.push(2);
				payor.encode(out);
				payee.encode(out);
				password_hash.encode(out);
			},
			WithdrawCondition::Option { optionor, optionee, strike_price, expiration } => {
				out.push(3);
				optionor.encode(out);
				optionee.encode(out);
				strike_price.encode(out);
				expiration.encode(out);
			},
		}
	}
}

impl CanonicalDecode for WithdrawCondition {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		Ok(match r.take(1)?[0] {
			0 => WithdrawCondition::Signature { owner: CanonicalDecode::decode(r)? },
			1 => WithdrawCondition::MultiSig {
				required: CanonicalDecode::decode(r)?,
				owners: CanonicalDecode::decode(r)?,
			},
			2 => WithdrawCondition::Password {
				payor: CanonicalDecode::decode(r)?,
				payee: CanonicalDecode::decode(r)?,
				password_hash: CanonicalDecode::decode(r)?,
			},
			3 => WithdrawCondition::Option {
				optionor: CanonicalDecode::decode(r)?,
				optionee: CanonicalDecode::decode(r)?,
				strike_price: CanonicalDecode::decode(r)?,
				expiration: CanonicalDecode::decode(r)?,
			},
			_ => return Err(CodecError::MalformedEncoding),
		})
	}
}

/// A withdraw condition bound to an asset and an optional delegate vote.
/// The balance's address is the hash of this whole structure, so the same
/// owner voting for two delegates holds two distinct balances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceCondition {
	pub asset_id: AssetId,
	/// `DelegateVoteId(0)` casts no vote.
	pub vote_id: DelegateVoteId,
	pub condition: WithdrawCondition,
}

canonical_struct!(BalanceCondition { asset_id, vote_id, condition });

impl BalanceCondition {
	pub fn signature(owner: Address, asset_id: AssetId, vote_id: DelegateVoteId) -> Self {
		Self { asset_id, vote_id, condition: WithdrawCondition::Signature { owner } }
	}

	pub fn balance_id(&self) -> Address {
		address_hash(&self.to_bytes())
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceRecord {
	pub condition: BalanceCondition,
	pub balance: ShareAmount,
	pub last_update: Timestamp,
	pub deposit_date: Timestamp,
}

canonical_struct!(BalanceRecord { condition, balance, last_update, deposit_date });

impl BalanceRecord {
	pub fn new(condition: BalanceCondition, now: Timestamp) -> Self {
		Self { condition, balance: 0, last_update: now, deposit_date: now }
	}

	pub fn balance_id(&self) -> Address {
		self.condition.balance_id()
	}

	pub fn asset_id(&self) -> AssetId {
		self.condition.asset_id
	}

	/// The sole controlling address, when the condition has one.
	pub fn owner(&self) -> Option<Address> {
		match &self.condition.condition {
			WithdrawCondition::Signature { owner } => Some(*owner),
			_ => None,
		}
	}

	pub fn key(id: &Address) -> Vec<u8> {
		id.0.to_vec()
	}
}
