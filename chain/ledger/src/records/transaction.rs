use obol_codec::{
	canonical_struct, key_address, recover, sha256, ByteReader, CanonicalDecode, CanonicalEncode,
	CodecError, CompactSignature, PublicKey,
};
use obol_primitives::{
	AccountId, Address, AssetAmount, AssetId, DelegateVoteId, Price, ShareAmount, Timestamp,
	TransactionId,
};

use super::market::MarketIndex;

/// One ledger mutation. Market amounts are signed: a negative bid/ask/short
/// amount cancels that much of an existing order back to its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
	Withdraw {
		balance_id: Address,
		amount: ShareAmount,
		/// Password preimage for password-conditioned balances.
		claim_input: Vec<u8>,
	},
	Deposit {
		amount: ShareAmount,
		condition: super::balance::BalanceCondition,
	},
	RegisterAccount {
		name: String,
		owner_key: PublicKey,
		active_key: PublicKey,
		as_delegate: bool,
	},
	UpdateAccount {
		account_id: AccountId,
		active_key: Option<PublicKey>,
	},
	CreateAsset {
		symbol: String,
		name: String,
		description: String,
		issuer: AccountId,
		precision: u64,
		maximum_supply: ShareAmount,
	},
	UpdateAsset {
		asset_id: AssetId,
		description: Option<String>,
		issuer: Option<AccountId>,
	},
	IssueAsset {
		amount: AssetAmount,
	},
	Bid {
		amount: ShareAmount,
		index: MarketIndex,
	},
	Ask {
		amount: ShareAmount,
		index: MarketIndex,
	},
	Short {
		amount: ShareAmount,
		index: MarketIndex,
		limit: Option<Price>,
	},
	Cover {
		amount: ShareAmount,
		index: MarketIndex,
	},
	PublishFeed {
		delegate: AccountId,
		asset_id: AssetId,
		price: Price,
	},
}

impl CanonicalEncode for Operation {
	fn encode(&self, out: &mut Vec<u8>) {
		match self {
			Operation::Withdraw { balance_id, amount, claim_input } => {
				out.push(0);
				balance_id.encode(out);
				amount.encode(out);
				(claim_input.len() as u32).encode(out);
				out.extend_from_slice(claim_input);
			},
			Operation::Deposit { amount, condition } => {
				out.push(1);
				amount.encode(out);
				condition.encode(out);
			},
			Operation::RegisterAccount { name, owner_key, active_key, as_delegate } => {
				out.push(2);
				name.encode(out);
				owner_key.encode(out);
				active_key.encode(out);
				as_delegate.encode(out);
			},
			Operation::UpdateAccount { account_id, active_key } => {
				out.push(3);
				account_id.encode(out);
				active_key.encode(out);
			},
			Operation::CreateAsset {
				symbol,
				name,
				description,
				issuer,
				precision,
				maximum_supply,
			} => {
				out.push(4);
				symbol.encode(out);
				name.encode(out);
				description.encode(out);
				issuer.encode(out);
				precision.encode(out);
				maximum_supply.encode(out);
			},
			Operation::UpdateAsset { asset_id, description, issuer } => {
				out.push(5);
				asset_id.encode(out);
				description.encode(out);
				issuer.encode(out);
			},
			Operation::IssueAsset { amount } => {
				out.push(6);
				amount.encode(out);
			},
			Operation::Bid { amount, index } => {
				out.push(7);
				amount.encode(out);
				index.encode(out);
			},
			Operation::Ask { amount, index } => {
				out.push(8);
				amount.encode(out);
				index.encode(out);
			},
			Operation::Short { amount, index, limit } => {
				out.push(9);
				amount.encode(out);
				index.encode(out);
				limit.encode(out);
			},
			Operation::Cover { amount, index } => {
				out.push(10);
				amount.encode(out);
				index.encode(out);
			},
			Operation::PublishFeed { delegate, asset_id, price } => {
				out.push(11);
				delegate.encode(out);
				asset_id.encode(out);
				price.encode(out);
			},
		}
	}
}

impl CanonicalDecode for Operation {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		Ok(match r.take(1)?[0] {
			0 => {
				let balance_id = CanonicalDecode::decode(r)?;
				let amount = CanonicalDecode::decode(r)?;
				let len = u32::decode(r)? as usize;
				Operation::Withdraw { balance_id, amount, claim_input: r.take(len)?.to_vec() }
			},
			1 => Operation::Deposit {
				amount: CanonicalDecode::decode(r)?,
				condition: CanonicalDecode::decode(r)?,
			},
			2 => Operation::RegisterAccount {
				name: CanonicalDecode::decode(r)?,
				owner_key: CanonicalDecode::decode(r)?,
				active_key: CanonicalDecode::decode(r)?,
				as_delegate: CanonicalDecode::decode(r)?,
			},
			3 => Operation::UpdateAccount {
				account_id: CanonicalDecode::decode(r)?,
				active_key: CanonicalDecode::decode(r)?,
			},
			4 => Operation::CreateAsset {
				symbol: CanonicalDecode::decode(r)?,
				name: CanonicalDecode::decode(r)?,
				description: CanonicalDecode::decode(r)?,
				issuer: CanonicalDecode::decode(r)?,
				precision: CanonicalDecode::decode(r)?,
				maximum_supply: CanonicalDecode::decode(r)?,
			},
			5 => Operation::UpdateAsset {
				asset_id: CanonicalDecode::decode(r)?,
				description: CanonicalDecode::decode(r)?,
				issuer: CanonicalDecode::decode(r)?,
			},
			6 => Operation::IssueAsset { amount: CanonicalDecode::decode(r)? },
			7 => Operation::Bid {
				amount: CanonicalDecode::decode(r)?,
				index: CanonicalDecode::decode(r)?,
			},
			8 => Operation::Ask {
				amount: CanonicalDecode::decode(r)?,
				index: CanonicalDecode::decode(r)?,
			},
			9 => Operation::Short {
				amount: CanonicalDecode::decode(r)?,
				index: CanonicalDecode::decode(r)?,
				limit: CanonicalDecode::decode(r)?,
			},
			10 => Operation::Cover {
				amount: CanonicalDecode::decode(r)?,
				index: CanonicalDecode::decode(r)?,
			},
			11 => Operation::PublishFeed {
				delegate: CanonicalDecode::decode(r)?,
				asset_id: CanonicalDecode::decode(r)?,
				price: CanonicalDecode::decode(r)?,
			},
			_ => return Err(CodecError::MalformedEncoding),
		})
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
	pub expiration: Timestamp,
	/// Vote under which required deposits (option exercises) must land.
	pub vote_id: DelegateVoteId,
	pub operations: Vec<Operation>,
}

canonical_struct!(Transaction { expiration, vote_id, operations });

impl Transaction {
	/// The digest signatures commit to: SHA-256 of the unsigned encoding.
	pub fn digest(&self) -> [u8; 32] {
		sha256(&self.to_bytes())
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTransaction {
	pub transaction: Transaction,
	pub signatures: Vec<CompactSignature>,
}

canonical_struct!(SignedTransaction { transaction, signatures });

impl SignedTransaction {
	/// Signatures are part of the id: the same payload signed twice is two
	/// distinct transactions for dedup purposes.
	pub fn id(&self) -> TransactionId {
		TransactionId(obol_codec::id_hash(&self.to_bytes()))
	}

	pub fn sign(&mut self, secret: &obol_codec::SecretKey) {
		self.signatures.push(obol_codec::sign_compact(secret, &self.transaction.digest()));
	}

	/// Deduplicated addresses recovered from the signature set.
	pub fn signers(&self) -> Result<std::collections::BTreeSet<Address>, CodecError> {
		let digest = self.transaction.digest();
		self.signatures
			.iter()
			.map(|signature| Ok(key_address(&recover(signature, &digest)?)))
			.collect()
	}

	pub fn encoded_size(&self) -> usize {
		self.to_bytes().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use obol_codec::{SecretKey, SECP256K1};

	fn secret(seed: u8) -> SecretKey {
		SecretKey::from_slice(&[seed; 32]).unwrap()
	}

	fn transfer() -> Transaction {
		Transaction {
			expiration: Timestamp(1_000),
			vote_id: DelegateVoteId(0),
			operations: vec![Operation::Withdraw {
				balance_id: Address([1; 20]),
				amount: 500,
				claim_input: vec![],
			}],
		}
	}

	#[test]
	fn operations_round_trip() {
		let ops = vec![
			Operation::Withdraw {
				balance_id: Address([1; 20]),
				amount: 9,
				claim_input: b"pw".to_vec(),
			},
			Operation::IssueAsset { amount: AssetAmount::new(5, AssetId(2)) },
			Operation::Short {
				amount: 100,
				index: MarketIndex {
					price: Price::one(AssetId(1), AssetId(0)),
					owner: Address([3; 20]),
				},
				limit: Some(Price::one(AssetId(1), AssetId(0))),
			},
			Operation::PublishFeed {
				delegate: AccountId(4),
				asset_id: AssetId(1),
				price: Price::one(AssetId(1), AssetId(0)),
			},
		];
		for op in ops {
			assert_eq!(Operation::from_bytes(&op.to_bytes()).unwrap(), op);
		}
	}

	#[test]
	fn signing_adds_recoverable_signer() {
		let mut tx = SignedTransaction { transaction: transfer(), signatures: vec![] };
		tx.sign(&secret(5));
		let expected = key_address(&secret(5).public_key(SECP256K1));
		assert_eq!(tx.signers().unwrap().into_iter().collect::<Vec<_>>(), vec![expected]);
	}

	#[test]
	fn id_covers_signatures() {
		let mut a = SignedTransaction { transaction: transfer(), signatures: vec![] };
		let unsigned_id = a.id();
		a.sign(&secret(5));
		assert_ne!(a.id(), unsigned_id);
		// But the signing digest does not, so more signatures can be added.
		assert_eq!(a.transaction.digest(), transfer().digest());
	}
}
