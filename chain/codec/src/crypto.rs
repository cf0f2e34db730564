use obol_primitives::Address;
use secp256k1::{
	ecdsa::{RecoverableSignature, RecoveryId},
	Message,
};

pub use secp256k1::{PublicKey, SecretKey, SECP256K1};

use crate::{
	digest::address_hash,
	encode::{ByteReader, CanonicalDecode, CanonicalEncode},
	CodecError,
};

/// 65-byte recoverable ECDSA signature: one recovery-id byte followed by the
/// 64-byte compact signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompactSignature(pub [u8; 65]);

impl std::fmt::Debug for CompactSignature {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "CompactSignature({})", hex::encode(self.0))
	}
}

impl CanonicalEncode for CompactSignature {
	fn encode(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&self.0);
	}
}

impl CanonicalDecode for CompactSignature {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		Ok(Self(r.take_array()?))
	}
}

impl CanonicalEncode for PublicKey {
	fn encode(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&self.serialize());
	}
}

impl CanonicalDecode for PublicKey {
	fn decode(r: &mut ByteReader) -> Result<Self, CodecError> {
		PublicKey::from_slice(r.take(33)?).map_err(|_| CodecError::MalformedEncoding)
	}
}

/// The address a key signs for.
pub fn key_address(key: &PublicKey) -> Address {
	address_hash(&key.serialize())
}

pub fn sign_compact(secret: &SecretKey, digest: &[u8; 32]) -> CompactSignature {
	let message = Message::from_digest(*digest);
	let (recovery_id, data) =
		SECP256K1.sign_ecdsa_recoverable(&message, secret).serialize_compact();
	let mut bytes = [0u8; 65];
	bytes[0] = recovery_id.to_i32() as u8;
	bytes[1..].copy_from_slice(&data);
	CompactSignature(bytes)
}

pub fn recover(signature: &CompactSignature, digest: &[u8; 32]) -> Result<PublicKey, CodecError> {
	let recovery_id = RecoveryId::from_i32(i32::from(signature.0[0]))
		.map_err(|_| CodecError::InvalidSignature)?;
	let recoverable = RecoverableSignature::from_compact(&signature.0[1..], recovery_id)
		.map_err(|_| CodecError::InvalidSignature)?;
	SECP256K1
		.recover_ecdsa(&Message::from_digest(*digest), &recoverable)
		.map_err(|_| CodecError::InvalidSignature)
}
