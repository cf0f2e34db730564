use obol_primitives::Address;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
	Sha256::digest(bytes).into()
}

pub fn sha512(bytes: &[u8]) -> [u8; 64] {
	Sha512::digest(bytes).into()
}

pub fn ripemd160(bytes: &[u8]) -> [u8; 20] {
	Ripemd160::digest(bytes).into()
}

/// The 160-bit id digest used for transactions, blocks and revealed
/// secrets: RIPEMD-160 over SHA-512 of the canonical encoding.
pub fn id_hash(bytes: &[u8]) -> [u8; 20] {
	ripemd160(&sha512(bytes))
}

/// An address is RIPEMD-160 over SHA-256 of the serialized public key (or
/// of a withdraw condition's canonical encoding, for balance ids).
pub fn address_hash(bytes: &[u8]) -> Address {
	Address(ripemd160(&sha256(bytes)))
}
