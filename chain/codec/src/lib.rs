//! The one canonical byte encoding of the chain, plus the digest and
//! signature primitives built on it.
//!
//! Every replica must produce byte-identical encodings: block and
//! transaction ids are digests of these bytes, and signatures commit to
//! them. Anything order- or width-dependent lives here and nowhere else.

pub mod crypto;
pub mod digest;
pub mod encode;

pub use crypto::{key_address, recover, sign_compact, CompactSignature, PublicKey, SecretKey, SECP256K1};
pub use digest::{address_hash, id_hash, ripemd160, sha256, sha512};
pub use encode::{ByteReader, CanonicalDecode, CanonicalEncode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
	#[error("malformed encoding")]
	MalformedEncoding,
	#[error("invalid signature")]
	InvalidSignature,
}
