use obol_codec::CodecError;
use obol_primitives::ArithmeticError;
use obol_store::StoreError;

/// Every rule violation the core can surface. Arithmetic and encoding
/// failures are folded in so `?` composes across the crates.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
	#[error("malformed encoding")]
	MalformedEncoding,
	#[error("invalid signature")]
	InvalidSignature,
	#[error("duplicate transaction")]
	DuplicateTransaction,
	#[error("transaction expired or expires too far in the future")]
	ExpiredOrTooFarFuture,
	#[error("insufficient funds")]
	InsufficientFunds,
	#[error("missing required deposit")]
	MissingRequiredDeposit,
	#[error("missing required signature")]
	MissingRequiredSignature,
	#[error("insufficient fee")]
	InsufficientFee,
	#[error("delegate vote limit exceeded")]
	DelegateVoteLimit,
	#[error("unknown account")]
	UnknownAccount,
	#[error("unknown asset")]
	UnknownAsset,
	#[error("asset symbol already registered")]
	AssetAlreadyRegistered,
	#[error("account name already registered")]
	NameAlreadyRegistered,
	#[error("maximum supply exceeded")]
	SupplyExceeded,
	#[error("invalid order cancel")]
	InvalidCancel,
	#[error("insufficient price feeds")]
	InsufficientFeeds,
	#[error("insufficient market depth")]
	InsufficientDepth,
	#[error("fork exceeds maximum rewind depth")]
	ForkTooDeep,
	#[error("invalid block: {0}")]
	InvalidBlock(String),
	#[error(transparent)]
	Arithmetic(#[from] ArithmeticError),
	#[error(transparent)]
	Store(#[from] StoreError),
	/// An internal consistency check failed; the enclosing unit of work
	/// (transaction, market pair or block) must be discarded.
	#[error("protocol violation: {0}")]
	ProtocolViolation(String),
}

impl From<CodecError> for ChainError {
	fn from(e: CodecError) -> Self {
		match e {
			CodecError::MalformedEncoding => ChainError::MalformedEncoding,
			CodecError::InvalidSignature => ChainError::InvalidSignature,
		}
	}
}

impl ChainError {
	/// Short stable tag used in market status diagnostics and submit
	/// responses.
	pub fn kind(&self) -> &'static str {
		match self {
			ChainError::MalformedEncoding => "malformed_encoding",
			ChainError::InvalidSignature => "invalid_signature",
			ChainError::DuplicateTransaction => "duplicate_transaction",
			ChainError::ExpiredOrTooFarFuture => "expired_or_too_far_future",
			ChainError::InsufficientFunds => "insufficient_funds",
			ChainError::MissingRequiredDeposit => "missing_required_deposit",
			ChainError::MissingRequiredSignature => "missing_required_signature",
			ChainError::InsufficientFee => "insufficient_fee",
			ChainError::DelegateVoteLimit => "delegate_vote_limit",
			ChainError::UnknownAccount => "unknown_account",
			ChainError::UnknownAsset => "unknown_asset",
			ChainError::AssetAlreadyRegistered => "asset_already_registered",
			ChainError::NameAlreadyRegistered => "name_already_registered",
			ChainError::SupplyExceeded => "supply_exceeded",
			ChainError::InvalidCancel => "invalid_cancel",
			ChainError::InsufficientFeeds => "insufficient_feeds",
			ChainError::InsufficientDepth => "insufficient_depth",
			ChainError::ForkTooDeep => "fork_too_deep",
			ChainError::InvalidBlock(_) => "invalid_block",
			ChainError::Arithmetic(ArithmeticError::AdditionOverflow) => "addition_overflow",
			ChainError::Arithmetic(ArithmeticError::SubtractionOverflow) =>
				"subtraction_overflow",
			ChainError::Arithmetic(ArithmeticError::PriceMultiplicationOverflow) =>
				"price_multiplication_overflow",
			ChainError::Arithmetic(ArithmeticError::PriceMultiplicationUnderflow) =>
				"price_multiplication_underflow",
			ChainError::Arithmetic(ArithmeticError::AssetDivideByZero) => "asset_divide_by_zero",
			ChainError::Arithmetic(ArithmeticError::AssetDivideBySelf) => "asset_divide_by_self",
			ChainError::Arithmetic(ArithmeticError::AssetTypeMismatch) => "asset_type_mismatch",
			ChainError::Store(_) => "store_error",
			ChainError::ProtocolViolation(_) => "protocol_violation",
		}
	}
}
