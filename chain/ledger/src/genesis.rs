use obol_codec::{id_hash, key_address, PublicKey};
use obol_primitives::{
	AccountId, BlockId, ChainConfig, DelegateVoteId, ShareAmount, Timestamp, NATIVE_ASSET_ID,
};
use serde::{Deserialize, Serialize};

use crate::{
	error::ChainError,
	family::Family,
	records::{
		AccountRecord, AssetRecord, BalanceCondition, BalanceRecord, ChainHead, DelegateStats,
	},
	state::{ChainReadExt, ChainState, PendingState, META_CONFIG, META_DELEGATES, META_HEAD},
};

/// The file every replica starts from. Its serialized bytes define the
/// chain id, so two nodes with the same genesis converge on the same chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
	pub timestamp: Timestamp,
	pub chain: ChainConfig,
	pub native_symbol: String,
	pub native_name: String,
	pub native_precision: u64,
	pub native_maximum_supply: ShareAmount,
	pub accounts: Vec<GenesisAccount>,
	pub balances: Vec<GenesisBalance>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
	pub name: String,
	/// Hex of the 33-byte compressed public key; used for both owner and
	/// active roles at genesis.
	pub owner_key: String,
	pub is_delegate: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisBalance {
	/// Name of a genesis account the balance belongs to.
	pub account: String,
	pub amount: ShareAmount,
}

impl GenesisConfig {
	pub fn chain_id(&self) -> Result<BlockId, ChainError> {
		let bytes = serde_json::to_vec(self)
			.map_err(|e| ChainError::ProtocolViolation(format!("unencodable genesis: {e}")))?;
		Ok(BlockId(id_hash(&bytes)))
	}

	pub fn from_json(bytes: &[u8]) -> Result<GenesisConfig, ChainError> {
		serde_json::from_slice(bytes).map_err(|_| ChainError::MalformedEncoding)
	}
}

fn parse_key(hex_key: &str) -> Result<PublicKey, ChainError> {
	let bytes = hex::decode(hex_key).map_err(|_| ChainError::MalformedEncoding)?;
	PublicKey::from_slice(&bytes).map_err(|_| ChainError::MalformedEncoding)
}

/// Seed an empty state from the genesis file. Fails if the state already
/// has a head.
pub fn initialize(state: &ChainState, genesis: &GenesisConfig) -> Result<ChainHead, ChainError> {
	if state.head()?.is_some() {
		return Err(ChainError::ProtocolViolation("state already initialized".into()))
	}

	let mut pending = PendingState::new(state);
	let mut supply: ShareAmount = 0;
	let mut delegates = Vec::new();

	for (i, account) in genesis.accounts.iter().enumerate() {
		if !AccountRecord::is_valid_name(&account.name) {
			return Err(ChainError::MalformedEncoding)
		}
		if pending.account_id_by_name(&account.name)?.is_some() {
			return Err(ChainError::NameAlreadyRegistered)
		}
		let key = parse_key(&account.owner_key)?;
		// Account id 0 is reserved: a vote id's magnitude is the delegate's
		// account id, and magnitude zero means "no vote".
		let id = AccountId(i as u32 + 1);
		let record = AccountRecord {
			id,
			name: account.name.clone(),
			owner_key: key,
			active_key: key,
			registration_date: genesis.timestamp,
			last_update: genesis.timestamp,
			delegate: account.is_delegate.then(DelegateStats::default),
		};
		if account.is_delegate {
			delegates.push(id);
		}
		pending.put_record(Family::Accounts, AccountRecord::key(id), &record);
		pending.put_record(
			Family::AccountIndexByName,
			AccountRecord::name_key(&account.name),
			&id,
		);
		pending.put_record(Family::AccountIndexByKey, key_address(&key).0.to_vec(), &id);
	}

	if delegates.is_empty() {
		return Err(ChainError::ProtocolViolation("genesis has no delegates".into()))
	}

	for balance in &genesis.balances {
		let account = pending
			.get_account_by_name(&balance.account)?
			.ok_or(ChainError::UnknownAccount)?;
		if balance.amount <= 0 {
			return Err(ChainError::MalformedEncoding)
		}
		let condition = BalanceCondition::signature(
			key_address(&account.owner_key),
			NATIVE_ASSET_ID,
			DelegateVoteId(0),
		);
		let balance_id = condition.balance_id();
		let mut record = pending
			.get_balance(&balance_id)?
			.unwrap_or_else(|| BalanceRecord::new(condition, genesis.timestamp));
		record.balance = record
			.balance
			.checked_add(balance.amount)
			.ok_or(obol_primitives::ArithmeticError::AdditionOverflow)?;
		supply = supply
			.checked_add(balance.amount)
			.ok_or(obol_primitives::ArithmeticError::AdditionOverflow)?;
		pending.put_record(Family::Balances, BalanceRecord::key(&balance_id), &record);
	}

	// Issuer 0 is the reserved network account: the native asset can never
	// be issued or reissued by anyone.
	let native = AssetRecord {
		id: NATIVE_ASSET_ID,
		symbol: genesis.native_symbol.clone(),
		name: genesis.native_name.clone(),
		description: String::new(),
		issuer: AccountId(0),
		precision: genesis.native_precision,
		registration_date: genesis.timestamp,
		last_update: genesis.timestamp,
		current_supply: supply,
		maximum_supply: genesis.native_maximum_supply,
		collected_fees: 0,
	};
	if native.current_supply > native.maximum_supply {
		return Err(ChainError::SupplyExceeded)
	}
	pending.put_record(Family::Assets, AssetRecord::key(NATIVE_ASSET_ID), &native);
	pending.put_record(
		Family::AssetIndexBySymbol,
		AssetRecord::symbol_key(&genesis.native_symbol),
		&NATIVE_ASSET_ID,
	);

	let head =
		ChainHead { number: 0, id: genesis.chain_id()?, timestamp: genesis.timestamp };
	pending.put_record(Family::Meta, META_HEAD.to_vec(), &head);
	// The genesis id doubles as the block-0 entry so fork walks terminate.
	pending.put_record(
		Family::BlocksByNum,
		crate::records::Block::key_by_num(0),
		&head.id,
	);
	pending.put_record(Family::Meta, META_DELEGATES.to_vec(), &delegates);
	pending.put(
		Family::Meta,
		META_CONFIG.to_vec(),
		serde_json::to_vec(&genesis.chain)
			.map_err(|e| ChainError::ProtocolViolation(format!("unencodable config: {e}")))?,
	);

	state.commit_writes(pending.into_writes())?;
	Ok(head)
}
