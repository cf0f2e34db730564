use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::constants::{DEFAULT_MEMPOOL_BYTES, ENV_PREFIX, ENV_SEPARATOR};

#[derive(Debug, Deserialize, Clone)]
pub struct Node {
	pub data_directory: PathBuf,
	/// Endpoint handed to the (external) network layer.
	pub listen_endpoint: String,
	#[serde(default)]
	pub peer_bootstrap: Vec<String>,
	pub genesis_path: PathBuf,
	#[serde(default = "default_mempool_bytes")]
	pub mempool_max_bytes: usize,
}

fn default_mempool_bytes() -> usize {
	DEFAULT_MEMPOOL_BYTES
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Delegate {
	/// Hex-encoded 32-byte signing secrets for the delegate accounts this
	/// node produces for. Empty on a non-producing node.
	#[serde(default)]
	pub keys: Vec<String>,
}

/// Node-local settings. Consensus parameters live in the genesis file, not
/// here: two nodes may disagree about mempool sizing but never about rules.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub node: Node,
	#[serde(default)]
	pub delegate: Delegate,
}

impl Settings {
	/// Layered load: `settings.toml` under the config root, then
	/// `OBOL__`-prefixed environment overrides.
	pub fn load(config_root: &Path) -> Result<Settings, ConfigError> {
		Config::builder()
			.add_source(File::from(config_root.join("settings.toml")).required(true))
			.add_source(Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
			.build()?
			.try_deserialize()
	}
}
