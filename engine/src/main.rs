use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use obol_codec::SecretKey;
use obol_engine::{
	constants::{CONFIG_ROOT, CORE_CHANNEL_CAPACITY, DEFAULT_CONFIG_ROOT, PRODUCE_TICK_INTERVAL},
	logging,
	mempool::MemPool,
	node::{CoreRequest, Node, SystemClock},
	producer::Producer,
	settings::Settings,
};
use obol_ledger::{ChainDatabase, GenesisConfig};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[clap(version, about = "Obol chain node")]
struct Opts {
	/// Directory holding settings.toml (and usually the genesis file).
	#[clap(long = "config-root", env = CONFIG_ROOT, default_value = DEFAULT_CONFIG_ROOT)]
	config_root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
	logging::init();
	let opts = Opts::parse();
	let settings = Settings::load(&opts.config_root)
		.with_context(|| format!("loading settings from {}", opts.config_root.display()))?;

	let genesis_bytes = std::fs::read(&settings.node.genesis_path)
		.with_context(|| format!("reading {}", settings.node.genesis_path.display()))?;
	let genesis = GenesisConfig::from_json(&genesis_bytes).context("parsing genesis file")?;

	let db = ChainDatabase::open(&settings.node.data_directory, &genesis)
		.context("opening chain database")?;
	let head = db.head().context("reading head")?;
	tracing::info!(number = head.number, id = %head.id, "chain database open");

	let secrets = settings
		.delegate
		.keys
		.iter()
		.map(|hex_key| {
			let bytes = hex::decode(hex_key).context("delegate key is not hex")?;
			SecretKey::from_slice(&bytes).context("delegate key is not a valid secret")
		})
		.collect::<Result<Vec<_>>>()?;
	let producer = Producer::new(&db, &secrets).context("resolving delegate keys")?;
	let mempool = MemPool::new(settings.node.mempool_max_bytes);

	// The network layer (out of process here) consumes these broadcasts
	// and feeds the request channel.
	let (outbound_tx, mut outbound_rx) = mpsc::channel(CORE_CHANNEL_CAPACITY);
	let (request_tx, request_rx) = mpsc::channel(CORE_CHANNEL_CAPACITY);

	tokio::spawn(async move {
		while let Some(message) = outbound_rx.recv().await {
			// Placeholder sink until a gossip layer is attached.
			tracing::debug!("broadcast ready: {:?}", std::mem::discriminant(&message));
		}
	});

	let ticker_tx = request_tx.clone();
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(PRODUCE_TICK_INTERVAL);
		loop {
			interval.tick().await;
			if ticker_tx.send(CoreRequest::ProduceTick).await.is_err() {
				break
			}
		}
	});

	let shutdown_tx = request_tx.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::info!("shutdown signal received");
			let _ = shutdown_tx.send(CoreRequest::Shutdown).await;
		}
	});

	tracing::info!(endpoint = %settings.node.listen_endpoint, "node running");
	Node::new(db, mempool, producer, Box::new(SystemClock), outbound_tx)
		.run(request_rx)
		.await;
	Ok(())
}
