use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber: JSON lines to stdout,
/// filtered by `RUST_LOG` (default `info`). Call exactly once from main.
pub fn init() {
	tracing_subscriber::fmt()
		.json()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();
}

#[cfg(test)]
pub mod test_utils {
	/// Plain, non-JSON output for test runs; ignores double-init so every
	/// test can call it.
	pub fn init_test_logger() {
		let _ = tracing_subscriber::fmt().with_test_writer().try_init();
	}
}
