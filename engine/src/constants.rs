use std::time::Duration;

// ======= Settings environment variables =======

/// Prefix for environment overrides of settings file values, e.g.
/// `OBOL__NODE__DATA_DIRECTORY`.
pub const ENV_PREFIX: &str = "OBOL";
pub const ENV_SEPARATOR: &str = "__";

/// Base path for config and data when nothing else is given.
pub const CONFIG_ROOT: &str = "OBOL_CONFIG_ROOT";
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/obol";

// ======= Core task =======

/// How often the producer timer fires; slots are whole seconds, so finer
/// resolution buys nothing.
pub const PRODUCE_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on the core request channel; backpressure applies beyond this.
pub const CORE_CHANNEL_CAPACITY: usize = 1_024;

/// Default mempool budget in encoded transaction bytes.
pub const DEFAULT_MEMPOOL_BYTES: usize = 8 * 1024 * 1024;

/// Fraction of the slot the producer may spend building a candidate before
/// abandoning it, in milliseconds per interval second.
pub const PRODUCE_DEADLINE_MS_PER_SECOND: u64 = 500;
