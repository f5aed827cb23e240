use std::path::PathBuf;

/// Cluster- and node-level tunables. Defaults match the reference values
/// called out alongside the RPC surface and log format.
#[derive(Clone, Debug)]
pub struct Config {
	/// Base election timeout in milliseconds; the actual, per-reset timeout
	/// is drawn uniformly from `[election_timeout_ms, 2 * election_timeout_ms)`.
	pub election_timeout_ms: u64,

	/// Per-RPC deadline, for both peer replication traffic and client Save
	/// calls, in milliseconds.
	pub request_timeout_ms: u64,

	/// Byte cap on the entries carried by a single AppendEntries.
	pub max_entries_size: usize,

	/// Client-side retry bound per `SubmitData` call.
	pub num_retries: u32,

	/// Backoff before retrying a peer connection that just failed, in
	/// milliseconds.
	pub reopen_connection_interval_ms: u64,

	/// Log block size in bytes. Format-level; chosen at cluster creation and
	/// immutable afterwards. Production deployments want something like 64
	/// KiB; tests use small values (e.g. 160) to exercise straddling
	/// records cheaply.
	pub block_size: u64,

	/// Directory holding this node's log file and durable state file.
	pub data_dir: PathBuf,
}

impl Config {
	pub fn new(data_dir: impl Into<PathBuf>) -> Self {
		Config { data_dir: data_dir.into(), ..Config::default() }
	}
}

impl Default for Config {
	fn default() -> Self {
		Config {
			election_timeout_ms: 1000,
			request_timeout_ms: 120_000,
			max_entries_size: 1_048_576,
			num_retries: 5,
			reopen_connection_interval_ms: 5000,
			block_size: 65536,
			data_dir: PathBuf::from("."),
		}
	}
}
