//! Deployment constants and environment variable names.
//!
//! Defaults match the reference deployment; production overrides the socket
//! path and the pre-shared key via the environment.

use std::time::Duration;

/// Well-known IPC socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/scheduler.sock";

/// Pre-shared IPC key. Deployments should override via `HETSCHED_KEY`.
pub const DEFAULT_AUTH_KEY: &str = "lemon";

/// Client refreshes its strategy snapshot every this many submissions.
pub const DEFAULT_BATCH_REFRESH: u64 = 20;

/// Bounded concurrency for batch dispatch.
pub const DEFAULT_POOL_WORKERS: usize = 8;

/// Telemetry sweep period.
pub const TELEMETRY_TICK: Duration = Duration::from_millis(100);

/// Wall-clock budget for the dynamic strategy search before it falls back
/// to the static policy.
pub const DEFAULT_SEARCH_BUDGET: Duration = Duration::from_secs(1);

pub const ENV_SOCKET: &str = "HETSCHED_SOCKET";
pub const ENV_KEY: &str = "HETSCHED_KEY";
pub const ENV_DEVICES: &str = "HETSCHED_DEVICES";

/// Default roster when `HETSCHED_DEVICES` is unset.
pub const DEFAULT_ROSTER: &str = "GPU:0,CPU:0";
