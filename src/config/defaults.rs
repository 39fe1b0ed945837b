//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Scheduler
// ============================================================================

/// Delay between the end of one backfill cycle and the start of the next (seconds).
pub const SCHEDULER_INTERVAL_SECS: u64 = 10;

/// Environment variable overriding `scheduler.interval_secs`.
pub const INTERVAL_ENV_VAR: &str = "CLEARWELL_INTERVAL_SECS";

// ============================================================================
// Scanner
// ============================================================================

/// Most recent sensor readings examined per cycle.
pub const SCAN_WINDOW_LIMIT: usize = 8_000;

// ============================================================================
// Pipeline
// ============================================================================

/// Records processed concurrently within a cycle. 1 = sequential.
pub const MAX_CONCURRENT_RECORDS: usize = 4;

/// Upper bound accepted for `pipeline.max_concurrent_records`.
pub const MAX_CONCURRENT_RECORDS_LIMIT: usize = 64;

/// Timeout applied to every store call (milliseconds).
pub const STORE_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// Storage / Models
// ============================================================================

pub const STORAGE_PATH: &str = "./data/clearwell.db";

pub const MODELS_DIR: &str = "./models";

/// Environment variable naming the TOML config file.
pub const CONFIG_ENV_VAR: &str = "CLEARWELL_CONFIG";

/// Config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "clearwell.toml";

// ============================================================================
// HTTP API
// ============================================================================

pub const SERVER_ADDR: &str = "0.0.0.0:8080";

/// Rows returned by a history query when no `limit` is given.
pub const HISTORY_DEFAULT_LIMIT: usize = 500;

/// Default page for `/api/v1/history/:kind` (manual predictions).
pub const MANUAL_HISTORY_DEFAULT_LIMIT: usize = 50;

/// Largest `limit` a history query may request.
pub const HISTORY_MAX_LIMIT: usize = 10_000;
