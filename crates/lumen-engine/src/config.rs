use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the scheduler, loader and persistence subsystems.
///
/// Every field has a default so a partial `[engine]` table is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Instruction steps executed across all instances per scheduling pass
    #[serde(default = "default_instruction_frequency")]
    pub instruction_frequency: u32,

    /// Instruction steps given to one instance before moving to the next
    #[serde(default = "default_script_timeslice")]
    pub script_timeslice: u32,

    /// A single quantum longer than this is reported as slow
    #[serde(default = "default_slow_timeslice_ms")]
    pub slow_timeslice_ms: u64,

    /// Lifetime of a deferred bundle for a non-resident instance
    #[serde(default = "default_deferred_ttl_ms")]
    pub deferred_ttl_ms: u64,

    /// Events retained per deferred bundle; later ones are dropped
    #[serde(default = "default_max_deferred_events")]
    pub max_deferred_events: usize,

    /// Events retained in one instance's queue
    #[serde(default = "default_max_queued_events")]
    pub max_queued_events: usize,

    /// Operand stack depth before an instance faults
    #[serde(default = "default_max_operand_depth")]
    pub max_operand_depth: usize,

    /// Delay between repeated `touch` events while a touch is held
    #[serde(default = "default_touch_repeat_ms")]
    pub touch_repeat_ms: u64,

    /// Compiled units kept after their last instance unloads
    #[serde(default = "default_unloaded_cache_capacity")]
    pub unloaded_cache_capacity: usize,

    /// Characters of the asset id used as the compiled-cache shard directory
    #[serde(default = "default_cache_prefix_len")]
    pub cache_prefix_len: usize,

    /// Minimum spacing between two snapshots of the same instance
    #[serde(default = "default_save_interval_ms")]
    pub save_interval_ms: u64,

    /// Sleep of the persistence loop between cycles
    #[serde(default = "default_persistence_sleep_ms")]
    pub persistence_sleep_ms: u64,

    /// How often persistence statistics are logged
    #[serde(default = "default_persistence_report_ms")]
    pub persistence_report_ms: u64,

    /// Snapshot requests parked on a syscall longer than this are discarded
    #[serde(default = "default_syscall_timeout_ms")]
    pub syscall_timeout_ms: u64,

    /// Worker threads for long-running syscalls
    #[serde(default = "default_syscall_workers")]
    pub syscall_workers: usize,

    /// How long a blocking state request waits for the scheduler
    #[serde(default = "default_state_request_timeout_ms")]
    pub state_request_timeout_ms: u64,

    /// How long a blocking bytecode retrieval waits for the loader
    #[serde(default = "default_bytecode_request_timeout_ms")]
    pub bytecode_request_timeout_ms: u64,

    /// Compiled unit cache (default: <data>/lumen/cache)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Durable state store (default: <data>/lumen/states)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_instruction_frequency() -> u32 {
    48
}

fn default_script_timeslice() -> u32 {
    8
}

fn default_slow_timeslice_ms() -> u64 {
    250
}

fn default_deferred_ttl_ms() -> u64 {
    60_000
}

fn default_max_deferred_events() -> usize {
    32
}

fn default_max_queued_events() -> usize {
    64
}

fn default_max_operand_depth() -> usize {
    4096
}

fn default_touch_repeat_ms() -> u64 {
    100
}

fn default_unloaded_cache_capacity() -> usize {
    128
}

fn default_cache_prefix_len() -> usize {
    3
}

fn default_save_interval_ms() -> u64 {
    4 * 60 * 1000
}

fn default_persistence_sleep_ms() -> u64 {
    500
}

fn default_persistence_report_ms() -> u64 {
    5 * 60 * 1000
}

fn default_syscall_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_syscall_workers() -> usize {
    6
}

fn default_state_request_timeout_ms() -> u64 {
    5_000
}

fn default_bytecode_request_timeout_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instruction_frequency: default_instruction_frequency(),
            script_timeslice: default_script_timeslice(),
            slow_timeslice_ms: default_slow_timeslice_ms(),
            deferred_ttl_ms: default_deferred_ttl_ms(),
            max_deferred_events: default_max_deferred_events(),
            max_queued_events: default_max_queued_events(),
            max_operand_depth: default_max_operand_depth(),
            touch_repeat_ms: default_touch_repeat_ms(),
            unloaded_cache_capacity: default_unloaded_cache_capacity(),
            cache_prefix_len: default_cache_prefix_len(),
            save_interval_ms: default_save_interval_ms(),
            persistence_sleep_ms: default_persistence_sleep_ms(),
            persistence_report_ms: default_persistence_report_ms(),
            syscall_timeout_ms: default_syscall_timeout_ms(),
            syscall_workers: default_syscall_workers(),
            state_request_timeout_ms: default_state_request_timeout_ms(),
            bytecode_request_timeout_ms: default_bytecode_request_timeout_ms(),
            cache_dir: None,
            state_dir: None,
        }
    }
}

impl EngineConfig {
    /// Compiled unit cache directory (use provided or default)
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("cache"))
    }

    /// Durable state directory (use provided or default)
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("states"))
    }

    pub fn state_request_timeout(&self) -> Duration {
        Duration::from_millis(self.state_request_timeout_ms)
    }

    pub fn bytecode_request_timeout(&self) -> Duration {
        Duration::from_millis(self.bytecode_request_timeout_ms)
    }

    /// Config rooted in one directory, used by tests and throwaway regions
    pub fn rooted_at(dir: &std::path::Path) -> Self {
        Self {
            cache_dir: Some(dir.join("cache")),
            state_dir: Some(dir.join("states")),
            ..Self::default()
        }
    }
}

/// Platform data directory for lumen, falling back to a local dot directory
pub fn data_dir() -> PathBuf {
    ProjectDirs::from("", "", "lumen")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".lumen"))
}

/// Platform config directory for lumen
pub fn config_dir() -> PathBuf {
    ProjectDirs::from("", "", "lumen")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".lumen"))
}
