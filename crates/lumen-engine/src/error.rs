use lumen_events::{AssetId, ItemId, ObjectId};
use std::any::Any;
use std::path::PathBuf;

/// Fault raised while executing one instance. Fatal to that instance only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmFault {
    #[error("operand stack overflow ({depth} values)")]
    StackOverflow { depth: usize },

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("invalid opcode {opcode:#04x} at {ip:#x}")]
    InvalidOpcode { opcode: u8, ip: usize },

    #[error("instruction pointer {0:#x} is outside the bytecode")]
    IpOutOfBounds(usize),

    #[error("constant {0} does not exist")]
    BadConstant(u64),

    #[error("state {0} does not exist")]
    BadState(u64),

    #[error("{0}")]
    Script(String),

    #[error("interpreter panicked: {0}")]
    Panic(String),
}

/// Compiler front end rejection
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("script defines no states")]
    NoStates,

    #[error("script source is not valid UTF-8")]
    InvalidEncoding,
}

/// Failure of a single load request. The request is consumed; nothing retries it.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("object {object} for item {item} was not found")]
    ObjectNotFound { item: ItemId, object: ObjectId },

    #[error("item {0} has no script asset")]
    NoAsset(ItemId),

    #[error("item {0} is already running")]
    AlreadyRunning(ItemId),

    #[error("asset {0} was not found")]
    AssetNotFound(AssetId),

    #[error("asset {0} is not script source")]
    InvalidAsset(AssetId),

    #[error("asset {asset} failed to compile: {source}")]
    Compile {
        asset: AssetId,
        #[source]
        source: CompileError,
    },

    #[error("compiled unit for {asset} is unreadable: {reason}")]
    CorruptUnit { asset: AssetId, reason: String },

    #[error("compiled cache I/O on {path}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("asset fetch for {asset} failed: {reason}")]
    Fetch { asset: AssetId, reason: String },
}

/// Durable store failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store encoding: {0}")]
    Encode(#[from] bincode::Error),

    #[error("state store record at offset {offset} is corrupt: {reason}")]
    Corrupt { offset: u64, reason: String },
}

/// Snapshot could not be persisted. The instance stays dirty and is retried.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to serialize state for {item}: {source}")]
    Serialize {
        item: ItemId,
        #[source]
        source: bincode::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found at {0}")]
    NotFound(PathBuf),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine lifecycle failures, including the scheduler-fatal class
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyStarted,

    #[error("engine is not running")]
    NotRunning,

    #[error("engine terminated after a scheduler fault")]
    Terminated,

    #[error("failed to start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("scheduler fault: {0}")]
    SchedulerFault(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
