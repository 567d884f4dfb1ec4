//! Runtime core of the lumen in-world script engine
//!
//! A single scheduling thread ([`driver`]) interleaves the cooperative
//! scheduler ([`scheduler::ExecutionCore`]) with the load pipeline
//! ([`loader::LoadPipeline`]). Snapshots are written by a separate
//! persistence thread ([`persistence::PersistenceManager`]). Hosts talk to
//! all of it through [`Engine`].

pub mod clock;
pub mod config;
pub mod deferred;
pub mod driver;
pub mod engine;
pub mod error;
pub mod heap;
pub mod host;
pub mod loader;
pub mod persistence;
pub mod requests;
pub mod runtime;
pub mod scheduler;
pub mod signal;
pub mod unit;
pub mod vm;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{BuildError, Engine, EngineBuilder, EngineStats};
pub use error::{CompileError, EngineError, LoadError, PersistError, StoreError, VmFault};
pub use host::{AssetKind, AssetSource, CommChannel, Compiler, FaultSink, ScriptAsset, ScriptHost};
pub use loader::{LoadRequest, StateSource};
pub use requests::{StateData, StateDataRequest, StateForm, StateSnapshot};
pub use runtime::{LocalDisable, RunState, RuntimeState};
pub use unit::CompiledUnit;
