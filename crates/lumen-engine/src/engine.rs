//! The host-facing engine facade
//!
//! Wires the scheduler, loader and persistence together, owns the async
//! runtime used for asset fetches and long-running calls, and exposes the
//! operations a host simulator calls from any thread.

use lumen_events::{
    AssetId, DetectVariables, EnableDisableFlag, EngineCommand, ItemId, ObjectId, PostedEvent,
    StopScriptReason,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::driver::{Components, Driver, DriverHandle};
use crate::error::{EngineError, StoreError};
use crate::host::{
    AssetSource, CommChannel, Compiler, FaultSink, LogFaultSink, NullComm, ScriptHost,
};
use crate::loader::{LoadPipeline, LoadRequest, LoaderInbox};
use crate::persistence::{
    self, shared, JournalStore, PersistenceHandle, PersistenceManager, PersistenceStats,
    SharedStore,
};
use crate::requests::{
    wait_reply, EnabledDetail, Reply, RetrieveBytecodeRequest, ScriptInfoRequest,
    ScriptRunningInfo, StateData, StateDataRequest, StateForm,
};
use crate::scheduler::{CoreCollaborators, CoreInbox, ExecutionCore, SyscallPool};
use crate::signal::WorkSignal;
use crate::vm::{Assembler, BytecodeInterpreter, Interpreter};

/// Error during builder configuration
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Script host not specified - use .with_host()")]
    MissingHost,

    #[error("Asset source not specified - use .with_assets()")]
    MissingAssets,

    #[error("failed to open state store: {0}")]
    Store(#[from] StoreError),

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Counters collected when the engine stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub resident_instances: usize,
    pub loaded_units: usize,
    pub compilations: u64,
    pub fetches: u64,
    pub persistence: PersistenceStats,
}

/// Builder for Engine
pub struct EngineBuilder {
    config: EngineConfig,
    host: Option<Arc<dyn ScriptHost>>,
    assets: Option<Arc<dyn AssetSource>>,
    comm: Option<Box<dyn CommChannel>>,
    faults: Option<Arc<dyn FaultSink>>,
    compiler: Option<Arc<dyn Compiler>>,
    interpreter: Option<Arc<dyn Interpreter>>,
    clock: Option<SharedClock>,
    store: Option<SharedStore>,
}

impl EngineBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            host: None,
            assets: None,
            comm: None,
            faults: None,
            compiler: None,
            interpreter: None,
            clock: None,
            store: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Object and inventory model (required)
    pub fn with_host(mut self, host: Arc<dyn ScriptHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Asset service used on compiled cache misses (required)
    pub fn with_assets(mut self, assets: Arc<dyn AssetSource>) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Chat and listen plumbing (default: none)
    pub fn with_comm(mut self, comm: Box<dyn CommChannel>) -> Self {
        self.comm = Some(comm);
        self
    }

    /// Fault reporting (default: the log)
    pub fn with_fault_sink(mut self, faults: Arc<dyn FaultSink>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Compiler front end (default: the bytecode assembler)
    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Interpreter (default: the reference bytecode interpreter)
    pub fn with_interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    /// Time source (default: the system clock)
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Durable state store (default: a journal store in the state directory)
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the engine. Nothing runs until [`Engine::start`].
    pub fn build(self) -> Result<Engine, BuildError> {
        let host = self.host.ok_or(BuildError::MissingHost)?;
        let assets = self.assets.ok_or(BuildError::MissingAssets)?;
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => shared(JournalStore::open(&config.state_dir())?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(config.syscall_workers.max(1))
            .thread_name("lumen-worker")
            .enable_all()
            .build()
            .map_err(BuildError::Runtime)?;

        let signal = Arc::new(WorkSignal::new());
        let core_inbox = Arc::new(CoreInbox::new(signal.clone(), clock));
        let loader_inbox = Arc::new(LoaderInbox::new(signal));
        let (persistence_handle, persistence_rx) = persistence::channel();

        let interpreter = self
            .interpreter
            .unwrap_or_else(|| Arc::new(BytecodeInterpreter::new(config.max_operand_depth)));
        let core = ExecutionCore::new(
            config.clone(),
            CoreCollaborators {
                host: host.clone(),
                comm: self.comm.unwrap_or_else(|| Box::new(NullComm)),
                faults: self.faults.unwrap_or_else(|| Arc::new(LogFaultSink)),
                interpreter,
            },
            core_inbox.clone(),
            SyscallPool::new(runtime.handle().clone(), core_inbox.clone()),
            persistence_handle.clone(),
        );
        let pipeline = LoadPipeline::new(
            &config,
            loader_inbox.clone(),
            host.clone(),
            assets,
            self.compiler.unwrap_or_else(|| Arc::new(Assembler)),
            runtime.handle().clone(),
            store.clone(),
        );
        let manager = PersistenceManager::new(
            &config,
            &persistence_handle,
            persistence_rx,
            core_inbox.clone(),
            store,
        );

        Ok(Engine {
            config,
            host,
            core_inbox,
            loader_inbox,
            persistence_handle,
            lifecycle: Lifecycle::Built {
                components: Components { core, pipeline },
                manager,
            },
            runtime: Some(runtime),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum Lifecycle {
    Built {
        components: Components,
        manager: PersistenceManager,
    },
    Running {
        driver: DriverHandle,
        persistence: JoinHandle<PersistenceManager>,
    },
    Stopped,
}

/// A running script engine
pub struct Engine {
    config: EngineConfig,
    host: Arc<dyn ScriptHost>,
    core_inbox: Arc<CoreInbox>,
    loader_inbox: Arc<LoaderInbox>,
    persistence_handle: PersistenceHandle,
    lifecycle: Lifecycle,
    runtime: Option<Runtime>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the scheduling and persistence threads
    pub fn start(&mut self) -> Result<(), EngineError> {
        let (components, manager) =
            match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
                Lifecycle::Built {
                    components,
                    manager,
                } => (components, manager),
                other => {
                    self.lifecycle = other;
                    return Err(EngineError::AlreadyStarted);
                }
            };

        let persistence = manager.spawn()?;
        let driver = match Driver::new(components.core, components.pipeline).spawn() {
            Ok(driver) => driver,
            Err(e) => {
                self.persistence_handle.shutdown();
                let _ = persistence.join();
                return Err(e);
            }
        };
        info!(target: "engine", "Engine started");
        self.lifecycle = Lifecycle::Running {
            driver,
            persistence,
        };
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running { .. })
    }

    /// True once the scheduling thread has died on a scheduler fault
    pub fn is_terminated(&self) -> bool {
        match &self.lifecycle {
            Lifecycle::Running { driver, .. } => driver.is_terminated(),
            _ => false,
        }
    }

    /// Stop the scheduler, then persistence, then write every outstanding
    /// change. A terminated scheduler skips the final flush.
    pub fn stop(&mut self) -> Result<EngineStats, EngineError> {
        let (driver, persistence) =
            match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running {
                    driver,
                    persistence,
                } => (driver, persistence),
                other => {
                    self.lifecycle = other;
                    return Err(EngineError::NotRunning);
                }
            };

        let components = driver.stop();
        self.persistence_handle.shutdown();
        let mut manager = persistence.join().map_err(|_| {
            EngineError::SchedulerFault("persistence thread panicked".to_string())
        })?;

        let result = match components {
            Ok(Components { mut core, pipeline }) => {
                manager.shutdown_flush(&mut core);
                Ok(EngineStats {
                    resident_instances: core.instance_count(),
                    loaded_units: pipeline.loaded_count(),
                    compilations: pipeline.compilations(),
                    fetches: pipeline.fetches(),
                    persistence: manager.stats(),
                })
            }
            Err(e) => {
                error!(target: "engine", "Skipping shutdown flush: {}", e);
                Err(e)
            }
        };

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        info!(target: "engine", "Engine stopped");
        result
    }

    // ========================================================================
    // Events and control
    // ========================================================================

    pub fn post_event(&self, item_id: ItemId, event: PostedEvent) {
        self.core_inbox.post_event(item_id, event);
    }

    /// Post one event to every script in an object
    pub fn post_object_event(&self, object_id: ObjectId, event: PostedEvent) {
        let items = self.host.script_items(object_id);
        self.core_inbox
            .post_events(items.into_iter().map(|item_id| (item_id, event.clone())));
    }

    pub fn change_enabled_status(&self, item_id: ItemId, flag: EnableDisableFlag) {
        self.core_inbox.push_enable_disable(item_id, flag);
    }

    pub fn reset_script(&self, item_id: ItemId) {
        self.core_inbox.push_reset(item_id);
    }

    pub fn queue_crossed_avatar_ready(&self, item_id: ItemId, avatar: Uuid) {
        self.core_inbox.push_avatar_ready(item_id, avatar);
    }

    pub fn update_touch_data(&self, item_id: ItemId, detect: Vec<DetectVariables>) {
        self.core_inbox.push_touch_update(item_id, detect);
    }

    pub fn queue_command(&self, command: EngineCommand) {
        self.core_inbox.push_command(command);
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Queue a snapshot request answered through its own reply
    pub fn request_state_data(&self, request: StateDataRequest) {
        self.core_inbox.push_state_request(request);
    }

    /// Snapshot one instance, waiting up to the configured timeout.
    /// A timeout degrades to an empty answer.
    pub fn request_state_data_blocking(
        &self,
        item_id: ItemId,
        form: StateForm,
        stop_reason: StopScriptReason,
    ) -> StateData {
        let (reply, rx) = Reply::channel();
        self.core_inbox
            .push_state_request(StateDataRequest::new(item_id, form, reply).with_stop(stop_reason));
        wait_reply(&rx, self.config.state_request_timeout()).unwrap_or_else(|| {
            warn!(target: "engine", "State request for {} timed out", item_id);
            StateData::empty(item_id)
        })
    }

    pub fn post_load_unload_request(&self, request: LoadRequest) {
        self.loader_inbox.push_request(request);
    }

    pub fn post_retrieve_bytecode_request(&self, request: RetrieveBytecodeRequest) {
        self.loader_inbox.push_bytecode_request(request);
    }

    /// Serialized units for the resident assets among `asset_ids`. A timeout
    /// degrades to an empty map.
    pub fn retrieve_bytecode(&self, asset_ids: Vec<AssetId>) -> HashMap<AssetId, Vec<u8>> {
        let (reply, rx) = Reply::channel();
        self.loader_inbox
            .push_bytecode_request(RetrieveBytecodeRequest { asset_ids, reply });
        wait_reply(&rx, self.config.bytecode_request_timeout()).unwrap_or_else(|| {
            warn!(target: "engine", "Bytecode retrieval timed out");
            HashMap::new()
        })
    }

    pub fn script_running(&self, item_id: ItemId) -> Option<ScriptRunningInfo> {
        let (reply, rx) = Reply::channel();
        self.core_inbox
            .push_info_request(ScriptInfoRequest::Running { item_id, reply });
        wait_reply(&rx, self.config.state_request_timeout()).flatten()
    }

    pub fn enabled_details(&self, item_ids: Vec<ItemId>) -> Vec<EnabledDetail> {
        let (reply, rx) = Reply::channel();
        self.core_inbox
            .push_info_request(ScriptInfoRequest::EnabledDetails { item_ids, reply });
        wait_reply(&rx, self.config.state_request_timeout()).unwrap_or_default()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!(target: "engine", "Engine stopped with error: {}", e);
            }
        }
    }
}
