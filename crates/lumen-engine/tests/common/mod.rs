//! Shared fixture: every engine component wired by hand around recording
//! fakes, a manual clock and an in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use lumen_engine::clock::ManualClock;
use lumen_engine::config::EngineConfig;
use lumen_engine::driver::WorkStatus;
use lumen_engine::error::LoadError;
use lumen_engine::host::{
    AssetKind, AssetSource, CommChannel, FaultSink, ScriptAsset, ScriptHost,
};
use lumen_engine::loader::{LoadPipeline, LoadRequest, LoaderInbox};
use lumen_engine::persistence::{self, shared, MemoryStore, PersistenceManager};
use lumen_engine::scheduler::{CoreCollaborators, CoreInbox, ExecutionCore, SyscallPool};
use lumen_engine::signal::WorkSignal;
use lumen_engine::vm::{Assembler, BytecodeInterpreter};
use lumen_events::{AssetId, ItemId, ListenMessage, ObjectId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::runtime::Runtime;

pub const START_MS: u64 = 1_000_000;

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
pub struct FakeHost {
    objects: Mutex<HashMap<ObjectId, Vec<(ItemId, AssetId)>>>,
    pub parcel_blocked: Mutex<bool>,
    pub avatar_controls: Mutex<bool>,
}

impl FakeHost {
    pub fn add_item(&self, object: ObjectId, item: ItemId, asset: AssetId) {
        self.objects.lock().entry(object).or_default().push((item, asset));
    }
}

impl ScriptHost for FakeHost {
    fn object_exists(&self, object: ObjectId) -> bool {
        self.objects.lock().contains_key(&object)
    }

    fn find_asset_id(&self, object: ObjectId, item: ItemId) -> Option<AssetId> {
        self.objects
            .lock()
            .get(&object)?
            .iter()
            .find(|(id, _)| *id == item)
            .map(|(_, asset)| *asset)
    }

    fn script_items(&self, object: ObjectId) -> Vec<ItemId> {
        self.objects
            .lock()
            .get(&object)
            .map(|items| items.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    fn has_avatar_controls(&self, _object: ObjectId, _item: ItemId) -> bool {
        *self.avatar_controls.lock()
    }

    fn parcel_allows_scripts(&self, _object: ObjectId) -> bool {
        !*self.parcel_blocked.lock()
    }
}

#[derive(Default)]
pub struct FakeAssets {
    assets: Mutex<HashMap<AssetId, ScriptAsset>>,
    fetches: AtomicUsize,
}

impl FakeAssets {
    pub fn insert(&self, asset_id: AssetId, kind: AssetKind, data: &[u8]) {
        self.assets.lock().insert(
            asset_id,
            ScriptAsset {
                asset_id,
                kind,
                data: data.to_vec(),
            },
        );
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetches block until the returned guard is dropped
    pub fn hold(&self) -> MutexGuard<'_, HashMap<AssetId, ScriptAsset>> {
        self.assets.lock()
    }
}

#[async_trait]
impl AssetSource for FakeAssets {
    async fn fetch(&self, asset_id: AssetId) -> Result<Option<ScriptAsset>, LoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.assets.lock().get(&asset_id).cloned())
    }
}

/// Everything scripts said, in order
pub type SaidLog = Arc<Mutex<Vec<(ItemId, String)>>>;

pub struct RecordingComm {
    said: SaidLog,
}

impl CommChannel for RecordingComm {
    fn next_message(&mut self) -> Option<ListenMessage> {
        None
    }

    fn listen(&mut self, _item: ItemId, _channel: i32) {}

    fn remove_listeners(&mut self, _item: ItemId) {}

    fn say(&mut self, item: ItemId, _channel: i32, message: &str) {
        self.said.lock().push((item, message.to_string()));
    }
}

#[derive(Default)]
pub struct RecordingFaults {
    pub reports: Mutex<Vec<(ItemId, String)>>,
}

impl FaultSink for RecordingFaults {
    fn report(&self, item: ItemId, _asset: AssetId, message: &str) {
        self.reports.lock().push((item, message.to_string()));
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub clock: ManualClock,
    pub core: ExecutionCore,
    pub pipeline: LoadPipeline,
    pub manager: PersistenceManager,
    pub store: MemoryStore,
    pub host: Arc<FakeHost>,
    pub assets: Arc<FakeAssets>,
    pub faults: Arc<RecordingFaults>,
    pub said: SaidLog,
    pub core_inbox: Arc<CoreInbox>,
    pub loader_inbox: Arc<LoaderInbox>,
    pub config: EngineConfig,
    _cache: Option<TempDir>,
    _runtime: Runtime,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let cache = TempDir::new().unwrap();
        let mut harness = Self::build(cache.path(), adjust);
        harness._cache = Some(cache);
        harness
    }

    /// A harness whose compiled cache lives in a caller-owned directory
    pub fn with_cache_dir(dir: &Path) -> Self {
        Self::build(dir, |_| {})
    }

    fn build(cache_dir: &Path, adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let mut config = EngineConfig::rooted_at(cache_dir);
        adjust(&mut config);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let clock = ManualClock::new(START_MS);
        let signal = Arc::new(WorkSignal::new());
        let core_inbox = Arc::new(CoreInbox::new(signal.clone(), Arc::new(clock.clone())));
        let loader_inbox = Arc::new(LoaderInbox::new(signal));
        let (handle, rx) = persistence::channel();

        let host = Arc::new(FakeHost::default());
        let assets = Arc::new(FakeAssets::default());
        let faults = Arc::new(RecordingFaults::default());
        let said: SaidLog = Arc::default();
        let store = MemoryStore::new();

        let core = ExecutionCore::new(
            config.clone(),
            CoreCollaborators {
                host: host.clone(),
                comm: Box::new(RecordingComm { said: said.clone() }),
                faults: faults.clone(),
                interpreter: Arc::new(BytecodeInterpreter::new(config.max_operand_depth)),
            },
            core_inbox.clone(),
            SyscallPool::new(runtime.handle().clone(), core_inbox.clone()),
            handle.clone(),
        );
        let pipeline = LoadPipeline::new(
            &config,
            loader_inbox.clone(),
            host.clone(),
            assets.clone(),
            Arc::new(Assembler),
            runtime.handle().clone(),
            shared(store.clone()),
        );
        let manager = PersistenceManager::new(
            &config,
            &handle,
            rx,
            core_inbox.clone(),
            shared(store.clone()),
        );

        Self {
            clock,
            core,
            pipeline,
            manager,
            store,
            host,
            assets,
            faults,
            said,
            core_inbox,
            loader_inbox,
            config,
            _cache: None,
            _runtime: runtime,
        }
    }

    /// Register a script source in a fresh item of `object`
    pub fn add_script(&self, object: ObjectId, source: &str) -> (ItemId, AssetId) {
        let asset = AssetId::from_source(source);
        let item = ItemId::new_v4();
        self.assets
            .insert(asset, AssetKind::ScriptSource, source.as_bytes());
        self.host.add_item(object, item, asset);
        (item, asset)
    }

    /// Another item of `object` running an already registered asset
    pub fn add_item(&self, object: ObjectId, asset: AssetId) -> ItemId {
        let item = ItemId::new_v4();
        self.host.add_item(object, item, asset);
        item
    }

    pub fn step(&mut self) -> WorkStatus {
        let status = self.core.do_work();
        status.merge(self.pipeline.do_work(&mut self.core))
    }

    /// Run scheduler and loader passes until neither has work
    pub fn pump(&mut self) {
        for _ in 0..10_000 {
            if self.step().is_idle() {
                return;
            }
        }
        panic!("engine did not settle");
    }

    /// Pump until `done` holds, giving background fetches and syscalls time
    pub fn pump_until(&mut self, mut done: impl FnMut(&Harness) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            self.pump();
            if done(self) {
                return;
            }
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn advance(&mut self, ms: u64) {
        self.clock.advance(ms);
        self.pump();
    }

    /// Submit a load request and wait for its callback
    pub fn submit(&mut self, request: LoadRequest) -> Result<(), LoadError> {
        let slot: Arc<Mutex<Option<Result<(), LoadError>>>> = Arc::default();
        let result = slot.clone();
        self.loader_inbox
            .push_request(request.on_complete(move |_, r| *result.lock() = Some(r)));
        self.pump_until(|_| slot.lock().is_some());
        let outcome = slot.lock().take();
        outcome.unwrap()
    }

    pub fn load(&mut self, item: ItemId, object: ObjectId) -> Result<(), LoadError> {
        self.submit(LoadRequest::load(item, object))
    }

    pub fn unload(&mut self, item: ItemId) {
        self.submit(LoadRequest::unload(item)).unwrap();
    }

    /// Messages said by one item, in order
    pub fn said_by(&self, item: ItemId) -> Vec<String> {
        self.said
            .lock()
            .iter()
            .filter(|(id, _)| *id == item)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// One persistence cycle followed by a scheduler pass to answer any
    /// snapshot it requested, then a second cycle to write them
    pub fn persist(&mut self) {
        self.manager.run_cycle();
        self.pump();
        self.manager.run_cycle();
    }
}
