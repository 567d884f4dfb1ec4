//! LoadPipeline: resolves load requests into resident instances
//!
//! A compiled unit is looked up in order in the shared map of resident
//! units, the cache of recently unloaded units, the caller's embedded units,
//! the on-disk compiled cache, and finally fetched from the asset service and
//! compiled. Concurrent loads of one asset share a single fetch.
//!
//! Runs on the scheduling thread, interleaved with the ExecutionCore.

mod disk_cache;
mod inbox;
mod request;

pub use disk_cache::DiskCache;
pub use inbox::{FetchResult, LoaderInbox};
pub use request::{EmbeddedUnits, LoadCallback, LoadKind, LoadRequest, StateSource};

use lru::LruCache;
use lumen_events::{AssetId, ItemId};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::driver::WorkStatus;
use crate::error::LoadError;
use crate::host::{AssetKind, AssetSource, Compiler, ScriptHost};
use crate::persistence::SharedStore;
use crate::runtime::RuntimeState;
use crate::scheduler::{Admission, ExecutionCore};
use crate::unit::CompiledUnit;

/// A unit shared by resident instances. `refcount` equals the number of
/// instances using it.
struct LoadedUnit {
    unit: Arc<CompiledUnit>,
    refcount: usize,
}

/// Fresh copy of a load failure for each request waiting on the same asset
fn replicate(err: &LoadError, asset: AssetId) -> LoadError {
    match err {
        LoadError::AssetNotFound(id) => LoadError::AssetNotFound(*id),
        LoadError::InvalidAsset(id) => LoadError::InvalidAsset(*id),
        LoadError::Compile { asset, source } => LoadError::Compile {
            asset: *asset,
            source: source.clone(),
        },
        LoadError::CorruptUnit { asset, reason } => LoadError::CorruptUnit {
            asset: *asset,
            reason: reason.clone(),
        },
        other => LoadError::Fetch {
            asset,
            reason: other.to_string(),
        },
    }
}

pub struct LoadPipeline {
    inbox: Arc<LoaderInbox>,
    host: Arc<dyn ScriptHost>,
    assets: Arc<dyn AssetSource>,
    compiler: Arc<dyn Compiler>,
    runtime: Handle,
    store: SharedStore,

    loaded: HashMap<AssetId, LoadedUnit>,
    unloaded: LruCache<AssetId, Arc<CompiledUnit>>,
    disk: DiskCache,
    /// Requests parked on an outstanding fetch, keyed by asset
    waiting_for_asset: HashMap<AssetId, Vec<LoadRequest>>,
    /// Fetched assets awaiting compilation, one per pass
    compile_queue: VecDeque<(AssetId, FetchResult)>,

    compilations: u64,
    fetches: u64,
}

impl LoadPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &EngineConfig,
        inbox: Arc<LoaderInbox>,
        host: Arc<dyn ScriptHost>,
        assets: Arc<dyn AssetSource>,
        compiler: Arc<dyn Compiler>,
        runtime: Handle,
        store: SharedStore,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.unloaded_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inbox,
            host,
            assets,
            compiler,
            runtime,
            store,
            loaded: HashMap::new(),
            unloaded: LruCache::new(capacity),
            disk: DiskCache::new(config.cache_dir(), config.cache_prefix_len),
            waiting_for_asset: HashMap::new(),
            compile_queue: VecDeque::new(),
            compilations: 0,
            fetches: 0,
        }
    }

    pub fn inbox(&self) -> &Arc<LoaderInbox> {
        &self.inbox
    }

    pub fn disk_cache(&self) -> &DiskCache {
        &self.disk
    }

    /// Number of resident instances sharing `asset_id`, if it is loaded
    pub fn refcount(&self, asset_id: AssetId) -> Option<usize> {
        self.loaded.get(&asset_id).map(|loaded| loaded.refcount)
    }

    pub fn is_cached_unloaded(&self, asset_id: AssetId) -> bool {
        self.unloaded.contains(&asset_id)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Units produced by the compiler since startup
    pub fn compilations(&self) -> u64 {
        self.compilations
    }

    /// Asset fetches issued since startup
    pub fn fetches(&self) -> u64 {
        self.fetches
    }

    /// One pipeline pass: answer bytecode requests, compile at most one
    /// fetched asset, then take at most one load request.
    pub fn do_work(&mut self, core: &mut ExecutionCore) -> WorkStatus {
        let mut did_work = false;

        for request in self.inbox.take_bytecode_requests() {
            did_work = true;
            let mut units = HashMap::new();
            for asset_id in request.asset_ids {
                let Some(loaded) = self.loaded.get(&asset_id) else {
                    continue;
                };
                match loaded.unit.to_bytes() {
                    Ok(bytes) => {
                        units.insert(asset_id, bytes);
                    }
                    Err(e) => warn!(target: "loader", "Failed to export unit {}: {}", asset_id, e),
                }
            }
            request.reply.send(units);
        }

        self.compile_queue.extend(self.inbox.take_fetched());
        if let Some((asset_id, fetched)) = self.compile_queue.pop_front() {
            self.finish_fetch(core, asset_id, fetched);
            did_work = true;
        }

        if let Some(request) = self.inbox.pop_request() {
            self.process(core, request);
            did_work = true;
        }

        WorkStatus {
            work_was_done: did_work,
            work_is_pending: !self.compile_queue.is_empty() || self.inbox.has_pending(),
            next_wakeup: u64::MAX,
        }
    }

    fn process(&mut self, core: &mut ExecutionCore, request: LoadRequest) {
        match request.kind {
            LoadKind::Unload => {
                self.unload(core, request.item_id);
                request.complete(Ok(()));
            }
            LoadKind::Load => self.load(core, request),
            LoadKind::Reload => {
                self.unload(core, request.item_id);
                self.load(core, request);
            }
        }
    }

    fn unload(&mut self, core: &mut ExecutionCore, item_id: ItemId) {
        if let Some(unit) = core.do_unload(item_id) {
            self.release(unit.asset_id);
        }
    }

    /// Drop one reference. The last one moves the unit to the unloaded cache.
    fn release(&mut self, asset_id: AssetId) {
        if let Some(loaded) = self.loaded.get_mut(&asset_id) {
            loaded.refcount = loaded.refcount.saturating_sub(1);
        }
        self.demote_if_unused(asset_id);
    }

    fn demote_if_unused(&mut self, asset_id: AssetId) {
        if self.loaded.get(&asset_id).is_some_and(|loaded| loaded.refcount == 0) {
            if let Some(loaded) = self.loaded.remove(&asset_id) {
                debug!(target: "loader", "Unit {} is no longer in use", asset_id);
                self.unloaded.put(asset_id, loaded.unit);
            }
        }
    }

    /// Make `unit` the shared copy for its asset. A copy that became resident
    /// while this one was being produced wins, keeping its refcount.
    fn promote(&mut self, unit: CompiledUnit) -> Arc<CompiledUnit> {
        let asset_id = unit.asset_id;
        self.unloaded.pop(&asset_id);
        let loaded = self.loaded.entry(asset_id).or_insert_with(|| LoadedUnit {
            unit: Arc::new(unit),
            refcount: 0,
        });
        loaded.unit.clone()
    }

    fn load(&mut self, core: &mut ExecutionCore, request: LoadRequest) {
        let item_id = request.item_id;
        if core.is_resident(item_id) {
            request.complete(Err(LoadError::AlreadyRunning(item_id)));
            return;
        }
        if !self.host.object_exists(request.object_id) {
            let object = request.object_id;
            request.complete(Err(LoadError::ObjectNotFound {
                item: item_id,
                object,
            }));
            return;
        }
        let Some(asset_id) = self.host.find_asset_id(request.object_id, item_id) else {
            request.complete(Err(LoadError::NoAsset(item_id)));
            return;
        };

        match self.resolve_cached(asset_id, &request) {
            Some(unit) => self.start(core, request, unit),
            None => self.fetch(asset_id, request),
        }
    }

    /// Every tier short of the asset service. Whichever tier answers, the
    /// caller's embedded copy of the unit is discarded.
    fn resolve_cached(&mut self, asset_id: AssetId, request: &LoadRequest) -> Option<Arc<CompiledUnit>> {
        let embedded = request
            .embedded_units
            .as_ref()
            .and_then(|units| units.lock().remove(&asset_id));

        if let Some(loaded) = self.loaded.get(&asset_id) {
            return Some(loaded.unit.clone());
        }

        if let Some(unit) = self.unloaded.pop(&asset_id) {
            debug!(target: "loader", "Unit {} revived from the unloaded cache", asset_id);
            self.loaded.insert(
                asset_id,
                LoadedUnit {
                    unit: unit.clone(),
                    refcount: 0,
                },
            );
            return Some(unit);
        }

        if let Some(bytes) = embedded {
            match CompiledUnit::from_bytes(asset_id, &bytes) {
                Ok(unit) => {
                    debug!(target: "loader", "Unit {} taken from embedded bytecode", asset_id);
                    return Some(self.promote(unit));
                }
                Err(e) => warn!(target: "loader", "Ignoring embedded unit: {}", e),
            }
        }

        match self.disk.load(asset_id) {
            Ok(Some(unit)) => {
                debug!(target: "loader", "Unit {} read from the compiled cache", asset_id);
                Some(self.promote(unit))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(target: "loader", "{}", e);
                None
            }
        }
    }

    fn fetch(&mut self, asset_id: AssetId, request: LoadRequest) {
        let waiters = self.waiting_for_asset.entry(asset_id).or_default();
        waiters.push(request);
        if waiters.len() > 1 {
            debug!(target: "loader", "Joined outstanding fetch of {}", asset_id);
            return;
        }

        self.fetches += 1;
        debug!(target: "loader", "Fetching asset {}", asset_id);
        let assets = self.assets.clone();
        let inbox = self.inbox.clone();
        self.runtime.spawn(async move {
            let result = assets.fetch(asset_id).await;
            inbox.push_fetched(asset_id, result);
        });
    }

    fn compile(&mut self, asset_id: AssetId, fetched: FetchResult) -> Result<Arc<CompiledUnit>, LoadError> {
        let asset = fetched?.ok_or(LoadError::AssetNotFound(asset_id))?;
        if asset.kind != AssetKind::ScriptSource {
            return Err(LoadError::InvalidAsset(asset_id));
        }

        let unit = self
            .compiler
            .compile(asset_id, &asset.data)
            .map_err(|source| LoadError::Compile {
                asset: asset_id,
                source,
            })?;
        self.compilations += 1;
        info!(target: "loader", "Compiled {} ({} bytes of bytecode)", asset_id, unit.bytecode.len());

        if let Err(e) = self.disk.store(&unit) {
            warn!(target: "loader", "{}", e);
        }
        Ok(self.promote(unit))
    }

    fn finish_fetch(&mut self, core: &mut ExecutionCore, asset_id: AssetId, fetched: FetchResult) {
        let waiters = self.waiting_for_asset.remove(&asset_id).unwrap_or_default();
        match self.compile(asset_id, fetched) {
            Ok(unit) => {
                for request in waiters {
                    if core.is_resident(request.item_id) {
                        let item_id = request.item_id;
                        request.complete(Err(LoadError::AlreadyRunning(item_id)));
                    } else {
                        self.start(core, request, unit.clone());
                    }
                }
                self.demote_if_unused(asset_id);
            }
            Err(e) => {
                error!(target: "loader", "Unable to load asset {}: {}", asset_id, e);
                for request in waiters {
                    request.complete(Err(replicate(&e, asset_id)));
                }
            }
        }
    }

    /// Saved state for a loading instance. Unreadable state is logged and
    /// the instance starts fresh.
    fn resolve_state(&self, request: &LoadRequest) -> Option<RuntimeState> {
        let bytes = match &request.state_source {
            StateSource::None => return None,
            StateSource::Embedded(bytes) => bytes.clone(),
            StateSource::LocalStore => {
                let result = self.store.lock().load(request.item_id);
                match result {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(target: "loader", "Could not read saved state for {}: {}", request.item_id, e);
                        return None;
                    }
                }
            }
        };

        match RuntimeState::from_bytes(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(
                    target: "loader",
                    "Saved state for {} is unreadable, starting fresh: {}",
                    request.item_id,
                    e
                );
                None
            }
        }
    }

    fn start(&mut self, core: &mut ExecutionCore, request: LoadRequest, unit: Arc<CompiledUnit>) {
        let asset_id = unit.asset_id;
        let state = self.resolve_state(&request);
        let admission = Admission {
            item_id: request.item_id,
            object_id: request.object_id,
            unit,
            state,
            start_param: request.start_param,
            post_on_rez: request.post_on_rez,
            changed_region_start: request.changed_region_start,
            start_local_disabled: request.start_local_disabled,
            start_global_disabled: request.start_global_disabled,
            from_crossing: request.from_crossing,
        };

        match core.finished_loading(admission) {
            Ok(()) => {
                if let Some(loaded) = self.loaded.get_mut(&asset_id) {
                    loaded.refcount += 1;
                }
                request.complete(Ok(()));
            }
            Err(e) => {
                self.demote_if_unused(asset_id);
                request.complete(Err(e));
            }
        }
    }
}
