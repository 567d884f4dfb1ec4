//! PersistenceManager: rate-limited, batched snapshots of dirty instances
//!
//! The scheduler reports which instances changed and which were unloaded.
//! Snapshots are requested back through the scheduler inbox and captured on
//! the scheduling thread; this module never touches live instance state.

pub mod store;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use lumen_events::ItemId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::error::{EngineError, PersistError};
use crate::heap::{HeapHandle, IndexedHeap};
use crate::requests::{Reply, StateDataRequest, StateForm, StateSnapshot};
use crate::runtime::RuntimeState;
use crate::scheduler::{CoreInbox, ExecutionCore};

pub use store::{shared, JournalStore, MemoryStore, SharedStore, StateStore};

/// Messages into the persistence thread
#[derive(Debug)]
pub enum PersistenceMsg {
    Changed(ItemId),
    Unloaded(ItemId),
    /// Answer to a snapshot request; `None` if the instance was gone
    StateAvailable(ItemId, Option<RuntimeState>),
    Shutdown,
}

/// Sending side used by the scheduler
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: Sender<PersistenceMsg>,
}

impl PersistenceHandle {
    pub fn changed(&self, item_id: ItemId) {
        let _ = self.tx.send(PersistenceMsg::Changed(item_id));
    }

    pub fn unloaded(&self, item_id: ItemId) {
        let _ = self.tx.send(PersistenceMsg::Unloaded(item_id));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PersistenceMsg::Shutdown);
    }

    /// A handle whose messages go nowhere
    pub fn detached() -> Self {
        let (tx, _rx) = unbounded();
        Self { tx }
    }
}

pub fn channel() -> (PersistenceHandle, Receiver<PersistenceMsg>) {
    let (tx, rx) = unbounded();
    (PersistenceHandle { tx }, rx)
}

/// Counters reported periodically and exposed to the CLI
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceStats {
    pub snapshots_requested: u64,
    pub saves: u64,
    pub batches: u64,
    pub removals: u64,
    pub failures: u64,
}

pub struct PersistenceManager {
    save_interval_ms: u64,
    sleep: Duration,
    report_interval_ms: u64,

    rx: Receiver<PersistenceMsg>,
    tx: Sender<PersistenceMsg>,
    inbox: Arc<CoreInbox>,
    store: SharedStore,
    clock: SharedClock,

    /// Touched since the last durable write
    dirty: HashSet<ItemId>,
    /// Earliest time the next snapshot of an instance may be requested
    delays: IndexedHeap<(u64, ItemId)>,
    delay_handles: HashMap<ItemId, HeapHandle>,
    /// Captured but not yet written
    needs_saving: HashMap<ItemId, RuntimeState>,
    unloaded: Vec<ItemId>,

    stats: PersistenceStats,
    last_report: u64,
}

impl PersistenceManager {
    pub fn new(
        config: &EngineConfig,
        handle: &PersistenceHandle,
        rx: Receiver<PersistenceMsg>,
        inbox: Arc<CoreInbox>,
        store: SharedStore,
    ) -> Self {
        let clock = inbox.clock().clone();
        let last_report = clock.now_ms();
        Self {
            save_interval_ms: config.save_interval_ms,
            sleep: Duration::from_millis(config.persistence_sleep_ms),
            report_interval_ms: config.persistence_report_ms,
            rx,
            tx: handle.tx.clone(),
            inbox,
            store,
            clock,
            dirty: HashSet::new(),
            delays: IndexedHeap::new(),
            delay_handles: HashMap::new(),
            needs_saving: HashMap::new(),
            unloaded: Vec::new(),
            stats: PersistenceStats::default(),
            last_report,
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        self.stats
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Handle one message. Returns false on shutdown.
    fn handle(&mut self, msg: PersistenceMsg, now: u64) -> bool {
        match msg {
            PersistenceMsg::Changed(item_id) => {
                self.dirty.insert(item_id);
                if !self.delay_handles.contains_key(&item_id) {
                    self.request_snapshot(item_id);
                    self.arm_delay(item_id, now);
                }
            }
            PersistenceMsg::StateAvailable(item_id, state) => {
                // Not dirty means it was unloaded after the request went out
                if self.dirty.remove(&item_id) {
                    if let Some(state) = state {
                        self.needs_saving.insert(item_id, state);
                    }
                }
            }
            PersistenceMsg::Unloaded(item_id) => {
                self.dirty.remove(&item_id);
                self.needs_saving.remove(&item_id);
                if let Some(handle) = self.delay_handles.remove(&item_id) {
                    self.delays.remove(handle);
                }
                self.unloaded.push(item_id);
            }
            PersistenceMsg::Shutdown => return false,
        }
        true
    }

    fn arm_delay(&mut self, item_id: ItemId, now: u64) {
        let handle = self
            .delays
            .push((now.saturating_add(self.save_interval_ms), item_id));
        self.delay_handles.insert(item_id, handle);
    }

    fn request_snapshot(&mut self, item_id: ItemId) {
        let tx = self.tx.clone();
        let reply = Reply::callback(move |data: crate::requests::StateData| {
            let state = match data.snapshot {
                Some(StateSnapshot::Raw(state)) => Some(state),
                _ => None,
            };
            let _ = tx.send(PersistenceMsg::StateAvailable(item_id, state));
        });
        self.inbox
            .push_state_request(StateDataRequest::new(item_id, StateForm::Raw, reply));
        self.stats.snapshots_requested += 1;
    }

    /// Keep a failed snapshot dirty and make sure it is asked for again
    fn retry(&mut self, item_id: ItemId, now: u64) {
        self.dirty.insert(item_id);
        if !self.delay_handles.contains_key(&item_id) {
            self.arm_delay(item_id, now);
        }
    }

    fn save_pending(&mut self, now: u64) {
        if self.needs_saving.is_empty() {
            return;
        }

        let mut rows = Vec::with_capacity(self.needs_saving.len());
        for (item_id, state) in std::mem::take(&mut self.needs_saving) {
            match state.to_bytes() {
                Ok(blob) => rows.push((item_id, blob)),
                Err(source) => {
                    let err = PersistError::Serialize {
                        item: item_id,
                        source,
                    };
                    warn!(target: "persistence", "{}", err);
                    self.stats.failures += 1;
                    self.retry(item_id, now);
                }
            }
        }
        if rows.is_empty() {
            return;
        }

        let result = self.store.lock().save_batch(&rows);
        match result {
            Ok(()) => {
                debug!(target: "persistence", "Saved {} script states", rows.len());
                self.stats.saves += rows.len() as u64;
                self.stats.batches += 1;
            }
            Err(e) => {
                warn!(target: "persistence", "{}", PersistError::Store(e));
                self.stats.failures += 1;
                for (item_id, _) in rows {
                    self.retry(item_id, now);
                }
            }
        }
    }

    /// Re-request snapshots for instances still dirty once their delay ends
    fn expire_delays(&mut self, now: u64) {
        while let Some(&(ready_on, item_id)) = self.delays.peek() {
            if ready_on > now {
                break;
            }
            self.delays.pop();
            self.delay_handles.remove(&item_id);
            if self.dirty.contains(&item_id) {
                self.request_snapshot(item_id);
                self.arm_delay(item_id, now);
            }
        }
    }

    fn delete_unloaded(&mut self) {
        if self.unloaded.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.unloaded);
        let result = self.store.lock().delete_batch(&ids);
        match result {
            Ok(()) => {
                debug!(target: "persistence", "Removed {} script states", ids.len());
                self.stats.removals += ids.len() as u64;
            }
            Err(e) => {
                warn!(target: "persistence", "Failed to remove script states: {}", e);
                self.stats.failures += 1;
                self.unloaded = ids;
            }
        }
    }

    fn report(&mut self, now: u64) {
        if now.saturating_sub(self.last_report) < self.report_interval_ms {
            return;
        }
        self.last_report = now;
        debug!(
            target: "persistence",
            "Persistence: {} saved in {} batches, {} removed, {} failures, {} dirty",
            self.stats.saves,
            self.stats.batches,
            self.stats.removals,
            self.stats.failures,
            self.dirty.len()
        );
    }

    /// Drain messages, then save, re-arm, delete and report.
    /// Returns false once shutdown has been requested.
    pub fn run_cycle(&mut self) -> bool {
        let now = self.clock.now_ms();
        let mut running = true;
        while let Ok(msg) = self.rx.try_recv() {
            running &= self.handle(msg, now);
        }
        self.save_pending(now);
        self.expire_delays(now);
        self.delete_unloaded();
        self.report(now);
        running
    }

    /// Run on a dedicated thread until shutdown. The manager is handed back
    /// on join for the final flush.
    pub fn spawn(mut self) -> Result<JoinHandle<PersistenceManager>, EngineError> {
        thread::Builder::new()
            .name("lumen-persistence".into())
            .spawn(move || {
                info!(target: "persistence", "Persistence thread started");
                loop {
                    let mut running = match self.rx.recv_timeout(self.sleep) {
                        Ok(msg) => {
                            let now = self.clock.now_ms();
                            self.handle(msg, now)
                        }
                        Err(RecvTimeoutError::Timeout) => true,
                        Err(RecvTimeoutError::Disconnected) => false,
                    };
                    running &= self.run_cycle();
                    if !running {
                        break;
                    }
                }
                info!(target: "persistence", "Persistence thread stopped");
                self
            })
            .map_err(|source| EngineError::Spawn {
                what: "persistence thread",
                source,
            })
    }

    /// Write every outstanding change with the scheduler stopped.
    /// Still-dirty instances are captured directly from `core`.
    pub fn shutdown_flush(&mut self, core: &mut ExecutionCore) {
        let now = self.clock.now_ms();
        while let Ok(msg) = self.rx.try_recv() {
            self.handle(msg, now);
        }

        let dirty: Vec<ItemId> = self.dirty.drain().collect();
        for item_id in dirty {
            if let Some(state) = core.snapshot_now(item_id) {
                self.needs_saving.insert(item_id, state);
            }
        }
        self.save_pending(now);
        self.delete_unloaded();
        info!(
            target: "persistence",
            "Shutdown flush complete: {} saved, {} removed, {} left dirty",
            self.stats.saves,
            self.stats.removals,
            self.dirty.len()
        );
    }
}
