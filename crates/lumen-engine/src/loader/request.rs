use lumen_events::{AssetId, ItemId, ObjectId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::error::LoadError;

/// Called once with the outcome of a load, unload or reload
pub type LoadCallback = Box<dyn FnOnce(ItemId, Result<(), LoadError>) + Send + 'static>;

/// Serialized compiled units a caller already holds, keyed by asset id.
/// Shared with the caller so the loader can discard entries it has used.
pub type EmbeddedUnits = Arc<Mutex<HashMap<AssetId, Vec<u8>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Load,
    Unload,
    /// Unload the current instance, then load again
    Reload,
}

/// Where a loading instance's saved state comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StateSource {
    /// Start fresh
    #[default]
    None,
    /// The durable state store
    LocalStore,
    /// Serialized state shipped with the object, e.g. after a region crossing
    Embedded(Vec<u8>),
}

/// A pending load, unload or reload. Consumed in a single pass; failures are
/// reported through the callback and never retried.
pub struct LoadRequest {
    pub kind: LoadKind,
    pub item_id: ItemId,
    pub object_id: ObjectId,
    pub state_source: StateSource,
    pub embedded_units: Option<EmbeddedUnits>,
    pub start_param: i32,
    pub post_on_rez: bool,
    pub changed_region_start: bool,
    pub start_local_disabled: bool,
    pub start_global_disabled: bool,
    pub from_crossing: bool,
    pub callback: Option<LoadCallback>,
}

impl LoadRequest {
    fn new(kind: LoadKind, item_id: ItemId, object_id: ObjectId) -> Self {
        Self {
            kind,
            item_id,
            object_id,
            state_source: StateSource::None,
            embedded_units: None,
            start_param: 0,
            post_on_rez: false,
            changed_region_start: false,
            start_local_disabled: false,
            start_global_disabled: false,
            from_crossing: false,
            callback: None,
        }
    }

    pub fn load(item_id: ItemId, object_id: ObjectId) -> Self {
        Self::new(LoadKind::Load, item_id, object_id)
    }

    pub fn reload(item_id: ItemId, object_id: ObjectId) -> Self {
        Self::new(LoadKind::Reload, item_id, object_id)
    }

    pub fn unload(item_id: ItemId) -> Self {
        Self::new(LoadKind::Unload, item_id, 0)
    }

    pub fn with_state_source(mut self, source: StateSource) -> Self {
        self.state_source = source;
        self
    }

    pub fn with_embedded_units(mut self, units: EmbeddedUnits) -> Self {
        self.embedded_units = Some(units);
        self
    }

    pub fn with_start_param(mut self, start_param: i32) -> Self {
        self.start_param = start_param;
        self
    }

    pub fn post_on_rez(mut self) -> Self {
        self.post_on_rez = true;
        self
    }

    pub fn changed_region_start(mut self) -> Self {
        self.changed_region_start = true;
        self
    }

    pub fn start_local_disabled(mut self) -> Self {
        self.start_local_disabled = true;
        self
    }

    pub fn start_global_disabled(mut self) -> Self {
        self.start_global_disabled = true;
        self
    }

    pub fn from_crossing(mut self) -> Self {
        self.from_crossing = true;
        self
    }

    pub fn on_complete(
        mut self,
        callback: impl FnOnce(ItemId, Result<(), LoadError>) + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Report the outcome and consume the request
    pub fn complete(mut self, result: Result<(), LoadError>) {
        if let Err(e) = &result {
            warn!(target: "loader", "{:?} of {} failed: {}", self.kind, self.item_id, e);
        }
        if let Some(callback) = self.callback.take() {
            callback(self.item_id, result);
        }
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("kind", &self.kind)
            .field("item_id", &self.item_id)
            .field("object_id", &self.object_id)
            .field("state_source", &self.state_source)
            .field("start_param", &self.start_param)
            .field("from_crossing", &self.from_crossing)
            .finish_non_exhaustive()
    }
}
