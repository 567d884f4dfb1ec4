//! Narrow collaborator interfaces consumed from the host simulator
//!
//! The engine never holds a reference to the whole host. Each subsystem gets
//! exactly the seam it needs at construction.

use async_trait::async_trait;
use lumen_events::{AssetId, ItemId, ListenMessage, ObjectId};
use tracing::error;
use uuid::Uuid;

use crate::error::{CompileError, LoadError};
use crate::unit::CompiledUnit;

/// Object and inventory model of the host simulator
pub trait ScriptHost: Send + Sync {
    fn object_exists(&self, object: ObjectId) -> bool;

    /// Asset id of the script stored in inventory item `item` of `object`
    fn find_asset_id(&self, object: ObjectId, item: ItemId) -> Option<AssetId>;

    /// Script items in the inventory of `object`
    fn script_items(&self, object: ObjectId) -> Vec<ItemId>;

    /// Whether an avatar has granted control permissions to this script
    fn has_avatar_controls(&self, object: ObjectId, item: ItemId) -> bool;

    /// Parcel permission for running scripts in `object`
    fn parcel_allows_scripts(&self, _object: ObjectId) -> bool {
        true
    }

    /// An avatar that crossed in with this script's object has arrived
    fn crossed_avatar_ready(&self, _item: ItemId, _avatar: Uuid) {}
}

/// Chat and listen plumbing. Owned by the scheduling thread.
pub trait CommChannel: Send {
    /// Next message that matched a script's listener, if any
    fn next_message(&mut self) -> Option<ListenMessage>;

    fn listen(&mut self, item: ItemId, channel: i32);

    fn remove_listeners(&mut self, item: ItemId);

    fn say(&mut self, item: ItemId, channel: i32, message: &str);
}

/// Where instance-fatal faults are surfaced
pub trait FaultSink: Send + Sync {
    fn report(&self, item: ItemId, asset: AssetId, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    ScriptSource,
    Other,
}

/// Asset payload returned by the host's asset service
#[derive(Debug, Clone)]
pub struct ScriptAsset {
    pub asset_id: AssetId,
    pub kind: AssetKind,
    pub data: Vec<u8>,
}

/// Asynchronous asset fetch. `Ok(None)` means the asset does not exist.
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn fetch(&self, asset_id: AssetId) -> Result<Option<ScriptAsset>, LoadError>;
}

/// Compiler front end
pub trait Compiler: Send + Sync {
    fn compile(&self, asset_id: AssetId, source: &[u8]) -> Result<CompiledUnit, CompileError>;
}

/// Reports faults to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFaultSink;

impl FaultSink for LogFaultSink {
    fn report(&self, item: ItemId, asset: AssetId, message: &str) {
        error!(target: "scheduler", "Script {} (asset {}) faulted: {}", item, asset, message);
    }
}

/// Channel for hosts without chat
#[derive(Debug, Default, Clone, Copy)]
pub struct NullComm;

impl CommChannel for NullComm {
    fn next_message(&mut self) -> Option<ListenMessage> {
        None
    }

    fn listen(&mut self, _item: ItemId, _channel: i32) {}

    fn remove_listeners(&mut self, _item: ItemId) {}

    fn say(&mut self, _item: ItemId, _channel: i32, _message: &str) {}
}
