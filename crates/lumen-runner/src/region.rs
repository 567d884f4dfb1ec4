//! A self-contained local region: script sources from a directory, objects
//! held in memory and chat routed between listening scripts.

use async_trait::async_trait;
use lumen_engine::host::{
    AssetKind, AssetSource, CommChannel, FaultSink, ScriptAsset, ScriptHost,
};
use lumen_engine::LoadError;
use lumen_events::{AssetId, ItemId, ListenMessage, ObjectId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// File extension of script sources
pub const SCRIPT_EXTENSION: &str = "lum";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Directory scanned for `*.lum` script sources
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Objects rezzed per script source
    #[serde(default = "default_instances_per_script")]
    pub instances_per_script: usize,

    /// Touch every object this often; 0 disables
    #[serde(default = "default_touch_interval_ms")]
    pub touch_interval_ms: u64,

    /// Resume scripts from the state store instead of starting fresh
    #[serde(default = "default_restore_state")]
    pub restore_state: bool,
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts")
}

fn default_instances_per_script() -> usize {
    1
}

fn default_touch_interval_ms() -> u64 {
    1000
}

fn default_restore_state() -> bool {
    true
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            instances_per_script: default_instances_per_script(),
            touch_interval_ms: default_touch_interval_ms(),
            restore_state: default_restore_state(),
        }
    }
}

// ============================================================================
// Assets
// ============================================================================

/// Script sources found in one directory, keyed by content-derived asset id
#[derive(Debug, Default)]
pub struct DirectoryAssets {
    assets: HashMap<AssetId, (String, PathBuf)>,
}

impl DirectoryAssets {
    pub fn scan(dir: &Path) -> io::Result<Self> {
        let mut assets = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION) {
                continue;
            }
            let source = fs::read_to_string(&path)?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!(target: "region", "Found script {} in {}", name, path.display());
            assets.insert(AssetId::from_source(&source), (name, path));
        }
        info!(target: "region", "Found {} scripts in {}", assets.len(), dir.display());
        Ok(Self { assets })
    }

    /// Asset ids with their script names, ordered by name
    pub fn scripts(&self) -> Vec<(AssetId, String)> {
        let mut scripts: Vec<_> = self
            .assets
            .iter()
            .map(|(id, (name, _))| (*id, name.clone()))
            .collect();
        scripts.sort_by(|a, b| a.1.cmp(&b.1));
        scripts
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

#[async_trait]
impl AssetSource for DirectoryAssets {
    async fn fetch(&self, asset_id: AssetId) -> Result<Option<ScriptAsset>, LoadError> {
        let Some((_, path)) = self.assets.get(&asset_id) else {
            return Ok(None);
        };
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(ScriptAsset {
                asset_id,
                kind: AssetKind::ScriptSource,
                data,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LoadError::Fetch {
                asset: asset_id,
                reason: e.to_string(),
            }),
        }
    }
}

// ============================================================================
// Objects
// ============================================================================

/// One script rezzed into the region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub object_id: ObjectId,
    pub item_id: ItemId,
    pub asset_id: AssetId,
    pub name: String,
}

/// In-memory object and inventory model
pub struct Region {
    objects: RwLock<HashMap<ObjectId, Vec<(ItemId, AssetId)>>>,
    next_object: AtomicU32,
    parcel_open: AtomicBool,
}

impl Region {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            next_object: AtomicU32::new(1),
            parcel_open: AtomicBool::new(true),
        }
    }

    /// Rez a new object holding one copy of `asset_id`. Item ids are derived
    /// from the object and asset so a rerun finds the same saved state.
    pub fn rez(&self, asset_id: AssetId) -> (ObjectId, ItemId) {
        let object_id = self.next_object.fetch_add(1, Ordering::Relaxed);
        let item_id = ItemId(Uuid::new_v5(&asset_id.0, &object_id.to_le_bytes()));
        self.objects
            .write()
            .insert(object_id, vec![(item_id, asset_id)]);
        (object_id, item_id)
    }

    /// Rez `per_script` objects for every script source
    pub fn populate(&self, assets: &DirectoryAssets, per_script: usize) -> Vec<Placement> {
        let mut placements = Vec::new();
        for (asset_id, name) in assets.scripts() {
            for _ in 0..per_script {
                let (object_id, item_id) = self.rez(asset_id);
                placements.push(Placement {
                    object_id,
                    item_id,
                    asset_id,
                    name: name.clone(),
                });
            }
        }
        placements
    }

    pub fn objects(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.objects.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn set_parcel_open(&self, open: bool) {
        self.parcel_open.store(open, Ordering::Relaxed);
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptHost for Region {
    fn object_exists(&self, object: ObjectId) -> bool {
        self.objects.read().contains_key(&object)
    }

    fn find_asset_id(&self, object: ObjectId, item: ItemId) -> Option<AssetId> {
        self.objects
            .read()
            .get(&object)?
            .iter()
            .find(|(id, _)| *id == item)
            .map(|(_, asset)| *asset)
    }

    fn script_items(&self, object: ObjectId) -> Vec<ItemId> {
        self.objects
            .read()
            .get(&object)
            .map(|items| items.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    fn has_avatar_controls(&self, _object: ObjectId, _item: ItemId) -> bool {
        false
    }

    fn parcel_allows_scripts(&self, _object: ObjectId) -> bool {
        self.parcel_open.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Chat
// ============================================================================

/// Routes what one script says to every other script listening on the
/// same channel
pub struct ChatChannel {
    listeners: HashMap<i32, Vec<ItemId>>,
    pending: VecDeque<ListenMessage>,
    said: Arc<AtomicU64>,
}

impl ChatChannel {
    /// `said` counts every message spoken
    pub fn new(said: Arc<AtomicU64>) -> Self {
        Self {
            listeners: HashMap::new(),
            pending: VecDeque::new(),
            said,
        }
    }
}

impl CommChannel for ChatChannel {
    fn next_message(&mut self) -> Option<ListenMessage> {
        self.pending.pop_front()
    }

    fn listen(&mut self, item: ItemId, channel: i32) {
        let listeners = self.listeners.entry(channel).or_default();
        if !listeners.contains(&item) {
            listeners.push(item);
        }
    }

    fn remove_listeners(&mut self, item: ItemId) {
        for listeners in self.listeners.values_mut() {
            listeners.retain(|id| *id != item);
        }
        self.listeners.retain(|_, listeners| !listeners.is_empty());
    }

    fn say(&mut self, item: ItemId, channel: i32, message: &str) {
        info!(target: "region", "[{}] {}: {}", channel, item, message);
        self.said.fetch_add(1, Ordering::Relaxed);

        let Some(listeners) = self.listeners.get(&channel) else {
            return;
        };
        for listener in listeners.iter().filter(|id| **id != item) {
            self.pending.push_back(ListenMessage {
                item_id: *listener,
                channel,
                name: item.to_string(),
                speaker_id: item.0,
                message: message.to_string(),
                from_bot: false,
            });
        }
    }
}

/// Logs faults and counts them
#[derive(Debug, Default)]
pub struct RegionFaults {
    count: AtomicU64,
}

impl RegionFaults {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl FaultSink for RegionFaults {
    fn report(&self, item: ItemId, asset: AssetId, message: &str) {
        self.count.fetch_add(1, Ordering::Relaxed);
        error!(target: "region", "Script {} (asset {}) faulted: {}", item, asset, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_finds_only_script_sources() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hello.lum"), "@state default\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let assets = DirectoryAssets::scan(dir.path()).unwrap();
        let scripts = assets.scripts();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].0, AssetId::from_source("@state default\n"));
        assert_eq!(scripts[0].1, "hello");

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let fetched = runtime.block_on(assets.fetch(scripts[0].0)).unwrap().unwrap();
        assert_eq!(fetched.data, b"@state default\n");
        assert!(runtime
            .block_on(assets.fetch(AssetId::new_v4()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_demo_scripts_assemble() {
        use lumen_engine::vm::Assembler;
        use lumen_engine::Compiler;

        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/scripts");
        let assets = DirectoryAssets::scan(&dir).unwrap();
        assert_eq!(assets.len(), 4);

        let runtime = tokio::runtime::Runtime::new().unwrap();
        for (asset_id, name) in assets.scripts() {
            let source = runtime.block_on(assets.fetch(asset_id)).unwrap().unwrap();
            let unit = Assembler.compile(asset_id, &source.data);
            assert!(unit.is_ok(), "{} failed: {:?}", name, unit.err());
        }
    }

    #[test]
    fn test_item_ids_are_stable_across_regions() {
        let asset = AssetId::from_source("x");
        let (object, item) = Region::new().rez(asset);
        let second = Region::new();
        assert_eq!(second.rez(asset), (object, item));
        assert_eq!(second.find_asset_id(object, item), Some(asset));
        assert_eq!(second.script_items(object), vec![item]);
    }

    #[test]
    fn test_chat_reaches_other_listeners() {
        let said = Arc::new(AtomicU64::new(0));
        let mut chat = ChatChannel::new(said.clone());
        let a = ItemId::new_v4();
        let b = ItemId::new_v4();
        chat.listen(a, 0);
        chat.listen(b, 0);

        chat.say(a, 0, "hi");
        let heard = chat.next_message().unwrap();
        assert_eq!(heard.item_id, b);
        assert_eq!(heard.message, "hi");
        assert!(chat.next_message().is_none());

        chat.remove_listeners(b);
        chat.say(a, 0, "again");
        assert!(chat.next_message().is_none());
        assert_eq!(said.load(Ordering::Relaxed), 2);
    }
}
