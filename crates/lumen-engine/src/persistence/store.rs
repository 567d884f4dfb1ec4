//! Durable state rows: one opaque blob per item id
//!
//! [`JournalStore`] keeps every row in memory and makes changes durable by
//! appending one length-prefixed record per batch to a journal file. After a
//! number of records the rows are rewritten into a snapshot file and the
//! journal starts over.

use lumen_events::ItemId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::StoreError;

const SNAPSHOT_FILE: &str = "states.snapshot";
const JOURNAL_FILE: &str = "states.journal";
const STORE_FORMAT_VERSION: u32 = 1;
const DEFAULT_COMPACT_AFTER: u64 = 1024;

/// Row storage used by the persistence manager and by load-time reads
pub trait StateStore: Send {
    fn load(&mut self, item_id: ItemId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write every row in one transaction
    fn save_batch(&mut self, rows: &[(ItemId, Vec<u8>)]) -> Result<(), StoreError>;

    fn delete_batch(&mut self, item_ids: &[ItemId]) -> Result<(), StoreError>;

    fn items(&mut self) -> Result<Vec<ItemId>, StoreError>;
}

/// Store handle shared between the persistence thread and the loader
pub type SharedStore = Arc<Mutex<Box<dyn StateStore>>>;

pub fn shared(store: impl StateStore + 'static) -> SharedStore {
    Arc::new(Mutex::new(Box::new(store) as Box<dyn StateStore>))
}

// ============================================================================
// Journal store
// ============================================================================

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    format_version: u32,
    last_seq: u64,
    rows: Vec<(ItemId, Vec<u8>)>,
}

#[derive(Serialize, Deserialize)]
enum JournalOp {
    Put { item_id: ItemId, blob: Vec<u8> },
    Delete { item_id: ItemId },
}

#[derive(Serialize, Deserialize)]
struct JournalRecord {
    seq: u64,
    ops: Vec<JournalOp>,
}

pub struct JournalStore {
    root: PathBuf,
    rows: HashMap<ItemId, Vec<u8>>,
    journal: File,
    next_seq: u64,
    records_since_compaction: u64,
    compact_after: u64,
}

impl JournalStore {
    /// Open or create a store under `root`, replaying the journal on top of
    /// the last snapshot. A torn record at the end of the journal is cut off.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root)?;

        let mut rows = HashMap::new();
        let mut last_seq = 0;
        let snapshot_path = root.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let reader = BufReader::new(File::open(&snapshot_path)?);
            let snapshot: StoreSnapshot = bincode::deserialize_from(reader)?;
            if snapshot.format_version != STORE_FORMAT_VERSION {
                return Err(StoreError::Corrupt {
                    offset: 0,
                    reason: format!(
                        "unsupported snapshot format version {}",
                        snapshot.format_version
                    ),
                });
            }
            rows.extend(snapshot.rows);
            last_seq = snapshot.last_seq;
        }

        let journal_path = root.join(JOURNAL_FILE);
        let mut journal = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&journal_path)?;
        let mut bytes = Vec::new();
        journal.read_to_end(&mut bytes)?;

        let (records, valid_len) = decode_journal(&bytes);
        let mut max_seq = last_seq;
        let mut replayed = 0u64;
        for record in records {
            if record.seq <= last_seq {
                continue;
            }
            max_seq = max_seq.max(record.seq);
            apply(&mut rows, record.ops);
            replayed += 1;
        }

        if valid_len < bytes.len() {
            warn!(
                target: "persistence",
                "Discarding {} bytes of torn journal tail in {}",
                bytes.len() - valid_len,
                journal_path.display()
            );
            journal.set_len(valid_len as u64)?;
            journal.sync_data()?;
        }

        info!(
            target: "persistence",
            "Opened state store at {} ({} rows, {} journal records replayed)",
            root.display(),
            rows.len(),
            replayed
        );

        Ok(Self {
            root: root.to_path_buf(),
            rows,
            journal,
            next_seq: max_seq + 1,
            records_since_compaction: replayed,
            compact_after: DEFAULT_COMPACT_AFTER,
        })
    }

    /// Compact after this many journal records
    pub fn with_compaction_threshold(mut self, records: u64) -> Self {
        self.compact_after = records.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn append(&mut self, ops: Vec<JournalOp>) -> Result<(), StoreError> {
        let record = JournalRecord {
            seq: self.next_seq,
            ops,
        };
        let payload = bincode::serialize(&record)?;
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.journal.write_all(&frame)?;
        self.journal.sync_data()?;

        self.next_seq += 1;
        apply(&mut self.rows, record.ops);
        self.records_since_compaction += 1;
        if self.records_since_compaction >= self.compact_after {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrite all rows into the snapshot file and empty the journal
    pub fn compact(&mut self) -> Result<(), StoreError> {
        let snapshot = StoreSnapshot {
            format_version: STORE_FORMAT_VERSION,
            last_seq: self.next_seq - 1,
            rows: self
                .rows
                .iter()
                .map(|(id, blob)| (*id, blob.clone()))
                .collect(),
        };

        let tmp_path = self.root.join(format!("{}.tmp", SNAPSHOT_FILE));
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, &snapshot)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, self.root.join(SNAPSHOT_FILE))?;

        self.journal.set_len(0)?;
        self.journal.sync_data()?;
        self.records_since_compaction = 0;
        debug!(target: "persistence", "Compacted state store ({} rows)", self.rows.len());
        Ok(())
    }
}

fn apply(rows: &mut HashMap<ItemId, Vec<u8>>, ops: Vec<JournalOp>) {
    for op in ops {
        match op {
            JournalOp::Put { item_id, blob } => {
                rows.insert(item_id, blob);
            }
            JournalOp::Delete { item_id } => {
                rows.remove(&item_id);
            }
        }
    }
}

/// Decode complete records. Returns them with the length of the valid prefix.
fn decode_journal(bytes: &[u8]) -> (Vec<JournalRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;
    while bytes.len() - offset >= 4 {
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_le_bytes(len) as usize;
        let Some(payload) = bytes.get(offset + 4..offset + 4 + len) else {
            break;
        };
        match bincode::deserialize::<JournalRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        offset += 4 + len;
    }
    (records, offset)
}

impl StateStore for JournalStore {
    fn load(&mut self, item_id: ItemId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.rows.get(&item_id).cloned())
    }

    fn save_batch(&mut self, rows: &[(ItemId, Vec<u8>)]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let ops = rows
            .iter()
            .map(|(item_id, blob)| JournalOp::Put {
                item_id: *item_id,
                blob: blob.clone(),
            })
            .collect();
        self.append(ops)
    }

    fn delete_batch(&mut self, item_ids: &[ItemId]) -> Result<(), StoreError> {
        let ops: Vec<_> = item_ids
            .iter()
            .filter(|id| self.rows.contains_key(*id))
            .map(|id| JournalOp::Delete { item_id: *id })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        self.append(ops)
    }

    fn items(&mut self) -> Result<Vec<ItemId>, StoreError> {
        let mut ids: Vec<_> = self.rows.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

// ============================================================================
// Memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryRows {
    rows: HashMap<ItemId, Vec<u8>>,
    batches_written: usize,
    rows_written: usize,
}

/// In-memory store. Clones share the same rows, so a test can keep one
/// clone to inspect what the engine wrote through another.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryRows>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty save batches
    pub fn batches_written(&self) -> usize {
        self.inner.lock().batches_written
    }

    /// Number of rows written across all batches
    pub fn rows_written(&self) -> usize {
        self.inner.lock().rows_written
    }

    pub fn row(&self, item_id: ItemId) -> Option<Vec<u8>> {
        self.inner.lock().rows.get(&item_id).cloned()
    }

    pub fn contains(&self, item_id: ItemId) -> bool {
        self.inner.lock().rows.contains_key(&item_id)
    }

    pub fn insert(&self, item_id: ItemId, blob: Vec<u8>) {
        self.inner.lock().rows.insert(item_id, blob);
    }
}

impl StateStore for MemoryStore {
    fn load(&mut self, item_id: ItemId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.row(item_id))
    }

    fn save_batch(&mut self, rows: &[(ItemId, Vec<u8>)]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        for (item_id, blob) in rows {
            inner.rows.insert(*item_id, blob.clone());
        }
        inner.batches_written += 1;
        inner.rows_written += rows.len();
        Ok(())
    }

    fn delete_batch(&mut self, item_ids: &[ItemId]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for item_id in item_ids {
            inner.rows.remove(item_id);
        }
        Ok(())
    }

    fn items(&mut self) -> Result<Vec<ItemId>, StoreError> {
        let mut ids: Vec<_> = self.inner.lock().rows.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
