use lumen_events::{EnableDisableFlag, ItemId, PostedEvent};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::heap::{HeapHandle, IndexedHeap};

/// Everything that arrived for one item id before its instance existed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeferredBundle {
    pub events: Vec<PostedEvent>,
    pub enable_flags: Vec<EnableDisableFlag>,
    pub avatars_ready: Vec<Uuid>,
}

#[derive(Debug)]
struct DeferredEntry {
    bundle: DeferredBundle,
    expiry: HeapHandle,
}

/// Buffer for stimuli addressed to instances that are not resident.
///
/// Each bundle lives for a fixed TTL from its first stimulus. Events are
/// capped per id and the oldest are kept; flags and readiness notices are not
/// capped. Expired bundles are dropped without notice.
#[derive(Debug)]
pub struct DeferredEventBuffer {
    entries: HashMap<ItemId, DeferredEntry>,
    expiries: IndexedHeap<(u64, ItemId)>,
    ttl_ms: u64,
    max_events: usize,
}

impl DeferredEventBuffer {
    pub fn new(ttl_ms: u64, max_events: usize) -> Self {
        Self {
            entries: HashMap::new(),
            expiries: IndexedHeap::new(),
            ttl_ms,
            max_events,
        }
    }

    fn entry(&mut self, item_id: ItemId, now: u64) -> &mut DeferredBundle {
        let expiries = &mut self.expiries;
        let ttl_ms = self.ttl_ms;
        &mut self
            .entries
            .entry(item_id)
            .or_insert_with(|| DeferredEntry {
                bundle: DeferredBundle::default(),
                expiry: expiries.push((now.saturating_add(ttl_ms), item_id)),
            })
            .bundle
    }

    /// Buffer an event. Returns false if the bundle is full and it was dropped.
    pub fn add_event(&mut self, item_id: ItemId, event: PostedEvent, now: u64) -> bool {
        let max_events = self.max_events;
        let bundle = self.entry(item_id, now);
        if bundle.events.len() >= max_events {
            debug!(target: "scheduler", "Deferred bundle for {} is full, dropping {}", item_id, event.kind);
            return false;
        }
        bundle.events.push(event);
        true
    }

    pub fn add_enable_flag(&mut self, item_id: ItemId, flag: EnableDisableFlag, now: u64) {
        self.entry(item_id, now).enable_flags.push(flag);
    }

    pub fn add_avatar_ready(&mut self, item_id: ItemId, avatar: Uuid, now: u64) {
        self.entry(item_id, now).avatars_ready.push(avatar);
    }

    /// Detach the whole bundle for an instance that just loaded
    pub fn take(&mut self, item_id: ItemId) -> Option<DeferredBundle> {
        let entry = self.entries.remove(&item_id)?;
        self.expiries.remove(entry.expiry);
        Some(entry.bundle)
    }

    /// Drop every bundle whose expiry is at or before `now`. Returns how many.
    pub fn expire(&mut self, now: u64) -> usize {
        let mut expired = 0;
        while let Some(&(expiry, item_id)) = self.expiries.peek() {
            if expiry > now {
                break;
            }
            self.expiries.pop();
            self.entries.remove(&item_id);
            expired += 1;
        }
        if expired > 0 {
            debug!(target: "scheduler", "Expired {} deferred bundles", expired);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_events::{EventKind, Value};

    fn numbered(n: i32) -> PostedEvent {
        PostedEvent::with_args(EventKind::LinkMessage, vec![Value::Int(n)])
    }

    #[test]
    fn test_cap_keeps_oldest_events() {
        let mut buffer = DeferredEventBuffer::new(60_000, 32);
        let item = ItemId::new_v4();

        let retained = (0..40).filter(|n| buffer.add_event(item, numbered(*n), 0)).count();
        buffer.add_enable_flag(item, EnableDisableFlag::GeneralDisable, 0);
        buffer.add_avatar_ready(item, Uuid::new_v4(), 0);

        assert_eq!(retained, 32);
        let bundle = buffer.take(item).unwrap();
        let order: Vec<i32> = bundle
            .events
            .iter()
            .filter_map(|e| e.args[0].as_int())
            .collect();
        assert_eq!(order, (0..32).collect::<Vec<_>>());
        assert_eq!(bundle.enable_flags, vec![EnableDisableFlag::GeneralDisable]);
        assert_eq!(bundle.avatars_ready.len(), 1);
        assert!(buffer.take(item).is_none());
    }

    #[test]
    fn test_expiry_is_measured_from_first_stimulus() {
        let mut buffer = DeferredEventBuffer::new(1_000, 32);
        let early = ItemId::new_v4();
        let late = ItemId::new_v4();

        buffer.add_event(early, numbered(1), 100);
        buffer.add_event(late, numbered(2), 600);
        buffer.add_event(early, numbered(3), 900);

        assert_eq!(buffer.expire(1_099), 0);
        assert_eq!(buffer.expire(1_100), 1);
        assert!(buffer.take(early).is_none());
        assert_eq!(buffer.len(), 1);

        assert_eq!(buffer.expire(5_000), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_removes_expiry() {
        let mut buffer = DeferredEventBuffer::new(1_000, 32);
        let item = ItemId::new_v4();
        buffer.add_event(item, numbered(1), 0);
        buffer.take(item);

        buffer.add_event(item, numbered(2), 2_000);
        assert_eq!(buffer.expire(1_500), 0);
        assert_eq!(buffer.take(item).unwrap().events, vec![numbered(2)]);
    }
}
