use lumen_events::ItemId;
use slab::Slab;
use std::collections::HashMap;

struct Node {
    item_id: ItemId,
    prev: usize,
    next: usize,
}

/// Circular doubly linked list of runnable instances with a "next to run" cursor.
///
/// Nodes live in a slab and are found through an id index, so insert, remove
/// and advance are all O(1).
#[derive(Default)]
pub struct RunQueue {
    nodes: Slab<Node>,
    index: HashMap<ItemId, usize>,
    cursor: Option<usize>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert just behind the cursor so the instance runs last in this
    /// rotation. Returns false if it was already queued.
    pub fn push_back(&mut self, item_id: ItemId) -> bool {
        if self.index.contains_key(&item_id) {
            return false;
        }

        let key = match self.cursor {
            None => {
                let entry = self.nodes.vacant_entry();
                let key = entry.key();
                entry.insert(Node {
                    item_id,
                    prev: key,
                    next: key,
                });
                self.cursor = Some(key);
                key
            }
            Some(head) => {
                let tail = self.nodes[head].prev;
                let key = self.nodes.insert(Node {
                    item_id,
                    prev: tail,
                    next: head,
                });
                self.nodes[tail].next = key;
                self.nodes[head].prev = key;
                key
            }
        };
        self.index.insert(item_id, key);
        true
    }

    /// Unlink an instance. A cursor resting on it moves to its successor.
    pub fn remove(&mut self, item_id: ItemId) -> bool {
        let Some(key) = self.index.remove(&item_id) else {
            return false;
        };
        let node = self.nodes.remove(key);
        if node.next == key {
            self.cursor = None;
        } else {
            self.nodes[node.prev].next = node.next;
            self.nodes[node.next].prev = node.prev;
            if self.cursor == Some(key) {
                self.cursor = Some(node.next);
            }
        }
        true
    }

    pub fn cursor(&self) -> Option<ItemId> {
        self.cursor.map(|key| self.nodes[key].item_id)
    }

    /// Move the cursor to the next instance, wrapping around
    pub fn advance(&mut self) {
        if let Some(key) = self.cursor {
            self.cursor = Some(self.nodes[key].next);
        }
    }

    pub fn contains(&self, item_id: ItemId) -> bool {
        self.index.contains_key(&item_id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation(queue: &mut RunQueue) -> Vec<ItemId> {
        let mut seen = Vec::new();
        for _ in 0..queue.len() {
            seen.extend(queue.cursor());
            queue.advance();
        }
        seen
    }

    #[test]
    fn test_rotation_order_and_wraparound() {
        let mut queue = RunQueue::new();
        let ids: Vec<ItemId> = (0..3).map(|_| ItemId::new_v4()).collect();
        for id in &ids {
            assert!(queue.push_back(*id));
        }
        assert!(!queue.push_back(ids[1]));

        assert_eq!(rotation(&mut queue), ids);
        assert_eq!(rotation(&mut queue), ids);
    }

    #[test]
    fn test_push_lands_behind_cursor() {
        let mut queue = RunQueue::new();
        let (a, b, c) = (ItemId::new_v4(), ItemId::new_v4(), ItemId::new_v4());
        queue.push_back(a);
        queue.push_back(b);
        queue.advance();
        queue.push_back(c);

        assert_eq!(rotation(&mut queue), vec![b, c, a]);
    }

    #[test]
    fn test_remove_under_cursor_moves_to_successor() {
        let mut queue = RunQueue::new();
        let (a, b, c) = (ItemId::new_v4(), ItemId::new_v4(), ItemId::new_v4());
        queue.push_back(a);
        queue.push_back(b);
        queue.push_back(c);
        queue.advance();

        assert!(queue.remove(b));
        assert_eq!(queue.cursor(), Some(c));
        assert!(queue.remove(c));
        assert_eq!(queue.cursor(), Some(a));
        assert!(queue.remove(a));
        assert_eq!(queue.cursor(), None);
        assert!(queue.is_empty());
        assert!(!queue.remove(a));
    }
}
