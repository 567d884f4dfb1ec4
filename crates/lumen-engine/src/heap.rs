use slab::Slab;

/// Stable token for an element inside an [`IndexedHeap`].
///
/// A handle is valid until its element is popped or removed; after that the
/// slot may be reused by a later push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(usize);

struct Slot<T> {
    value: T,
    pos: usize,
}

/// Binary min-heap with delete-by-handle.
///
/// Values live in a slab; the heap array stores slab keys and every slot
/// records its current heap position so arbitrary elements can be removed or
/// replaced in O(log n).
pub struct IndexedHeap<T: Ord> {
    slots: Slab<Slot<T>>,
    heap: Vec<usize>,
}

impl<T: Ord> std::fmt::Debug for IndexedHeap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedHeap").field("len", &self.heap.len()).finish()
    }
}

impl<T: Ord> IndexedHeap<T> {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            heap: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, value: T) -> HeapHandle {
        let pos = self.heap.len();
        let key = self.slots.insert(Slot { value, pos });
        self.heap.push(key);
        self.sift_up(pos);
        HeapHandle(key)
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.first().map(|&key| &self.slots[key].value)
    }

    pub fn pop(&mut self) -> Option<(HeapHandle, T)> {
        let key = *self.heap.first()?;
        let value = self.remove_key(key);
        Some((HeapHandle(key), value))
    }

    pub fn get(&self, handle: HeapHandle) -> Option<&T> {
        self.slots.get(handle.0).map(|slot| &slot.value)
    }

    pub fn contains(&self, handle: HeapHandle) -> bool {
        self.slots.contains(handle.0)
    }

    /// Remove the element behind `handle`, if it is still present
    pub fn remove(&mut self, handle: HeapHandle) -> Option<T> {
        if !self.slots.contains(handle.0) {
            return None;
        }
        Some(self.remove_key(handle.0))
    }

    /// Swap in a new value for an existing element, keeping the same handle
    pub fn replace(&mut self, handle: HeapHandle, value: T) -> Option<T> {
        let slot = self.slots.get_mut(handle.0)?;
        let old = std::mem::replace(&mut slot.value, value);
        let pos = slot.pos;
        self.sift_up(pos);
        let pos = self.slots[handle.0].pos;
        self.sift_down(pos);
        Some(old)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.heap.clear();
    }

    fn remove_key(&mut self, key: usize) -> T {
        let pos = self.slots[key].pos;
        let last = self.heap.len() - 1;
        self.swap(pos, last);
        self.heap.pop();
        let slot = self.slots.remove(key);
        if pos < self.heap.len() {
            let moved = self.heap[pos];
            self.sift_up(pos);
            let pos = self.slots[moved].pos;
            self.sift_down(pos);
        }
        slot.value
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.slots[self.heap[a]].value < self.slots[self.heap[b]].value
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let ka = self.heap[a];
        let kb = self.heap[b];
        self.slots[ka].pos = a;
        self.slots[kb].pos = b;
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}

impl<T: Ord> Default for IndexedHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(heap: &mut IndexedHeap<u64>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some((_, v)) = heap.pop() {
            out.push(v);
        }
        out
    }

    #[test]
    fn test_pops_in_ascending_order() {
        let mut heap = IndexedHeap::new();
        for v in [50, 10, 40, 30, 20, 10] {
            heap.push(v);
        }
        assert_eq!(heap.peek(), Some(&10));
        assert_eq!(drain(&mut heap), vec![10, 10, 20, 30, 40, 50]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_remove_by_handle() {
        let mut heap = IndexedHeap::new();
        let a = heap.push(5);
        let b = heap.push(1);
        let c = heap.push(9);
        heap.push(3);

        assert_eq!(heap.remove(b), Some(1));
        assert_eq!(heap.remove(b), None);
        assert!(heap.contains(a));
        assert_eq!(heap.remove(c), Some(9));
        assert_eq!(drain(&mut heap), vec![3, 5]);
    }

    #[test]
    fn test_replace_moves_element_both_ways() {
        let mut heap = IndexedHeap::new();
        let a = heap.push(10);
        let b = heap.push(20);
        heap.push(30);

        assert_eq!(heap.replace(b, 1), Some(20));
        assert_eq!(heap.peek(), Some(&1));
        assert_eq!(heap.replace(b, 100), Some(1));
        assert_eq!(heap.get(a), Some(&10));
        assert_eq!(drain(&mut heap), vec![10, 30, 100]);
    }

    #[test]
    fn test_interleaved_operations_keep_heap_order() {
        let mut heap = IndexedHeap::new();
        let mut handles = Vec::new();
        for v in (0..64u64).rev() {
            handles.push((v, heap.push(v * 7 % 64)));
        }
        for (v, h) in handles.iter().filter(|(v, _)| v % 3 == 0) {
            assert_eq!(heap.remove(*h), Some(v * 7 % 64));
        }
        let drained = drain(&mut heap);
        let mut sorted = drained.clone();
        sorted.sort();
        assert_eq!(drained, sorted);
        assert_eq!(drained.len(), 64 - 22);
    }
}
