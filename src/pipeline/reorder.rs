//! Restores listing order over out-of-order completions.

use std::collections::BTreeMap;

/// Holds items that completed ahead of their turn and releases them
/// strictly by ordinal.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(first: u64) -> Self {
        Self {
            next: first,
            pending: BTreeMap::new(),
        }
    }

    /// Buffer `item`. Returns false (and drops it) for an ordinal that was
    /// already released or is already buffered.
    pub fn insert(&mut self, ordinal: u64, item: T) -> bool {
        if ordinal < self.next || self.pending.contains_key(&ordinal) {
            return false;
        }
        self.pending.insert(ordinal, item);
        true
    }

    /// Next item in order, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    pub fn next_ordinal(&self) -> u64 {
        self.next
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_in_ordinal_order() {
        let mut buffer = ReorderBuffer::new(0);
        assert!(buffer.insert(2, "c"));
        assert!(buffer.insert(1, "b"));
        assert_eq!(buffer.pop_ready(), None);

        assert!(buffer.insert(0, "a"));
        let drained: Vec<_> = std::iter::from_fn(|| buffer.pop_ready()).collect();
        assert_eq!(drained, ["a", "b", "c"]);
        assert_eq!(buffer.next_ordinal(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn stale_and_duplicate_ordinals_are_refused() {
        let mut buffer = ReorderBuffer::new(5);
        assert!(!buffer.insert(4, 'x'));
        assert!(buffer.insert(6, 'y'));
        assert!(!buffer.insert(6, 'z'));
        assert_eq!(buffer.len(), 1);
        assert!(buffer.insert(5, 'w'));
        assert_eq!(buffer.pop_ready(), Some('w'));
        assert_eq!(buffer.pop_ready(), Some('y'));
        assert!(!buffer.insert(5, 'v'));
    }
}
