use std::collections::VecDeque;

/// Fixed-capacity append-only buffer. Appending past capacity drops the
/// oldest entry; iteration is always oldest-first.
#[derive(Debug, Clone)]
pub struct BoundedStore<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> BoundedStore<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append `item`, returning the entry evicted to make room, if any.
    pub fn append(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) {
        for item in items {
            self.append(item);
        }
    }

    pub fn get_all(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// The last `limit` entries, newest-last.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(limit);
        self.items.iter().skip(skip).cloned().collect()
    }

    /// Swap the contents wholesale, keeping only the newest `capacity` items.
    pub fn replace(&mut self, items: Vec<T>) {
        self.items.clear();
        self.extend(items);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}
