use std::collections::VecDeque;

/// Bounded set handing out the most recently pushed item first. Pushing beyond the capacity
/// evicts the oldest item, pushing a present item refreshes it.
pub(crate) struct LifoSet<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: PartialEq> LifoSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }

        self.items.retain(|i| *i != item);
        self.items.push_back(item);

        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear()
    }
}
