//! Fixed-capacity FIFO buffer.
//!
//! Backs the metric log, the breadcrumb trail, the error list and the alert
//! history. Once full, every push evicts the oldest entry. Iteration yields
//! entries from oldest to newest.

use std::collections::VecDeque;
use std::collections::vec_deque;

use serde::{Serialize, Serializer};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct BoundedBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    /// Total items ever pushed, evicted ones included.
    total: u64,
}

impl<T> BoundedBuffer<T> {
    /// Create a buffer holding at most `capacity` items.
    ///
    /// A zero capacity is rejected; a buffer that can hold nothing would
    /// silently drop every write.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::validation("buffer capacity must be greater than zero"));
        }
        Ok(Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total: 0,
        })
    }

    /// Append an item, returning the evicted oldest item when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        self.total += 1;
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
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

    pub fn total_pushed(&self) -> u64 {
        self.total
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    /// The most recent `n` items, oldest first.
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip)
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> BoundedBuffer<T> {
    /// Copy of the current contents, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<'a, T> IntoIterator for &'a BoundedBuffer<T> {
    type Item = &'a T;
    type IntoIter = vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Serialize> Serialize for BoundedBuffer<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(BoundedBuffer::<u32>::new(0).is_err());
    }

    #[test]
    fn test_eviction_keeps_most_recent() {
        let mut buf = BoundedBuffer::new(3).unwrap();
        for v in [1, 2, 3] {
            assert_eq!(buf.push(v), None);
        }
        assert_eq!(buf.push(4), Some(1));
        assert_eq!(buf.to_vec(), vec![2, 3, 4]);
        assert_eq!(buf.total_pushed(), 4);
    }

    #[test]
    fn test_latest() {
        let mut buf = BoundedBuffer::new(5).unwrap();
        for v in 0..5 {
            buf.push(v);
        }
        assert_eq!(buf.latest(2).copied().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(buf.latest(10).count(), 5);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..64, extra in 1usize..64) {
            let mut buf = BoundedBuffer::new(capacity).unwrap();
            let total = capacity + extra;
            for v in 0..total {
                buf.push(v);
            }
            prop_assert_eq!(buf.len(), capacity);
            let expected: Vec<usize> = (extra..total).collect();
            prop_assert_eq!(buf.to_vec(), expected);
        }
    }
}
