//! Bounded request-correlation containers.
//!
//! Each protocol correlator keeps its in-flight requests in one of these.
//! Both containers preserve request arrival order, enforce a cap with
//! oldest-first eviction, and expire entries against packet time, so
//! pending-transaction memory stays bounded for any input.

use hashlink::LinkedHashMap;

use std::collections::VecDeque;
use std::hash::Hash;

/// Keyed pending map (correlation token -> in-flight request).
#[derive(Debug)]
pub(crate) struct PendingMap<K: Hash + Eq, V> {
    map: LinkedHashMap<K, (u64, V)>,
    cap: usize,
}

impl<K: Hash + Eq, V> PendingMap<K, V> {
    pub fn new(cap: usize) -> Self {
        PendingMap {
            map: LinkedHashMap::new(),
            cap,
        }
    }

    /// Inserts a request; if the map is full, the oldest entry is evicted
    /// and returned so the caller can publish it as dropped.
    pub fn insert(&mut self, key: K, ts: u64, value: V) -> Option<(K, u64, V)> {
        let evicted = if self.map.len() >= self.cap {
            self.map.pop_front().map(|(k, (ts, v))| (k, ts, v))
        } else {
            None
        };
        // re-inserting an existing key keeps the new request
        self.map.remove(&key);
        self.map.insert(key, (ts, value));
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<(u64, V)> {
        self.map.remove(key)
    }

    /// Oldest entry, if any.
    pub fn front(&self) -> Option<(&K, &(u64, V))> {
        self.map.front()
    }

    pub fn pop_front(&mut self) -> Option<(K, u64, V)> {
        self.map.pop_front().map(|(k, (ts, v))| (k, ts, v))
    }

    /// Pops every entry whose request timestamp is older than `timeout`.
    pub fn expire(&mut self, now: u64, timeout: u64) -> Vec<(K, u64, V)> {
        let mut expired = Vec::new();
        while let Some((_, (ts, _))) = self.map.front() {
            if now.saturating_sub(*ts) < timeout {
                break;
            }
            let (k, (ts, v)) = self.map.pop_front().unwrap();
            expired.push((k, ts, v));
        }
        expired
    }

    pub fn drain(&mut self) -> Vec<(K, u64, V)> {
        let mut out = Vec::with_capacity(self.map.len());
        while let Some((k, (ts, v))) = self.map.pop_front() {
            out.push((k, ts, v));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// FIFO pending queue for protocols correlated purely by order.
#[derive(Debug)]
pub(crate) struct PendingQueue<V> {
    queue: VecDeque<(u64, V)>,
    cap: usize,
}

impl<V> PendingQueue<V> {
    pub fn new(cap: usize) -> Self {
        PendingQueue {
            queue: VecDeque::new(),
            cap,
        }
    }

    /// Pushes a request, evicting and returning the oldest when full.
    pub fn push(&mut self, ts: u64, value: V) -> Option<(u64, V)> {
        let evicted = if self.queue.len() >= self.cap {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back((ts, value));
        evicted
    }

    pub fn pop(&mut self) -> Option<(u64, V)> {
        self.queue.pop_front()
    }

    pub fn front(&self) -> Option<&(u64, V)> {
        self.queue.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut (u64, V)> {
        self.queue.front_mut()
    }

    pub fn back_mut(&mut self) -> Option<&mut (u64, V)> {
        self.queue.back_mut()
    }

    pub fn pop_back(&mut self) -> Option<(u64, V)> {
        self.queue.pop_back()
    }

    pub fn expire(&mut self, now: u64, timeout: u64) -> Vec<(u64, V)> {
        let mut expired = Vec::new();
        while let Some((ts, _)) = self.queue.front() {
            if now.saturating_sub(*ts) < timeout {
                break;
            }
            expired.push(self.queue.pop_front().unwrap());
        }
        expired
    }

    pub fn drain(&mut self) -> Vec<(u64, V)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_pending_map_evicts_oldest() {
        let mut map = PendingMap::new(2);
        assert!(map.insert(1u16, 100, "a").is_none());
        assert!(map.insert(2, 200, "b").is_none());
        let evicted = map.insert(3, 300, "c").unwrap();
        assert_eq!(evicted, (1, 100, "a"));
        assert_eq!(map.len(), 2);
        assert_eq!(map.remove(&2), Some((200, "b")));
        assert_eq!(map.remove(&1), None);
    }

    #[test]
    fn core_pending_map_expire_in_order() {
        let mut map = PendingMap::new(8);
        map.insert(1u16, 100, "a");
        map.insert(2, 500, "b");
        map.insert(3, 900, "c");
        let expired = map.expire(1_200, 500);
        assert_eq!(
            expired.iter().map(|(k, _, _)| *k).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn core_pending_queue_fifo() {
        let mut q = PendingQueue::new(2);
        assert!(q.push(1, "a").is_none());
        assert!(q.push(2, "b").is_none());
        assert_eq!(q.push(3, "c"), Some((1, "a")));
        assert_eq!(q.pop(), Some((2, "b")));
        assert_eq!(q.drain(), vec![(3, "c")]);
    }
}
