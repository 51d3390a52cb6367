//! Idle-deadline min-heap with O(log n) random-access update.
//!
//! A dense binary min-heap ordered by absolute expiry, plus a side map from
//! connection id to current heap index. Every swap updates the side map, so
//! refreshing or cancelling a specific connection's deadline never scans.
//!
//! The heap doubles as the reactor's wait-timeout source: `next_deadline`
//! fires everything already due and then reports how long the reactor may
//! sleep, which turns idle eviction into a side effect of the normal wait
//! loop rather than a dedicated timer thread.
//!
//! Callbacks run on the thread driving `tick`; the heap is deliberately not
//! `Send`, keeping it pinned to the reactor thread.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct TimerNode {
    id: usize,
    expiry: Instant,
    callback: Box<dyn FnMut()>,
}

/// Min-heap of per-connection idle deadlines.
pub struct TimerHeap {
    /// Dense heap storage.
    heap: Vec<TimerNode>,
    /// Connection id -> current index in `heap`.
    ref_map: HashMap<usize, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            ref_map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedule (or reschedule) `id` to expire `timeout` from now.
    ///
    /// A new id is appended and sifted up. An existing id has its expiry and
    /// callback replaced in place and is resettled in whichever direction the
    /// new expiry requires.
    pub fn add<F>(&mut self, id: usize, timeout: Duration, callback: F)
    where
        F: FnMut() + 'static,
    {
        let expiry = Instant::now() + timeout;
        match self.ref_map.get(&id).copied() {
            None => {
                let index = self.heap.len();
                self.ref_map.insert(id, index);
                self.heap.push(TimerNode {
                    id,
                    expiry,
                    callback: Box::new(callback),
                });
                self.sift_up(index);
            }
            Some(index) => {
                self.heap[index].expiry = expiry;
                self.heap[index].callback = Box::new(callback);
                if !self.sift_down(index) {
                    self.sift_up(index);
                }
            }
        }
    }

    /// Refresh `id`'s expiry to now + `timeout`, keeping its callback.
    /// Unknown ids are ignored.
    pub fn adjust(&mut self, id: usize, timeout: Duration) {
        if let Some(&index) = self.ref_map.get(&id) {
            self.heap[index].expiry = Instant::now() + timeout;
            if !self.sift_down(index) {
                self.sift_up(index);
            }
        }
    }

    /// Cancel `id` without firing its callback. Returns whether an entry was
    /// present; cancelling twice is not an error.
    pub fn remove(&mut self, id: usize) -> bool {
        match self.ref_map.get(&id).copied() {
            Some(index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    /// Remove and return the root id without firing its callback.
    #[allow(dead_code)]
    pub fn pop(&mut self) -> Option<usize> {
        if self.heap.is_empty() {
            None
        } else {
            Some(self.remove_at(0).id)
        }
    }

    /// Fire and pop every entry whose expiry has passed, in expiry order.
    pub fn tick(&mut self) {
        while let Some(root) = self.heap.first() {
            if root.expiry > Instant::now() {
                break;
            }
            let mut node = self.remove_at(0);
            (node.callback)();
        }
    }

    /// Fire everything due, then report how long until the next expiry.
    /// `None` when no deadline remains; zero when the root is already due.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.tick();
        self.heap
            .first()
            .map(|node| node.expiry.saturating_duration_since(Instant::now()))
    }

    /// Remove the node at `index`, resettling whatever the swap moved there.
    fn remove_at(&mut self, index: usize) -> TimerNode {
        let node = self.heap.swap_remove(index);
        self.ref_map.remove(&node.id);
        if index < self.heap.len() {
            let moved = self.heap[index].id;
            self.ref_map.insert(moved, index);
            if !self.sift_down(index) {
                self.sift_up(index);
            }
        }
        node
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.ref_map.insert(self.heap[a].id, a);
        self.ref_map.insert(self.heap[b].id, b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expiry <= self.heap[i].expiry {
                break;
            }
            self.swap_nodes(parent, i);
            i = parent;
        }
    }

    /// Returns whether the node moved at least one level down.
    fn sift_down(&mut self, index: usize) -> bool {
        let n = self.heap.len();
        let mut i = index;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expiry < self.heap[child].expiry {
                child += 1;
            }
            if self.heap[i].expiry <= self.heap[child].expiry {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > index
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        assert_eq!(self.ref_map.len(), self.heap.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.ref_map[&node.id], i);
            if i > 0 {
                let parent = (i - 1) / 2;
                assert!(self.heap[parent].expiry <= node.expiry, "heap property");
            }
        }
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread::sleep;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_pop_order_follows_expiry() {
        let mut timer = TimerHeap::new();
        timer.add(1, ms(300), || {});
        timer.add(2, ms(100), || {});
        timer.add(3, ms(200), || {});
        timer.assert_consistent();

        assert_eq!(timer.pop(), Some(2));
        assert_eq!(timer.pop(), Some(3));
        assert_eq!(timer.pop(), Some(1));
        assert_eq!(timer.pop(), None);
    }

    #[test]
    fn test_tick_fires_expired_in_order() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut timer = TimerHeap::new();
        for (id, t) in [(1usize, 30u64), (2, 10), (3, 20)] {
            let fired = Rc::clone(&fired);
            timer.add(id, ms(t), move || fired.borrow_mut().push(id));
        }

        sleep(ms(60));
        timer.tick();

        assert_eq!(*fired.borrow(), vec![2, 3, 1]);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_add_existing_id_replaces() {
        let mut timer = TimerHeap::new();
        timer.add(1, ms(300), || {});
        timer.add(2, ms(100), || {});
        timer.add(1, ms(50), || {});
        timer.assert_consistent();
        assert_eq!(timer.len(), 2);

        assert_eq!(timer.pop(), Some(1));
        assert_eq!(timer.pop(), Some(2));
    }

    #[test]
    fn test_adjust_resettles() {
        let mut timer = TimerHeap::new();
        timer.add(1, ms(100), || {});
        timer.add(2, ms(200), || {});
        timer.adjust(1, ms(500));
        timer.assert_consistent();

        assert_eq!(timer.pop(), Some(2));
        assert_eq!(timer.pop(), Some(1));
    }

    #[test]
    fn test_adjust_shorter_moves_toward_root() {
        let mut timer = TimerHeap::new();
        timer.add(1, ms(100), || {});
        timer.add(2, ms(200), || {});
        timer.add(3, ms(300), || {});
        timer.adjust(3, ms(10));
        timer.assert_consistent();

        assert_eq!(timer.pop(), Some(3));
        assert_eq!(timer.pop(), Some(1));
        assert_eq!(timer.pop(), Some(2));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut timer = TimerHeap::new();
        timer.add(1, ms(100), || {});
        timer.add(2, ms(200), || {});
        timer.add(3, ms(300), || {});

        assert!(timer.remove(2));
        timer.assert_consistent();
        assert!(!timer.remove(2));
        assert_eq!(timer.len(), 2);

        assert_eq!(timer.pop(), Some(1));
        assert_eq!(timer.pop(), Some(3));
    }

    #[test]
    fn test_next_deadline_fires_due_entries_first() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut timer = TimerHeap::new();
        assert_eq!(timer.next_deadline(), None);

        {
            let fired = Rc::clone(&fired);
            timer.add(7, Duration::ZERO, move || fired.borrow_mut().push(7));
        }
        timer.add(8, ms(200), || {});

        // The due entry must fire inside the call, never be reported as a
        // deadline.
        let deadline = timer.next_deadline().unwrap();
        assert_eq!(*fired.borrow(), vec![7]);
        assert!(deadline <= ms(200));
        assert!(deadline > ms(100));
    }

    #[test]
    fn test_heap_property_under_mixed_ops() {
        let mut timer = TimerHeap::new();
        for id in 0..16usize {
            timer.add(id, ms(((id * 37) % 11) as u64 * 10 + 5), || {});
            timer.assert_consistent();
        }
        for id in (0..16usize).step_by(3) {
            timer.adjust(id, ms(1000 - id as u64));
            timer.assert_consistent();
        }
        for id in (0..16usize).step_by(4) {
            assert!(timer.remove(id));
            timer.assert_consistent();
        }

        let mut last = None;
        while let Some(root) = timer.heap.first().map(|n| n.expiry) {
            if let Some(prev) = last {
                assert!(prev <= root, "pop order must be nondecreasing");
            }
            last = Some(root);
            timer.pop();
            timer.assert_consistent();
        }
    }
}
