//! LRU replacement over a recency list of frame indices.
//!
//! - On hit or assignment: move the frame to the head
//! - On eviction: walk from the tail towards the head and take the first
//!   unpinned frame
//!
//! The list lives behind one mutex as `prev`/`next` index arrays, so no frame
//! metadata lock is needed to reorder it.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::buffer_manager::{BufferFrame, FrameMeta};

#[derive(Debug)]
struct Recency {
    prev: Vec<Option<usize>>,
    next: Vec<Option<usize>>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Recency {
    fn new(len: usize) -> Self {
        let prev = (0..len).map(|i| i.checked_sub(1)).collect();
        let next = (0..len).map(|i| (i + 1 < len).then_some(i + 1)).collect();
        Self {
            prev,
            next,
            head: (len > 0).then_some(0),
            tail: len.checked_sub(1),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.prev[idx], self.next[idx]);
        match prev {
            Some(p) => self.next[p] = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.prev[n] = prev,
            None => self.tail = prev,
        }
        self.prev[idx] = None;
        self.next[idx] = None;
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.next[idx] = self.head;
        if let Some(old_head) = self.head {
            self.prev[old_head] = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

#[derive(Debug)]
pub(crate) struct PolicyState {
    list: Mutex<Recency>,
}

impl PolicyState {
    pub(crate) fn new(frames: &[Arc<BufferFrame>]) -> Self {
        Self {
            list: Mutex::new(Recency::new(frames.len())),
        }
    }

    pub(crate) fn record_hit(&self, frame_idx: usize) {
        self.list.lock().move_to_head(frame_idx);
    }

    pub(crate) fn on_frame_assigned(&self, frame_idx: usize) {
        self.list.lock().move_to_head(frame_idx);
    }

    pub(crate) fn evict_frame<'a>(
        &self,
        frames: &'a [Arc<BufferFrame>],
    ) -> Option<(usize, MutexGuard<'a, FrameMeta>)> {
        let list = self.list.lock();
        let mut current = list.tail;
        while let Some(idx) = current {
            let meta = frames[idx].lock_meta();
            if meta.pins == 0 {
                return Some((idx, meta));
            }
            current = list.prev[idx];
        }
        None
    }
}

#[cfg(test)]
mod lru_tests {
    use super::*;

    fn frames(n: usize) -> Vec<Arc<BufferFrame>> {
        (0..n).map(|_| Arc::new(BufferFrame::new())).collect()
    }

    #[test]
    fn least_recent_unpinned_frame_is_evicted() {
        let frames = frames(3);
        let policy = PolicyState::new(&frames);
        policy.on_frame_assigned(0);
        policy.on_frame_assigned(1);
        policy.on_frame_assigned(2);
        policy.record_hit(0);
        // Recency: 0, 2, 1.
        let (victim, meta) = policy.evict_frame(&frames).unwrap();
        assert_eq!(victim, 1);
        drop(meta);

        frames[1].lock_meta().pin();
        let (victim, _meta) = policy.evict_frame(&frames).unwrap();
        assert_eq!(victim, 2);
    }

    #[test]
    fn all_pinned_yields_none() {
        let frames = frames(2);
        let policy = PolicyState::new(&frames);
        for frame in &frames {
            frame.lock_meta().pin();
        }
        assert!(policy.evict_frame(&frames).is_none());
    }

    #[test]
    fn recency_list_stays_consistent() {
        let mut list = Recency::new(4);
        for idx in [3, 1, 3, 0, 2, 2] {
            list.move_to_head(idx);
        }
        let mut order = Vec::new();
        let mut current = list.head;
        while let Some(idx) = current {
            order.push(idx);
            current = list.next[idx];
        }
        assert_eq!(order, vec![2, 0, 3, 1]);
        assert_eq!(list.tail, Some(1));
    }
}
