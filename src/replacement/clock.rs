//! Clock (second-chance) replacement.
//!
//! - On hit or assignment: set the frame's hot bit
//! - On eviction: sweep the hand, skipping pinned frames and clearing hot
//!   bits, until a cold unpinned frame is found

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::MutexGuard;

use crate::buffer_manager::{BufferFrame, FrameMeta};

#[derive(Debug)]
pub(crate) struct PolicyState {
    hot: Vec<AtomicBool>,
    hand: AtomicUsize,
}

impl PolicyState {
    pub(crate) fn new(frames: &[Arc<BufferFrame>]) -> Self {
        Self {
            hot: frames.iter().map(|_| AtomicBool::new(false)).collect(),
            hand: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_hit(&self, frame_idx: usize) {
        self.hot[frame_idx].store(true, Ordering::Relaxed);
    }

    pub(crate) fn on_frame_assigned(&self, frame_idx: usize) {
        self.hot[frame_idx].store(true, Ordering::Relaxed);
    }

    /// Two full sweeps: the first may only clear hot bits.
    pub(crate) fn evict_frame<'a>(
        &self,
        frames: &'a [Arc<BufferFrame>],
    ) -> Option<(usize, MutexGuard<'a, FrameMeta>)> {
        let len = frames.len();
        if len == 0 {
            return None;
        }
        for _ in 0..2 * len {
            let idx = self.hand.fetch_add(1, Ordering::Relaxed) % len;
            let meta = frames[idx].lock_meta();
            if meta.pins > 0 {
                continue;
            }
            if self.hot[idx].swap(false, Ordering::Relaxed) {
                continue;
            }
            return Some((idx, meta));
        }
        None
    }
}

#[cfg(test)]
mod clock_tests {
    use super::*;

    fn frames(n: usize) -> Vec<Arc<BufferFrame>> {
        (0..n).map(|_| Arc::new(BufferFrame::new())).collect()
    }

    #[test]
    fn hot_frames_get_a_second_chance() {
        let frames = frames(3);
        let policy = PolicyState::new(&frames);
        policy.on_frame_assigned(0);
        policy.on_frame_assigned(1);
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
}
