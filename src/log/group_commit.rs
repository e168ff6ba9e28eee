use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{error::StorageResult, Lsn};

/// Batches commit forces.
///
/// A committer whose LSN is not yet durable registers as pending. While fewer
/// commits are pending than transactions are active (95% of them once more
/// than twenty are active) it waits up to the window for someone else's force
/// to cover its LSN. The committer that
/// finds enough company, or whose window expires, forces the log and wakes
/// everyone else.
#[derive(Debug)]
pub(crate) struct GroupCommit {
    pending: Mutex<usize>,
    forced: Condvar,
    window: Duration,
    active: Arc<AtomicUsize>,
}

impl GroupCommit {
    pub(crate) fn new(window: Duration, active: Arc<AtomicUsize>) -> Self {
        if window > Duration::from_secs(1) {
            tracing::warn!(?window, "group commit window above one second delays every commit");
        }
        Self {
            pending: Mutex::new(0),
            forced: Condvar::new(),
            window,
            active,
        }
    }

    /// Above this many active transactions a group is full at 95% of them.
    const LARGE_GROUP: usize = 20;

    fn should_wait(pending: usize, active: usize) -> bool {
        if active <= 1 {
            return false;
        }
        if active > Self::LARGE_GROUP {
            pending * 100 < active * 95
        } else {
            pending < active
        }
    }

    /// Returns once `lsn` is durable, calling `force_tail` at most once.
    pub(crate) fn force(
        &self,
        lsn: Lsn,
        is_durable: impl Fn(Lsn) -> bool,
        force_tail: impl FnOnce() -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut pending = self.pending.lock();
        if is_durable(lsn) {
            return Ok(());
        }
        *pending += 1;

        let active = self.active.load(Ordering::Acquire);
        if !self.window.is_zero() && Self::should_wait(*pending, active) {
            let deadline = Instant::now() + self.window;
            while !self.forced.wait_until(&mut pending, deadline).timed_out() {
                if is_durable(lsn) {
                    *pending -= 1;
                    return Ok(());
                }
            }
        }

        let result = if is_durable(lsn) {
            Ok(())
        } else {
            let result = force_tail();
            self.forced.notify_all();
            result
        };
        *pending -= 1;
        result
    }
}
