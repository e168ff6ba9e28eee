use std::{
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};

use crate::buffer_manager::BufferManager;

#[derive(Debug, Default)]
struct WorkerState {
    requested: bool,
    stopping: bool,
}

#[derive(Debug, Default)]
struct Signal {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

/// Background thread that flushes the dirty page table when woken.
///
/// The buffer manager wakes it on page misses once the dirty page count
/// reaches the high-water mark, so eviction rarely has to write back a page
/// itself.
#[derive(Debug)]
pub(crate) struct WritebackWorker {
    signal: Arc<Signal>,
    high_water: usize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WritebackWorker {
    pub(crate) fn spawn(buffers: Weak<BufferManager>, high_water: usize) -> std::io::Result<Self> {
        let signal = Arc::new(Signal::default());
        let thread_signal = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name("txstore-writeback".into())
            .spawn(move || run(buffers, thread_signal))?;
        tracing::debug!(high_water, "write-back worker started");
        Ok(Self {
            signal,
            high_water,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Wakes the worker if `dirty_count` has reached the high-water mark.
    pub(crate) fn maybe_wake(&self, dirty_count: usize) {
        if dirty_count < self.high_water {
            return;
        }
        let mut state = self.signal.state.lock();
        if !state.requested {
            state.requested = true;
            self.signal.cond.notify_one();
        }
    }

    pub(crate) fn stop(&self) {
        {
            let mut state = self.signal.state.lock();
            state.stopping = true;
            self.signal.cond.notify_one();
        }
        if let Some(handle) = self.thread.lock().take() {
            // The worker itself may drop the last buffer manager reference.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("write-back worker panicked");
            }
        }
    }
}

impl Drop for WritebackWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(buffers: Weak<BufferManager>, signal: Arc<Signal>) {
    loop {
        {
            let mut state = signal.state.lock();
            while !state.requested && !state.stopping {
                signal.cond.wait(&mut state);
            }
            if state.stopping {
                return;
            }
            state.requested = false;
        }
        let Some(buffers) = buffers.upgrade() else {
            return;
        };
        match buffers.flush_all() {
            Ok(written) => tracing::trace!(written, "write-back pass"),
            Err(e) => {
                // The store checks the flag before every operation.
                buffers.record_failure(&e);
                return;
            }
        }
    }
}
