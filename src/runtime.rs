//! The application runtime's thread.
//!
//! A [`RuntimeLoop`] is created on the thread that runs the host's event loop.
//! It remembers that thread and owns the receiving end of a wake-up signal;
//! the cloneable [`LoopHandle`] travels to native threads so they can ask for
//! a runtime turn after publishing an event.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::error::{BridgeError, Result};

struct LoopShared {
    thread: ThreadId,
    wake_tx: Sender<()>,
    shutting_down: AtomicBool,
}

/// Runtime-thread side of the loop. Not `Send`.
pub struct RuntimeLoop {
    shared: Arc<LoopShared>,
    wake_rx: Receiver<()>,
    _not_send: PhantomData<*const ()>,
}

impl RuntimeLoop {
    /// Bind a loop to the calling thread.
    pub fn new() -> Self {
        // One slot is enough: wake-ups coalesce until the next turn.
        let (wake_tx, wake_rx) = channel::bounded(1);
        let shared = Arc::new(LoopShared {
            thread: thread::current().id(),
            wake_tx,
            shutting_down: AtomicBool::new(false),
        });
        Self {
            shared,
            wake_rx,
            _not_send: PhantomData,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block until a publisher wakes the loop or `timeout` elapses.
    ///
    /// Returns `true` when woken.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.wake_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            // The loop holds a sender itself, so this never disconnects.
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Consume a pending wake-up without blocking.
    pub fn take_wake(&self) -> bool {
        self.wake_rx.try_recv().is_ok()
    }

    /// Mark the runtime as shutting down. New dispatchers can no longer be
    /// created against it.
    pub fn begin_shutdown(&self) {
        debug!("runtime loop shutting down");
        self.shared.shutting_down.store(true, Ordering::SeqCst);
    }
}

impl Default for RuntimeLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe reference to a [`RuntimeLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Request a runtime turn. Never blocks.
    pub fn wake(&self) {
        let _ = self.shared.wake_tx.try_send(());
    }

    pub fn is_runtime_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_runtime_thread(&self, operation: &'static str) -> Result<()> {
        if self.is_runtime_thread() {
            Ok(())
        } else {
            Err(BridgeError::WrongThread { operation })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_from_another_thread_coalesces() {
        let runtime = RuntimeLoop::new();
        let handle = runtime.handle();

        thread::spawn(move || {
            handle.wake();
            handle.wake();
            handle.wake();
        })
        .join()
        .unwrap();

        assert!(runtime.wait(Duration::from_millis(100)));
        assert!(!runtime.take_wake());
    }

    #[test]
    fn only_the_creating_thread_is_the_runtime_thread() {
        let runtime = RuntimeLoop::new();
        let handle = runtime.handle();
        assert!(handle.is_runtime_thread());

        let remote = thread::spawn(move || handle.ensure_runtime_thread("deliver"))
            .join()
            .unwrap();
        assert!(matches!(
            remote,
            Err(BridgeError::WrongThread {
                operation: "deliver"
            })
        ));
    }

    #[test]
    fn wait_times_out_without_publishers() {
        let runtime = RuntimeLoop::new();
        assert!(!runtime.wait(Duration::from_millis(10)));
    }
}
