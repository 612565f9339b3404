//! Ordered delivery of events from native threads onto the runtime thread.
//!
//! Each channel is a bounded lock-free queue. Native threads hold a
//! [`Publisher`] and enqueue without blocking; the runtime thread owns the
//! [`EventDispatcher`] and drains the queue on its own turn, invoking the
//! single registered callback. Events are delivered in the order they were
//! published on that channel. Nothing orders one channel against another.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::error::{BridgeError, Result};
use crate::runtime::LoopHandle;

/// Default queue bound per channel.
pub const DEFAULT_CAPACITY: usize = 256;

/// Result of a single [`Publisher::publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Queued,
    Dropped(DropReason),
}

/// Why an event was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The channel was closed by teardown
    Closed,
    /// The runtime thread is not draining fast enough
    Full,
    /// The sender belongs to a listen cycle that is already over
    Stale,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Closed => f.write_str("channel closed"),
            DropReason::Full => f.write_str("channel full"),
            DropReason::Stale => f.write_str("listen cycle over"),
        }
    }
}

/// How queued events are treated when a channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Deliver queued events to the callback before closing
    Flush,
    /// Drop queued events without delivering them
    Discard,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub delivered: usize,
    pub discarded: usize,
}

struct Shared {
    channel: &'static str,
    closed: AtomicBool,
    dropped: AtomicUsize,
    runtime: LoopHandle,
}

/// Producer side of a channel. Cheap to clone and safe to use from any thread.
pub struct Publisher<T> {
    tx: Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> Publisher<T> {
    /// Enqueue an event for delivery on the runtime thread.
    ///
    /// Never blocks. Once the channel is closed every event is dropped.
    pub fn publish(&self, event: T) -> Published {
        if self.shared.closed.load(Ordering::Acquire) {
            return self.drop_event(DropReason::Closed);
        }

        match self.tx.try_send(event) {
            Ok(()) => {
                self.shared.runtime.wake();
                Published::Queued
            }
            Err(TrySendError::Full(_)) => self.drop_event(DropReason::Full),
            Err(TrySendError::Disconnected(_)) => self.drop_event(DropReason::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn drop_event(&self, reason: DropReason) -> Published {
        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        match reason {
            DropReason::Closed | DropReason::Stale => {
                trace!(channel = self.shared.channel, "dropped event: {reason}")
            }
            DropReason::Full => warn!(channel = self.shared.channel, "dropped event: {reason}"),
        }
        Published::Dropped(reason)
    }
}

/// Runtime-thread side of a channel.
pub struct EventDispatcher<T> {
    rx: Option<Receiver<T>>,
    shared: Arc<Shared>,
    callback: Option<Box<dyn FnMut(T)>>,
}

impl<T: Send + 'static> EventDispatcher<T> {
    /// Create a channel bound to the runtime behind `runtime`.
    ///
    /// Must be called on the runtime thread, and fails once the runtime has
    /// begun shutting down.
    pub fn new(
        channel: &'static str,
        capacity: usize,
        runtime: &LoopHandle,
    ) -> Result<(Self, Publisher<T>)> {
        if runtime.is_shutting_down() {
            return Err(BridgeError::DispatcherUnavailable {
                channel,
                reason: "runtime is shutting down",
            });
        }
        runtime.ensure_runtime_thread("create dispatcher")?;
        if capacity == 0 {
            return Err(BridgeError::DispatcherUnavailable {
                channel,
                reason: "capacity must be at least one",
            });
        }

        let (tx, rx) = channel::bounded(capacity);
        let shared = Arc::new(Shared {
            channel,
            closed: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
            runtime: runtime.clone(),
        });
        debug!(channel, capacity, "dispatcher created");

        let publisher = Publisher {
            tx,
            shared: Arc::clone(&shared),
        };
        let dispatcher = Self {
            rx: Some(rx),
            shared,
            callback: None,
        };
        Ok((dispatcher, publisher))
    }

    /// Register the channel's callback, replacing any earlier one.
    pub fn register(&mut self, callback: impl FnMut(T) + 'static) {
        if self.callback.is_some() {
            debug!(channel = self.shared.channel, "replacing callback");
        }
        self.callback = Some(Box::new(callback));
    }

    /// Deliver the events queued so far to the registered callback.
    ///
    /// Without a callback the events stay queued. Returns how many were
    /// delivered.
    pub fn deliver_on_runtime_thread(&mut self) -> Result<usize> {
        let Some(mut callback) = self.callback.take() else {
            self.shared.runtime.ensure_runtime_thread("deliver events")?;
            return Ok(0);
        };
        let delivered = self.deliver_with(&mut callback);
        self.callback = Some(callback);
        delivered
    }

    /// Deliver the events queued so far to `consumer` instead of the
    /// registered callback.
    pub fn deliver_with(&mut self, mut consumer: impl FnMut(T)) -> Result<usize> {
        self.shared.runtime.ensure_runtime_thread("deliver events")?;
        if self.is_closed() {
            return Ok(0);
        }
        let Some(rx) = self.rx.as_ref() else {
            return Ok(0);
        };

        // Bound the turn to what is queued now so a busy producer cannot
        // starve the runtime thread.
        let batch = rx.len();
        let mut delivered = 0;
        for _ in 0..batch {
            match rx.try_recv() {
                Ok(event) => {
                    consumer(event);
                    delivered += 1;
                }
                Err(_) => break,
            }
        }
        if delivered > 0 {
            trace!(channel = self.shared.channel, delivered, "delivered events");
        }
        Ok(delivered)
    }

    /// Close the channel. Later publishes are dropped; queued events are
    /// delivered or discarded according to `mode`. Idempotent.
    pub fn close(&mut self, mode: CloseMode) -> CloseReport {
        let mut report = CloseReport::default();
        let Some(rx) = self.rx.take() else {
            return report;
        };
        self.shared.closed.store(true, Ordering::Release);

        let flush = mode == CloseMode::Flush && self.shared.runtime.is_runtime_thread();
        while let Ok(event) = rx.try_recv() {
            match self.callback.as_mut() {
                Some(callback) if flush => {
                    callback(event);
                    report.delivered += 1;
                }
                _ => report.discarded += 1,
            }
        }
        // Dropping the receiver makes racing publishers observe `Closed`.
        drop(rx);
        self.callback = None;

        if report.discarded > 0 {
            warn!(
                channel = self.shared.channel,
                discarded = report.discarded,
                "discarded undelivered events on close"
            );
        }
        debug!(
            channel = self.shared.channel,
            delivered = report.delivered,
            "dispatcher closed"
        );
        report
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Events queued and not yet delivered.
    pub fn pending(&self) -> usize {
        self.rx.as_ref().map_or(0, |rx| rx.len())
    }

    /// Events dropped by publishers because the channel was full or closed.
    pub fn dropped(&self) -> usize {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn channel(&self) -> &'static str {
        self.shared.channel
    }
}

impl<T> Drop for EventDispatcher<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}
