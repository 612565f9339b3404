//! The recognizer session: one native handle, its delivery channels, and the
//! state machine that decides which operations are valid when.
//!
//! ```text
//!  AwaitingAuthorization ──(terminal outcome)──▶ Idle ◀───────────────┐
//!                                               │ start              │
//!                                               ▼                    │
//!                                           Listening ──stop──▶ Stopping
//!                                               │  (ended)           │ (stopped / ended)
//!                                               └────────────────────┘
//!  any state ──close──▶ Closed
//! ```
//!
//! Every public method runs on the runtime thread and returns without
//! waiting on the native service. Results, errors and lifecycle changes
//! arrive later, during [`RecognizerSession::dispatch_pending`].

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::auth::{AuthorizationGate, AuthorizationOutcome, AuthorizationRequest};
use crate::config::BridgeConfig;
use crate::dispatch::{CloseMode, CloseReport, EventDispatcher, Publisher};
use crate::error::{BridgeError, RecognitionError, Result};
use crate::events::{RecognitionEvent, SessionStatus, Signal, Stamped};
use crate::handle::NativeSessionHandle;
use crate::runtime::LoopHandle;
use crate::speech::{EventSink, NativePlatform, StopMode};

// Status signals are few per listen cycle; a small queue is plenty.
const STATUS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAuthorization,
    Idle,
    Listening,
    Stopping,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingAuthorization => "awaiting authorization",
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Stopping => "stopping",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Counts from one [`RecognizerSession::dispatch_pending`] turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub results: usize,
    pub errors: usize,
    pub status: usize,
    pub authorization: Option<AuthorizationOutcome>,
}

impl DispatchSummary {
    pub fn is_empty(&self) -> bool {
        self.results == 0 && self.errors == 0 && self.status == 0 && self.authorization.is_none()
    }
}

/// What teardown did with undelivered events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub results: CloseReport,
    pub errors: CloseReport,
    /// The native release reported an error (already logged)
    pub release_failed: bool,
}

// Every queue entry carries the listen generation of the sink that sent it.
struct Channels {
    results: EventDispatcher<Stamped<RecognitionEvent>>,
    results_tx: Publisher<Stamped<RecognitionEvent>>,
    errors: EventDispatcher<Stamped<RecognitionError>>,
    errors_tx: Publisher<Stamped<RecognitionError>>,
    status: EventDispatcher<Stamped<Signal>>,
    status_tx: Publisher<Stamped<Signal>>,
}

/// A speech recognition session bound to the runtime thread.
///
/// Owns the native recognizer from construction until [`close`] (or drop),
/// and at most one listen cycle at a time.
///
/// Callbacks run inside [`dispatch_pending`] and must not call back into the
/// session.
///
/// [`close`]: RecognizerSession::close
/// [`dispatch_pending`]: RecognizerSession::dispatch_pending
pub struct RecognizerSession {
    state: SessionState,
    handle: NativeSessionHandle,
    channels: Channels,
    auth: AuthorizationGate,
    status_callback: Option<Box<dyn FnMut(SessionStatus)>>,
    disposed: Arc<AtomicBool>,
    runtime: LoopHandle,
    config: BridgeConfig,
    requires_authorization: bool,
    /// Listen cycle of the last `start`; callbacks only see its events
    generation: Rc<Cell<u64>>,
    /// Generation sinks may still publish for; 0 between cycles
    active: Arc<AtomicU64>,
}

impl RecognizerSession {
    /// Acquire a native recognizer from `platform` and build its channels.
    ///
    /// Fails if the recognizer cannot be created or if the runtime can no
    /// longer accept dispatchers; in both cases nothing is left behind.
    pub fn new(
        platform: &dyn NativePlatform,
        config: BridgeConfig,
        runtime: &LoopHandle,
    ) -> Result<Self> {
        runtime.ensure_runtime_thread("create session")?;

        // Channels first: without them events would be lost unobserved, so
        // there is no point in touching the platform.
        let (results, results_tx) =
            EventDispatcher::new("results", config.channel_capacity, runtime)?;
        let (errors, errors_tx) = EventDispatcher::new("errors", config.channel_capacity, runtime)?;
        let (status, status_tx) = EventDispatcher::new("status", STATUS_CAPACITY, runtime)?;

        let handle = NativeSessionHandle::acquire(platform, &config)?;
        let native = handle.get()?;
        let requires_authorization = config.require_authorization && native.authorization_required();
        let initial = if requires_authorization {
            native.authorization_status()
        } else {
            AuthorizationOutcome::Granted
        };
        let state = if initial.is_terminal() {
            SessionState::Idle
        } else {
            SessionState::AwaitingAuthorization
        };

        info!(
            platform = handle.platform(),
            locale = %config.locale,
            authorization = %initial,
            "recognizer session created"
        );

        Ok(Self {
            state,
            handle,
            channels: Channels {
                results,
                results_tx,
                errors,
                errors_tx,
                status,
                status_tx,
            },
            auth: AuthorizationGate::new(runtime.clone(), initial),
            status_callback: None,
            disposed: Arc::new(AtomicBool::new(false)),
            runtime: runtime.clone(),
            config,
            requires_authorization,
            generation: Rc::new(Cell::new(0)),
            active: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last authorization outcome observed, if any request resolved or the
    /// platform reported one at construction.
    pub fn authorization(&self) -> Option<AuthorizationOutcome> {
        self.auth.outcome()
    }

    pub fn locale(&self) -> &str {
        &self.config.locale
    }

    pub fn on_result(&mut self, callback: impl FnMut(RecognitionEvent) + 'static) {
        self.channels
            .results
            .register(current_cycle_only("result", &self.generation, callback));
    }

    pub fn on_error(&mut self, callback: impl FnMut(RecognitionError) + 'static) {
        self.channels
            .errors
            .register(current_cycle_only("error", &self.generation, callback));
    }

    pub fn on_status(&mut self, callback: impl FnMut(SessionStatus) + 'static) {
        self.status_callback = Some(Box::new(callback));
    }

    /// Ask for speech recognition permission.
    ///
    /// Answers from the cache once a terminal outcome is known; requests made
    /// while a prompt is pending share it.
    pub fn request_authorization(&mut self) -> Result<AuthorizationRequest> {
        self.ensure_open()?;
        let native = self.handle.get_mut()?;
        self.auth.request(native)
    }

    /// Begin listening. Results and errors arrive through the registered
    /// callbacks on later dispatch turns.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        match self.state {
            SessionState::Idle => {}
            SessionState::AwaitingAuthorization => return Err(BridgeError::AuthorizationRequired),
            state => {
                return Err(BridgeError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }
        if self.requires_authorization {
            self.auth
                .outcome()
                .unwrap_or(AuthorizationOutcome::Undetermined)
                .require_granted()?;
        }

        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        self.active.store(generation, Ordering::Release);
        let sink = EventSink::new(
            self.channels.results_tx.clone(),
            self.channels.errors_tx.clone(),
            self.channels.status_tx.clone(),
            Arc::clone(&self.disposed),
            Arc::clone(&self.active),
            generation,
        );

        let native = self.handle.get_mut()?;
        match native.start(sink) {
            Ok(()) => {
                self.transition(SessionState::Listening);
            }
            Err(err) => {
                // Native failures are reported asynchronously, like any
                // other failure raised by the service.
                warn!(code = err.code, "native start failed: {}", err.message);
                self.active.store(0, Ordering::Release);
                self.channels.errors_tx.publish(Stamped {
                    generation,
                    event: err,
                });
            }
        }
        Ok(())
    }

    /// Stop listening. Harmless when not listening.
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state != SessionState::Listening {
            debug!(state = %self.state, "stop ignored");
            return Ok(());
        }

        self.transition(SessionState::Stopping);
        let native = self.handle.get_mut()?;
        match native.stop() {
            StopMode::Completed => self.finish_listening(),
            StopMode::Deferred => debug!("waiting for native stop confirmation"),
        }
        Ok(())
    }

    /// Runtime turn: resolve authorization, apply lifecycle signals, then
    /// deliver queued results and errors to their callbacks.
    pub fn dispatch_pending(&mut self) -> Result<DispatchSummary> {
        self.runtime.ensure_runtime_thread("dispatch events")?;
        self.ensure_open()?;

        let mut summary = DispatchSummary::default();

        if let Some(outcome) = self.auth.pump()? {
            summary.authorization = Some(outcome);
            if self.state == SessionState::AwaitingAuthorization && outcome.is_terminal() {
                self.transition(SessionState::Idle);
            }
        }

        let mut signals = Vec::new();
        summary.status = self.channels.status.deliver_with(|signal| signals.push(signal))?;
        for signal in signals {
            self.apply_signal(signal);
        }

        summary.results = self.channels.results.deliver_on_runtime_thread()?;
        summary.errors = self.channels.errors.deliver_on_runtime_thread()?;
        Ok(summary)
    }

    /// Tear the session down. Never fails; later calls do nothing.
    ///
    /// Once this returns the native recognizer is released, every channel is
    /// closed and no callback will run again.
    pub fn close(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == SessionState::Closed {
            return report;
        }

        // Native callbacks racing with teardown see this before anything else.
        self.disposed.store(true, Ordering::Release);

        if self.state == SessionState::Listening {
            if let Ok(native) = self.handle.get_mut() {
                native.stop();
            }
        }
        if let Err(err) = self.handle.release() {
            warn!(code = err.code, "native release failed: {}", err.message);
            report.release_failed = true;
        }

        self.auth.close();
        let mode = CloseMode::from(self.config.teardown);
        report.results = self.channels.results.close(mode);
        report.errors = self.channels.errors.close(mode);
        self.channels.status.close(CloseMode::Discard);
        self.status_callback = None;

        self.transition(SessionState::Closed);
        info!(
            discarded_results = report.results.discarded,
            discarded_errors = report.errors.discarded,
            "recognizer session closed"
        );
        report
    }

    fn apply_signal(&mut self, status: Stamped<Signal>) {
        if status.generation != self.generation.get() {
            debug!(
                generation = status.generation,
                current = self.generation.get(),
                "ignoring stale status signal"
            );
            return;
        }

        match (status.event, self.state) {
            (Signal::Started, SessionState::Listening) => self.notify(SessionStatus::Started),
            (Signal::Stopped, SessionState::Stopping)
            | (Signal::Ended, SessionState::Stopping)
            | (Signal::Ended, SessionState::Listening) => self.finish_listening(),
            (signal, state) => debug!(?signal, %state, "status signal ignored"),
        }
    }

    fn finish_listening(&mut self) {
        self.active.store(0, Ordering::Release);
        self.transition(SessionState::Idle);
        self.notify(SessionStatus::Stopped);
    }

    fn notify(&mut self, status: SessionStatus) {
        if let Some(callback) = self.status_callback.as_mut() {
            callback(status);
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "session transition");
            self.state = next;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            Err(BridgeError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// Wrap a user callback so entries stamped by an earlier listen cycle are
/// dropped instead of delivered.
fn current_cycle_only<T: 'static>(
    kind: &'static str,
    generation: &Rc<Cell<u64>>,
    mut callback: impl FnMut(T) + 'static,
) -> impl FnMut(Stamped<T>) + 'static {
    let generation = Rc::clone(generation);
    move |stamped| {
        if stamped.generation == generation.get() {
            callback(stamped.event);
        } else {
            trace!(
                kind,
                generation = stamped.generation,
                "dropping entry from an earlier cycle"
            );
        }
    }
}

impl Drop for RecognizerSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RecognizerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognizerSession")
            .field("state", &self.state)
            .field("platform", &self.handle.platform())
            .field("locale", &self.config.locale)
            .field("generation", &self.generation.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::runtime::RuntimeLoop;
    use crate::speech::{MockController, MockPlatform};

    fn granted_session(runtime: &RuntimeLoop) -> (RecognizerSession, MockController) {
        let (platform, controller) = MockPlatform::manual();
        controller.set_authorization_status(AuthorizationOutcome::Granted);
        let session =
            RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle()).unwrap();
        (session, controller)
    }

    #[test]
    fn undetermined_platform_starts_awaiting_authorization() {
        let runtime = RuntimeLoop::new();
        let (platform, _controller) = MockPlatform::manual();
        let mut session =
            RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle()).unwrap();

        assert_eq!(session.state(), SessionState::AwaitingAuthorization);
        assert!(matches!(session.start(), Err(BridgeError::AuthorizationRequired)));
    }

    #[test]
    fn platform_without_permission_model_is_idle_immediately() {
        let runtime = RuntimeLoop::new();
        let (platform, controller) = MockPlatform::manual();
        controller.set_authorization_required(false);
        let mut session =
            RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle()).unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Listening);
    }

    #[test]
    fn second_start_is_invalid() {
        let runtime = RuntimeLoop::new();
        let (mut session, controller) = granted_session(&runtime);

        session.start().unwrap();
        let err = session.start().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidState {
                operation: "start",
                state: SessionState::Listening
            }
        ));
        assert_eq!(controller.starts(), 1);
    }

    #[test]
    fn deferred_stop_waits_for_confirmation() {
        let runtime = RuntimeLoop::new();
        let (mut session, controller) = granted_session(&runtime);
        controller.set_stop_mode(StopMode::Deferred);
        let statuses = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&statuses);
        session.on_status(move |status| seen.borrow_mut().push(status));

        session.start().unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopping);
        assert!(matches!(
            session.start(),
            Err(BridgeError::InvalidState {
                state: SessionState::Stopping,
                ..
            })
        ));
        session.stop().unwrap();

        controller.confirm_stop();
        session.dispatch_pending().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(*statuses.borrow(), vec![SessionStatus::Stopped]);
    }

    #[test]
    fn native_start_failure_goes_to_error_channel() {
        let runtime = RuntimeLoop::new();
        let (mut session, controller) = granted_session(&runtime);
        let errors = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&errors);
        session.on_error(move |err| seen.borrow_mut().push(err));

        controller.fail_next_start(RecognitionError::new(
            crate::error::codes::AUDIO_ENGINE,
            "engine failed",
        ));
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        session.dispatch_pending().unwrap();
        assert_eq!(errors.borrow().len(), 1);
        assert_eq!(errors.borrow()[0].code, crate::error::codes::AUDIO_ENGINE);
    }

    #[test]
    fn stale_signals_from_earlier_cycle_are_ignored() {
        let runtime = RuntimeLoop::new();
        let (mut session, controller) = granted_session(&runtime);

        session.start().unwrap();
        let old_sink = controller.take_sink().unwrap();
        session.stop().unwrap();
        session.start().unwrap();

        old_sink.ended();
        session.dispatch_pending().unwrap();
        assert_eq!(session.state(), SessionState::Listening);
    }

    #[test]
    fn results_and_errors_from_earlier_cycle_are_not_delivered() {
        let runtime = RuntimeLoop::new();
        let (mut session, controller) = granted_session(&runtime);
        let results = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(RefCell::new(Vec::new()));
        {
            let results = Rc::clone(&results);
            session.on_result(move |event: RecognitionEvent| results.borrow_mut().push(event));
            let errors = Rc::clone(&errors);
            session.on_error(move |err: RecognitionError| errors.borrow_mut().push(err));
        }

        session.start().unwrap();
        let old_sink = controller.take_sink().unwrap();
        session.stop().unwrap();
        assert_eq!(
            old_sink.final_text("after stop"),
            crate::dispatch::Published::Dropped(crate::dispatch::DropReason::Stale)
        );
        session.start().unwrap();

        // Refused at the sink once the cycle is over
        assert!(!old_sink.is_current());
        old_sink.final_text("from the first cycle");
        old_sink.error(RecognitionError::new(crate::error::codes::RECOGNITION, "first cycle"));

        // Entries that were already in flight are filtered on delivery
        let old_generation = session.generation.get() - 1;
        session.channels.results_tx.publish(Stamped {
            generation: old_generation,
            event: RecognitionEvent::Partial { text: "in flight".into() },
        });
        session.channels.errors_tx.publish(Stamped {
            generation: old_generation,
            event: RecognitionError::new(crate::error::codes::RECOGNITION, "in flight"),
        });

        controller.emit_partial("current");
        session.dispatch_pending().unwrap();
        assert_eq!(
            *results.borrow(),
            vec![RecognitionEvent::Partial { text: "current".into() }]
        );
        assert!(errors.borrow().is_empty());
    }

    #[test]
    fn platform_end_closes_the_cycle_for_its_sink() {
        let runtime = RuntimeLoop::new();
        let (mut session, controller) = granted_session(&runtime);

        session.start().unwrap();
        let sink = controller.take_sink().unwrap();
        sink.ended();
        session.dispatch_pending().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!sink.is_current());
        assert_eq!(
            sink.partial("late"),
            crate::dispatch::Published::Dropped(crate::dispatch::DropReason::Stale)
        );
    }

    #[test]
    fn operations_after_close_report_disposed() {
        let runtime = RuntimeLoop::new();
        let (mut session, controller) = granted_session(&runtime);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(controller.live_handles(), 0);
        assert!(matches!(session.start(), Err(BridgeError::Disposed)));
        assert!(matches!(session.stop(), Err(BridgeError::Disposed)));
        assert!(matches!(session.request_authorization(), Err(BridgeError::Disposed)));
        assert!(matches!(session.dispatch_pending(), Err(BridgeError::Disposed)));
        assert_eq!(session.close(), TeardownReport::default());
    }

    #[test]
    fn release_failure_does_not_block_teardown() {
        let runtime = RuntimeLoop::new();
        let (mut session, controller) = granted_session(&runtime);
        controller.fail_next_release(RecognitionError::new(99, "busy"));

        let report = session.close();
        assert!(report.release_failed);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(controller.live_handles(), 0);
    }

    #[test]
    fn construction_fails_when_runtime_is_shutting_down() {
        let runtime = RuntimeLoop::new();
        runtime.begin_shutdown();
        let (platform, controller) = MockPlatform::manual();

        let err = RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle())
            .unwrap_err();
        assert!(matches!(err, BridgeError::DispatcherUnavailable { .. }));
        assert_eq!(controller.live_handles(), 0);
    }
}
