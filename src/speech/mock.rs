//! Mock speech recognizer for platforms without native support.
//!
//! Two flavours:
//! - [`MockPlatform::scripted`] simulates speech recognition with demo text on
//!   a background thread, for development on unsupported platforms.
//! - [`MockPlatform::manual`] hands back a [`MockController`] so tests can play
//!   the native side from any thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::thread;
use std::time::Duration;

use crate::auth::AuthorizationOutcome;
use crate::config::BridgeConfig;
use crate::dispatch::Published;
use crate::error::RecognitionError;
use crate::speech::{AuthorizationCallback, EventSink, NativePlatform, NativeRecognizer, StopMode};

const DEMO_WORDS: [&str; 17] = [
    "Hello",
    "world,",
    "this",
    "is",
    "a",
    "demo",
    "of",
    "speech",
    "recognition.",
    "The",
    "words",
    "fade",
    "in",
    "as",
    "they",
    "are",
    "transcribed...",
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Scripted,
    Manual,
}

struct MockInner {
    auth_status: AuthorizationOutcome,
    auth_required: bool,
    pending_auth: Vec<AuthorizationCallback>,
    auth_prompts: usize,
    sink: Option<EventSink>,
    live_handles: usize,
    max_live_handles: usize,
    starts: usize,
    stops: usize,
    stop_mode: StopMode,
    fail_acquire: Option<RecognitionError>,
    fail_start: Option<RecognitionError>,
    fail_release: Option<RecognitionError>,
}

struct MockState {
    inner: Mutex<MockInner>,
}

impl MockState {
    fn lock(&self) -> MutexGuard<'_, MockInner> {
        // Test assertions may panic while the lock is held; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MockPlatform {
    state: Arc<MockState>,
    mode: Mode,
}

impl MockPlatform {
    /// Demo recognizer: emits the demo words as growing partial results,
    /// then a final result. Authorization is pre-granted.
    pub fn scripted() -> Self {
        let (mut platform, _) = Self::manual();
        platform.mode = Mode::Scripted;
        platform.state.lock().auth_status = AuthorizationOutcome::Granted;
        platform
    }

    /// Test recognizer driven through the returned controller. Starts with
    /// authorization undetermined and synchronous stop.
    pub fn manual() -> (Self, MockController) {
        let state = Arc::new(MockState {
            inner: Mutex::new(MockInner {
                auth_status: AuthorizationOutcome::Undetermined,
                auth_required: true,
                pending_auth: Vec::new(),
                auth_prompts: 0,
                sink: None,
                live_handles: 0,
                max_live_handles: 0,
                starts: 0,
                stops: 0,
                stop_mode: StopMode::Completed,
                fail_acquire: None,
                fail_start: None,
                fail_release: None,
            }),
        });
        let controller = MockController {
            state: Arc::clone(&state),
        };
        (
            Self {
                state,
                mode: Mode::Manual,
            },
            controller,
        )
    }
}

impl NativePlatform for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn acquire(&self, config: &BridgeConfig) -> Result<Box<dyn NativeRecognizer>, RecognitionError> {
        let mut inner = self.state.lock();
        if let Some(err) = inner.fail_acquire.take() {
            return Err(err);
        }
        inner.live_handles += 1;
        inner.max_live_handles = inner.max_live_handles.max(inner.live_handles);
        drop(inner);

        Ok(Box::new(MockRecognizerImpl {
            state: Arc::clone(&self.state),
            mode: self.mode,
            report_partial_results: config.report_partial_results,
            stop_signal: Arc::new(AtomicBool::new(false)),
            released: false,
        }))
    }
}

struct MockRecognizerImpl {
    state: Arc<MockState>,
    mode: Mode,
    report_partial_results: bool,
    stop_signal: Arc<AtomicBool>,
    released: bool,
}

impl MockRecognizerImpl {
    fn run_script(&self, sink: EventSink) {
        let stop_signal = Arc::clone(&self.stop_signal);
        let report_partial_results = self.report_partial_results;

        // Simulate speech recognition with demo text
        thread::spawn(move || {
            sink.started();
            let mut transcription = String::new();

            for word in DEMO_WORDS.iter() {
                if stop_signal.load(Ordering::SeqCst) {
                    break;
                }

                thread::sleep(Duration::from_millis(400));

                if !transcription.is_empty() {
                    transcription.push(' ');
                }
                transcription.push_str(word);
                if report_partial_results && sink.partial(transcription.clone()) != Published::Queued {
                    break;
                }
            }

            sink.final_text(transcription);
            if stop_signal.load(Ordering::SeqCst) {
                sink.stopped();
            } else {
                sink.ended();
            }
        });
    }
}

impl NativeRecognizer for MockRecognizerImpl {
    fn authorization_required(&self) -> bool {
        self.state.lock().auth_required
    }

    fn authorization_status(&self) -> AuthorizationOutcome {
        self.state.lock().auth_status
    }

    fn request_authorization(&mut self, respond: AuthorizationCallback) {
        let mut inner = self.state.lock();
        inner.auth_prompts += 1;
        if self.mode == Mode::Scripted {
            let status = inner.auth_status;
            drop(inner);
            respond(status);
        } else {
            inner.pending_auth.push(respond);
        }
    }

    fn start(&mut self, sink: EventSink) -> Result<(), RecognitionError> {
        let mut inner = self.state.lock();
        if let Some(err) = inner.fail_start.take() {
            return Err(err);
        }
        inner.starts += 1;
        self.stop_signal = Arc::new(AtomicBool::new(false));

        match self.mode {
            Mode::Manual => {
                inner.sink = Some(sink);
            }
            Mode::Scripted => {
                drop(inner);
                self.run_script(sink);
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> StopMode {
        self.stop_signal.store(true, Ordering::SeqCst);
        let mut inner = self.state.lock();
        inner.stops += 1;
        match self.mode {
            Mode::Scripted => StopMode::Deferred,
            Mode::Manual => {
                if inner.stop_mode == StopMode::Completed {
                    inner.sink = None;
                }
                inner.stop_mode
            }
        }
    }

    fn release(&mut self) -> Result<(), RecognitionError> {
        self.stop_signal.store(true, Ordering::SeqCst);
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut inner = self.state.lock();
        inner.live_handles -= 1;
        match inner.fail_release.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for MockRecognizerImpl {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Plays the native side of a [`MockPlatform::manual`] recognizer.
///
/// `Send + Sync`; emitting from a spawned thread exercises the same path a
/// platform callback thread takes.
#[derive(Clone)]
pub struct MockController {
    state: Arc<MockState>,
}

impl MockController {
    /// The sink of the current listen cycle, if any.
    fn sink(&self) -> Option<EventSink> {
        self.state.lock().sink.clone()
    }

    pub fn emit_partial(&self, text: &str) -> Option<Published> {
        self.sink().map(|sink| sink.partial(text))
    }

    pub fn emit_final(&self, text: &str) -> Option<Published> {
        self.sink().map(|sink| sink.final_text(text))
    }

    pub fn emit_error(&self, code: i64, message: &str) -> Option<Published> {
        self.sink()
            .map(|sink| sink.error(RecognitionError::new(code, message)))
    }

    pub fn emit_started(&self) -> Option<Published> {
        self.sink().map(|sink| sink.started())
    }

    /// The platform ends the session by itself.
    pub fn end_session(&self) -> Option<Published> {
        let sink = self.state.lock().sink.take();
        sink.map(|sink| sink.ended())
    }

    /// Confirm a deferred stop.
    pub fn confirm_stop(&self) -> Option<Published> {
        let sink = self.state.lock().sink.take();
        sink.map(|sink| sink.stopped())
    }

    /// A sink captured earlier keeps working (or not) exactly like a stray
    /// platform callback would.
    pub fn take_sink(&self) -> Option<EventSink> {
        self.sink()
    }

    /// Answer every pending authorization prompt. Returns `false` if none
    /// was pending.
    pub fn resolve_authorization(&self, outcome: AuthorizationOutcome) -> bool {
        let pending = {
            let mut inner = self.state.lock();
            inner.auth_status = outcome;
            std::mem::take(&mut inner.pending_auth)
        };
        let answered = !pending.is_empty();
        for respond in pending {
            respond(outcome);
        }
        answered
    }

    pub fn set_authorization_status(&self, outcome: AuthorizationOutcome) {
        self.state.lock().auth_status = outcome;
    }

    pub fn set_authorization_required(&self, required: bool) {
        self.state.lock().auth_required = required;
    }

    pub fn set_stop_mode(&self, mode: StopMode) {
        self.state.lock().stop_mode = mode;
    }

    pub fn fail_next_acquire(&self, err: RecognitionError) {
        self.state.lock().fail_acquire = Some(err);
    }

    pub fn fail_next_start(&self, err: RecognitionError) {
        self.state.lock().fail_start = Some(err);
    }

    pub fn fail_next_release(&self, err: RecognitionError) {
        self.state.lock().fail_release = Some(err);
    }

    pub fn authorization_prompts(&self) -> usize {
        self.state.lock().auth_prompts
    }

    pub fn live_handles(&self) -> usize {
        self.state.lock().live_handles
    }

    /// Highest number of simultaneously live handles seen so far.
    pub fn max_live_handles(&self) -> usize {
        self.state.lock().max_live_handles
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }
}
