//! The native speech-recognition boundary, with platform-specific backends.
//!
//! - macOS: Native Speech framework via objc2-speech
//! - Windows: Native Windows.Media.SpeechRecognition API
//! - Linux: Vosk offline speech recognition (`vosk` feature)
//! - Everywhere: Mock implementation for testing/development
//!
//! Backends never see the session. Everything they report goes through an
//! [`EventSink`], which is the only session-owned object allowed onto native
//! threads.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::auth::AuthorizationOutcome;
use crate::config::BridgeConfig;
use crate::dispatch::{DropReason, Published, Publisher};
use crate::error::RecognitionError;
use crate::events::{RecognitionEvent, Signal, Stamped};

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(all(target_os = "linux", feature = "vosk"))]
mod linux;

pub mod mock;

#[cfg(target_os = "macos")]
pub use macos::MacSpeechPlatform;

#[cfg(target_os = "windows")]
pub use windows::WindowsSpeechPlatform;

#[cfg(all(target_os = "linux", feature = "vosk"))]
pub use linux::VoskPlatform;

pub use mock::{MockController, MockPlatform};

/// Callback handed to the platform's authorization prompt. May run on any
/// thread, at most once.
pub type AuthorizationCallback = Box<dyn FnOnce(AuthorizationOutcome) + Send + 'static>;

/// How a backend completed a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Recognition has ceased by the time `stop` returns
    Completed,
    /// The backend will confirm through [`EventSink::stopped`]
    Deferred,
}

/// Factory for native recognizers.
pub trait NativePlatform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the platform recognizer. Called once per session.
    fn acquire(&self, config: &BridgeConfig) -> Result<Box<dyn NativeRecognizer>, RecognitionError>;
}

/// An acquired platform recognizer.
pub trait NativeRecognizer {
    /// Whether the platform requires a permission grant before `start`.
    fn authorization_required(&self) -> bool {
        true
    }

    /// Current authorization status, without prompting.
    fn authorization_status(&self) -> AuthorizationOutcome;

    /// Ask the platform for permission. Must not block; `respond` is called
    /// later from any thread.
    fn request_authorization(&mut self, respond: AuthorizationCallback);

    /// Begin producing events into `sink`. Must not block on recognition.
    fn start(&mut self, sink: EventSink) -> Result<(), RecognitionError>;

    fn stop(&mut self) -> StopMode;

    /// Free platform resources. Called exactly once.
    fn release(&mut self) -> Result<(), RecognitionError>;
}

/// Thread-safe entry point for native callbacks.
///
/// Every method checks the session's disposed flag first, so a callback that
/// fires after teardown touches nothing. A sink is bound to one listen cycle:
/// once that cycle is over (stopped, ended or replaced by a new `start`) its
/// events are dropped.
#[derive(Clone)]
pub struct EventSink {
    results: Publisher<Stamped<RecognitionEvent>>,
    errors: Publisher<Stamped<RecognitionError>>,
    status: Publisher<Stamped<Signal>>,
    disposed: Arc<AtomicBool>,
    active: Arc<AtomicU64>,
    generation: u64,
}

impl EventSink {
    pub(crate) fn new(
        results: Publisher<Stamped<RecognitionEvent>>,
        errors: Publisher<Stamped<RecognitionError>>,
        status: Publisher<Stamped<Signal>>,
        disposed: Arc<AtomicBool>,
        active: Arc<AtomicU64>,
        generation: u64,
    ) -> Self {
        Self {
            results,
            errors,
            status,
            disposed,
            active,
            generation,
        }
    }

    pub fn partial(&self, text: impl Into<String>) -> Published {
        self.result(RecognitionEvent::Partial { text: text.into() })
    }

    pub fn final_text(&self, text: impl Into<String>) -> Published {
        self.result(RecognitionEvent::Final { text: text.into() })
    }

    pub fn result(&self, event: RecognitionEvent) -> Published {
        if let Some(dropped) = self.refuse("result") {
            return dropped;
        }
        self.results.publish(self.stamp(event))
    }

    pub fn error(&self, error: RecognitionError) -> Published {
        if let Some(dropped) = self.refuse("error") {
            return dropped;
        }
        self.errors.publish(self.stamp(error))
    }

    /// Audio is flowing.
    pub fn started(&self) -> Published {
        self.signal(Signal::Started)
    }

    /// A deferred stop has completed.
    pub fn stopped(&self) -> Published {
        self.signal(Signal::Stopped)
    }

    /// The platform ended the session without being asked to.
    pub fn ended(&self) -> Published {
        self.signal(Signal::Ended)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether this sink's listen cycle is still the session's current one.
    pub fn is_current(&self) -> bool {
        self.active.load(Ordering::Acquire) == self.generation
    }

    fn signal(&self, signal: Signal) -> Published {
        if let Some(dropped) = self.refuse("status") {
            return dropped;
        }
        self.status.publish(self.stamp(signal))
    }

    fn stamp<T>(&self, event: T) -> Stamped<T> {
        Stamped {
            generation: self.generation,
            event,
        }
    }

    fn refuse(&self, kind: &'static str) -> Option<Published> {
        if self.is_disposed() {
            trace!(kind, "native callback after teardown ignored");
            return Some(Published::Dropped(DropReason::Closed));
        }
        if !self.is_current() {
            trace!(
                kind,
                generation = self.generation,
                "native callback from a finished cycle ignored"
            );
            return Some(Published::Dropped(DropReason::Stale));
        }
        None
    }
}

/// The platform this build talks to natively.
#[cfg(target_os = "macos")]
pub fn default_platform() -> Box<dyn NativePlatform> {
    Box::new(MacSpeechPlatform)
}

#[cfg(target_os = "windows")]
pub fn default_platform() -> Box<dyn NativePlatform> {
    Box::new(WindowsSpeechPlatform)
}

#[cfg(all(target_os = "linux", feature = "vosk"))]
pub fn default_platform() -> Box<dyn NativePlatform> {
    Box::new(VoskPlatform)
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "windows",
    all(target_os = "linux", feature = "vosk")
)))]
pub fn default_platform() -> Box<dyn NativePlatform> {
    Box::new(MockPlatform::scripted())
}
