//! Speech bridge - native speech recognition for single-threaded runtimes
//!
//! Wraps the platform speech recognizer in a [`RecognizerSession`] that lives
//! on the application runtime's thread. Native callbacks fire on whatever
//! thread the platform chooses; they are queued per channel and handed to the
//! registered callbacks, in order, when the runtime calls
//! [`RecognizerSession::dispatch_pending`].
//!
//! ```no_run
//! use std::time::Duration;
//! use speech_bridge::{speech, BridgeConfig, RecognizerSession, RuntimeLoop};
//!
//! let runtime = RuntimeLoop::new();
//! let platform = speech::default_platform();
//! let mut session =
//!     RecognizerSession::new(platform.as_ref(), BridgeConfig::default(), &runtime.handle())?;
//! session.on_result(|event| println!("{}", event.text()));
//!
//! let _auth = session.request_authorization()?;
//! loop {
//!     runtime.wait(Duration::from_millis(50));
//!     session.dispatch_pending()?;
//!     # break;
//! }
//! # Ok::<(), speech_bridge::BridgeError>(())
//! ```

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handle;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod speech;

pub use auth::{AuthorizationOutcome, AuthorizationRequest};
pub use config::{BridgeConfig, TeardownPolicy};
pub use error::{BridgeError, RecognitionError, Result};
pub use events::{RecognitionEvent, SessionStatus};
pub use runtime::{LoopHandle, RuntimeLoop};
pub use session::{DispatchSummary, RecognizerSession, SessionState, TeardownReport};
