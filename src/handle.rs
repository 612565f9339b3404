//! Exclusive ownership of the platform recognizer.

use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, RecognitionError, Result};
use crate::speech::{NativePlatform, NativeRecognizer};

/// Move-only owner of one native recognizer.
///
/// Acquired once when a session is built and released once at teardown.
/// After release every access reports [`BridgeError::Disposed`].
pub struct NativeSessionHandle {
    recognizer: Option<Box<dyn NativeRecognizer>>,
    platform: &'static str,
}

impl NativeSessionHandle {
    pub fn acquire(platform: &dyn NativePlatform, config: &BridgeConfig) -> Result<Self> {
        let recognizer = platform
            .acquire(config)
            .map_err(BridgeError::NativeFailure)?;
        debug!(platform = platform.name(), locale = %config.locale, "native recognizer acquired");
        Ok(Self {
            recognizer: Some(recognizer),
            platform: platform.name(),
        })
    }

    pub fn get(&self) -> Result<&dyn NativeRecognizer> {
        self.recognizer.as_deref().ok_or(BridgeError::Disposed)
    }

    pub fn get_mut(&mut self) -> Result<&mut (dyn NativeRecognizer + 'static)> {
        self.recognizer.as_deref_mut().ok_or(BridgeError::Disposed)
    }

    pub fn is_live(&self) -> bool {
        self.recognizer.is_some()
    }

    pub fn platform(&self) -> &'static str {
        self.platform
    }

    /// Release the recognizer. The second and later calls do nothing.
    pub fn release(&mut self) -> Result<(), RecognitionError> {
        let Some(mut recognizer) = self.recognizer.take() else {
            return Ok(());
        };
        let released = recognizer.release();
        drop(recognizer);
        debug!(platform = self.platform, "native recognizer released");
        released
    }
}

impl Drop for NativeSessionHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(platform = self.platform, "native release failed during drop: {err}");
        }
    }
}
