//! Process-wide registration of the bridge's export surface.
//!
//! A host registers the bridge once, choosing the native platform; sessions
//! are then created through the registration. There is no way to register
//! again or to replace the platform later in the process.

use once_cell::sync::OnceCell;
use tracing::info;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::runtime::LoopHandle;
use crate::session::RecognizerSession;
use crate::speech::NativePlatform;

/// Name under which the bridge exports itself to a host.
pub const MODULE_NAME: &str = "SpeechRecognizer";

static REGISTRATION: OnceCell<Registration> = OnceCell::new();

pub struct Registration {
    platform: Box<dyn NativePlatform>,
}

impl Registration {
    pub fn module_name(&self) -> &'static str {
        MODULE_NAME
    }

    pub fn platform_name(&self) -> &'static str {
        self.platform.name()
    }

    pub fn create_session(&self, config: BridgeConfig, runtime: &LoopHandle) -> Result<RecognizerSession> {
        RecognizerSession::new(self.platform.as_ref(), config, runtime)
    }
}

/// Register the bridge with `platform`. Fails with
/// [`BridgeError::AlreadyRegistered`] on every call after the first.
pub fn register(platform: Box<dyn NativePlatform>) -> Result<&'static Registration> {
    let mut fresh = false;
    let registration = REGISTRATION.get_or_init(|| {
        fresh = true;
        Registration { platform }
    });
    if !fresh {
        return Err(BridgeError::AlreadyRegistered);
    }
    info!(
        module = MODULE_NAME,
        platform = registration.platform_name(),
        version = env!("CARGO_PKG_VERSION"),
        "speech bridge registered"
    );
    Ok(registration)
}

/// The registration made by [`register`], if any.
pub fn registration() -> Option<&'static Registration> {
    REGISTRATION.get()
}
