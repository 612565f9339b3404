//! Bridge configuration from an optional file and `SPEECH_BRIDGE_*` environment variables.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dispatch::{CloseMode, DEFAULT_CAPACITY};
use crate::error::Result;

/// Environment variable prefix, e.g. `SPEECH_BRIDGE_LOCALE=en-US`.
pub const ENV_PREFIX: &str = "SPEECH_BRIDGE";

/// What teardown does with events still queued for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Drop queued events; nothing is delivered once teardown starts
    #[default]
    Discard,
    /// Deliver queued events before teardown returns
    Flush,
}

impl From<TeardownPolicy> for CloseMode {
    fn from(policy: TeardownPolicy) -> Self {
        match policy {
            TeardownPolicy::Discard => CloseMode::Discard,
            TeardownPolicy::Flush => CloseMode::Flush,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Recognition locale identifier, e.g. `ja-JP`
    pub locale: String,
    /// Emit `Partial` results while the user is still speaking
    pub report_partial_results: bool,
    /// Queue bound of the result and error channels
    pub channel_capacity: usize,
    /// Require a granted authorization before `start`, when the platform
    /// has a permission model at all
    pub require_authorization: bool,
    pub teardown: TeardownPolicy,
    /// Offline model directory for backends that need one (Vosk)
    pub model_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            locale: "ja-JP".to_string(),
            report_partial_results: true,
            channel_capacity: DEFAULT_CAPACITY,
            require_authorization: true,
            teardown: TeardownPolicy::default(),
            model_path: None,
        }
    }
}

impl BridgeConfig {
    /// Load from an optional file, then `SPEECH_BRIDGE_*` environment
    /// variables. Unset keys keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }
}
