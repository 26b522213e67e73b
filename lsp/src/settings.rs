//! Server settings parsed from `initializationOptions`.

use serde::Deserialize;

/// Trace verbosity as set by `initialize` or `$/setTrace`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceValue {
    #[default]
    Off,
    Messages,
    Verbose,
}

impl TraceValue {
    #[must_use]
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Messages,
            2 => Self::Verbose,
            _ => Self::Off,
        }
    }
}

/// User configuration. Unknown fields are ignored so older clients keep
/// working across option additions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Extra prover-side logging.
    pub debug: bool,
    /// Publish diagnostics after every progressing step instead of only at
    /// completion.
    pub eager_diagnostics: bool,
    /// Initial trace level; `$/setTrace` overrides it later.
    pub trace: TraceValue,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            debug: false,
            eager_diagnostics: true,
            trace: TraceValue::Off,
        }
    }
}

impl ServerSettings {
    /// Parse `initializationOptions`; absent or malformed options fall back
    /// to defaults with a log, never a failed initialize.
    #[must_use]
    pub fn from_initialization_options(options: Option<&serde_json::Value>) -> Self {
        let Some(options) = options else {
            return Self::default();
        };
        match serde_json::from_value(options.clone()) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(%err, "malformed initializationOptions, using defaults");
                Self::default()
            }
        }
    }
}
