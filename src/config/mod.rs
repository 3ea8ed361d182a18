//! Environment-driven configuration.
//!
//! Operator-facing knobs (URLs, topic names) arrive through CLI arguments
//! with environment fallbacks; the long-lived stream credentials are loaded
//! here, straight from the environment, and are never hardcoded or logged.

use std::env;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("environment variable {0} is empty")]
    Empty(&'static str),
}

/// Long-lived credentials for the upstream filtered stream.
///
/// Four secrets: consumer key/secret identify the application, access
/// token/secret identify the account the stream is read as.
#[derive(Clone)]
pub struct StreamCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
}

impl StreamCredentials {
    /// Load all four secrets from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            consumer_key: require("POLLWIRE_CONSUMER_KEY")?,
            consumer_secret: require("POLLWIRE_CONSUMER_SECRET")?,
            access_token: require("POLLWIRE_ACCESS_TOKEN")?,
            access_secret: require("POLLWIRE_ACCESS_SECRET")?,
        })
    }
}

// Secrets must not leak through debug formatting of surrounding state.
impl fmt::Debug for StreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCredentials")
            .field("consumer_key", &"<redacted>")
            .field("consumer_secret", &"<redacted>")
            .field("access_token", &"<redacted>")
            .field("access_secret", &"<redacted>")
            .finish()
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if value.trim().is_empty() => Err(ConfigError::Empty(key)),
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => Err(ConfigError::Missing(key)),
    }
}
