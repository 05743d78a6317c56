//! Structured debug logging system

use callroom_core::CallError;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "callroom=info,callroom_core=info,callroom_signaling=info";

/// Debug logger for structured logging
#[derive(Debug, Clone)]
pub struct DebugLogger {
    directive: String,
    with_target: bool,
}

impl DebugLogger {
    /// Create new debug logger with the default directive
    pub fn new() -> Self {
        Self {
            directive: DEFAULT_DIRECTIVE.to_string(),
            with_target: true,
        }
    }

    /// Filter directive used when `RUST_LOG` is unset
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = directive.into();
        self
    }

    /// Include the event target in each line
    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    /// Build the filter: `RUST_LOG` wins over the configured directive
    pub fn env_filter(&self) -> Result<EnvFilter, CallError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.directive).map_err(|e| CallError::InvalidConfiguration {
            reason: format!("invalid log directive `{}`: {}", self.directive, e),
        })
    }

    /// Install the global subscriber
    ///
    /// Returns `Ok(false)` when a subscriber was already installed.
    pub fn install(&self) -> Result<bool, CallError> {
        let filter = self.env_filter()?;
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.with_target)
            .try_init()
            .is_ok();
        if installed {
            tracing::debug!("Logging initialised with `{}`", self.directive);
        }
        Ok(installed)
    }
}

impl Default for DebugLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize logging; a second call is a no-op
pub fn init_logging(default_directive: &str) -> Result<(), CallError> {
    DebugLogger::new()
        .with_directive(default_directive)
        .install()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_init_logging_is_idempotent() {
        assert_ok!(init_logging("debug"));
        assert_ok!(init_logging("debug"));
        assert!(!assert_ok!(DebugLogger::new().install()));
    }

    #[test]
    fn test_invalid_directive_rejected() {
        // only meaningful when RUST_LOG does not override the directive
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let err = assert_err!(DebugLogger::new()
            .with_directive("callroom=loudest")
            .env_filter());
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
    }
}
