// ── Core error types ──
//
// User-facing errors from homesync-core. Automation code never sees raw
// transport failures: the `From<homesync_api::Error>` impl translates them
// into the variants below.

use thiserror::Error;

/// Error returned by subscriber handlers. Logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Readiness ────────────────────────────────────────────────────
    /// A cache was read before its first snapshot load completed.
    #[error("{cache} cache is not initialized: connect to the hub first")]
    NotInitialized { cache: &'static str },

    // ── Connection errors ────────────────────────────────────────────
    #[error("Hub disconnected")]
    Disconnected,

    #[error("Cannot connect to hub: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Hub request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Hub rejected command ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Could not decode {what}: {message}")]
    Deserialization { what: String, message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn decode(what: impl Into<String>, err: &serde_json::Error) -> Self {
        Self::Deserialization {
            what: what.into(),
            message: err.to_string(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<homesync_api::Error> for CoreError {
    fn from(err: homesync_api::Error) -> Self {
        match err {
            homesync_api::Error::ConnectionClosed => CoreError::Disconnected,
            homesync_api::Error::Cancelled => CoreError::Cancelled,
            homesync_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            homesync_api::Error::Transport(reason) => CoreError::ConnectionFailed { reason },
            homesync_api::Error::Command { code, message } => CoreError::Rejected { code, message },
            homesync_api::Error::Deserialization { message, body: _ } => {
                CoreError::Deserialization {
                    what: "hub response".into(),
                    message,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_user_variants() {
        assert!(matches!(
            CoreError::from(homesync_api::Error::ConnectionClosed),
            CoreError::Disconnected
        ));
        assert!(matches!(
            CoreError::from(homesync_api::Error::Timeout { timeout_secs: 3 }),
            CoreError::Timeout { timeout_secs: 3 }
        ));
        let rejected = CoreError::from(homesync_api::Error::Command {
            code: "not_found".into(),
            message: "Service light.blink not found".into(),
        });
        assert_eq!(
            rejected.to_string(),
            "Hub rejected command (not_found): Service light.blink not found"
        );
    }

    #[test]
    fn not_initialized_names_the_cache() {
        let err = CoreError::NotInitialized { cache: "entity state" };
        assert!(err.to_string().starts_with("entity state cache is not initialized"));
    }
}
