use thiserror::Error;

/// Top-level error type for the `homesync-api` crate.
///
/// Covers every failure a [`HubConnection`](crate::HubConnection) can report:
/// transport loss, cancellation, rejected commands, and payloads the hub
/// sent that could not be decoded. `homesync-core` maps these into
/// user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// The connection to the hub is gone (closed by either side).
    #[error("Connection to hub closed")]
    ConnectionClosed,

    /// The operation was cancelled before the hub answered.
    #[error("Operation cancelled")]
    Cancelled,

    /// The hub did not answer in time.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Lower-level transport failure (socket, TLS, framing).
    #[error("Transport error: {0}")]
    Transport(String),

    // ── Hub replies ─────────────────────────────────────────────────
    /// The hub answered a command with an error result.
    #[error("Hub rejected command ({code}): {message}")]
    Command { code: String, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Wrap a `serde_json` failure together with the offending body.
    pub fn deserialization(err: &serde_json::Error, body: impl Into<String>) -> Self {
        Self::Deserialization {
            message: err.to_string(),
            body: body.into(),
        }
    }
}
