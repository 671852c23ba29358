//! Error taxonomy for the gateway core.
//!
//! Mirrors the structure of the upstream Session Manager's error surface
//! (§7 of the design): state-precondition errors, validation errors,
//! transport/protocol failures, and the rig-link/sink errors that are
//! logged but never abort the owning session.

use serde::Serialize;
use thiserror::Error;

/// Maps an error to a stable, machine-readable code for the `error{error, ...}`
/// broadcast event and for API responses.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

/// Errors surfaced by the Session Manager's public operations.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum GatewayError {
    /// `Connect` was called while a session already exists.
    #[error("a session is already connected")]
    AlreadyConnected,

    /// An operation requiring a session was called with none present.
    #[error("no session is connected")]
    NotConnected,

    /// A tune intent touched a field that is currently locked.
    #[error("field is locked: {field}")]
    Locked { field: &'static str },

    /// A tune intent's frequency fell outside [100kHz, 30MHz].
    #[error("frequency {hz} out of range")]
    OutOfRange { hz: i64 },

    /// A tune intent or rig report used an unrecognized mode string.
    #[error("unknown mode: {mode}")]
    UnknownMode { mode: String },

    /// A bandwidth pair was invalid (e.g. low >= high, or present on an IQ mode).
    #[error("invalid bandwidth: {reason}")]
    BadBandwidth { reason: String },

    /// `Connect` did not complete within the 10s wall-time budget.
    #[error("operation timed out")]
    Timeout,

    /// The upstream admission endpoint declined the session.
    #[error("admission denied: {reason}")]
    AdmissionDenied { reason: String },

    /// Transport-level failure: connect failure, read/write failure, remote close.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Frame-decode failure: bad magic, short header, invalid JSON, codec error.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A rig link's transport or protocol failed. Logged, never session-fatal.
    #[error("rig link error ({rig}): {message}")]
    RigLink { rig: &'static str, message: String },

    /// A sink failed to open or write. Logged, disables the sink, never session-fatal.
    #[error("sink error ({sink}): {message}")]
    Sink { sink: &'static str, message: String },

    /// Anything else - config load failures, internal invariants.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorCode for GatewayError {
    fn code(&self) -> &'static str {
        match self {
            GatewayError::AlreadyConnected => "already_connected",
            GatewayError::NotConnected => "not_connected",
            GatewayError::Locked { .. } => "locked",
            GatewayError::OutOfRange { .. } => "out_of_range",
            GatewayError::UnknownMode { .. } => "unknown_mode",
            GatewayError::BadBandwidth { .. } => "bad_bandwidth",
            GatewayError::Timeout => "timeout",
            GatewayError::AdmissionDenied { .. } => "admission_denied",
            GatewayError::Transport { .. } => "transport",
            GatewayError::Protocol { .. } => "protocol",
            GatewayError::RigLink { .. } => "rig_link",
            GatewayError::Sink { .. } => "sink",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Transport {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Protocol {
            message: e.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Transport {
            message: e.to_string(),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_snake_case_and_stable() {
        assert_eq!(GatewayError::AlreadyConnected.code(), "already_connected");
        assert_eq!(
            GatewayError::OutOfRange { hz: 1 }.code(),
            "out_of_range"
        );
        assert_eq!(
            GatewayError::RigLink {
                rig: "tci",
                message: "x".into()
            }
            .code(),
            "rig_link"
        );
    }

    #[test]
    fn serializes_with_tagged_shape() {
        let e = GatewayError::UnknownMode {
            mode: "qrm".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "UnknownMode");
        assert_eq!(json["details"]["mode"], "qrm");
    }
}
