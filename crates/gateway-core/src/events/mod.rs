//! Event system for observers registered via `Subscribe`.
//!
//! Mirrors the teacher's `events` module: a tagged [`GatewayEvent`] enum
//! broadcast to every observer, plus an [`EventEmitter`] abstraction so
//! internal services don't need to know how observers are transported.

mod emitter;

pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

use crate::tuning::TuningState;

/// Events delivered to every `Subscribe`d observer (§4.1).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Upstream connection state changed.
    Connection {
        connected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Tuning/session snapshot, coalesced per §4.1 "Status broadcast".
    Status {
        tuning: TuningState,
        band: Option<String>,
        uptime_secs: u64,
    },
    /// An error condition surfaced synchronously or asynchronously.
    Error { error: &'static str, message: String },
    /// A config patch was applied.
    ConfigUpdate { patch_summary: String },
    /// MIDI control-surface events (observed, not produced, by this core).
    MidiEvent { channel: u8, controller: u8, value: u8 },
    /// A noise-floor reading polled from the upstream's auxiliary endpoint (§6).
    NoiseFloor { dbfs: f32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_event_omits_reason_when_absent() {
        let e = GatewayEvent::Connection {
            connected: true,
            reason: None,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("reason").is_none());
    }
}
