//! Emitter abstraction decoupling services from the observer transport.

use super::GatewayEvent;

/// Implemented by whatever transports events to observers (broadcast
/// channels, WebSocket fan-out, etc.). Services depend on this trait, not
/// on a concrete transport, mirroring the teacher's `EventEmitter`.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

/// Discards all events. Used in tests and headless contexts with no
/// observers registered yet.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: GatewayEvent) {}
}

/// Logs every event via `tracing`, for the hosted process before any
/// observer subscribes.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: GatewayEvent) {
        tracing::debug!(?event, "gateway_event");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct CountingEventEmitter {
        pub count: AtomicUsize,
    }

    impl CountingEventEmitter {
        pub fn new() -> Self {
            Self {
                count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, _event: GatewayEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_counts() {
        let emitter = CountingEventEmitter::new();
        emitter.emit(GatewayEvent::Error {
            error: "x",
            message: "y".into(),
        });
        assert_eq!(emitter.count.load(Ordering::SeqCst), 1);
    }
}
