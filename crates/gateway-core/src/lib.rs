//! Gateway Core - shared library for the SDR client gateway.
//!
//! This crate provides the concurrency and streaming core that bridges a
//! remote SDR server to local audio sinks, radio-control protocols, and
//! multiple concurrent observers. It has no HTTP/REST surface, embedded UI,
//! or persistent config store of its own; a hosting binary (see
//! `gateway-server`) supplies those around it.
//!
//! # Architecture
//!
//! - [`config`]: process-state configuration, loaded from YAML
//! - [`tuning`]: mode/frequency/band vocabulary and the tuning invariants
//! - [`frame_codec`]: binary/base64/Opus audio frame decoding
//! - [`spectrum`]: spectrum wire formats and the TCI S-meter peak algorithm
//! - [`fanout`]: the Fan-out Hub distributing decoded frames to observers
//! - [`sinks`]: the Sink Set (local audio, FIFO, UDP)
//! - [`rig`]: the Rig Control Set (JSON-RPC, line, serial, TCI variants)
//! - [`upstream`]: the Upstream Session (audio WebSocket)
//! - [`spectrum_session`]: the Spectrum Session (spectrum WebSocket)
//! - [`reconnect`]: the Reconnect Supervisor's backoff state machine
//! - [`session`]: the Session Manager tying all of the above together
//! - [`events`]: the observer event system
//! - [`error`]: the crate's error taxonomy
//! - [`bootstrap`]: the composition root

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod frame_codec;
pub mod protocol_constants;
pub mod reconnect;
pub mod rig;
pub mod session;
pub mod sinks;
pub mod spectrum;
pub mod spectrum_session;
pub mod tuning;
pub mod upstream;

pub use bootstrap::{bootstrap, BootstrappedCore};
pub use config::Config;
pub use error::{ErrorCode, GatewayError, GatewayResult};
pub use events::{EventEmitter, GatewayEvent, LoggingEventEmitter, NoopEventEmitter};
pub use fanout::FanoutHub;
pub use session::{SessionManager, StatusSnapshot};
pub use tuning::{Mode, TuneIntent, TuningState};
