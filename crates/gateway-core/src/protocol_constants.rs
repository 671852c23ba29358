//! Fixed protocol constants defined by the upstream SDR server and rig
//! protocols. These values are not tunable - changing them breaks wire
//! compatibility.

// ─────────────────────────────────────────────────────────────────────────────
// Upstream SDR WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// Keepalive interval on the upstream audio WebSocket (seconds).
pub const UPSTREAM_KEEPALIVE_SECS: u64 = 30;

/// Wall-clock budget for `Connect` to either succeed or fail (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Per-command WebSocket write timeout (seconds).
pub const WS_WRITE_TIMEOUT_SECS: u64 = 10;

/// Frequency validity range, inclusive (Hz).
pub const MIN_FREQUENCY_HZ: i64 = 100_000;
pub const MAX_FREQUENCY_HZ: i64 = 30_000_000;

/// Noise-floor poll cadence (seconds).
pub const NOISE_FLOOR_POLL_SECS: u64 = 60;

/// 16-bit little-endian magic for the full PCM binary header ("PC").
pub const PCM_MAGIC_FULL: u16 = 0x5043;
/// 16-bit little-endian magic for the minimal PCM binary header ("PM").
pub const PCM_MAGIC_MINIMAL: u16 = 0x504D;

/// Outer frame format byte indicating a plain (uncompressed) PC/PM frame.
pub const FORMAT_PLAIN: u8 = 0;
/// Outer frame format byte indicating an Opus-encoded frame.
pub const FORMAT_OPUS: u8 = 1;
/// Outer frame format byte indicating zstd-wrapped payload.
pub const FORMAT_ZSTD: u8 = 2;

/// Opus frame header size (rtp-timestamp u64 + sample-rate u32 + channels u8).
pub const OPUS_HEADER_LEN: usize = 13;
/// Opus decode frame duration (ms).
pub const OPUS_FRAME_DURATION_MS: u32 = 20;

/// Full PCM binary header size in bytes: magic(2) version(1) format(1)
/// rtp_ts(8) wall_clock(8) sample_rate(4) channels(2) reserved(2).
pub const PC_HEADER_LEN: usize = 28;
/// Minimal PCM binary header size in bytes: magic(2) version(1) format(1)
/// rtp_ts(8).
pub const PM_HEADER_LEN: usize = 12;

// ─────────────────────────────────────────────────────────────────────────────
// Fan-out Hub
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded per-subscriber channel capacity for audio and spectrum fan-out.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

/// On-demand disconnect debounce after the last subscriber departs (ms).
pub const ON_DEMAND_DISCONNECT_DEBOUNCE_MS: u64 = 500;

/// Status broadcast coalescing interval per observer (ms).
pub const STATUS_COALESCE_MS: u64 = 50;

// ─────────────────────────────────────────────────────────────────────────────
// Spectrum Session
// ─────────────────────────────────────────────────────────────────────────────

/// ASCII magic prefixing binary spectrum frames.
pub const SPECTRUM_MAGIC: &[u8; 4] = b"SPEC";

pub const SPECTRUM_FLAG_FULL_F32: u8 = 0x01;
pub const SPECTRUM_FLAG_DELTA_F32: u8 = 0x02;
pub const SPECTRUM_FLAG_FULL_U8: u8 = 0x03;
pub const SPECTRUM_FLAG_DELTA_U8: u8 = 0x04;

/// uint8 spectrum encoding offset: stored byte `v` represents `v - 256` dBFS.
pub const SPECTRUM_U8_DBFS_OFFSET: i32 = 256;

/// Outbound zoom/pan command rate limit (commands per second).
pub const SPECTRUM_COMMAND_RATE_LIMIT_PER_SEC: u32 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Rig Control Set
// ─────────────────────────────────────────────────────────────────────────────

/// Poll cadence for the JSON-RPC and line-oriented rig daemons (ms).
pub const RIG_POLL_INTERVAL_MS: u64 = 200;

/// Default serial CAT emulator baud rate.
pub const DEFAULT_SERIAL_BAUD: u32 = 57_600;

/// Default TCI server TCP port.
pub const DEFAULT_TCI_PORT: u16 = 40_001;

/// TCI IQ/audio mode-switch cooldown (ms); upstream rate-limited at 500ms.
pub const TCI_MODE_COOLDOWN_MS: u64 = 600;
pub const TCI_UPSTREAM_RATE_LIMIT_MS: u64 = 500;

/// TCI binary frame header size (bytes).
pub const TCI_FRAME_HEADER_LEN: usize = 64;

/// Allowed IQ sample rates (Hz).
pub const TCI_IQ_SAMPLE_RATES: [u32; 4] = [48_000, 96_000, 192_000, 384_000];

/// TCI IF limits (Hz), symmetric around the VFO.
pub const TCI_IF_LIMIT_LOW: i32 = -48_000;
pub const TCI_IF_LIMIT_HIGH: i32 = 48_000;

// ─────────────────────────────────────────────────────────────────────────────
// Reconnect Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Exponential backoff cap (seconds).
pub const RECONNECT_BACKOFF_CAP_SECS: u64 = 60;

/// Settle delay after a successful reconnect, before state restoration (seconds).
pub const RECONNECT_SETTLE_SECS: u64 = 2;

/// Window before `maxSessionTimeSeconds` within which auto-reconnect is inhibited (seconds).
pub const SESSION_EXPIRY_GUARD_SECS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Sink Set
// ─────────────────────────────────────────────────────────────────────────────

/// Audio device open timeout (seconds).
pub const AUDIO_DEVICE_OPEN_TIMEOUT_SECS: u64 = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

/// `IsConnected` non-blocking fallback window (ms).
pub const IS_CONNECTED_PROBE_MS: u64 = 100;
