//! Spectrum Session (§4.4): a second upstream WebSocket producing spectrum
//! frames in JSON or one of two binary encodings, opened lazily once a
//! spectrum subscriber exists.

use std::io::Read;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol_constants::*;

/// A decoded, geometry-enriched spectrum frame (§3 Spot Frame / §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumFrame {
    pub bins_dbfs: Vec<f32>,
    pub center_freq_hz: f64,
    pub total_bandwidth_hz: f64,
    pub bin_count: usize,
    pub wall_clock_ms: u64,
}

/// Spectrum geometry carried by JSON `config` messages and binary frame
/// headers, persisted across frames that don't repeat it (§4.4).
#[derive(Debug, Clone, Copy, Default)]
struct Geometry {
    center_freq_hz: f64,
    total_bandwidth_hz: f64,
}

/// One of the three wire formats, locked in once detected from the first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    Json,
    BinaryF32,
    BinaryU8,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JsonSpectrumMessage {
    Config {
        #[serde(rename = "centerFreq")]
        center_freq: f64,
        #[serde(rename = "totalBandwidth")]
        total_bandwidth: f64,
        #[serde(rename = "binCount")]
        bin_count: usize,
    },
    Spectrum { data: Vec<f32> },
}

/// Reconstructs full frames from a stream that may interleave full and
/// delta frames, and tracks which wire format this session settled on.
pub struct SpectrumSessionState {
    format: Option<WireFormat>,
    geometry: Geometry,
    buffer_f32: Vec<f32>,
    buffer_u8: Vec<u8>,
    has_full_frame: bool,
}

impl SpectrumSessionState {
    pub fn new() -> Self {
        Self {
            format: None,
            geometry: Geometry::default(),
            buffer_f32: Vec::new(),
            buffer_u8: Vec::new(),
            has_full_frame: false,
        }
    }

    /// Processes a JSON text message (plain or legacy gzip-wrapped).
    pub fn process_json(&mut self, text: &str) -> GatewayResult<Option<SpectrumFrame>> {
        self.format.get_or_insert(WireFormat::Json);
        let text_owned;
        let text = if looks_like_gzip_base64(text) {
            text_owned = decode_gzip_json(text)?;
            text_owned.as_str()
        } else {
            text
        };
        let msg: JsonSpectrumMessage = serde_json::from_str(text)?;
        match msg {
            JsonSpectrumMessage::Config {
                center_freq,
                total_bandwidth,
                bin_count: _,
            } => {
                self.geometry = Geometry {
                    center_freq_hz: center_freq,
                    total_bandwidth_hz: total_bandwidth,
                };
                Ok(None)
            }
            JsonSpectrumMessage::Spectrum { data } => {
                self.has_full_frame = true;
                self.buffer_f32 = data.clone();
                Ok(Some(SpectrumFrame {
                    bin_count: data.len(),
                    bins_dbfs: data,
                    center_freq_hz: self.geometry.center_freq_hz,
                    total_bandwidth_hz: self.geometry.total_bandwidth_hz,
                    wall_clock_ms: now_ms(),
                }))
            }
        }
    }

    /// Processes one binary frame, dispatching on the `SPEC` magic + flags
    /// byte (§4.4).
    pub fn process_binary(&mut self, frame: &[u8]) -> GatewayResult<Option<SpectrumFrame>> {
        if frame.len() < 4 + 1 + 1 + 8 + 8 || &frame[0..4] != SPECTRUM_MAGIC {
            return Err(GatewayError::Protocol {
                message: "spectrum frame missing SPEC magic".into(),
            });
        }
        let flags = frame[5];
        let timestamp = u64::from_le_bytes(frame[6..14].try_into().unwrap());
        let frequency = f64::from_le_bytes(frame[14..22].try_into().unwrap());
        let payload = &frame[22..];

        match flags {
            SPECTRUM_FLAG_FULL_F32 => {
                self.format = Some(WireFormat::BinaryF32);
                let bins = decode_full_f32(payload)?;
                self.buffer_f32 = bins.clone();
                self.has_full_frame = true;
                Ok(Some(self.emit(bins, frequency, timestamp)))
            }
            SPECTRUM_FLAG_DELTA_F32 => {
                self.format = Some(WireFormat::BinaryF32);
                if !self.has_full_frame {
                    tracing::warn!("spectrum delta frame dropped: no prior full frame");
                    return Ok(None);
                }
                apply_delta_f32(&mut self.buffer_f32, payload)?;
                let bins = self.buffer_f32.clone();
                Ok(Some(self.emit(bins, frequency, timestamp)))
            }
            SPECTRUM_FLAG_FULL_U8 => {
                self.format = Some(WireFormat::BinaryU8);
                self.buffer_u8 = payload.to_vec();
                self.has_full_frame = true;
                let bins = u8_buffer_to_dbfs(&self.buffer_u8);
                Ok(Some(self.emit(bins, frequency, timestamp)))
            }
            SPECTRUM_FLAG_DELTA_U8 => {
                self.format = Some(WireFormat::BinaryU8);
                if !self.has_full_frame {
                    tracing::warn!("spectrum delta frame dropped: no prior full frame");
                    return Ok(None);
                }
                apply_delta_u8(&mut self.buffer_u8, payload)?;
                let bins = u8_buffer_to_dbfs(&self.buffer_u8);
                Ok(Some(self.emit(bins, frequency, timestamp)))
            }
            other => Err(GatewayError::Protocol {
                message: format!("unknown spectrum flags byte: {other:#04x}"),
            }),
        }
    }

    fn emit(&self, bins: Vec<f32>, _frequency: f64, timestamp: u64) -> SpectrumFrame {
        SpectrumFrame {
            bin_count: bins.len(),
            bins_dbfs: bins,
            center_freq_hz: self.geometry.center_freq_hz,
            total_bandwidth_hz: self.geometry.total_bandwidth_hz,
            wall_clock_ms: timestamp,
        }
    }
}

fn decode_full_f32(payload: &[u8]) -> GatewayResult<Vec<f32>> {
    if payload.len() % 4 != 0 {
        return Err(GatewayError::Protocol {
            message: "full float32 spectrum payload not a multiple of 4 bytes".into(),
        });
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn apply_delta_f32(buffer: &mut [f32], payload: &[u8]) -> GatewayResult<()> {
    if payload.len() < 2 {
        return Err(GatewayError::Protocol {
            message: "delta float32 frame missing changeCount".into(),
        });
    }
    let change_count = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let mut offset = 2;
    for _ in 0..change_count {
        if offset + 6 > payload.len() {
            return Err(GatewayError::Protocol {
                message: "delta float32 frame truncated".into(),
            });
        }
        let index = u16::from_le_bytes([payload[offset], payload[offset + 1]]) as usize;
        let value = f32::from_le_bytes(payload[offset + 2..offset + 6].try_into().unwrap());
        if let Some(slot) = buffer.get_mut(index) {
            *slot = value;
        }
        offset += 6;
    }
    Ok(())
}

fn apply_delta_u8(buffer: &mut [u8], payload: &[u8]) -> GatewayResult<()> {
    if payload.len() < 2 {
        return Err(GatewayError::Protocol {
            message: "delta uint8 frame missing changeCount".into(),
        });
    }
    let change_count = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let mut offset = 2;
    for _ in 0..change_count {
        if offset + 3 > payload.len() {
            return Err(GatewayError::Protocol {
                message: "delta uint8 frame truncated".into(),
            });
        }
        let index = u16::from_le_bytes([payload[offset], payload[offset + 1]]) as usize;
        let value = payload[offset + 2];
        if let Some(slot) = buffer.get_mut(index) {
            *slot = value;
        }
        offset += 3;
    }
    Ok(())
}

fn u8_buffer_to_dbfs(buffer: &[u8]) -> Vec<f32> {
    buffer
        .iter()
        .map(|&v| v as i32 as f32 - SPECTRUM_U8_DBFS_OFFSET as f32)
        .collect()
}

/// Legacy gzip-wrapped JSON frames are base64 text whose decoded bytes start
/// with the gzip magic (`0x1f 0x8b`), rather than `{`. A cheap peek at the
/// decoded prefix is enough to disambiguate without fully decoding twice.
fn looks_like_gzip_base64(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return false;
    }
    match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, trimmed) {
        Ok(bytes) => bytes.starts_with(&[0x1f, 0x8b]),
        Err(_) => false,
    }
}

fn decode_gzip_json(text: &str) -> GatewayResult<String> {
    use flate2::read::GzDecoder;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, text)
        .map_err(|e| GatewayError::Protocol {
            message: format!("invalid base64 gzip wrapper: {e}"),
        })?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = String::new();
    decoder.read_to_string(&mut out).map_err(|e| GatewayError::Protocol {
        message: format!("gzip decode failed: {e}"),
    })?;
    Ok(out)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Rate limiter for outbound `zoom`/`pan` commands (§4.4): at most 10/s,
/// excess silently dropped.
pub struct SpectrumCommandLimiter {
    window_start: Instant,
    sent_in_window: u32,
    limit: u32,
}

impl SpectrumCommandLimiter {
    pub fn new(limit_per_sec: u32) -> Self {
        Self {
            window_start: Instant::now(),
            sent_in_window: 0,
            limit: limit_per_sec,
        }
    }

    /// Returns `true` if the caller may send now (and records that it did).
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.sent_in_window = 0;
        }
        if self.sent_in_window < self.limit {
            self.sent_in_window += 1;
            true
        } else {
            false
        }
    }
}

impl Default for SpectrumCommandLimiter {
    fn default() -> Self {
        Self::new(SPECTRUM_COMMAND_RATE_LIMIT_PER_SEC)
    }
}

/// Extracts a peak-dBFS S-meter value over a passband, with the FFT-bin
/// unwrap applied (second half precedes first half) before mapping
/// frequencies to indices (§4.4 "TCI signal-meter extraction"). This
/// asymmetry (unwrap only on this path, never on the forwarded frame) is
/// intentional per §9 and must not be "fixed".
pub fn tci_signal_meter_peak(
    frame: &SpectrumFrame,
    tuned_freq_hz: f64,
    bandwidth_low_hz: i64,
    bandwidth_high_hz: i64,
) -> Option<f32> {
    if frame.bin_count == 0 || frame.total_bandwidth_hz <= 0.0 {
        return None;
    }
    let n = frame.bin_count;
    let mut unwrapped = Vec::with_capacity(n);
    unwrapped.extend_from_slice(&frame.bins_dbfs[n / 2..]);
    unwrapped.extend_from_slice(&frame.bins_dbfs[..n / 2]);

    let half_bw = frame.total_bandwidth_hz / 2.0;
    let freq_to_bin = |f: f64| -> usize {
        let rel = (f - (frame.center_freq_hz - half_bw)) / frame.total_bandwidth_hz;
        (rel.clamp(0.0, 1.0) * n as f64) as usize
    };

    let low_bin = freq_to_bin(tuned_freq_hz + bandwidth_low_hz as f64).min(n - 1);
    let high_bin = freq_to_bin(tuned_freq_hz + bandwidth_high_hz as f64).min(n - 1);
    let (low_bin, high_bin) = if low_bin <= high_bin {
        (low_bin, high_bin)
    } else {
        (high_bin, low_bin)
    };

    unwrapped[low_bin..=high_bin]
        .iter()
        .copied()
        .fold(None, |acc: Option<f32>, v| Some(acc.map_or(v, |m| m.max(v))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_then_delta_f32_reconstructs_expected_value() {
        let mut state = SpectrumSessionState::new();
        let mut full = Vec::new();
        full.extend_from_slice(SPECTRUM_MAGIC);
        full.push(1); // version
        full.push(SPECTRUM_FLAG_FULL_F32);
        full.extend_from_slice(&0u64.to_le_bytes());
        full.extend_from_slice(&0f64.to_le_bytes());
        let bins = vec![-90.0f32; 1024];
        for b in &bins {
            full.extend_from_slice(&b.to_le_bytes());
        }
        let f = state.process_binary(&full).unwrap().unwrap();
        assert_eq!(f.bins_dbfs.len(), 1024);

        let mut delta = Vec::new();
        delta.extend_from_slice(SPECTRUM_MAGIC);
        delta.push(1);
        delta.push(SPECTRUM_FLAG_DELTA_F32);
        delta.extend_from_slice(&0u64.to_le_bytes());
        delta.extend_from_slice(&0f64.to_le_bytes());
        delta.extend_from_slice(&1u16.to_le_bytes()); // changeCount
        delta.extend_from_slice(&512u16.to_le_bytes());
        delta.extend_from_slice(&(-50.0f32).to_le_bytes());

        let f2 = state.process_binary(&delta).unwrap().unwrap();
        assert_eq!(f2.bins_dbfs[512], -50.0);
        assert_eq!(f2.bins_dbfs[0], -90.0);
        assert_eq!(f2.bins_dbfs[1023], -90.0);
    }

    #[test]
    fn delta_before_full_is_dropped() {
        let mut state = SpectrumSessionState::new();
        let mut delta = Vec::new();
        delta.extend_from_slice(SPECTRUM_MAGIC);
        delta.push(1);
        delta.push(SPECTRUM_FLAG_DELTA_F32);
        delta.extend_from_slice(&0u64.to_le_bytes());
        delta.extend_from_slice(&0f64.to_le_bytes());
        delta.extend_from_slice(&0u16.to_le_bytes());
        assert!(state.process_binary(&delta).unwrap().is_none());
    }

    #[test]
    fn u8_full_frame_maps_byte_to_dbfs_offset() {
        let mut state = SpectrumSessionState::new();
        let mut frame = Vec::new();
        frame.extend_from_slice(SPECTRUM_MAGIC);
        frame.push(1);
        frame.push(SPECTRUM_FLAG_FULL_U8);
        frame.extend_from_slice(&0u64.to_le_bytes());
        frame.extend_from_slice(&0f64.to_le_bytes());
        frame.push(206); // 206 - 256 = -50
        let f = state.process_binary(&frame).unwrap().unwrap();
        assert_eq!(f.bins_dbfs[0], -50.0);
    }

    #[test]
    fn legacy_gzip_wrapped_json_config_is_decoded() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let json = r#"{"type":"config","centerFreq":14100000.0,"totalBandwidth":24000.0,"binCount":1024}"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json.as_bytes()).unwrap();
        let gz = encoder.finish().unwrap();
        let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, gz);

        let mut state = SpectrumSessionState::new();
        assert!(state.process_json(&b64).unwrap().is_none());
        assert_eq!(state.geometry.center_freq_hz, 14_100_000.0);
    }

    #[test]
    fn command_limiter_caps_at_ten_per_second() {
        let mut limiter = SpectrumCommandLimiter::new(10);
        let allowed = (0..100).filter(|_| limiter.try_acquire()).count();
        assert_eq!(allowed, 10);
    }

    #[test]
    fn signal_meter_unwraps_bins_before_ranging() {
        let mut bins = vec![-100.0f32; 8];
        // After unwrap, original index 0 lands at position n/2=4.
        bins[0] = -10.0;
        let frame = SpectrumFrame {
            bins_dbfs: bins,
            center_freq_hz: 14_100_000.0,
            total_bandwidth_hz: 8.0,
            bin_count: 8,
            wall_clock_ms: 0,
        };
        // center - half_bw = 14_100_000 - 4; bin width = 1 Hz.
        let peak = tci_signal_meter_peak(&frame, 14_100_000.0 - 4.0, 0, 0).unwrap();
        assert_eq!(peak, -10.0);
    }
}
