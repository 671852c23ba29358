//! Decodes upstream binary audio frames into raw little-endian PCM plus
//! metadata (§4.2, Frame Codec of §2).
//!
//! Supports the `PC`/`PM` magic-tagged headers, an optional outer zstd
//! wrapper, and Opus-framed payloads. The hot decode path never suspends:
//! all of this is synchronous, pure computation over an in-memory buffer.

use base64::Engine as _;
use bytes::Bytes;

use crate::error::{GatewayError, GatewayResult};
use crate::protocol_constants::*;

/// Decoded PCM plus the metadata needed to deliver it correctly (§3 Spot Frame).
#[derive(Debug, Clone, PartialEq)]
pub struct PcmFrame {
    /// Little-endian int16 PCM samples, interleaved if stereo.
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub rtp_timestamp: u64,
}

/// Carries forward the last full header's sample-rate/channels so that a
/// subsequent minimal (`PM`) header can be decoded (§4.2).
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodecState {
    last_sample_rate: u32,
    last_channels: u16,
}

impl FrameCodecState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one binary audio frame, applying the zstd unwrap first if the
    /// outer format byte indicates it.
    ///
    /// `format_byte` is out-of-band context supplied by the caller (from the
    /// enclosing message envelope); when `None`, no zstd unwrap is attempted.
    pub fn decode_binary(
        &mut self,
        frame: &[u8],
        format_byte: Option<u8>,
    ) -> GatewayResult<PcmFrame> {
        let owned;
        let frame = if format_byte == Some(FORMAT_ZSTD) {
            owned = zstd::decode_all(frame).map_err(|e| GatewayError::Protocol {
                message: format!("zstd decode failed: {e}"),
            })?;
            owned.as_slice()
        } else {
            frame
        };

        if frame.len() < 2 {
            return Err(GatewayError::Protocol {
                message: "frame shorter than magic".into(),
            });
        }
        let magic = u16::from_le_bytes([frame[0], frame[1]]);
        match magic {
            PCM_MAGIC_FULL => self.decode_full(frame),
            PCM_MAGIC_MINIMAL => self.decode_minimal(frame),
            other => Err(GatewayError::Protocol {
                message: format!("unknown binary frame magic: {other:#06x}"),
            }),
        }
    }

    fn decode_full(&mut self, frame: &[u8]) -> GatewayResult<PcmFrame> {
        if frame.len() < PC_HEADER_LEN {
            return Err(GatewayError::Protocol {
                message: "PC header truncated".into(),
            });
        }
        // Layout: magic(2) version(1) format(1) rtp_ts(8 LE) wall_clock(8 LE)
        //         sample_rate(4 LE) channels(2 LE) reserved(2)
        let rtp_timestamp = u64::from_le_bytes(frame[4..12].try_into().unwrap());
        let sample_rate = u32::from_le_bytes(frame[20..24].try_into().unwrap());
        let channels = u16::from_le_bytes(frame[24..26].try_into().unwrap());
        self.last_sample_rate = sample_rate;
        self.last_channels = channels;

        let pcm = big_endian_i16_payload_to_le(&frame[PC_HEADER_LEN..]);
        Ok(PcmFrame {
            pcm,
            sample_rate,
            channels,
            rtp_timestamp,
        })
    }

    fn decode_minimal(&mut self, frame: &[u8]) -> GatewayResult<PcmFrame> {
        if frame.len() < PM_HEADER_LEN {
            return Err(GatewayError::Protocol {
                message: "PM header truncated".into(),
            });
        }
        if self.last_sample_rate == 0 {
            return Err(GatewayError::Protocol {
                message: "minimal header with no prior full header".into(),
            });
        }
        // Layout: magic(2) version(1) format(1) rtp_ts(8 LE) then payload.
        let rtp_timestamp = u64::from_le_bytes(frame[4..12].try_into().unwrap());
        let pcm = big_endian_i16_payload_to_le(&frame[PM_HEADER_LEN..]);
        Ok(PcmFrame {
            pcm,
            sample_rate: self.last_sample_rate,
            channels: self.last_channels,
            rtp_timestamp,
        })
    }

    /// Decodes the JSON `audio` message's base64 big-endian PCM payload,
    /// normalizing to little-endian (§4.2 "audio" inbound kind).
    pub fn decode_base64_audio(
        &mut self,
        payload_b64: &str,
        sample_rate: u32,
        channels: u16,
    ) -> GatewayResult<PcmFrame> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(payload_b64)
            .map_err(|e| GatewayError::Protocol {
                message: format!("invalid base64 audio payload: {e}"),
            })?;
        self.last_sample_rate = sample_rate;
        self.last_channels = channels;
        Ok(PcmFrame {
            pcm: big_endian_i16_payload_to_le(&raw),
            sample_rate,
            channels,
            rtp_timestamp: 0,
        })
    }

    /// Decodes an Opus-framed binary message into a sequence of 20ms PCM
    /// frames (§4.2). Each decode call yields exactly one frame's worth of
    /// samples per Opus packet received.
    pub fn decode_opus(&mut self, frame: &[u8], decoder: &mut OpusState) -> GatewayResult<PcmFrame> {
        if frame.len() < OPUS_HEADER_LEN {
            return Err(GatewayError::Protocol {
                message: "opus frame header truncated".into(),
            });
        }
        let rtp_timestamp = u64::from_le_bytes(frame[0..8].try_into().unwrap());
        let sample_rate = u32::from_le_bytes(frame[8..12].try_into().unwrap());
        let channels = frame[12] as u16;
        let payload = &frame[OPUS_HEADER_LEN..];

        self.last_sample_rate = sample_rate;
        self.last_channels = channels;

        let pcm_i16 = decoder.decode(payload, sample_rate, channels)?;
        let mut pcm = Vec::with_capacity(pcm_i16.len() * 2);
        for sample in pcm_i16 {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(PcmFrame {
            pcm,
            sample_rate,
            channels,
            rtp_timestamp,
        })
    }
}

/// Reinterprets a big-endian int16 byte buffer as little-endian, in place
/// conceptually (returns a fresh buffer so the caller can own it).
fn big_endian_i16_payload_to_le(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for chunk in bytes.chunks_exact(2) {
        out.push(chunk[1]);
        out.push(chunk[0]);
    }
    out
}

/// Converts interleaved little-endian int16 PCM to float32 samples in [-1,1].
pub fn pcm_i16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

/// Converts float32 samples back to little-endian int16 PCM, saturating at
/// ±32767 (§8 round-trip property).
pub fn f32_to_pcm_i16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let scaled = (s * 32768.0).round();
        let clamped = scaled.clamp(i16::MIN as f32, i16::MAX as f32);
        out.extend_from_slice(&(clamped as i16).to_le_bytes());
    }
    out
}

/// Applies volume scaling and per-channel mute to interleaved little-endian
/// int16 PCM before it reaches the Sink Set (§4.1 "Volume, channel-enable,
/// NR2-enable are applied to live state without a server round-trip"). A
/// muted channel is zeroed rather than dropped, so frame length and stereo
/// interleaving are preserved for whatever sink receives it.
pub fn apply_output_gain(
    pcm: &[u8],
    channels: u16,
    volume: f32,
    left_enabled: bool,
    right_enabled: bool,
) -> Vec<u8> {
    let identity = (volume - 1.0).abs() < f32::EPSILON && left_enabled && right_enabled;
    if identity {
        return pcm.to_vec();
    }
    let mut out = Vec::with_capacity(pcm.len());
    for (i, chunk) in pcm.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        let enabled = if channels == 2 {
            if i % 2 == 0 { left_enabled } else { right_enabled }
        } else {
            left_enabled || right_enabled
        };
        let scaled = if enabled {
            (sample as f32 * volume).clamp(i16::MIN as f32, i16::MAX as f32) as i16
        } else {
            0
        };
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    out
}

/// Opus decoder state, wrapping the `audiopus` binding. Kept as a distinct
/// struct so the frame codec stays synchronous and testable without a real
/// decoder in unit tests that don't exercise Opus frames.
pub struct OpusState {
    inner: Option<audiopus::coder::Decoder>,
}

impl OpusState {
    pub fn new() -> Self {
        Self { inner: None }
    }

    fn ensure(&mut self, sample_rate: u32, channels: u16) -> GatewayResult<&mut audiopus::coder::Decoder> {
        let sr = audiopus::SampleRate::try_from(sample_rate as i32).map_err(|e| {
            GatewayError::Protocol {
                message: format!("unsupported opus sample rate: {e}"),
            }
        })?;
        let ch = if channels == 1 {
            audiopus::Channels::Mono
        } else {
            audiopus::Channels::Stereo
        };
        if self.inner.is_none() {
            self.inner = Some(
                audiopus::coder::Decoder::new(sr, ch).map_err(|e| GatewayError::Protocol {
                    message: format!("opus decoder init failed: {e}"),
                })?,
            );
        }
        Ok(self.inner.as_mut().unwrap())
    }

    fn decode(&mut self, payload: &[u8], sample_rate: u32, channels: u16) -> GatewayResult<Vec<i16>> {
        let frame_samples = (sample_rate as u64 * OPUS_FRAME_DURATION_MS as u64 / 1000) as usize
            * channels as usize;
        let decoder = self.ensure(sample_rate, channels)?;
        let mut out = vec![0i16; frame_samples];
        let n = decoder
            .decode(Some(payload), &mut out[..], false)
            .map_err(|e| GatewayError::Protocol {
                message: format!("opus decode failed: {e}"),
            })?;
        out.truncate(n * channels as usize);
        Ok(out)
    }
}

/// Inbound audio/control message kinds on the upstream session (§4.2).
#[derive(Debug, Clone)]
pub enum UpstreamMessage {
    Audio(PcmFrame),
    Status { session_id: String, frequency: i64, mode: String },
    Error { error: String },
    Pong,
}

/// Wraps raw WebSocket payload bytes for downstream handling.
pub fn bytes_of(frame: &[u8]) -> Bytes {
    Bytes::copy_from_slice(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_pc_frame(rtp_ts: u64, sample_rate: u32, channels: u16, be_samples: &[i16]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&PCM_MAGIC_FULL.to_le_bytes());
        frame.push(1); // version
        frame.push(0); // format (uncompressed)
        frame.extend_from_slice(&rtp_ts.to_le_bytes());
        frame.extend_from_slice(&0u64.to_le_bytes()); // wall clock
        frame.extend_from_slice(&sample_rate.to_le_bytes());
        frame.extend_from_slice(&channels.to_le_bytes());
        frame.extend_from_slice(&0u16.to_le_bytes()); // reserved
        assert_eq!(frame.len(), PC_HEADER_LEN);
        for s in be_samples {
            frame.extend_from_slice(&s.to_be_bytes());
        }
        frame
    }

    #[test]
    fn decodes_full_pc_header_and_swaps_endianness() {
        let mut codec = FrameCodecState::new();
        let frame = build_pc_frame(42, 12_000, 1, &[1, -1, 32767]);
        let pcm = codec.decode_binary(&frame, None).unwrap();
        assert_eq!(pcm.sample_rate, 12_000);
        assert_eq!(pcm.channels, 1);
        assert_eq!(pcm.rtp_timestamp, 42);
        let samples: Vec<i16> = pcm
            .pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![1, -1, 32767]);
    }

    #[test]
    fn minimal_header_reuses_last_full_header_metadata() {
        let mut codec = FrameCodecState::new();
        let full = build_pc_frame(1, 8000, 2, &[10, 20]);
        codec.decode_binary(&full, None).unwrap();

        let mut minimal = Vec::new();
        minimal.extend_from_slice(&PCM_MAGIC_MINIMAL.to_le_bytes());
        minimal.push(1);
        minimal.push(0);
        minimal.extend_from_slice(&99u64.to_le_bytes());
        minimal.extend_from_slice(&30i16.to_be_bytes());
        assert_eq!(minimal.len(), PM_HEADER_LEN + 2);

        let pcm = codec.decode_binary(&minimal, None).unwrap();
        assert_eq!(pcm.sample_rate, 8000);
        assert_eq!(pcm.channels, 2);
        assert_eq!(pcm.rtp_timestamp, 99);
    }

    #[test]
    fn minimal_header_without_prior_full_header_errors() {
        let mut codec = FrameCodecState::new();
        let mut minimal = vec![0u8; PM_HEADER_LEN];
        minimal[0..2].copy_from_slice(&PCM_MAGIC_MINIMAL.to_le_bytes());
        assert!(codec.decode_binary(&minimal, None).is_err());
    }

    #[test]
    fn unknown_magic_is_protocol_error() {
        let mut codec = FrameCodecState::new();
        let frame = [0xAAu8, 0xBB, 0, 0];
        assert!(matches!(
            codec.decode_binary(&frame, None),
            Err(GatewayError::Protocol { .. })
        ));
    }

    #[test]
    fn f32_pcm_round_trip_saturates_at_extremes() {
        let samples = [0.0f32, 1.0, -1.0, 2.0, -2.0];
        let pcm = f32_to_pcm_i16(&samples);
        let back = pcm_i16_to_f32(&pcm);
        assert!((back[0]).abs() < 1e-4);
        assert!((back[1] - 1.0).abs() < 1e-3);
        // 2.0 clamps to the int16 max, which is just under 1.0 when normalized.
        assert!(back[3] <= 1.0);
        assert!(back[4] >= -1.0);
    }

    #[test]
    fn apply_output_gain_is_identity_at_unit_volume_both_channels_enabled() {
        let pcm = 1000i16.to_le_bytes().to_vec();
        assert_eq!(apply_output_gain(&pcm, 1, 1.0, true, true), pcm);
    }

    #[test]
    fn apply_output_gain_mutes_the_right_channel_only() {
        let mut pcm = Vec::new();
        pcm.extend_from_slice(&100i16.to_le_bytes());
        pcm.extend_from_slice(&200i16.to_le_bytes());
        let out = apply_output_gain(&pcm, 2, 1.0, true, false);
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![100, 0]);
    }

    #[test]
    fn base64_audio_decodes_and_swaps_endianness() {
        let mut codec = FrameCodecState::new();
        let be_bytes = 1i16.to_be_bytes();
        let b64 = base64::engine::general_purpose::STANDARD.encode(be_bytes);
        let pcm = codec.decode_base64_audio(&b64, 12000, 1).unwrap();
        assert_eq!(pcm.pcm, 1i16.to_le_bytes());
    }
}
