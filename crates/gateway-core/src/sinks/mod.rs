//! Sink Set (§4.5): three independent byte-stream destinations for decoded
//! PCM, each with its own enable/disable lifecycle. Per the Non-goals,
//! actual device enumeration and driver I/O for PortAudio are out of scope;
//! this module owns lifecycle and the byte-stream contract, plugging an
//! injectable [`AudioDeviceOpener`] in where a real driver would sit.

mod fifo;
mod udp;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;

use crate::error::{GatewayError, GatewayResult};
use crate::protocol_constants::AUDIO_DEVICE_OPEN_TIMEOUT_SECS;

pub use fifo::FifoSink;
pub use udp::UdpSink;

/// Accepts raw little-endian int16 PCM. Implemented by whatever actually
/// owns the destination (a FIFO file handle, a UDP socket, or - for local
/// audio - the device stream a real [`AudioDeviceOpener`] would hand back).
pub trait SinkWriter: Send + Sync {
    fn write_pcm(&self, pcm: &[u8]) -> std::io::Result<()>;
}

/// Opens a local audio output device. The default implementation used when
/// no platform driver is wired in just accepts and discards frames, which
/// keeps the Sink Set's lifecycle and backpressure behavior testable
/// without a real sound card.
#[async_trait::async_trait]
pub trait AudioDeviceOpener: Send + Sync {
    async fn open(
        &self,
        device_index: Option<u32>,
        sample_rate: u32,
        channels: u16,
    ) -> std::io::Result<Arc<dyn SinkWriter>>;
}

pub struct NullAudioDeviceOpener;

struct NullSinkWriter;
impl SinkWriter for NullSinkWriter {
    fn write_pcm(&self, _pcm: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl AudioDeviceOpener for NullAudioDeviceOpener {
    async fn open(
        &self,
        _device_index: Option<u32>,
        _sample_rate: u32,
        _channels: u16,
    ) -> std::io::Result<Arc<dyn SinkWriter>> {
        Ok(Arc::new(NullSinkWriter))
    }
}

struct LocalAudioState {
    enabled: bool,
    device_index: Option<u32>,
    writer: Option<Arc<dyn SinkWriter>>,
}

/// Owns the three sinks. Each is independently enabled/disabled; a disabled
/// sink simply isn't offered frames, matching §3's "enabled flag and
/// byte-stream opening/closing are equivalent" invariant.
pub struct SinkSet {
    opener: Arc<dyn AudioDeviceOpener>,
    local_audio: Mutex<LocalAudioState>,
    fifo: Mutex<Option<FifoSink>>,
    udp: Mutex<Option<UdpSink>>,
}

impl SinkSet {
    pub fn new(opener: Arc<dyn AudioDeviceOpener>) -> Self {
        Self {
            opener,
            local_audio: Mutex::new(LocalAudioState {
                enabled: false,
                device_index: None,
                writer: None,
            }),
            fifo: Mutex::new(None),
            udp: Mutex::new(None),
        }
    }

    /// Opens the local audio device within the 5s timeout (§4.5). On
    /// timeout or failure the sink stays disabled and the error is
    /// returned for the caller to log - never fatal to the owning session.
    pub async fn enable_local_audio(
        &self,
        device_index: Option<u32>,
        sample_rate: u32,
        channels: u16,
    ) -> GatewayResult<()> {
        let writer = timeout(
            Duration::from_secs(AUDIO_DEVICE_OPEN_TIMEOUT_SECS),
            self.opener.open(device_index, sample_rate, channels),
        )
        .await
        .map_err(|_| GatewayError::Sink {
            sink: "local_audio",
            message: "device open timed out".into(),
        })?
        .map_err(|e| GatewayError::Sink {
            sink: "local_audio",
            message: e.to_string(),
        })?;

        let mut state = self.local_audio.lock();
        state.enabled = true;
        state.device_index = device_index;
        state.writer = Some(writer);
        Ok(())
    }

    pub fn disable_local_audio(&self) {
        let mut state = self.local_audio.lock();
        state.enabled = false;
        state.writer = None;
    }

    pub fn enable_fifo(&self, path: &str) -> GatewayResult<()> {
        *self.fifo.lock() = Some(FifoSink::open(path)?);
        Ok(())
    }

    pub fn disable_fifo(&self) {
        *self.fifo.lock() = None;
    }

    pub async fn enable_udp(&self, host: &str, port: u16) -> GatewayResult<()> {
        *self.udp.lock() = Some(UdpSink::connect(host, port).await?);
        Ok(())
    }

    pub fn disable_udp(&self) {
        *self.udp.lock() = None;
    }

    /// Offers one PCM frame to every enabled sink. A sink that can't accept
    /// it (device underrun, FIFO with no reader, UDP send error) drops the
    /// frame for itself only and is logged, never disabled automatically -
    /// disabling is only ever a deliberate `Disable*` call or reconnect
    /// state restoration (§4.4).
    pub fn write_pcm(&self, pcm: &[u8]) {
        {
            let state = self.local_audio.lock();
            if state.enabled {
                if let Some(writer) = &state.writer {
                    if let Err(e) = writer.write_pcm(pcm) {
                        tracing::warn!(error = %e, "local audio sink write failed");
                    }
                }
            }
        }
        if let Some(fifo) = self.fifo.lock().as_ref() {
            if let Err(e) = fifo.write_pcm(pcm) {
                tracing::warn!(error = %e, "fifo sink write failed");
            }
        }
        if let Some(udp) = self.udp.lock().as_ref() {
            udp.send(pcm);
        }
    }

    pub fn local_audio_enabled(&self) -> bool {
        self.local_audio.lock().enabled
    }

    pub fn fifo_enabled(&self) -> bool {
        self.fifo.lock().is_some()
    }

    pub fn udp_enabled(&self) -> bool {
        self.udp.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enabling_local_audio_with_null_opener_succeeds_and_accepts_writes() {
        let sinks = SinkSet::new(Arc::new(NullAudioDeviceOpener));
        sinks.enable_local_audio(None, 12_000, 1).await.unwrap();
        assert!(sinks.local_audio_enabled());
        sinks.write_pcm(&[0, 0, 1, 0]);
        sinks.disable_local_audio();
        assert!(!sinks.local_audio_enabled());
    }
}
