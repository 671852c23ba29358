//! Upstream Session (§4.2): the single WebSocket connection to the remote
//! SDR server that carries admission, tuning, and decoded audio. Modeled on
//! the teacher's `api::ws` connection loop (split sink/stream,
//! `tokio::select!`, a dedicated ping interval) but for the *client* role -
//! this gateway connects out, rather than accepting connections in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventEmitter, GatewayEvent};
use crate::fanout::FanoutHub;
use crate::frame_codec::{apply_output_gain, FrameCodecState, OpusState, PcmFrame, UpstreamMessage};
use crate::protocol_constants::{
    CONNECT_TIMEOUT_SECS, FORMAT_OPUS, UPSTREAM_KEEPALIVE_SECS, WS_WRITE_TIMEOUT_SECS,
};
use crate::sinks::SinkSet;
use crate::tuning::TuneIntent;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection parameters for one upstream session attempt.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub password: Option<String>,
    /// Minted once per process (§3 Session Descriptor "userSessionId"),
    /// carried on every admission check and WebSocket handshake so the
    /// server can correlate them to the same logical session.
    pub user_session_id: uuid::Uuid,
}

impl UpstreamTarget {
    fn http_base(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Builds the `/ws` URL carrying the initial tune as query parameters
    /// (§4.2, §6): `frequency`, `mode`, `user_session_id`, and the optional
    /// `bandwidthLow`/`bandwidthHigh` pair (omitted entirely for IQ modes,
    /// per the §3 invariant that IQ carries no bandwidth bounds).
    fn ws_url(&self, initial_tune: &TuneIntent) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        let mut url = url::Url::parse(&format!(
            "{scheme}://{}:{}/ws",
            self.host, self.port
        ))
        .expect("host/port always form a valid URL");
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("user_session_id", &self.user_session_id.to_string());
            if let Some(hz) = initial_tune.frequency_hz {
                q.append_pair("frequency", &hz.to_string());
            }
            if let Some(mode) = initial_tune.mode {
                q.append_pair("mode", mode.as_str());
            }
            if let Some(low) = initial_tune.bandwidth_low {
                q.append_pair("bandwidthLow", &low.to_string());
            }
            if let Some(high) = initial_tune.bandwidth_high {
                q.append_pair("bandwidthHigh", &high.to_string());
            }
        }
        url.into()
    }
}

#[derive(serde::Deserialize)]
struct AdmissionResponse {
    allowed: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    client_ip: String,
}

/// Checks whether the upstream server will accept a session before paying
/// for a WebSocket handshake (§4.2 "admission check", §6 `POST /connection`).
pub async fn admission_check(client: &reqwest::Client, target: &UpstreamTarget) -> GatewayResult<()> {
    let url = format!("{}/connection", target.http_base());
    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "user_session_id": target.user_session_id.to_string() }))
        .send()
        .await?;

    let admission: AdmissionResponse = resp.json().await?;
    if admission.allowed {
        tracing::debug!(client_ip = %admission.client_ip, "admission granted");
        return Ok(());
    }
    Err(GatewayError::AdmissionDenied {
        reason: admission.reason,
    })
}

/// Upstream-declared facts about this session, captured alongside admission
/// (§3 Session Descriptor, §4.1 "capturing bypassed, allowedIqModes,
/// maxSessionTimeSeconds"). Fetched from `GET /api/description`; a failure
/// to fetch it is non-fatal to `Connect` (the fields simply stay at their
/// permissive defaults) since the admission check already answered the
/// question that actually gates the connection.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    pub bypassed: bool,
    pub allowed_iq_modes: Vec<String>,
    pub max_session_time_secs: Option<u64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

async fn fetch_description(client: &reqwest::Client, target: &UpstreamTarget) -> SessionDescription {
    let url = format!("{}/api/description", target.http_base());
    let Ok(resp) = client.get(&url).send().await else {
        return SessionDescription::default();
    };
    let Ok(value) = resp.json::<serde_json::Value>().await else {
        return SessionDescription::default();
    };
    SessionDescription {
        bypassed: value.get("bypassed").and_then(|v| v.as_bool()).unwrap_or(false),
        allowed_iq_modes: value
            .get("allowedIqModes")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|m| m.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        max_session_time_secs: value.get("maxSessionTimeSeconds").and_then(|v| v.as_u64()),
        sample_rate: value.get("sampleRate").and_then(|v| v.as_u64()).map(|v| v as u32),
        channels: value.get("channels").and_then(|v| v.as_u64()).map(|v| v as u16),
    }
}

/// Polls the noise-floor auxiliary endpoint (§6 "Auxiliary endpoints").
/// Best-effort like `fetch_description`: any transport failure or
/// unparseable body yields `None` rather than propagating an error into the
/// poll loop.
pub async fn fetch_noise_floor(client: &reqwest::Client, target: &UpstreamTarget) -> Option<f32> {
    let url = format!("{}/api/noisefloor/latest", target.http_base());
    let resp = client.get(&url).send().await.ok()?;
    let value: serde_json::Value = resp.json().await.ok()?;
    value.get("dbfs").and_then(|v| v.as_f64()).map(|v| v as f32)
}

/// A live upstream audio session. Outbound sends share a single mutex so
/// tune commands, pings, and (implicitly) close frames never interleave on
/// the wire, matching the "single send path" requirement implied by a
/// WebSocket's lack of message framing beyond the frame boundary itself.
pub struct UpstreamSession {
    write: Arc<Mutex<futures::stream::SplitSink<WsStream, Message>>>,
    shutdown: mpsc::Sender<()>,
    /// Set by the read loop when it exits for any reason (remote close,
    /// I/O error, decode error escalated to a transport failure) so
    /// `SessionManager::is_connected` reflects an unexpected drop without
    /// needing the read loop to call back into the manager directly.
    closed: Arc<AtomicBool>,
    description: SessionDescription,
}

impl UpstreamSession {
    /// Connects, performs admission, and spawns the inbound read loop.
    /// Returns once the session is ready to send tune commands; the read
    /// loop runs in the background for the session's lifetime.
    pub async fn connect(
        target: UpstreamTarget,
        initial_tune: TuneIntent,
        fanout: FanoutHub,
        sinks: Arc<SinkSet>,
        config: Arc<SyncMutex<Config>>,
        emitter: Arc<dyn EventEmitter>,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::new();
        admission_check(&client, &target).await?;
        let description = fetch_description(&client, &target).await;

        let connect_fut = tokio_tungstenite::connect_async(target.ws_url(&initial_tune));
        let (ws, _resp) = timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect_fut)
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(GatewayError::from)?;

        let (write, read) = ws.split();
        let write = Arc::new(Mutex::new(write));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(read, fanout, sinks, config, emitter.clone(), closed.clone()));
        tokio::spawn(keepalive_loop(write.clone(), shutdown_rx));

        emitter.emit(GatewayEvent::Connection {
            connected: true,
            reason: None,
        });

        Ok(Self {
            write,
            shutdown: shutdown_tx,
            closed,
            description,
        })
    }

    /// `true` once the read loop has exited, i.e. the connection dropped
    /// (remote close, transport error) independently of the owning
    /// `SessionManager` having torn it down deliberately.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn description(&self) -> &SessionDescription {
        &self.description
    }

    async fn send_text(&self, text: String) -> GatewayResult<()> {
        let mut write = self.write.lock().await;
        timeout(
            Duration::from_secs(WS_WRITE_TIMEOUT_SECS),
            write.send(Message::Text(text.into())),
        )
        .await
        .map_err(|_| GatewayError::Timeout)?
        .map_err(GatewayError::from)
    }

    /// Sends a tune intent. Fields left `None` are omitted from the wire
    /// payload so the server only updates what actually changed.
    pub async fn send_tune(&self, intent: &TuneIntent) -> GatewayResult<()> {
        let mut payload = serde_json::Map::new();
        payload.insert("type".into(), "tune".into());
        if let Some(hz) = intent.frequency_hz {
            payload.insert("frequency".into(), hz.into());
        }
        if let Some(mode) = intent.mode {
            payload.insert("mode".into(), mode.as_str().into());
        }
        if let Some(low) = intent.bandwidth_low {
            payload.insert("bandwidthLow".into(), low.into());
        }
        if let Some(high) = intent.bandwidth_high {
            payload.insert("bandwidthHigh".into(), high.into());
        }
        self.send_text(serde_json::Value::Object(payload).to_string())
            .await
    }

    pub async fn send_ping(&self) -> GatewayResult<()> {
        self.send_text(serde_json::json!({ "type": "ping" }).to_string())
            .await
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(()).await;
        let mut write = self.write.lock().await;
        let _ = write.close().await;
    }
}

async fn keepalive_loop(
    write: Arc<Mutex<futures::stream::SplitSink<WsStream, Message>>>,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(UPSTREAM_KEEPALIVE_SECS));
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let ping = serde_json::json!({ "type": "ping" }).to_string();
                let mut write = write.lock().await;
                if write.send(Message::Text(ping.into())).await.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn read_loop(
    mut read: futures::stream::SplitStream<WsStream>,
    fanout: FanoutHub,
    sinks: Arc<SinkSet>,
    config: Arc<SyncMutex<Config>>,
    emitter: Arc<dyn EventEmitter>,
    closed: Arc<AtomicBool>,
) {
    let mut codec = FrameCodecState::new();
    let mut opus = OpusState::new();

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                emitter.emit(GatewayEvent::Error {
                    error: "transport",
                    message: e.to_string(),
                });
                break;
            }
        };
        match msg {
            // The leading byte is an out-of-band format discriminant (not
            // part of any PC/PM/Opus header itself) so the read loop can
            // tell a zstd-wrapped frame, a plain PC/PM frame, and an Opus
            // frame apart before handing the rest to the codec (§4.2).
            Message::Binary(bytes) if bytes.is_empty() => {
                tracing::warn!("dropping empty binary frame");
            }
            Message::Binary(bytes) => {
                let format_byte = bytes[0];
                let payload = &bytes[1..];
                let decoded = if format_byte == FORMAT_OPUS {
                    codec.decode_opus(payload, &mut opus)
                } else {
                    codec.decode_binary(payload, Some(format_byte))
                };
                match decoded {
                    Ok(frame) => deliver_audio(&fanout, &sinks, &config, frame),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable audio frame");
                    }
                }
            }
            Message::Text(text) => {
                if let Some(upstream_msg) = parse_text_message(&text, &mut codec, &mut opus) {
                    match upstream_msg {
                        UpstreamMessage::Audio(frame) => {
                            deliver_audio(&fanout, &sinks, &config, frame)
                        }
                        UpstreamMessage::Status {
                            session_id: _,
                            frequency: _,
                            mode: _,
                        } => {
                            // Session Manager owns the authoritative tuning state;
                            // this read loop only forwards audio and error
                            // conditions into the fan-out path.
                        }
                        UpstreamMessage::Error { error } => {
                            emitter.emit(GatewayEvent::Error {
                                error: "upstream",
                                message: error,
                            });
                        }
                        UpstreamMessage::Pong => {}
                    }
                }
            }
            Message::Close(_) => {
                emitter.emit(GatewayEvent::Connection {
                    connected: false,
                    reason: Some("remote closed".into()),
                });
                break;
            }
            _ => {}
        }
    }
    closed.store(true, Ordering::SeqCst);
    emitter.emit(GatewayEvent::Connection {
        connected: false,
        reason: None,
    });
}

/// Fans a decoded frame out to subscribers unchanged, and separately offers
/// a volume/channel-gain-adjusted copy to the Sink Set (§4.1, §4.5): the
/// Fan-out Hub's subscribers and the Sink Set are independent outputs, and
/// only the latter applies the locally-configured gain.
fn deliver_audio(fanout: &FanoutHub, sinks: &SinkSet, config: &SyncMutex<Config>, frame: PcmFrame) {
    let (volume, left_enabled, right_enabled) = {
        let config = config.lock();
        (
            config.volume,
            config.left_channel_enabled,
            config.right_channel_enabled,
        )
    };
    let gained = apply_output_gain(&frame.pcm, frame.channels, volume, left_enabled, right_enabled);
    sinks.write_pcm(&gained);
    fanout.publish_audio(frame);
}

fn parse_text_message(
    text: &str,
    codec: &mut FrameCodecState,
    opus: &mut OpusState,
) -> Option<UpstreamMessage> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("type")?.as_str()? {
        "audio" => {
            let payload = value.get("data")?.as_str()?;
            let sample_rate = value.get("sampleRate").and_then(|v| v.as_u64())? as u32;
            let channels = value.get("channels").and_then(|v| v.as_u64()).unwrap_or(1) as u16;
            if value.get("codec").and_then(|v| v.as_str()) == Some("opus") {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(payload)
                    .ok()?;
                codec.decode_opus(&raw, opus).ok().map(UpstreamMessage::Audio)
            } else {
                codec
                    .decode_base64_audio(payload, sample_rate, channels)
                    .ok()
                    .map(UpstreamMessage::Audio)
            }
        }
        "status" => Some(UpstreamMessage::Status {
            session_id: value.get("sessionId")?.as_str()?.to_string(),
            frequency: value.get("frequency")?.as_i64()?,
            mode: value.get("mode")?.as_str()?.to_string(),
        }),
        "error" => Some(UpstreamMessage::Error {
            error: value.get("error")?.as_str()?.to_string(),
        }),
        "pong" => Some(UpstreamMessage::Pong),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_uses_wss_for_ssl_targets_and_carries_the_initial_tune() {
        let target = UpstreamTarget {
            host: "sdr.example".into(),
            port: 8080,
            ssl: true,
            password: None,
            user_session_id: uuid::Uuid::nil(),
        };
        let tune = TuneIntent {
            frequency_hz: Some(14_074_000),
            mode: Some(crate::tuning::Mode::Usb),
            bandwidth_low: Some(50),
            bandwidth_high: Some(2700),
        };
        let url = target.ws_url(&tune);
        assert!(url.starts_with("wss://sdr.example:8080/ws?"));
        assert!(url.contains("frequency=14074000"));
        assert!(url.contains("mode=usb"));
        assert!(url.contains(&format!("user_session_id={}", uuid::Uuid::nil())));
        assert!(url.contains("bandwidthLow=50"));
        assert!(url.contains("bandwidthHigh=2700"));
        assert_eq!(target.http_base(), "https://sdr.example:8080");
    }

    #[test]
    fn ws_url_omits_bandwidth_for_iq_modes() {
        let target = UpstreamTarget {
            host: "sdr.example".into(),
            port: 8080,
            ssl: false,
            password: None,
            user_session_id: uuid::Uuid::nil(),
        };
        let tune = TuneIntent {
            frequency_hz: Some(14_100_000),
            mode: Some(crate::tuning::Mode::Iq96),
            bandwidth_low: None,
            bandwidth_high: None,
        };
        let url = target.ws_url(&tune);
        assert!(!url.contains("bandwidthLow"));
        assert!(!url.contains("bandwidthHigh"));
    }

    #[test]
    fn parse_text_message_reads_status_fields() {
        let mut codec = FrameCodecState::new();
        let mut opus = OpusState::new();
        let text = r#"{"type":"status","sessionId":"abc","frequency":14074000,"mode":"usb"}"#;
        let msg = parse_text_message(text, &mut codec, &mut opus).unwrap();
        match msg {
            UpstreamMessage::Status { frequency, .. } => assert_eq!(frequency, 14_074_000),
            _ => panic!("expected status"),
        }
    }

    #[test]
    fn parse_text_message_ignores_unknown_type() {
        let mut codec = FrameCodecState::new();
        let mut opus = OpusState::new();
        assert!(parse_text_message(r#"{"type":"midi"}"#, &mut codec, &mut opus).is_none());
    }
}
