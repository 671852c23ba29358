//! TCI WebSocket server (§4.5, §5, §9): hosts a single TCI-protocol client
//! (typically a logging or digital-mode app) over a plain text command
//! channel plus a binary IQ/audio stream, modeled on the teacher's
//! `api::ws` handler (axum `WebSocketUpgrade`, split sink/stream,
//! `tokio::select!` event loop).
//!
//! TCI allows exactly one client at a time; a second connection attempt is
//! rejected with HTTP 403 before the upgrade completes. Outbound state
//! pushes (frequency/mode) are coalesced to one per [`TCI_MODE_COOLDOWN_MS`]
//! window so a rapid sequence of Session Manager updates doesn't flood the
//! client, and inbound commands are rate-limited to
//! [`TCI_UPSTREAM_RATE_LIMIT_MS`] for the same reason in the other
//! direction. The same cooldown gates the `AudioActive`/`IQActive` state
//! machine's side effects (§4.5): a burst of `iq_start`/`audio_start`/
//! `iq_samplerate` commands settles onto one actual mode change per window.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::mode_map::{mode_to_tci, tci_to_mode};
use super::{RigLink, RigReport};
use crate::error::{GatewayError, GatewayResult};
use crate::frame_codec::pcm_i16_to_f32;
use crate::protocol_constants::{
    MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ, TCI_FRAME_HEADER_LEN, TCI_IF_LIMIT_HIGH,
    TCI_IF_LIMIT_LOW, TCI_IQ_SAMPLE_RATES, TCI_MODE_COOLDOWN_MS, TCI_UPSTREAM_RATE_LIMIT_MS,
};
use crate::session::SessionManager;
use crate::tuning::Mode;

/// TCI's own view of what it's currently streaming, distinct from the
/// session's demodulation mode: while `IQActive`, the session itself is
/// tuned to an `iq*` mode, but TCI still remembers the audio modulation the
/// client last asked for so `audio_start` can restore it (§4.5).
#[derive(Debug, Clone, Copy, PartialEq)]
enum StreamState {
    Audio,
    Iq(u32),
}

#[derive(Clone)]
struct TciShared {
    connected: Arc<AtomicBool>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    pending_report: Arc<Mutex<Option<RigReport>>>,
    last_inbound: Arc<Mutex<Option<Instant>>>,
    last_mode_change: Arc<Mutex<Option<Instant>>>,
    current: Arc<Mutex<RigReport>>,
    stream_state: Arc<Mutex<StreamState>>,
    previous_audio_mode: Arc<Mutex<Mode>>,
    pending_iq_rate: Arc<Mutex<u32>>,
    last_outbound_push: Arc<Mutex<Option<Instant>>>,
    session: Weak<SessionManager>,
}

pub struct TciServer {
    shared: TciShared,
}

impl TciServer {
    /// Binds `addr` and spawns the axum server task. Mirrors the teacher's
    /// split between building the router and handing it to a background
    /// task the caller doesn't have to await. `session` is a weak handle so
    /// the Rig Control Set never keeps the Session Manager alive on its own
    /// (the manager owns the rig link, not the other way around).
    pub async fn spawn(addr: SocketAddr, session: Weak<SessionManager>) -> GatewayResult<Self> {
        let shared = TciShared {
            connected: Arc::new(AtomicBool::new(false)),
            outbound: Arc::new(Mutex::new(None)),
            pending_report: Arc::new(Mutex::new(None)),
            last_inbound: Arc::new(Mutex::new(None)),
            last_mode_change: Arc::new(Mutex::new(None)),
            current: Arc::new(Mutex::new(RigReport {
                frequency_hz: 14_074_000,
                mode: Mode::Usb,
                vfo: None,
            })),
            stream_state: Arc::new(Mutex::new(StreamState::Audio)),
            previous_audio_mode: Arc::new(Mutex::new(Mode::Usb)),
            pending_iq_rate: Arc::new(Mutex::new(TCI_IQ_SAMPLE_RATES[0])),
            last_outbound_push: Arc::new(Mutex::new(None)),
            session,
        };

        let router = Router::new()
            .route("/", get(ws_handler))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::RigLink {
                rig: "tci",
                message: format!("binding {addr}: {e}"),
            })?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::warn!(error = %e, "tci server exited");
            }
        });

        Ok(Self { shared })
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(shared): State<TciShared>) -> Response {
    // Reject a second client before paying for the upgrade (§4.5, §6):
    // the swap is the actual admission decision, so there's no race window
    // between checking and claiming the slot.
    if shared.connected.swap(true, Ordering::SeqCst) {
        return (StatusCode::FORBIDDEN, "tci: one client at a time").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, shared))
        .into_response()
}

async fn handle_socket(socket: WebSocket, shared: TciShared) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    *shared.outbound.lock() = Some(tx);

    for cmd in initial_state_commands(&shared.current.lock()) {
        if sender.send(Message::Text(cmd.into())).await.is_err() {
            shared.connected.store(false, Ordering::SeqCst);
            *shared.outbound.lock() = None;
            return;
        }
    }

    let session = shared.session.upgrade();
    let mut audio_rx = None;
    let mut spectrum_rx = None;
    let mut audio_id = None;
    let mut spectrum_id = None;
    if let Some(session) = &session {
        session.fanout().register_other_subscriber();
        let (id, rx) = session.fanout().subscribe_audio();
        audio_id = Some(id);
        audio_rx = Some(rx);
        let (id, rx) = session.subscribe_spectrum().await;
        spectrum_id = Some(id);
        spectrum_rx = Some(rx);
    }

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_commands(&text, &shared).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            Some(frame) = recv_optional(&mut audio_rx) => {
                let stream_state = *shared.stream_state.lock();
                let frame_type = match stream_state {
                    StreamState::Audio => 1u8,
                    StreamState::Iq(_) => 0u8,
                };
                let duplicate_mono = matches!(stream_state, StreamState::Audio) && frame.channels == 1;
                let samples = pcm_i16_to_f32(&frame.pcm);
                let (payload, channels): (Vec<f32>, u8) = if duplicate_mono {
                    let mut stereo = Vec::with_capacity(samples.len() * 2);
                    for s in &samples {
                        stereo.push(*s);
                        stereo.push(*s);
                    }
                    (stereo, 2)
                } else {
                    (samples, frame.channels as u8)
                };
                let header = build_tci_frame_header(frame.sample_rate, payload.len() as u32, frame_type, channels);
                let mut bytes = header;
                for s in &payload {
                    bytes.extend_from_slice(&s.to_le_bytes());
                }
                if let Some(tx) = shared.outbound.lock().clone() {
                    let _ = tx.send(Message::Binary(bytes.into()));
                }
            }
            Some(frame) = recv_optional(&mut spectrum_rx) => {
                if let Some(session) = &session {
                    let status = session.get_status().await;
                    let low = status.tuning.bandwidth_low.unwrap_or(-2700);
                    let high = status.tuning.bandwidth_high.unwrap_or(-50);
                    if let Some(peak) = crate::spectrum::tci_signal_meter_peak(
                        &frame,
                        status.tuning.frequency_hz as f64,
                        low,
                        high,
                    ) {
                        if let Some(tx) = shared.outbound.lock().clone() {
                            let _ = tx.send(Message::Text(format!("rx_smeter:0,0,{peak:.1};").into()));
                        }
                    }
                }
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    *shared.outbound.lock() = None;
    if let Some(session) = session {
        if let Some(id) = audio_id {
            session.fanout().unsubscribe_audio(id);
        }
        if let Some(id) = spectrum_id {
            session.unsubscribe_spectrum(id).await;
        }
        session.fanout().unregister_other_subscriber();
    }
}

/// Polls an `Option<Receiver<T>>`, never resolving when `None` so the
/// `tokio::select!` arm simply never fires for a connection with no fan-out
/// subscription (e.g. the Weak session handle failed to upgrade).
async fn recv_optional<T>(rx: &mut Option<mpsc::Receiver<Arc<T>>>) -> Option<Arc<T>> {
    match rx {
        Some(inner) => match inner.recv().await {
            Some(frame) => Some(frame),
            None => {
                // Sender side dropped; stop polling this branch instead of
                // busy-looping on an exhausted channel.
                *rx = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

/// Builds the fixed 64-byte binary frame header (§4.5): receiver(u32),
/// sampleRate(u32), format=3(u8), codec=0(u8), crc=0(u32), length(u32),
/// type(u8), channels(u8), zero-padded to [`TCI_FRAME_HEADER_LEN`].
fn build_tci_frame_header(sample_rate: u32, sample_count: u32, frame_type: u8, channels: u8) -> Vec<u8> {
    let mut header = vec![0u8; TCI_FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(&0u32.to_le_bytes()); // receiver
    header[4..8].copy_from_slice(&sample_rate.to_le_bytes());
    header[8] = 3; // format
    header[9] = 0; // codec
    header[10..14].copy_from_slice(&0u32.to_le_bytes()); // crc
    header[14..18].copy_from_slice(&(sample_count * 4).to_le_bytes()); // length in bytes
    header[18] = frame_type;
    header[19] = channels;
    header
}

/// The initial-state handshake emitted once per connection (§4.5): device
/// identity, capability limits, the modulations list, both stream sample
/// rates, per-receiver state, then `ready;` (and `start;`, since the
/// gateway is always "powered" once a session exists).
fn initial_state_commands(current: &RigReport) -> Vec<String> {
    let modulations = "usb,lsb,am,sam,fm,nfm,cw";
    vec![
        "device:gateway;".into(),
        "protocol:1.0;".into(),
        "receive_only:true;".into(),
        "trx_count:2;".into(),
        "channels_count:2;".into(),
        format!("vfo_limits:0,{MIN_FREQUENCY_HZ},{MAX_FREQUENCY_HZ};"),
        format!("if_limits:{TCI_IF_LIMIT_LOW},{TCI_IF_LIMIT_HIGH};"),
        format!("modulations_list:{modulations};"),
        "audio_samplerate:48000;".into(),
        format!(
            "iq_samplerates:{};",
            TCI_IQ_SAMPLE_RATES
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(",")
        ),
        "rx_enable:0,true;".into(),
        format!("dds:0,{};", current.frequency_hz),
        format!("vfo:0,0,{};", current.frequency_hz),
        format!("modulation:0,{};", mode_to_tci(current.mode)),
        "split_enable:0,false;".into(),
        "trx:0,false;".into(),
        "ready;".into(),
        "start;".into(),
    ]
}

/// Parses semicolon-separated TCI commands, applying the rate limit per
/// §9: a burst of commands inside [`TCI_UPSTREAM_RATE_LIMIT_MS`] collapses
/// to just the first. Mode-changing side effects (`iq_start`, `audio_start`,
/// `iq_samplerate` switches) additionally wait out [`TCI_MODE_COOLDOWN_MS`]
/// before reaching the Session Manager (§4.5).
async fn handle_inbound_commands(text: &str, shared: &TciShared) {
    {
        let mut last = shared.last_inbound.lock();
        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < Duration::from_millis(TCI_UPSTREAM_RATE_LIMIT_MS) {
                return;
            }
        }
        *last = Some(now);
    }

    let mut freq_update = None;
    let mut plain_modulation = None;
    let mut wants_audio_start = false;
    let mut wants_iq_start = false;
    let mut requested_iq_rate = None;

    for cmd in text.split(';').filter(|c| !c.is_empty()) {
        let (tag, params) = match cmd.split_once(':') {
            Some(parts) => parts,
            None => (cmd, ""),
        };
        match tag {
            "vfo" | "dds" => {
                let hz_field = if tag == "vfo" { params.split(',').nth(2) } else { params.split(',').nth(1) };
                if let Some(hz) = hz_field.and_then(|s| s.parse::<i64>().ok()) {
                    freq_update = Some(hz);
                }
            }
            "modulation" => {
                if let Some(mode_str) = params.split(',').nth(1) {
                    plain_modulation = Some(tci_to_mode(mode_str));
                }
            }
            "audio_start" => wants_audio_start = true,
            "iq_start" => wants_iq_start = true,
            "iq_samplerate" => {
                if let Ok(rate) = params.trim().parse::<u32>() {
                    if TCI_IQ_SAMPLE_RATES.contains(&rate) && iq_rate_is_allowed(rate, shared) {
                        requested_iq_rate = Some(rate);
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(hz) = freq_update {
        shared.current.lock().frequency_hz = hz;
        *shared.pending_report.lock() = Some(shared.current.lock().clone());
        if let Some(session) = shared.session.upgrade() {
            let _ = session.set_frequency(hz).await;
        }
    }

    if let Some(mode) = plain_modulation {
        let in_audio = matches!(*shared.stream_state.lock(), StreamState::Audio);
        if in_audio {
            apply_mode_change(shared, mode).await;
        } else {
            // While IQActive, remember the requested demod mode for the
            // eventual `audio_start` return without leaving IQ (§4.5).
            *shared.previous_audio_mode.lock() = mode;
        }
    }

    if let Some(rate) = requested_iq_rate {
        let was_iq = matches!(*shared.stream_state.lock(), StreamState::Iq(_));
        *shared.pending_iq_rate.lock() = rate;
        if was_iq {
            if let Some(mode) = Mode::from_iq_sample_rate(rate) {
                wait_out_cooldown(shared).await;
                *shared.stream_state.lock() = StreamState::Iq(rate);
                if let Some(session) = shared.session.upgrade() {
                    let _ = session.set_mode(mode).await;
                }
            }
        }
    }

    if wants_iq_start {
        let in_audio = matches!(*shared.stream_state.lock(), StreamState::Audio);
        if in_audio {
            *shared.previous_audio_mode.lock() = shared.current.lock().mode;
            let rate = *shared.pending_iq_rate.lock();
            if let Some(mode) = Mode::from_iq_sample_rate(rate) {
                wait_out_cooldown(shared).await;
                *shared.stream_state.lock() = StreamState::Iq(rate);
                if let Some(session) = shared.session.upgrade() {
                    let _ = session.set_mode(mode).await;
                }
            }
        }
    }

    if wants_audio_start {
        let in_iq = matches!(*shared.stream_state.lock(), StreamState::Iq(_));
        if in_iq {
            let restore = *shared.previous_audio_mode.lock();
            wait_out_cooldown(shared).await;
            *shared.stream_state.lock() = StreamState::Audio;
            if let Some(session) = shared.session.upgrade() {
                let _ = session.set_mode(restore).await;
            }
        }
    }
}

/// Checks a requested IQ sample rate against the session's
/// `allowed_iq_modes` (populated from `SessionDescription` on connect): an
/// empty list means the upstream placed no restriction, so every rate in
/// [`TCI_IQ_SAMPLE_RATES`] stays eligible.
fn iq_rate_is_allowed(rate: u32, shared: &TciShared) -> bool {
    let Some(mode) = Mode::from_iq_sample_rate(rate) else {
        return false;
    };
    let Some(session) = shared.session.upgrade() else {
        return true;
    };
    let allowed = session.allowed_iq_modes();
    allowed.is_empty() || allowed.iter().any(|m| m == mode.as_str())
}

async fn apply_mode_change(shared: &TciShared, mode: Mode) {
    wait_out_cooldown(shared).await;
    if let Some(session) = shared.session.upgrade() {
        let _ = session.set_mode(mode).await;
    }
}

/// Sleeps out whatever remains of the [`TCI_MODE_COOLDOWN_MS`] window since
/// the last mode-change side effect (§4.5 "the server must wait out the
/// cooldown, sleeping as needed").
async fn wait_out_cooldown(shared: &TciShared) {
    let wait = {
        let mut last = shared.last_mode_change.lock();
        let now = Instant::now();
        let remaining = last
            .map(|prev| Duration::from_millis(TCI_MODE_COOLDOWN_MS).saturating_sub(now.duration_since(prev)))
            .unwrap_or_default();
        *last = Some(now + remaining);
        remaining
    };
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
}

#[async_trait]
impl RigLink for TciServer {
    fn name(&self) -> &'static str {
        "tci"
    }

    async fn set_frequency(&self, hz: i64) -> GatewayResult<()> {
        self.shared.current.lock().frequency_hz = hz;
        push_state(&self.shared).await;
        Ok(())
    }

    async fn set_mode(&self, mode: Mode) -> GatewayResult<()> {
        self.shared.current.lock().mode = mode;
        if matches!(*self.shared.stream_state.lock(), StreamState::Audio) {
            *self.shared.previous_audio_mode.lock() = mode;
        }
        push_state(&self.shared).await;
        Ok(())
    }

    async fn set_vfo(&self, _vfo: &str) -> GatewayResult<()> {
        // TCI has no separate VFO-select concept in this emulation; the
        // gateway always reports on logical VFO 0.
        Ok(())
    }

    async fn poll(&self) -> GatewayResult<Option<RigReport>> {
        Ok(self.shared.pending_report.lock().take())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if let Some(tx) = self.shared.outbound.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

/// Pushes the current frequency/mode to the connected client, coalescing
/// within [`TCI_MODE_COOLDOWN_MS`] (§9): a push inside the cooldown window
/// is dropped, relying on the next call after the window to carry the
/// latest state instead of queuing every intermediate one.
async fn push_state(shared: &TciShared) {
    {
        let mut last = shared.last_outbound_push.lock();
        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < Duration::from_millis(TCI_MODE_COOLDOWN_MS) {
                return;
            }
        }
        *last = Some(now);
    }

    let Some(tx) = shared.outbound.lock().clone() else {
        return;
    };
    let current = shared.current.lock().clone();
    let text = format!(
        "vfo:0,0,{};modulation:0,{};",
        current.frequency_hz,
        mode_to_tci(current.mode)
    );
    let _ = tx.send(Message::Text(text.into()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_shared() -> TciShared {
        TciShared {
            connected: Arc::new(AtomicBool::new(false)),
            outbound: Arc::new(Mutex::new(None)),
            pending_report: Arc::new(Mutex::new(None)),
            last_inbound: Arc::new(Mutex::new(None)),
            last_mode_change: Arc::new(Mutex::new(None)),
            current: Arc::new(Mutex::new(RigReport {
                frequency_hz: 14_074_000,
                mode: Mode::Usb,
                vfo: None,
            })),
            stream_state: Arc::new(Mutex::new(StreamState::Audio)),
            previous_audio_mode: Arc::new(Mutex::new(Mode::Usb)),
            pending_iq_rate: Arc::new(Mutex::new(TCI_IQ_SAMPLE_RATES[0])),
            last_outbound_push: Arc::new(Mutex::new(None)),
            session: Weak::new(),
        }
    }

    #[tokio::test]
    async fn inbound_vfo_command_updates_current_and_queues_report() {
        let shared = fresh_shared();
        handle_inbound_commands("vfo:0,0,7040000;", &shared).await;
        assert_eq!(shared.current.lock().frequency_hz, 7_040_000);
        assert_eq!(
            shared.pending_report.lock().as_ref().unwrap().frequency_hz,
            7_040_000
        );
    }

    #[tokio::test]
    async fn inbound_modulation_command_maps_cw_to_cwu_while_iq_active() {
        let shared = fresh_shared();
        // While IQActive a plain `modulation` command only updates the
        // remembered audio mode, which is where the cw->cwu mapping is
        // observable without a live Session Manager attached.
        *shared.stream_state.lock() = StreamState::Iq(48_000);
        handle_inbound_commands("modulation:0,cw;", &shared).await;
        assert_eq!(*shared.previous_audio_mode.lock(), Mode::Cwu);
    }

    #[tokio::test]
    async fn rapid_repeat_inbound_command_is_rate_limited() {
        let shared = fresh_shared();
        handle_inbound_commands("vfo:0,0,7040000;", &shared).await;
        handle_inbound_commands("vfo:0,0,14074000;", &shared).await;
        // Second command landed inside the rate-limit window and was dropped.
        assert_eq!(shared.current.lock().frequency_hz, 7_040_000);
    }

    #[tokio::test]
    async fn iq_start_switches_stream_state_and_remembers_audio_mode() {
        let shared = fresh_shared();
        shared.current.lock().mode = Mode::Usb;
        *shared.pending_iq_rate.lock() = 96_000;
        handle_inbound_commands("iq_start:0;", &shared).await;
        assert_eq!(*shared.stream_state.lock(), StreamState::Iq(96_000));
        assert_eq!(*shared.previous_audio_mode.lock(), Mode::Usb);
    }

    #[tokio::test]
    async fn audio_start_restores_previous_mode_and_leaves_iq() {
        let shared = fresh_shared();
        *shared.stream_state.lock() = StreamState::Iq(48_000);
        *shared.previous_audio_mode.lock() = Mode::Lsb;
        handle_inbound_commands("audio_start:0;", &shared).await;
        assert_eq!(*shared.stream_state.lock(), StreamState::Audio);
    }

    #[test]
    fn frame_header_is_64_bytes_and_carries_type_and_channels() {
        let header = build_tci_frame_header(96_000, 10, 0, 2);
        assert_eq!(header.len(), TCI_FRAME_HEADER_LEN);
        assert_eq!(u32::from_le_bytes(header[4..8].try_into().unwrap()), 96_000);
        assert_eq!(header[18], 0);
        assert_eq!(header[19], 2);
    }

    #[test]
    fn initial_state_commands_include_ready_and_start() {
        let current = RigReport {
            frequency_hz: 14_074_000,
            mode: Mode::Usb,
            vfo: None,
        };
        let commands = initial_state_commands(&current);
        assert!(commands.iter().any(|c| c == "ready;"));
        assert!(commands.iter().any(|c| c == "start;"));
        assert!(commands.iter().any(|c| c.contains("14074000")));
    }
}
