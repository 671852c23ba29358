//! Spectrum Session connection wrapper (§4.2, §2 "Spectrum Session"):
//! opens a second WebSocket, separate from the audio Upstream Session, only
//! once the first spectrum subscriber appears, and tears it down once the
//! last one leaves. Wire-format decoding itself lives in [`crate::spectrum`];
//! this module owns the socket lifecycle.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{GatewayError, GatewayResult};
use crate::fanout::FanoutHub;
use crate::protocol_constants::CONNECT_TIMEOUT_SECS;
use crate::spectrum::{SpectrumCommandLimiter, SpectrumSessionState};
use crate::upstream::UpstreamTarget;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Builds the `/ws/user-spectrum` URL (§4.4, §6): `user_session_id` and
/// `mode=binary8` are always present; `password` is carried only when the
/// session descriptor has one.
fn spectrum_ws_url(target: &UpstreamTarget) -> String {
    let scheme = if target.ssl { "wss" } else { "ws" };
    let mut url = url::Url::parse(&format!(
        "{scheme}://{}:{}/ws/user-spectrum",
        target.host, target.port
    ))
    .expect("host/port always form a valid URL");
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("user_session_id", &target.user_session_id.to_string());
        if let Some(password) = &target.password {
            q.append_pair("password", password);
        }
        q.append_pair("mode", "binary8");
    }
    url.into()
}

/// A live spectrum session. Holds the outbound sink behind a mutex so
/// zoom/pan commands from multiple observers serialize onto one socket.
pub struct SpectrumSession {
    write: Mutex<futures::stream::SplitSink<WsStream, Message>>,
    limiter: Mutex<SpectrumCommandLimiter>,
    shutdown: mpsc::Sender<()>,
}

impl SpectrumSession {
    /// Connects and negotiates binary-u8 spectrum frames (the most
    /// bandwidth-efficient wire format this core supports end to end),
    /// then spawns the inbound decode loop feeding the fan-out hub.
    pub async fn open(target: &UpstreamTarget, fanout: FanoutHub) -> GatewayResult<Self> {
        let connect_fut = tokio_tungstenite::connect_async(spectrum_ws_url(target));
        let (ws, _resp) = timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect_fut)
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(GatewayError::from)?;

        let (write, read) = ws.split();

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(read_loop(read, fanout, shutdown_rx));

        Ok(Self {
            write: Mutex::new(write),
            limiter: Mutex::new(SpectrumCommandLimiter::default()),
            shutdown: shutdown_tx,
        })
    }

    /// Sends an outbound zoom/pan command, dropping it silently if it
    /// exceeds the rate limit (§4.2 "Spectrum command rate limit") rather
    /// than queuing - a dropped zoom command is superseded by the next one
    /// the UI sends anyway.
    pub async fn send_command(&self, command: serde_json::Value) -> GatewayResult<()> {
        if !self.limiter.lock().await.try_acquire() {
            return Ok(());
        }
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(command.to_string().into()))
            .await
            .map_err(GatewayError::from)
    }

    pub async fn close(&self) {
        let _ = self.shutdown.send(()).await;
        let mut write = self.write.lock().await;
        let _ = write.close().await;
    }
}

async fn read_loop(
    mut read: futures::stream::SplitStream<WsStream>,
    fanout: FanoutHub,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut state = SpectrumSessionState::new();
    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        match state.process_json(&text) {
                            Ok(Some(frame)) => fanout.publish_spectrum(frame),
                            Ok(None) => {}
                            Err(e) => tracing::warn!(error = %e, "dropping unparseable spectrum json"),
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        match state.process_binary(&bytes) {
                            Ok(Some(frame)) => fanout.publish_spectrum(frame),
                            Ok(None) => {}
                            Err(e) => tracing::warn!(error = %e, "dropping unparseable spectrum binary frame"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spectrum_url_uses_dedicated_path_and_carries_session_and_mode() {
        let target = UpstreamTarget {
            host: "sdr.example".into(),
            port: 8080,
            ssl: false,
            password: None,
            user_session_id: uuid::Uuid::nil(),
        };
        let url = spectrum_ws_url(&target);
        assert!(url.starts_with("ws://sdr.example:8080/ws/user-spectrum?"));
        assert!(url.contains("mode=binary8"));
        assert!(url.contains(&format!("user_session_id={}", uuid::Uuid::nil())));
        assert!(!url.contains("password"));
    }

    #[test]
    fn spectrum_url_carries_password_when_set() {
        let target = UpstreamTarget {
            host: "sdr.example".into(),
            port: 8080,
            ssl: true,
            password: Some("hunter2".into()),
            user_session_id: uuid::Uuid::nil(),
        };
        assert!(spectrum_ws_url(&target).contains("password=hunter2"));
    }
}
