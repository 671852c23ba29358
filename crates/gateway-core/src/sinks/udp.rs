//! UDP datagram sink: one datagram per PCM frame, fire-and-forget (§4.5).

use tokio::net::UdpSocket;

use crate::error::{GatewayError, GatewayResult};

pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    pub async fn connect(host: &str, port: u16) -> GatewayResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| GatewayError::Sink {
                sink: "udp",
                message: format!("binding local socket: {e}"),
            })?;
        socket
            .connect((host, port))
            .await
            .map_err(|e| GatewayError::Sink {
                sink: "udp",
                message: format!("connecting to {host}:{port}: {e}"),
            })?;
        Ok(Self { socket })
    }

    /// Best-effort send; a dropped datagram is exactly the backpressure
    /// behavior the Sink Set expects (§4.3), not an error worth surfacing
    /// per-frame.
    pub fn send(&self, pcm: &[u8]) {
        if let Err(e) = self.socket.try_send(pcm) {
            tracing::trace!(error = %e, "udp sink datagram dropped");
        }
    }
}
