//! Line-oriented rig daemon client (rigctld-style): newline-terminated
//! ASCII commands over a plain TCP socket. Connection is opened lazily and
//! re-opened transparently on the next command after a failure; the
//! Reconnect Supervisor only concerns itself with the upstream SDR session,
//! not this link, so this client owns its own reconnection.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::mode_map::{generic_to_mode, mode_to_generic};
use super::{RigLink, RigReport};
use crate::error::{GatewayError, GatewayResult};
use crate::tuning::Mode;

pub struct LineRig {
    addr: String,
    conn: Mutex<Option<BufReader<TcpStream>>>,
    last_report: Mutex<Option<RigReport>>,
    /// Set whenever `ensure_connected` freshly opens the socket, so the next
    /// `poll` forces a callback even if the cached value hasn't moved (§3
    /// `firstPoll`: "forces callbacks on first successful poll after
    /// (re)connect, regardless of change").
    just_reconnected: std::sync::atomic::AtomicBool,
}

impl LineRig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            conn: Mutex::new(None),
            last_report: Mutex::new(None),
            just_reconnected: std::sync::atomic::AtomicBool::new(true),
        }
    }

    async fn ensure_connected(
        &self,
        slot: &mut Option<BufReader<TcpStream>>,
    ) -> GatewayResult<()> {
        if slot.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| GatewayError::RigLink {
                rig: "rigctld",
                message: e.to_string(),
            })?;
        *slot = Some(BufReader::new(stream));
        self.just_reconnected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    /// Sends one command line and reads one response line, reconnecting and
    /// retrying exactly once on any I/O failure.
    async fn command(&self, line: &str) -> GatewayResult<String> {
        let mut guard = self.conn.lock().await;
        for attempt in 0..2 {
            if let Err(e) = self.ensure_connected(&mut *guard).await {
                if attempt == 1 {
                    return Err(e);
                }
                continue;
            }
            let conn = guard.as_mut().unwrap();
            let result: std::io::Result<String> = async {
                conn.get_mut().write_all(line.as_bytes()).await?;
                conn.get_mut().write_all(b"\n").await?;
                let mut resp = String::new();
                conn.read_line(&mut resp).await?;
                Ok(resp)
            }
            .await;
            match result {
                Ok(resp) => return Ok(resp.trim().to_string()),
                Err(e) if attempt == 0 => {
                    *guard = None;
                    let _ = e;
                }
                Err(e) => {
                    *guard = None;
                    return Err(GatewayError::RigLink {
                        rig: "rigctld",
                        message: e.to_string(),
                    });
                }
            }
        }
        unreachable!("loop always returns or errors")
    }
}

#[async_trait]
impl RigLink for LineRig {
    fn name(&self) -> &'static str {
        "rigctld"
    }

    async fn set_frequency(&self, hz: i64) -> GatewayResult<()> {
        self.command(&format!("F {hz}")).await?;
        Ok(())
    }

    async fn set_mode(&self, mode: Mode) -> GatewayResult<()> {
        self.command(&format!("M {} 0", mode_to_generic(mode)))
            .await?;
        Ok(())
    }

    async fn set_vfo(&self, vfo: &str) -> GatewayResult<()> {
        self.command(&format!("V {vfo}")).await?;
        Ok(())
    }

    async fn poll(&self) -> GatewayResult<Option<RigReport>> {
        let freq_resp = self.command("f").await?;
        let frequency_hz: i64 = freq_resp.parse().map_err(|_| GatewayError::RigLink {
            rig: "rigctld",
            message: format!("unparseable frequency response: {freq_resp:?}"),
        })?;
        let mode_resp = self.command("m").await?;
        let mode_name = mode_resp.lines().next().unwrap_or("").to_string();

        let report = RigReport {
            frequency_hz,
            mode: generic_to_mode(&mode_name),
            vfo: None,
        };
        let first_poll = self
            .just_reconnected
            .swap(false, std::sync::atomic::Ordering::SeqCst);
        let mut last = self.last_report.lock().await;
        if !first_poll && last.as_ref() == Some(&report) {
            return Ok(None);
        }
        *last = Some(report.clone());
        Ok(Some(report))
    }

    fn is_connected(&self) -> bool {
        // `try_lock` avoids blocking the non-blocking `IsConnected` probe on
        // a link that is mid-command; a contended lock just reads as "connected".
        match self.conn.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(_) => true,
        }
    }

    async fn close(&self) {
        *self.conn.lock().await = None;
    }
}
