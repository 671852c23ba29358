//! Serial CAT emulator (§5, §9): the gateway impersonates a Kenwood TS-480
//! on a serial port so third-party logging/rig-control software can read and
//! set frequency/mode as if it were talking to a real radio. Unlike the
//! other three variants, this one is a *server*: it answers queries and
//! applies sets pushed at it, rather than polling an external daemon.
//!
//! Commands are semicolon-terminated ASCII (`FA00014074000;`). Only the
//! handful of TS-480 commands a typical contest/logging client actually
//! issues on connect are implemented: `FA`/`FB` (VFO A/B frequency), `MD`
//! (mode), `IF` (the catch-all info string most software polls first),
//! `ID` (rig identity), `AI` (auto-info, accepted and ignored - this
//! emulator is always poll-driven), `FT`/`FR` (VFO select, accepted and
//! ignored since there is only one operating frequency), `PS` (power
//! state, always on), `TX`/`RX` (accepted and ignored - no real PTT to
//! emulate).

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;

use super::mode_map::{cat_code_to_mode, mode_to_cat_code};
use super::{RigLink, RigReport};
use crate::error::{GatewayError, GatewayResult};
use crate::tuning::Mode;

const RIG_ID: &str = "ID020;"; // TS-480 identity code

#[derive(Debug, Clone, Copy)]
struct SerialState {
    frequency_hz: i64,
    /// VFO B's cached frequency, tracked separately so an `FB` set doesn't
    /// clobber VFO A's (`frequency_hz`) - this emulator only ever *operates*
    /// on VFO A, but a logging client that queries `FB` after setting it
    /// still expects to read back what it wrote.
    frequency_b_hz: i64,
    mode: Mode,
    connected: bool,
}

pub struct SerialEmu {
    state: Arc<Mutex<SerialState>>,
    /// Set by `poll` when the port-reader task observes a command that
    /// changes state; drained and returned to the caller.
    pending_report: Arc<Mutex<Option<RigReport>>>,
}

impl SerialEmu {
    /// Opens `path` at `baud` and spawns the reader/writer task. Returns
    /// immediately; the task runs for the lifetime of the returned handle's
    /// `Arc` clones held by the caller.
    pub fn spawn(path: &str, baud: u32) -> GatewayResult<Self> {
        let port = tokio_serial::new(path, baud)
            .open_native_async()
            .map_err(|e| GatewayError::RigLink {
                rig: "serial",
                message: format!("opening {path}: {e}"),
            })?;

        let state = Arc::new(Mutex::new(SerialState {
            frequency_hz: 14_074_000,
            frequency_b_hz: 14_074_000,
            mode: Mode::Usb,
            connected: true,
        }));
        let pending_report = Arc::new(Mutex::new(None));

        tokio::spawn(run_port(port, state.clone(), pending_report.clone()));

        Ok(Self {
            state,
            pending_report,
        })
    }
}

async fn run_port(
    mut port: tokio_serial::SerialStream,
    state: Arc<Mutex<SerialState>>,
    pending_report: Arc<Mutex<Option<RigReport>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = match port.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "serial CAT port read failed");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);
        while let Some(end) = buf.iter().position(|&b| b == b';') {
            let cmd: Vec<u8> = buf.drain(..=end).collect();
            let cmd = &cmd[..cmd.len() - 1]; // strip trailing ';'
            if let Some(reply) = handle_command(cmd, &state, &pending_report) {
                if port.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }
    state.lock().connected = false;
}

/// Applies one command to shared state and returns the reply to write back,
/// if the command expects one.
fn handle_command(
    cmd: &[u8],
    state: &Mutex<SerialState>,
    pending_report: &Mutex<Option<RigReport>>,
) -> Option<String> {
    let cmd = std::str::from_utf8(cmd).ok()?;
    if cmd.len() < 2 {
        return None;
    }
    let (tag, rest) = cmd.split_at(2);
    match tag {
        "ID" => Some(RIG_ID.to_string()),
        "PS" => Some("PS1;".to_string()),
        "AI" | "FT" | "FR" | "TX" | "RX" => Some(format!("{cmd};")),
        "FA" => {
            if rest.is_empty() {
                let hz = state.lock().frequency_hz;
                Some(format!("FA{hz:011};"))
            } else {
                let hz: i64 = rest.parse().ok()?;
                let mut s = state.lock();
                s.frequency_hz = hz;
                *pending_report.lock() = Some(RigReport {
                    frequency_hz: hz,
                    mode: s.mode,
                    vfo: None,
                });
                None
            }
        }
        "FB" => {
            if rest.is_empty() {
                let hz = state.lock().frequency_b_hz;
                Some(format!("FB{hz:011};"))
            } else {
                // VFO B is never the operating frequency in this emulation,
                // so a set here only updates the cached readback value - no
                // pending report, no effect on `frequency_hz`.
                let hz: i64 = rest.parse().ok()?;
                state.lock().frequency_b_hz = hz;
                None
            }
        }
        "MD" => {
            if rest.is_empty() {
                let code = mode_to_cat_code(state.lock().mode);
                Some(format!("MD{code};"))
            } else {
                let code: u8 = rest.parse().ok()?;
                let mode = cat_code_to_mode(code);
                let mut s = state.lock();
                s.mode = mode;
                *pending_report.lock() = Some(RigReport {
                    frequency_hz: s.frequency_hz,
                    mode,
                    vfo: None,
                });
                None
            }
        }
        "IF" => {
            let s = state.lock();
            // TS-480 `IF` is a fixed-width status string; only frequency and
            // mode are populated meaningfully, the rest zeroed/spaced.
            Some(format!(
                "IF{:011}00000+00000000{}0000000;",
                s.frequency_hz,
                mode_to_cat_code(s.mode)
            ))
        }
        _ => None,
    }
}

#[async_trait]
impl RigLink for SerialEmu {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn set_frequency(&self, hz: i64) -> GatewayResult<()> {
        self.state.lock().frequency_hz = hz;
        Ok(())
    }

    async fn set_mode(&self, mode: Mode) -> GatewayResult<()> {
        self.state.lock().mode = mode;
        Ok(())
    }

    async fn set_vfo(&self, _vfo: &str) -> GatewayResult<()> {
        // The emulator exposes a single operating frequency; VFO A/B select
        // from the client side is accepted (see `handle_command`'s `FT`/`FR`
        // arms) but does not fan out to two independent frequencies.
        Ok(())
    }

    async fn poll(&self) -> GatewayResult<Option<RigReport>> {
        Ok(self.pending_report.lock().take())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn close(&self) {
        self.state.lock().connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (Mutex<SerialState>, Mutex<Option<RigReport>>) {
        (
            Mutex::new(SerialState {
                frequency_hz: 14_074_000,
                frequency_b_hz: 14_074_000,
                mode: Mode::Usb,
                connected: true,
            }),
            Mutex::new(None),
        )
    }

    #[test]
    fn fa_query_reports_current_frequency() {
        let (state, pending) = fresh();
        let reply = handle_command(b"FA", &state, &pending);
        assert_eq!(reply, Some("FA00014074000;".to_string()));
    }

    #[test]
    fn fa_set_updates_state_and_queues_report() {
        let (state, pending) = fresh();
        let reply = handle_command(b"FA00007040000", &state, &pending);
        assert_eq!(reply, None);
        assert_eq!(state.lock().frequency_hz, 7_040_000);
        assert_eq!(pending.lock().as_ref().unwrap().frequency_hz, 7_040_000);
    }

    #[test]
    fn md_set_maps_cat_code_to_mode() {
        let (state, pending) = fresh();
        handle_command(b"MD3", &state, &pending);
        assert_eq!(state.lock().mode, Mode::Cwu);
        assert_eq!(pending.lock().as_ref().unwrap().mode, Mode::Cwu);
    }

    #[test]
    fn fb_set_does_not_clobber_vfo_a_or_queue_a_report() {
        let (state, pending) = fresh();
        let reply = handle_command(b"FB00007040000", &state, &pending);
        assert_eq!(reply, None);
        assert_eq!(state.lock().frequency_b_hz, 7_040_000);
        assert_eq!(state.lock().frequency_hz, 14_074_000);
        assert!(pending.lock().is_none());
    }

    #[test]
    fn fb_query_reports_its_own_cached_frequency() {
        let (state, pending) = fresh();
        handle_command(b"FB00007040000", &state, &pending);
        let reply = handle_command(b"FB", &state, &pending);
        assert_eq!(reply, Some("FB00007040000;".to_string()));
    }

    #[test]
    fn id_query_returns_ts480_identity() {
        let (state, pending) = fresh();
        assert_eq!(handle_command(b"ID", &state, &pending), Some(RIG_ID.to_string()));
    }
}
