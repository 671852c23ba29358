//! Composition root - the single place every service gets instantiated and
//! wired together. Mirrors the teacher's `bootstrap::bootstrap_services`:
//! one function, dependency-ordered construction, a container struct the
//! hosting binary drives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{Config, RadioControlType, RigConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventEmitter, LoggingEventEmitter};
use crate::protocol_constants::{
    NOISE_FLOOR_POLL_SECS, RECONNECT_SETTLE_SECS, RIG_POLL_INTERVAL_MS,
};
use crate::reconnect::ReconnectSupervisor;
use crate::rig::jsonrpc::JsonRpcRig;
use crate::rig::line::LineRig;
use crate::rig::serial::SerialEmu;
use crate::rig::tci::TciServer;
use crate::rig::RigLink;
use crate::session::SessionManager;
use crate::sinks::{NullAudioDeviceOpener, SinkSet};

/// Everything the hosting binary needs to drive the core: the Session
/// Manager (the surface every operation goes through) plus the
/// cancellation token that tears down its background tasks.
#[derive(Clone)]
pub struct BootstrappedCore {
    pub session: Arc<SessionManager>,
    pub cancel_token: CancellationToken,
}

impl BootstrappedCore {
    /// Graceful shutdown: cancel background tasks, then close the upstream
    /// session and any rig link so nothing lingers after the process exits.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] beginning graceful shutdown");
        self.cancel_token.cancel();
        if let Err(e) = self.session.disconnect().await {
            log::debug!("[Bootstrap] shutdown: {e}");
        }
        self.session.set_rig_link(None, false).await;
        log::info!("[Bootstrap] shutdown complete");
    }
}

/// Wires the core in dependency order (§10.5):
///
/// 1. Cancellation token (everything downstream is handed a clone)
/// 2. Fan-out Hub (created implicitly by the Session Manager, which owns it)
/// 3. Sink Set (no dependencies of its own)
/// 4. Session Manager (depends on config + Sink Set)
/// 5. Rig Control Set, if configured (depends on the Session Manager, to
///    feed `apply_rig_report` back in)
/// 6. Reconnect Supervisor (depends on the Session Manager's `reconnect_attempt`)
pub async fn bootstrap(config: Config) -> GatewayResult<BootstrappedCore> {
    config.fanout.validate()?;

    let cancel_token = CancellationToken::new();
    let emitter: Arc<dyn EventEmitter> = Arc::new(LoggingEventEmitter);

    let sinks = Arc::new(SinkSet::new(Arc::new(NullAudioDeviceOpener)));
    enable_configured_sinks(&config, &sinks).await;
    let session = SessionManager::new(config.clone(), sinks.clone(), emitter.clone());

    if let Some(rig) = build_rig_link(&config, Arc::downgrade(&session)).await? {
        let rig_config = active_rig_config(&config);
        session
            .set_rig_link(Some(rig.clone()), rig_config.sync_to_rig)
            .await;
        if rig_config.sync_from_rig {
            spawn_rig_poll_loop(rig, session.clone(), cancel_token.clone());
        }
    }

    spawn_reconnect_supervisor(session.clone(), cancel_token.clone());
    spawn_noise_floor_poller(session.clone(), cancel_token.clone());

    if config.auto_connect {
        if let Err(e) = session.connect().await {
            log::warn!("[Bootstrap] auto-connect failed, will retry via supervisor: {e}");
        }
    }

    Ok(BootstrappedCore {
        session,
        cancel_token,
    })
}

/// Turns on whichever Sink Set outputs the config enables before the
/// Session Manager exists, so the first decoded frame after connect already
/// has somewhere to go (§2, §4.5) - a sink left disabled here only ever
/// turns on via a later explicit enable call, never implicitly on connect.
async fn enable_configured_sinks(config: &Config, sinks: &SinkSet) {
    if config.port_audio_enabled {
        let sample_rate = config.resample_output_rate.unwrap_or(48_000);
        if let Err(e) = sinks
            .enable_local_audio(None, sample_rate, config.output_channels)
            .await
        {
            log::warn!("[Bootstrap] failed to enable local audio sink: {e}");
        }
    }
    if config.fifo_enabled {
        match &config.fifo_path {
            Some(path) => {
                if let Err(e) = sinks.enable_fifo(path) {
                    log::warn!("[Bootstrap] failed to enable fifo sink: {e}");
                }
            }
            None => log::warn!("[Bootstrap] fifo sink enabled with no path configured"),
        }
    }
    if config.udp_enabled {
        match (&config.udp_host, config.udp_port) {
            (Some(host), Some(port)) => {
                if let Err(e) = sinks.enable_udp(host, port).await {
                    log::warn!("[Bootstrap] failed to enable udp sink: {e}");
                }
            }
            _ => log::warn!("[Bootstrap] udp sink enabled with no host/port configured"),
        }
    }
}

/// Polls `GET /api/noisefloor/latest` on [`NOISE_FLOOR_POLL_SECS`] cadence
/// while a session is connected (§6 "Auxiliary endpoints"), feeding each
/// reading to the emitter as a `NoiseFloor` event. Mirrors
/// `spawn_rig_poll_loop`'s shape: a `tokio::select!` over the cancellation
/// token and a fixed-interval ticker.
fn spawn_noise_floor_poller(session: Arc<SessionManager>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(NOISE_FLOOR_POLL_SECS));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !session.is_connected().await {
                continue;
            }
            match session.poll_noise_floor().await {
                Ok(Some(dbfs)) => session.emit_noise_floor(dbfs),
                Ok(None) => {}
                Err(e) => log::debug!("[Bootstrap] noise floor poll failed: {e}"),
            }
        }
    });
}

/// Instantiates whichever Rig Control Set variant `radioControlType`
/// selects. Returns `Ok(None)` for `RadioControlType::None` rather than an
/// error - no rig link is a valid, common configuration.
async fn build_rig_link(
    config: &Config,
    session: std::sync::Weak<SessionManager>,
) -> GatewayResult<Option<Arc<dyn RigLink>>> {
    if config.radio_control_type == RadioControlType::None {
        return Ok(None);
    }
    if !active_rig_config(config).enabled {
        log::info!(
            "[Bootstrap] rig control type {:?} configured but disabled, skipping rig link",
            config.radio_control_type
        );
        return Ok(None);
    }

    let link: Arc<dyn RigLink> = match config.radio_control_type {
        RadioControlType::None => unreachable!("handled by the early return above"),
        RadioControlType::Flrig => {
            let cfg = &config.flrig;
            let host = cfg.host.as_deref().unwrap_or("127.0.0.1");
            let port = cfg.port.unwrap_or(12_345);
            Arc::new(JsonRpcRig::new(host, port))
        }
        RadioControlType::Rigctl => {
            let cfg = &config.rigctl;
            let host = cfg.host.as_deref().unwrap_or("127.0.0.1");
            let port = cfg.port.unwrap_or(4_532);
            Arc::new(LineRig::new(host, port))
        }
        RadioControlType::Serial => {
            let cfg = &config.serial;
            let path = cfg.path.as_deref().ok_or_else(|| GatewayError::Internal(
                "serial rig control selected with no path configured".into(),
            ))?;
            let baud = cfg.baudrate.unwrap_or(crate::protocol_constants::DEFAULT_SERIAL_BAUD);
            Arc::new(SerialEmu::spawn(path, baud)?)
        }
        RadioControlType::Tci => {
            let cfg = &config.tci;
            let port = cfg.port.unwrap_or(crate::protocol_constants::DEFAULT_TCI_PORT);
            let addr: SocketAddr = ([0, 0, 0, 0], port).into();
            Arc::new(TciServer::spawn(addr, session).await?)
        }
    };
    Ok(Some(link))
}

/// Returns the `RigConfig` block matching `radio_control_type`, so the poll
/// loop can honor that variant's own `sync_from_rig` flag rather than a
/// global one (§5 "Rig Link State").
fn active_rig_config(config: &Config) -> RigConfig {
    match config.radio_control_type {
        RadioControlType::None => RigConfig::default(),
        RadioControlType::Flrig => config.flrig.clone(),
        RadioControlType::Rigctl => config.rigctl.clone(),
        RadioControlType::Serial => config.serial.clone(),
        RadioControlType::Tci => config.tci.clone(),
    }
}

/// Drives `sync_from_rig` (§5): polls the active rig link on a fixed
/// cadence and feeds any reported state change back into the Session
/// Manager as if it were a local `Tune`, without echoing it back out to
/// the same link (`apply_rig_report` handles that asymmetry).
fn spawn_rig_poll_loop(
    rig: Arc<dyn RigLink>,
    session: Arc<SessionManager>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(RIG_POLL_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match rig.poll().await {
                Ok(Some(report)) => {
                    session.apply_rig_report(report.frequency_hz, report.mode).await;
                }
                Ok(None) => {}
                Err(e) => log::warn!("[Bootstrap] rig poll failed: {e}"),
            }
        }
    });
}

fn spawn_reconnect_supervisor(session: Arc<SessionManager>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let (supervisor, _state_rx) = ReconnectSupervisor::new(cancel);
        loop {
            // Only runs the backoff loop once the session observes a drop;
            // between drops this task just waits on the next disconnect.
            wait_for_disconnect(&session).await;

            if session.consume_manual_disconnect() {
                // A deliberate `Disconnect` already cleared the session and
                // must not trigger auto-reconnect (§4.1, §4.6).
                continue;
            }
            if session.session_time_expiring() {
                log::info!(
                    "[Bootstrap] session time limit reached, inhibiting auto-reconnect"
                );
                session.clear_stale_session().await;
                continue;
            }

            let session_for_attempt = session.clone();
            let session_for_settle = session.clone();
            supervisor
                .run(
                    move || {
                        let session = session_for_attempt.clone();
                        async move { session.reconnect_attempt().await }
                    },
                    move || {
                        let session = session_for_settle.clone();
                        async move {
                            log::info!(
                                "[Bootstrap] reconnect settled after {RECONNECT_SETTLE_SECS}s, restoring state"
                            );
                            // Sinks are never disabled on an unexpected
                            // drop (§3 "Sink States ... independent of a
                            // session's lifetime"), so they need no
                            // restoration here; only the rig link's
                            // outbound sync needs to be re-pushed (§4.6
                            // step 6).
                            session.resync_rig_on_reconnect().await;
                        }
                    },
                )
                .await;
        }
    });
}

/// Polls connection state rather than subscribing to events: the
/// supervisor only cares about the edge (connected -> not connected), and
/// polling keeps this task decoupled from the observer/event plumbing.
async fn wait_for_disconnect(session: &Arc<SessionManager>) {
    // Wait for a connection to exist first, so a cold-start process with
    // `autoConnect=false` doesn't immediately "detect a disconnect" and
    // spin the backoff loop before `Connect` is ever called.
    while !session.is_connected().await {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    while session.is_connected().await {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_with_default_config_has_no_rig_link() {
        let core = bootstrap(Config::default()).await.unwrap();
        assert!(!core.session.is_connected().await);
    }

    #[tokio::test]
    async fn bootstrap_rejects_serial_rig_control_with_no_path() {
        let mut config = Config::default();
        config.radio_control_type = RadioControlType::Serial;
        config.serial.enabled = true;
        let err = bootstrap(config).await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[tokio::test]
    async fn bootstrap_skips_rig_link_when_variant_disabled() {
        let mut config = Config::default();
        config.radio_control_type = RadioControlType::Serial;
        config.serial.enabled = false;
        config.serial.path = Some("/dev/ttyUSB0".into());
        // A missing path would otherwise fail construction; disabled short-
        // circuits before that point is ever reached.
        let core = bootstrap(config).await.unwrap();
        assert!(!core.session.is_connected().await);
    }
}
