//! Session Manager (§4.1): the single point of control for tuning,
//! connection lifecycle, and observer registration. Grounded on the
//! teacher's `services::stream_coordinator::StreamCoordinator` - a
//! `DashMap`-keyed orchestrator with heavily logged async methods that
//! apply best-effort side effects (here: pushing to the Rig Control Set)
//! around an authoritative piece of state it alone owns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventEmitter, GatewayEvent};
use crate::fanout::{on_demand_disconnect_check, FanoutHub, SubscriberId};
use crate::protocol_constants::{
    CONNECT_TIMEOUT_SECS, IS_CONNECTED_PROBE_MS, MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ,
    SESSION_EXPIRY_GUARD_SECS, STATUS_COALESCE_MS,
};
use crate::rig::RigLink;
use crate::sinks::SinkSet;
use crate::spectrum::SpectrumFrame;
use crate::spectrum_session::SpectrumSession;
use crate::tuning::{band_of, default_sideband, LockState, Mode, TuneIntent, TuningState};
use crate::upstream::{UpstreamSession, UpstreamTarget};

/// A point-in-time snapshot for `GetStatus` (§4.1).
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub tuning: TuningState,
    pub band: Option<&'static str>,
    pub connected: bool,
    pub uptime_secs: u64,
}

struct ObserverState {
    tx: mpsc::Sender<GatewayEvent>,
    last_status_sent: Option<Instant>,
}

/// Owns tuning state, the upstream/spectrum sessions, the active rig link,
/// and the set of subscribed observers. One instance per logical SDR
/// session; the composition root creates exactly one (§10.5).
pub struct SessionManager {
    config: Arc<SyncMutex<Config>>,
    tuning: SyncMutex<TuningState>,
    lock: SyncMutex<LockState>,
    fanout: FanoutHub,
    sinks: Arc<SinkSet>,
    /// Bumped every time a tune successfully commits, so anything driving
    /// NR2's noise-floor learning can tell "the signal just moved, forget
    /// what you'd adapted to" apart from a steady-state tune (§4.1 "resets
    /// NR2 noise learning").
    nr2_reset_generation: AtomicU64,
    /// `allowedIqModes` from the upstream Session Descriptor (§3), consulted
    /// by the TCI server when a client requests an IQ sample rate (§4.5).
    /// Empty means no restriction (permissive default, matching a
    /// `SessionDescription` the upstream never populated or that fetching
    /// failed for - admission already answered whether the session itself
    /// is allowed).
    allowed_iq_modes: SyncMutex<Vec<String>>,
    rig: AsyncMutex<Option<Arc<dyn RigLink>>>,
    /// Whether the active rig link has `syncOutbound` set (§5 "Sync
    /// discipline"). Read outside the `rig` lock so `apply_tune`'s push
    /// decision doesn't need to hold it across the rig call.
    rig_sync_to_rig: AtomicBool,
    upstream: AsyncMutex<Option<Arc<UpstreamSession>>>,
    spectrum_session: AsyncMutex<Option<Arc<SpectrumSession>>>,
    emitter: Arc<dyn EventEmitter>,
    observers: DashMap<SubscriberId, ObserverState>,
    session_started_at: SyncMutex<Option<Instant>>,
    /// `maxSessionTimeSeconds` captured from the upstream's description on
    /// connect (§3 Session Descriptor), used by the session-time expiry
    /// check (§4.1).
    max_session_time_secs: SyncMutex<Option<u64>>,
    /// Set by `disconnect()` so the Reconnect Supervisor's disconnect-edge
    /// watcher can tell a deliberate `Disconnect` apart from an unexpected
    /// drop and skip reconnecting (§4.1 "Disables auto-reconnect").
    manual_disconnect: AtomicBool,
    last_known_connected: AtomicBool,
    cancel: CancellationToken,
    /// Minted once per process (§3 Session Descriptor), reused across every
    /// reconnect so the upstream sees a stable identity for this gateway.
    user_session_id: uuid::Uuid,
}

impl SessionManager {
    pub fn new(config: Config, sinks: Arc<SinkSet>, emitter: Arc<dyn EventEmitter>) -> Arc<Self> {
        let tuning = TuningState {
            frequency_hz: config.frequency,
            mode: config.mode,
            bandwidth_low: config.bandwidth_low,
            bandwidth_high: config.bandwidth_high,
        }
        .normalized();
        let lock = LockState {
            frequency_locked: config.frequency_locked,
            mode_locked: config.mode_locked,
        };
        let fanout = FanoutHub::new(config.fanout.subscriber_channel_capacity);

        let manager = Arc::new(Self {
            config: Arc::new(SyncMutex::new(config)),
            tuning: SyncMutex::new(tuning),
            lock: SyncMutex::new(lock),
            fanout,
            sinks,
            nr2_reset_generation: AtomicU64::new(0),
            allowed_iq_modes: SyncMutex::new(Vec::new()),
            rig: AsyncMutex::new(None),
            rig_sync_to_rig: AtomicBool::new(false),
            upstream: AsyncMutex::new(None),
            spectrum_session: AsyncMutex::new(None),
            emitter,
            observers: DashMap::new(),
            session_started_at: SyncMutex::new(None),
            max_session_time_secs: SyncMutex::new(None),
            manual_disconnect: AtomicBool::new(false),
            last_known_connected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            user_session_id: uuid::Uuid::new_v4(),
        });

        // On-demand disconnect (§4.3, invariant #11): the Fan-out Hub has no
        // notion of "session", so it calls back into the weak-held manager
        // on every subscriber departure instead.
        let weak = Arc::downgrade(&manager);
        manager.fanout.set_on_departure_hook(move || {
            if let Some(manager) = weak.upgrade() {
                tokio::spawn(async move {
                    manager.maybe_disconnect_on_demand().await;
                });
            }
        });

        manager
    }

    pub fn fanout(&self) -> &FanoutHub {
        &self.fanout
    }

    /// Debounces then disconnects the upstream session once the combined
    /// subscriber count has stayed at zero for the configured window,
    /// provided `connectOnDemand` is enabled and `stayConnected` isn't
    /// pinning the session open regardless of subscribers (§4.3, invariant
    /// #11).
    async fn maybe_disconnect_on_demand(&self) {
        let (connect_on_demand, stay_connected, debounce_ms) = {
            let config = self.config.lock();
            (
                config.fanout.connect_on_demand,
                config.fanout.stay_connected,
                config.fanout.on_demand_disconnect_debounce_ms,
            )
        };
        if !connect_on_demand || stay_connected {
            return;
        }
        let should_disconnect =
            on_demand_disconnect_check(&self.fanout, Duration::from_millis(debounce_ms)).await;
        if should_disconnect && self.is_connected().await {
            log::info!("[SessionManager] on-demand disconnect: no subscribers remain");
            if let Err(e) = self.disconnect().await {
                log::debug!("[SessionManager] on-demand disconnect: {e}");
            }
        }
    }

    /// `allowedIqModes` captured from the upstream Session Descriptor on
    /// `connect()`; empty until a session has connected at least once, which
    /// the TCI server treats as "no restriction" (§3, §4.5).
    pub fn allowed_iq_modes(&self) -> Vec<String> {
        self.allowed_iq_modes.lock().clone()
    }

    /// Monotonically increasing counter bumped once per successfully
    /// committed tune, standing in for "NR2 noise learning was reset" since
    /// the NR2 DSP algorithm itself is out of scope here (§4.1).
    pub fn nr2_reset_generation(&self) -> u64 {
        self.nr2_reset_generation.load(Ordering::SeqCst)
    }

    fn upstream_target(&self) -> UpstreamTarget {
        let config = self.config.lock();
        UpstreamTarget {
            host: config.host.clone(),
            port: config.port,
            ssl: config.ssl,
            password: config.password.clone(),
            user_session_id: self.user_session_id,
        }
    }

    pub fn user_session_id(&self) -> uuid::Uuid {
        self.user_session_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    pub async fn connect(&self) -> GatewayResult<()> {
        let mut upstream_guard = self.upstream.lock().await;
        if upstream_guard.is_some() {
            return Err(GatewayError::AlreadyConnected);
        }

        let target = self.upstream_target();

        // The WebSocket URL itself carries the initial tune as query
        // parameters (§4.2, §6), so the server starts at the session's
        // current state rather than some connection-time default.
        let initial_tune = {
            let t = self.tuning.lock();
            TuneIntent {
                frequency_hz: Some(t.frequency_hz),
                mode: Some(t.mode),
                bandwidth_low: t.bandwidth_low,
                bandwidth_high: t.bandwidth_high,
            }
        };

        let session = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            UpstreamSession::connect(
                target,
                initial_tune,
                self.fanout.clone(),
                self.sinks.clone(),
                self.config.clone(),
                self.emitter.clone(),
            ),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;

        *self.max_session_time_secs.lock() = session.description().max_session_time_secs;
        *self.allowed_iq_modes.lock() = session.description().allowed_iq_modes.clone();
        *upstream_guard = Some(Arc::new(session));
        drop(upstream_guard);

        self.manual_disconnect.store(false, Ordering::SeqCst);
        self.last_known_connected.store(true, Ordering::SeqCst);
        *self.session_started_at.lock() = Some(Instant::now());

        log::info!("[SessionManager] connected");
        Ok(())
    }

    /// Fails with `NotConnected` if no session exists (§4.1). Cancels any
    /// in-flight reconnect via the shared cancellation token, tears down the
    /// Upstream and Spectrum Sessions, and disables auto-reconnect for the
    /// torn-down session by clearing `session_started_at` before the
    /// supervisor's next disconnect-edge check observes it.
    pub async fn disconnect(&self) -> GatewayResult<()> {
        let session = {
            let mut guard = self.upstream.lock().await;
            guard.take().ok_or(GatewayError::NotConnected)?
        };
        self.manual_disconnect.store(true, Ordering::SeqCst);
        session.close().await;
        if let Some(spectrum) = self.spectrum_session.lock().await.take() {
            spectrum.close().await;
        }
        self.last_known_connected.store(false, Ordering::SeqCst);
        *self.session_started_at.lock() = None;
        self.emitter.emit(GatewayEvent::Connection {
            connected: false,
            reason: Some("user".into()),
        });
        log::info!("[SessionManager] disconnected");
        Ok(())
    }

    /// Re-establishes the upstream connection without touching tuning or
    /// rig-link state, for use as the Reconnect Supervisor's
    /// `attempt_connect` closure. Returns `true` on success.
    pub async fn reconnect_attempt(&self) -> bool {
        {
            let mut guard = self.upstream.lock().await;
            *guard = None;
        }
        match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[SessionManager] reconnect attempt failed: {e}");
                false
            }
        }
    }

    /// Non-blocking connection probe (§4.1 "IsConnected"). Tries a
    /// zero-wait lock first; if the session lock is contended by another
    /// in-flight operation, waits up to [`IS_CONNECTED_PROBE_MS`] before
    /// falling back to the last known state rather than blocking the
    /// caller indefinitely.
    pub async fn is_connected(&self) -> bool {
        let connected = if let Ok(guard) = self.upstream.try_lock() {
            guard.as_ref().is_some_and(|s| !s.is_closed())
        } else {
            match timeout(Duration::from_millis(IS_CONNECTED_PROBE_MS), self.upstream.lock()).await
            {
                Ok(guard) => guard.as_ref().is_some_and(|s| !s.is_closed()),
                Err(_) => return self.last_known_connected.load(Ordering::SeqCst),
            }
        };
        self.last_known_connected.store(connected, Ordering::SeqCst);
        connected
    }

    /// `true` once a deliberate `disconnect()` fired and hasn't been
    /// consumed yet, so the reconnect-edge watcher can skip reconnecting
    /// for this drop (§4.1, §4.6 "A manual Disconnect ... clears
    /// auto-reconnect").
    pub fn consume_manual_disconnect(&self) -> bool {
        self.manual_disconnect.swap(false, Ordering::SeqCst)
    }

    /// `true` once the elapsed time since `sessionStartedAt` is within
    /// [`SESSION_EXPIRY_GUARD_SECS`] of `maxSessionTimeSeconds` (or past it),
    /// in which case auto-reconnect must be inhibited for this session
    /// (§4.1 "Session-time expiry").
    pub fn session_time_expiring(&self) -> bool {
        let Some(max_secs) = *self.max_session_time_secs.lock() else {
            return false;
        };
        let Some(started) = *self.session_started_at.lock() else {
            return false;
        };
        let elapsed = started.elapsed().as_secs();
        elapsed + SESSION_EXPIRY_GUARD_SECS >= max_secs
    }

    /// Drops a stale upstream handle left behind by an unexpected close that
    /// the caller has decided not to reconnect from (manual disconnect or
    /// session-time expiry), so a later `connect()` doesn't see a dead
    /// session and wrongly fail with `AlreadyConnected`.
    pub async fn clear_stale_session(&self) {
        *self.upstream.lock().await = None;
        *self.session_started_at.lock() = None;
        *self.max_session_time_secs.lock() = None;
        self.last_known_connected.store(false, Ordering::SeqCst);
    }

    // ── Rig link ─────────────────────────────────────────────────────────

    pub async fn set_rig_link(&self, rig: Option<Arc<dyn RigLink>>, sync_to_rig: bool) {
        *self.rig.lock().await = rig;
        self.rig_sync_to_rig.store(sync_to_rig, Ordering::SeqCst);
    }

    /// Re-pushes the current tuning to the active rig link, honoring
    /// `syncOutbound` the same way `apply_tune` does. Called by the
    /// Reconnect Supervisor once a reconnect has settled (§4.6 step 6).
    pub async fn resync_rig_on_reconnect(&self) {
        if !self.rig_sync_to_rig.load(Ordering::SeqCst) {
            return;
        }
        let Some(rig) = self.rig.lock().await.clone() else {
            return;
        };
        let (hz, mode) = {
            let t = self.tuning.lock();
            (t.frequency_hz, t.mode)
        };
        if let Err(e) = rig.set_frequency(hz).await {
            log::warn!("[SessionManager] reconnect rig resync set_frequency failed: {e}");
        }
        if let Err(e) = rig.set_mode(mode).await {
            log::warn!("[SessionManager] reconnect rig resync set_mode failed: {e}");
        }
    }

    /// Applies a rig-reported state as if it were a local `Tune`, but
    /// without echoing it back to the rig link (avoids a feedback loop
    /// between `sync_to_rig` and `sync_from_rig` on the same link).
    pub async fn apply_rig_report(&self, frequency_hz: i64, mode: Mode) {
        let intent = TuneIntent {
            frequency_hz: Some(frequency_hz),
            mode: Some(mode),
            bandwidth_low: None,
            bandwidth_high: None,
        };
        if let Err(e) = self.apply_tune(intent, false).await {
            log::warn!("[SessionManager] rejected tune from rig link: {e}");
        }
    }

    // ── Tuning ───────────────────────────────────────────────────────────

    pub async fn tune(&self, intent: TuneIntent) -> GatewayResult<TuningState> {
        self.apply_tune(intent, true).await
    }

    pub async fn set_frequency(&self, hz: i64) -> GatewayResult<TuningState> {
        self.tune(TuneIntent {
            frequency_hz: Some(hz),
            ..Default::default()
        })
        .await
    }

    pub async fn set_mode(&self, mode: Mode) -> GatewayResult<TuningState> {
        self.tune(TuneIntent {
            mode: Some(mode),
            ..Default::default()
        })
        .await
    }

    pub async fn set_bandwidth(&self, low: i64, high: i64) -> GatewayResult<TuningState> {
        self.tune(TuneIntent {
            bandwidth_low: Some(low),
            bandwidth_high: Some(high),
            ..Default::default()
        })
        .await
    }

    /// Core of `Tune`/`SetFrequency`/`SetMode`/`SetBandwidth` (§4.1).
    /// `push_to_rig` is `false` when the intent itself originated from the
    /// rig link, to avoid writing it straight back.
    async fn apply_tune(&self, intent: TuneIntent, push_to_rig: bool) -> GatewayResult<TuningState> {
        if let Some(hz) = intent.frequency_hz {
            if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
                return Err(GatewayError::OutOfRange { hz });
            }
        }

        let new_state = {
            let locks = *self.lock.lock();
            let mut state = self.tuning.lock().clone();

            if intent.frequency_hz.is_some() && locks.frequency_locked {
                return Err(GatewayError::Locked { field: "frequency" });
            }
            if intent.mode.is_some() && locks.mode_locked {
                return Err(GatewayError::Locked { field: "mode" });
            }

            let old_freq = state.frequency_hz;
            let frequency_changed = intent.frequency_hz.is_some_and(|hz| hz != old_freq);

            if let Some(hz) = intent.frequency_hz {
                state.frequency_hz = hz;
            }

            match intent.mode {
                Some(mode) => state.mode = mode,
                None if frequency_changed && !locks.mode_locked && is_sideband_mode(state.mode) => {
                    // Automatic sideband switching (§4.1): only engages when
                    // the named amateur band actually changes, and only when
                    // the current mode still matches the default rule for the
                    // old frequency - a user who manually picked the
                    // non-default sideband keeps it across a band change.
                    let band_changed = matches!(
                        (band_of(old_freq), band_of(state.frequency_hz)),
                        (Some(a), Some(b)) if a.name != b.name
                    );
                    if band_changed && state.mode == default_sideband(old_freq) {
                        state.mode = default_sideband(state.frequency_hz);
                    }
                }
                None => {}
            }

            // Mode-lock bandwidth pinning: while the mode is locked, bandwidth
            // is part of what's pinned too, so an intent that only touches
            // bandwidth without also carrying a mode is silently ignored
            // rather than rejected outright (§9) - this lets `SetFrequency`
            // keep working under a mode lock without the caller needing to
            // special-case bandwidth fields it never set in the first place.
            let bandwidth_pinned = locks.mode_locked && intent.mode.is_none();
            if !bandwidth_pinned {
                if let Some(low) = intent.bandwidth_low {
                    state.bandwidth_low = Some(low);
                }
                if let Some(high) = intent.bandwidth_high {
                    state.bandwidth_high = Some(high);
                }
            }

            if let (Some(low), Some(high)) = (state.bandwidth_low, state.bandwidth_high) {
                if low >= high {
                    return Err(GatewayError::BadBandwidth {
                        reason: format!("low ({low}) must be < high ({high})"),
                    });
                }
            }

            state.normalized()
        };

        // Local state only commits once the upstream push succeeds (§4.1
        // "updates local state only after the send succeeds") - a failed
        // send leaves `self.tuning` untouched and fails the whole call
        // rather than silently drifting out of sync with what the upstream
        // server actually has tuned.
        if let Some(upstream) = self.upstream.lock().await.as_ref() {
            let upstream_intent = TuneIntent {
                frequency_hz: Some(new_state.frequency_hz),
                mode: Some(new_state.mode),
                bandwidth_low: new_state.bandwidth_low,
                bandwidth_high: new_state.bandwidth_high,
            };
            upstream.send_tune(&upstream_intent).await?;
        }

        *self.tuning.lock() = new_state.clone();
        // NR2 noise learning reset (§4.1): the actual DSP adaptation lives
        // outside this crate's scope, but every commit still needs to
        // signal "the operating point moved" so a consumer driving NR2 can
        // forget what it had adapted to.
        self.nr2_reset_generation.fetch_add(1, Ordering::SeqCst);

        if push_to_rig && self.rig_sync_to_rig.load(Ordering::SeqCst) {
            if let Some(rig) = self.rig.lock().await.as_ref() {
                let rig = rig.clone();
                let hz = new_state.frequency_hz;
                let mode = new_state.mode;
                tokio::spawn(async move {
                    if let Err(e) = rig.set_frequency(hz).await {
                        log::warn!("[SessionManager] rig set_frequency failed: {e}");
                    }
                    if let Err(e) = rig.set_mode(mode).await {
                        log::warn!("[SessionManager] rig set_mode failed: {e}");
                    }
                });
            }
        }

        self.broadcast_status(&new_state).await;
        Ok(new_state)
    }

    pub fn lock_state(&self) -> LockState {
        *self.lock.lock()
    }

    pub fn set_lock_state(&self, lock: LockState) {
        *self.lock.lock() = lock;
    }

    // ── Config ───────────────────────────────────────────────────────────

    /// Applies a config patch and pushes it out to real subscribers, not
    /// just the logging-only event emitter (§4.1 `UpdateConfig`): every
    /// registered observer gets a fresh `Status` so a config change that
    /// affects tuning-adjacent display (e.g. a changed NR2 setting) is
    /// visible immediately rather than waiting for the next tune.
    pub async fn update_config(&self, patch: impl FnOnce(&mut Config)) {
        {
            let mut config = self.config.lock();
            patch(&mut config);
        }
        self.emitter.emit(GatewayEvent::ConfigUpdate {
            patch_summary: "config updated".into(),
        });
        let tuning = self.tuning.lock().clone();
        self.broadcast_status(&tuning).await;
    }

    pub fn config_snapshot(&self) -> Config {
        self.config.lock().clone()
    }

    // ── Auxiliary polling ────────────────────────────────────────────────

    /// Polls `GET /api/noisefloor/latest` for the currently configured
    /// upstream target (§6 "Auxiliary endpoints"), best-effort like
    /// `fetch_description`.
    pub async fn poll_noise_floor(&self) -> GatewayResult<Option<f32>> {
        let client = reqwest::Client::new();
        let target = self.upstream_target();
        Ok(crate::upstream::fetch_noise_floor(&client, &target).await)
    }

    pub fn emit_noise_floor(&self, dbfs: f32) {
        self.emitter.emit(GatewayEvent::NoiseFloor { dbfs });
    }

    // ── Status / observers ──────────────────────────────────────────────

    pub async fn get_status(&self) -> StatusSnapshot {
        let tuning = self.tuning.lock().clone();
        let band = band_of(tuning.frequency_hz).map(|b| b.name);
        let connected = self.is_connected().await;
        let uptime_secs = self
            .session_started_at
            .lock()
            .map(|start| start.elapsed().as_secs())
            .unwrap_or(0);
        StatusSnapshot {
            tuning,
            band,
            connected,
            uptime_secs,
        }
    }

    /// Registers an observer for `status`/`connection`/`error`/
    /// `config_update`/`midi_*` events (§4.1 `Subscribe`).
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<GatewayEvent>) {
        let id = crate::fanout::next_subscriber_id();
        let (tx, rx) = mpsc::channel(32);
        self.observers.insert(
            id,
            ObserverState {
                tx,
                last_status_sent: None,
            },
        );
        self.fanout.register_other_subscriber();
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.observers.remove(&id).is_some() {
            self.fanout.unregister_other_subscriber();
        }
    }

    /// Registers a spectrum observer and lazily opens the Spectrum Session's
    /// dedicated WebSocket if this is the first one (§4.4). Opening is
    /// best-effort: a failure is logged and the observer still gets a
    /// channel, which simply stays empty until a future subscriber
    /// successfully triggers the open.
    pub async fn subscribe_spectrum(&self) -> (SubscriberId, mpsc::Receiver<Arc<SpectrumFrame>>) {
        let (id, rx) = self.fanout.subscribe_spectrum();
        self.ensure_spectrum_session().await;
        (id, rx)
    }

    /// Unregisters a spectrum observer, tearing down the Spectrum Session if
    /// this was the last one (§4.4).
    pub async fn unsubscribe_spectrum(&self, id: SubscriberId) {
        self.fanout.unsubscribe_spectrum(id);
        if self.fanout.spectrum_subscriber_count() == 0 {
            if let Some(spectrum) = self.spectrum_session.lock().await.take() {
                spectrum.close().await;
            }
        }
    }

    async fn ensure_spectrum_session(&self) {
        let mut guard = self.spectrum_session.lock().await;
        if guard.is_some() {
            return;
        }
        if !self.is_connected().await {
            log::warn!("[SessionManager] spectrum subscribe requested with no upstream session");
            return;
        }
        let target = self.upstream_target();
        match SpectrumSession::open(&target, self.fanout.clone()).await {
            Ok(session) => *guard = Some(Arc::new(session)),
            Err(e) => log::warn!("[SessionManager] failed to open spectrum session: {e}"),
        }
    }

    /// Delivers a `Status` event to every observer, coalesced to one per
    /// [`STATUS_COALESCE_MS`] window per observer (§4.1): an observer that
    /// already received a status update inside the window is skipped, and
    /// will see the *next* tune's status instead of a backlog of every
    /// intermediate one.
    async fn broadcast_status(&self, tuning: &TuningState) {
        let band = band_of(tuning.frequency_hz).map(|b| b.name.to_string());
        let uptime_secs = self
            .session_started_at
            .lock()
            .map(|start| start.elapsed().as_secs())
            .unwrap_or(0);
        let event = GatewayEvent::Status {
            tuning: tuning.clone(),
            band,
            uptime_secs,
        };
        self.emitter.emit(event.clone());

        let now = Instant::now();
        let mut dead = Vec::new();
        for mut entry in self.observers.iter_mut() {
            let send = match entry.last_status_sent {
                Some(last) => now.duration_since(last) >= Duration::from_millis(STATUS_COALESCE_MS),
                None => true,
            };
            if !send {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => entry.last_status_sent = Some(now),
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }
    }
}

fn is_sideband_mode(mode: Mode) -> bool {
    matches!(mode, Mode::Usb | Mode::Lsb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::sinks::NullAudioDeviceOpener;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(
            Config::default(),
            Arc::new(SinkSet::new(Arc::new(NullAudioDeviceOpener))),
            Arc::new(NoopEventEmitter),
        )
    }

    #[tokio::test]
    async fn tune_rejects_out_of_range_frequency() {
        let mgr = manager();
        let err = mgr
            .tune(TuneIntent {
                frequency_hz: Some(99_999),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn tune_rejects_locked_frequency() {
        let mgr = manager();
        mgr.set_lock_state(LockState {
            frequency_locked: true,
            mode_locked: false,
        });
        let err = mgr
            .tune(TuneIntent {
                frequency_hz: Some(7_100_000),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Locked { field: "frequency" }));
    }

    #[tokio::test]
    async fn crossing_10mhz_without_explicit_mode_flips_sideband() {
        let mgr = manager();
        // Start at 14074000 USB (default config), tune down across 10MHz.
        let state = mgr
            .tune(TuneIntent {
                frequency_hz: Some(7_100_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(state.mode, Mode::Lsb);
    }

    #[tokio::test]
    async fn user_overridden_sideband_survives_a_band_change() {
        let mgr = manager();
        // Manually override to USB on 80m, below 10MHz (default would be LSB).
        mgr.tune(TuneIntent {
            frequency_hz: Some(3_600_000),
            mode: Some(Mode::Usb),
            ..Default::default()
        })
        .await
        .unwrap();
        // Move to 40m, still below 10MHz and still a sideband mode with no
        // explicit mode in the intent - the override must hold.
        let state = mgr
            .tune(TuneIntent {
                frequency_hz: Some(7_100_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(state.mode, Mode::Usb);
    }

    #[tokio::test]
    async fn explicit_mode_overrides_automatic_sideband_switching() {
        let mgr = manager();
        let state = mgr
            .tune(TuneIntent {
                frequency_hz: Some(7_100_000),
                mode: Some(Mode::Usb),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(state.mode, Mode::Usb);
    }

    #[tokio::test]
    async fn mode_locked_bandwidth_only_intent_is_pinned() {
        let mgr = manager();
        mgr.set_lock_state(LockState {
            frequency_locked: false,
            mode_locked: true,
        });
        let before = mgr.get_status().await.tuning;
        let after = mgr
            .tune(TuneIntent {
                bandwidth_low: Some(100),
                bandwidth_high: Some(500),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(after.bandwidth_low, before.bandwidth_low);
        assert_eq!(after.bandwidth_high, before.bandwidth_high);
    }

    #[tokio::test]
    async fn bad_bandwidth_ordering_is_rejected() {
        let mgr = manager();
        let err = mgr.set_bandwidth(2700, 50).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadBandwidth { .. }));
    }

    #[tokio::test]
    async fn disconnect_without_connect_fails_not_connected() {
        let mgr = manager();
        let err = mgr.disconnect().await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
        assert!(!mgr.is_connected().await);
    }

    #[tokio::test]
    async fn spectrum_subscribe_without_connection_still_returns_a_channel() {
        let mgr = manager();
        let (id, mut rx) = mgr.subscribe_spectrum().await;
        assert!(rx.try_recv().is_err());
        mgr.unsubscribe_spectrum(id).await;
        assert_eq!(mgr.fanout().spectrum_subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_updates_fanout_other_count() {
        let mgr = manager();
        let (id, _rx) = mgr.subscribe();
        assert_eq!(mgr.fanout().subscriber_count(), 1);
        mgr.unsubscribe(id);
        assert_eq!(mgr.fanout().subscriber_count(), 0);
    }
}
