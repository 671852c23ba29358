//! Reconnect Supervisor (§4.4): watches the Upstream Session for an
//! unexpected drop and re-establishes it with exponential backoff, then
//! restores sink and rig-link state once the connection has settled.
//! Grounded on the teacher's `sonos::retry::with_retry` backoff helper, but
//! the sequence and cap here are fixed by the protocol (§9), not
//! configurable, so this is a small state machine rather than a generic
//! retry wrapper.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::protocol_constants::{RECONNECT_BACKOFF_CAP_SECS, RECONNECT_SETTLE_SECS};

/// Backoff sequence in seconds, repeating the cap once reached (§9):
/// 1, 2, 4, 8, 16, 32, 60, 60, 60, ...
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs.min(RECONNECT_BACKOFF_CAP_SECS))
}

/// Live state of the supervisor, observable by whatever surface reports
/// connection health upward (status broadcast, `GetStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    BackingOff { attempt: u32 },
    Settling,
}

/// Drives reconnect attempts. `attempt_connect` is supplied by the caller
/// (the Session Manager) so this module stays free of upstream-specific
/// types; it returns `true` on a successful reconnect.
pub struct ReconnectSupervisor {
    state_tx: watch::Sender<SupervisorState>,
    cancel: CancellationToken,
}

impl ReconnectSupervisor {
    pub fn new(cancel: CancellationToken) -> (Self, watch::Receiver<SupervisorState>) {
        let (tx, rx) = watch::channel(SupervisorState::Idle);
        (Self { state_tx: tx, cancel }, rx)
    }

    /// Runs the backoff loop until `attempt_connect` succeeds or the
    /// supervisor is cancelled (session torn down deliberately, e.g. by
    /// `Disconnect`). `on_settled` runs once after the settle delay, to
    /// restore sink/rig-link state - the "disable auto-reconnect while an
    /// attempt is in flight" guard is implicit: this loop only ever has one
    /// attempt in flight at a time.
    pub async fn run<C, S, Fut, FutS>(&self, mut attempt_connect: C, mut on_settled: S)
    where
        C: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
        S: FnMut() -> FutS,
        FutS: std::future::Future<Output = ()>,
    {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                let _ = self.state_tx.send(SupervisorState::Idle);
                return;
            }

            let delay = backoff_delay(attempt);
            let _ = self.state_tx.send(SupervisorState::BackingOff { attempt });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    let _ = self.state_tx.send(SupervisorState::Idle);
                    return;
                }
            }

            if attempt_connect().await {
                let _ = self.state_tx.send(SupervisorState::Settling);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(RECONNECT_SETTLE_SECS)) => {
                        on_settled().await;
                        let _ = self.state_tx.send(SupervisorState::Idle);
                        return;
                    }
                    _ = self.cancel.cancelled() => {
                        let _ = self.state_tx.send(SupervisorState::Idle);
                        return;
                    }
                }
            }

            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_doubling_sequence_then_caps() {
        let expected = [1u64, 2, 4, 8, 16, 32, 60, 60, 60];
        for (attempt, secs) in expected.iter().enumerate() {
            assert_eq!(backoff_delay(attempt as u32).as_secs(), *secs);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_until_connect_succeeds_then_settles() {
        let (supervisor, mut state_rx) = ReconnectSupervisor::new(CancellationToken::new());
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let settled = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let attempts_c = attempts.clone();
        let settled_c = settled.clone();
        let run = supervisor.run(
            move || {
                let attempts_c = attempts_c.clone();
                async move {
                    let n = attempts_c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    n >= 2 // fail twice, succeed on the third attempt
                }
            },
            move || {
                let settled_c = settled_c.clone();
                async move {
                    settled_c.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            },
        );

        tokio::pin!(run);
        loop {
            tokio::select! {
                _ = &mut run => break,
                _ = state_rx.changed() => {}
            }
        }

        assert!(settled.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
