//! Heartbeat Emitter: keeps the instance from being reclaimed as idle.
//!
//! Two states: idle (no task) and active (a spawned task ticking at the
//! configured rate). Entering the active state sends one heartbeat right
//! away so an instance that died before the first tick is noticed. Later
//! ticks are skipped whenever transport traffic already proves liveness:
//! a heartbeat goes out only when no tracked socket is open and the last
//! transport activity is older than the rate.
//!
//! A heartbeat answered with a termination reason moves the session to the
//! matching terminal state; any other failure is ignored and the next tick
//! retries. A heartbeat still unanswered after one rate is abandoned.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, Instrument};

use crate::client::{Liveness, StatusApi};
use crate::models::state::SessionState;
use crate::orchestrator::session::Session;

/// Builder for the heartbeat task.
pub struct HeartbeatEmitter {
    session: Arc<Session>,
    api: Arc<dyn StatusApi>,
    rate: Duration,
    cancel: CancellationToken,
}

impl HeartbeatEmitter {
    /// Construct an emitter (does not start ticking yet).
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        api: Arc<dyn StatusApi>,
        rate: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            api,
            rate,
            cancel,
        }
    }

    /// Enter the active state.
    #[must_use]
    pub fn spawn(self) -> HeartbeatHandle {
        let cancel = self.cancel.clone();
        let proxy_id = self.session.instance_id().unwrap_or_default();
        let join_handle = tokio::spawn(
            self.run()
                .instrument(info_span!("heartbeat", proxy_id = %proxy_id)),
        );
        HeartbeatHandle {
            cancel,
            join_handle: Some(join_handle),
        }
    }

    async fn run(self) {
        if !self.session.has_open_connection() {
            self.beat().await;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + self.rate, self.rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("heartbeat cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if self.session.is_inactive() {
                debug!("session inactive, heartbeat stops");
                return;
            }
            if !heartbeat_due(&self.session, self.rate) {
                trace!("transport activity proves liveness, heartbeat skipped");
                continue;
            }
            self.beat().await;
        }
    }

    async fn beat(&self) {
        let Some(id) = self.session.instance_id() else {
            return;
        };
        // Bounded by the rate so a hung request cannot hold back later ticks.
        let result = tokio::select! {
            () = self.cancel.cancelled() => return,
            result = tokio::time::timeout(self.rate, self.api.heartbeat(&id, None)) => result,
        };
        match result {
            Ok(Ok(Liveness::Alive)) => trace!("heartbeat accepted"),
            Ok(Ok(Liveness::Terminated(signal))) => {
                info!(reason = signal.as_reason(), "heartbeat reports termination");
                self.session
                    .transition(SessionState::from_termination(signal));
            }
            Ok(Ok(Liveness::Unknown)) => debug!("heartbeat inconclusive, ignored"),
            Ok(Err(err)) => debug!(%err, "heartbeat failed, retrying next tick"),
            Err(_) => debug!(rate = ?self.rate, "heartbeat timed out, retrying next tick"),
        }
    }
}

/// Whether a heartbeat must be sent now.
///
/// True only when no tracked socket is open and no transport activity
/// happened within `rate`.
#[must_use]
pub fn heartbeat_due(session: &Session, rate: Duration) -> bool {
    if session.has_open_connection() {
        return false;
    }
    session
        .last_activity()
        .is_none_or(|last| last.elapsed() > rate)
}

/// Handle of an active emitter; dropping it returns the emitter to idle.
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl HeartbeatHandle {
    /// Stop the emitter and wait for its task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}
