//! Reconnection Coordinator: bounded-backoff recovery after transport failures.
//!
//! Only Transport Monitor failures start an episode. Within an episode the
//! coordinator
//!
//! 1. ignores the failure when the tab is unloading or an attempt is in flight;
//! 2. under the `None` policy only checks liveness;
//! 3. stays silent when the user already declined to reconnect;
//! 4. checks liveness (a "gone" answer always wins over retrying);
//! 5. retries silently (`Auto`) or after confirmation (`Confirm`);
//! 6. offers a full page reload once the attempt budget is spent;
//! 7. reconnects in place through the embedded application's reconnect
//!    primitive when one is detected, or recreates the frame otherwise;
//! 8. polls for evidence of recovery and backs off linearly between attempts.
//!
//! Network trouble during an episode is treated as "still alive, keep
//! trying"; only the liveness probe's termination answer is authoritative.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::{is_alive, Liveness, StatusApi};
use crate::config::ClientConfig;
use crate::host::{EmbeddedFrame, Prompt, UserPrompt};
use crate::models::instance::{ReconnectionMode, RuntimeValues};
use crate::models::state::SessionState;
use crate::orchestrator::session::{Session, SessionEvent};
use crate::orchestrator::transport_monitor::ControlSignal;

/// Knobs of one coordinator, resolved from config and runtime values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSettings {
    /// Policy in effect for the bound instance.
    pub mode: ReconnectionMode,
    /// Never use the in-place reconnect primitive.
    pub force_full_reload: bool,
    /// Attempts before a full reload is offered.
    pub max_attempts: u32,
    /// Recovery checks per attempt.
    pub check_count: u32,
    /// Delay between two recovery checks.
    pub check_interval: Duration,
    /// Client-side timeout of the liveness probe.
    pub liveness_timeout: Duration,
}

impl ReconnectSettings {
    /// Combine client configuration with the instance's runtime values.
    #[must_use]
    pub fn resolve(config: &ClientConfig, values: &RuntimeValues) -> Self {
        Self {
            mode: values.reconnection_mode(),
            force_full_reload: values.force_full_reload(),
            max_attempts: config.reconnect.max_attempts,
            check_count: config.reconnect.check_count,
            check_interval: config.check_interval(),
            liveness_timeout: config.liveness_timeout(),
        }
    }
}

/// Delay before the retry that follows failed attempt number `attempts`.
#[must_use]
pub fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_secs(u64::from(attempts))
}

/// Drives recovery episodes for one session.
pub struct ReconnectCoordinator {
    session: Arc<Session>,
    api: Arc<dyn StatusApi>,
    frame: Arc<dyn EmbeddedFrame>,
    prompt: Arc<dyn UserPrompt>,
    signal_tx: mpsc::UnboundedSender<ControlSignal>,
    settings: ReconnectSettings,
    cancel: CancellationToken,
}

impl ReconnectCoordinator {
    /// Construct a coordinator.
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        api: Arc<dyn StatusApi>,
        frame: Arc<dyn EmbeddedFrame>,
        prompt: Arc<dyn UserPrompt>,
        signal_tx: mpsc::UnboundedSender<ControlSignal>,
        settings: ReconnectSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            api,
            frame,
            prompt,
            signal_tx,
            settings,
            cancel,
        }
    }

    /// React to a transport failure.
    ///
    /// Returns the spawned episode, or `None` when the failure is ignored
    /// because the tab is unloading or an episode is already in flight.
    pub fn handle_failure(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.session.is_navigating_away() {
            debug!("navigating away, transport failure ignored");
            return None;
        }
        if !self.session.try_begin_reconnect() {
            debug!("recovery already in flight, transport failure ignored");
            return None;
        }

        let this = Arc::clone(self);
        let proxy_id = self.session.instance_id().unwrap_or_default();
        Some(tokio::spawn(
            async move { this.run_episode().await }
                .instrument(info_span!("reconnect", proxy_id = %proxy_id)),
        ))
    }

    async fn run_episode(&self) {
        if self.settings.mode == ReconnectionMode::None {
            if let Some(signal) = self.check_terminated().await {
                info!(reason = signal, "instance gone, no reconnection policy");
            }
            self.session.end_reconnect();
            return;
        }

        if self.session.is_reload_dismissed() {
            debug!("user declined reconnecting earlier, failure ignored");
            self.session.end_reconnect();
            return;
        }
        if self.session.is_stopped() {
            self.session.end_reconnect();
            return;
        }

        if self.check_terminated().await.is_some() {
            self.session.end_reconnect();
            return;
        }

        let proceed = match self.settings.mode {
            ReconnectionMode::Auto => true,
            ReconnectionMode::Confirm => match self.ask(Prompt::Reconnect).await {
                Some(answer) => answer,
                None => {
                    debug!("reconnect prompt abandoned, phase ended");
                    self.session.end_reconnect();
                    return;
                }
            },
            ReconnectionMode::None => false,
        };
        if !proceed {
            info!("reconnection declined");
            self.session.dismiss_reload();
            self.session.end_reconnect();
            return;
        }

        self.retry().await;
        self.session.end_reconnect();
    }

    async fn retry(&self) {
        let max_attempts = self.settings.max_attempts;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            if self.session.reconnect_attempts() >= max_attempts {
                warn!(max_attempts, "reconnect attempts exhausted");
                match self.ask(Prompt::FullReload).await {
                    Some(true) => {
                        self.session
                            .emit(SessionEvent::FullReloadRequested { automatic: false });
                        self.session.navigate_away();
                    }
                    Some(false) => {
                        self.session.transition(SessionState::ReloadFailed);
                    }
                    None => {}
                }
                return;
            }

            if self.check_terminated().await.is_some() {
                self.session.reset_reconnect_attempts();
                return;
            }

            let attempt = self.session.record_reconnect_attempt();
            info!(attempt, max_attempts, "attempting to reconnect");
            self.session.emit(SessionEvent::Reconnecting {
                attempt,
                max_attempts,
            });

            if self.attempt_recovery().await {
                info!(attempt, "reconnected");
                self.session.mark_reconnected();
                self.session.emit(SessionEvent::Reconnected);
                return;
            }

            let delay = backoff_delay(attempt);
            info!(
                attempt,
                max_attempts,
                delay_secs = delay.as_secs(),
                "reconnect not succeeded, backing off"
            );
            if !self.count_down(attempt, delay).await {
                return;
            }
        }
    }

    /// One in-place recovery attempt followed by bounded polling.
    async fn attempt_recovery(&self) -> bool {
        let capability = if self.settings.force_full_reload {
            None
        } else {
            self.frame.probe_reconnect()
        };

        match capability {
            Some(app) => {
                debug!("reconnecting through the embedded application");
                if !app.is_connected() {
                    app.reconnect();
                }
                self.poll_recovered(|| app.channel_open()).await
            }
            None => {
                debug!("recreating the embedding frame");
                self.frame.recreate();
                if self.signal_tx.send(ControlSignal::FrameRecreated).is_err() {
                    debug!("controller gone, frame recreation not reported");
                }
                self.poll_recovered(|| self.frame.snapshot().shows_application())
                    .await
            }
        }
    }

    async fn poll_recovered(&self, recovered: impl Fn() -> bool) -> bool {
        let mut checks = 0;
        loop {
            if recovered() {
                return true;
            }
            if checks >= self.settings.check_count {
                return false;
            }
            checks += 1;
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = tokio::time::sleep(self.settings.check_interval) => {}
            }
        }
    }

    /// Wait `delay`, publishing a once-per-second countdown.
    /// Returns `false` when cancelled.
    async fn count_down(&self, attempt: u32, delay: Duration) -> bool {
        let max_attempts = self.settings.max_attempts;
        let mut seconds_left = delay.as_secs();
        loop {
            self.session.emit(SessionEvent::RetryCountdown {
                attempt,
                max_attempts,
                seconds_left,
            });
            if seconds_left == 0 {
                return true;
            }
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            seconds_left -= 1;
        }
    }

    /// Liveness probe; applies the terminal transition when the server
    /// proves the instance (or the user's session) is gone.
    async fn check_terminated(&self) -> Option<&'static str> {
        let id = self.session.instance_id()?;
        let liveness = tokio::select! {
            () = self.cancel.cancelled() => return None,
            liveness = is_alive(self.api.as_ref(), &id, self.settings.liveness_timeout) => liveness,
        };
        match liveness {
            Liveness::Terminated(signal) => {
                self.session
                    .transition(SessionState::from_termination(signal));
                Some(signal.as_reason())
            }
            Liveness::Alive | Liveness::Unknown => None,
        }
    }

    /// Put a question to the user; `None` when cancelled meanwhile.
    async fn ask(&self, prompt: Prompt) -> Option<bool> {
        tokio::select! {
            () = self.cancel.cancelled() => None,
            answer = self.prompt.confirm(prompt) => Some(answer),
        }
    }
}
