//! Client-local view of one instance rendered in one tab.
//!
//! A [`Session`] is owned by the controller and shared (via `Arc`) with the
//! components it spawns. It replaces page-global mutable state: every flag
//! and counter the components coordinate through lives here, so several
//! sessions can run side by side in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::instance::Instance;
use crate::models::state::{SessionState, Transition};

/// Capacity of the session event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications published for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The embedding frame was (re)created pointing at `url`.
    FrameLoaded {
        /// Address the frame loads.
        url: String,
    },
    /// A recovery attempt started.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Configured maximum.
        max_attempts: u32,
    },
    /// Seconds left before the next recovery attempt.
    RetryCountdown {
        /// Attempt that just failed.
        attempt: u32,
        /// Configured maximum.
        max_attempts: u32,
        /// Seconds until the retry; 0 means "retrying now".
        seconds_left: u64,
    },
    /// Recovery succeeded; the content is shown again.
    Reconnected,
    /// The whole page must be reloaded.
    FullReloadRequested {
        /// Reload triggered without asking the user (crash right after start).
        automatic: bool,
    },
    /// In-app navigation, relative to the instance's public path.
    AppUrlChanged {
        /// Sub-path inside the application.
        path: String,
    },
}

/// Identifier of a transport connection opened by the embedded content.
pub type ConnectionId = u64;

/// Lifecycle of a tracked transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Open and carrying traffic.
    Open,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared state of one session.
#[derive(Debug)]
pub struct Session {
    instance: Mutex<Option<Instance>>,
    connections: Mutex<HashMap<ConnectionId, ConnectionState>>,
    next_connection_id: AtomicU64,
    last_activity: Mutex<Option<Instant>>,
    reconnect_attempts: AtomicU32,
    navigating_away: AtomicBool,
    stopped: AtomicBool,
    trying_to_reconnect: AtomicBool,
    reload_dismissed: AtomicBool,
    state_tx: watch::Sender<SessionState>,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl Session {
    /// Create an unbound session and the receiver of its events.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (state_tx, _) = watch::channel(SessionState::Unbound);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session = Self {
            instance: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            last_activity: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            navigating_away: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            trying_to_reconnect: AtomicBool::new(false),
            reload_dismissed: AtomicBool::new(false),
            state_tx,
            event_tx,
            cancel,
        };
        (session, event_rx)
    }

    // ── Instance binding ─────────────────────────────────

    /// Bind (or rebind) the session to `instance`.
    ///
    /// Rebinding to a different instance resets the recovery counters.
    pub fn bind(&self, instance: Instance) {
        let mut guard = lock(&self.instance);
        let rebind = guard.as_ref().is_none_or(|current| current.id != instance.id);
        if rebind {
            self.reset_recovery();
            info!(proxy_id = %instance.id, status = ?instance.status, "session bound to instance");
        }
        *guard = Some(instance);
    }

    /// Currently bound instance.
    #[must_use]
    pub fn instance(&self) -> Option<Instance> {
        lock(&self.instance).clone()
    }

    /// Identifier of the bound instance.
    #[must_use]
    pub fn instance_id(&self) -> Option<String> {
        lock(&self.instance).as_ref().map(|i| i.id.clone())
    }

    // ── State ────────────────────────────────────────────

    /// Current UI state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to UI state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Request a transition to `next`.
    ///
    /// Terminal states cancel every timer the session owns.
    pub fn transition(&self, next: SessionState) -> Transition {
        if self.is_navigating_away() {
            debug!(next = %next, "transition suppressed, navigating away");
            return Transition::Suppressed;
        }

        let mut outcome = Transition::Unchanged;
        self.state_tx.send_if_modified(|current| {
            outcome = current.transition_to(&next);
            if outcome == Transition::Applied {
                info!(from = %current, to = %next, "session state changed");
                *current = next.clone();
                true
            } else {
                false
            }
        });

        match outcome {
            Transition::Applied if next.is_terminal() => {
                self.stopped.store(true, Ordering::SeqCst);
                self.cancel.cancel();
            }
            Transition::Rejected => {
                debug!(to = %next, current = %self.state(), "transition rejected");
            }
            _ => {}
        }
        outcome
    }

    // ── Flags ────────────────────────────────────────────

    /// Mark the tab as unloading: no further UI transitions, all timers cancelled.
    pub fn navigate_away(&self) {
        if !self.navigating_away.swap(true, Ordering::SeqCst) {
            info!("navigating away, session stops acting");
        }
        self.cancel.cancel();
    }

    /// Whether the tab is unloading.
    #[must_use]
    pub fn is_navigating_away(&self) -> bool {
        self.navigating_away.load(Ordering::SeqCst)
    }

    /// Whether the session reached a terminal state.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether the session must not act anymore.
    #[must_use]
    pub fn is_inactive(&self) -> bool {
        self.is_stopped() || self.is_navigating_away()
    }

    /// Root cancellation token; fires on terminal states and unload.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Claim the recovery guard; `false` when an attempt is already in flight.
    pub fn try_begin_reconnect(&self) -> bool {
        self.trying_to_reconnect
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release the recovery guard.
    pub fn end_reconnect(&self) {
        self.trying_to_reconnect.store(false, Ordering::SeqCst);
    }

    /// Whether a recovery attempt is in flight.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.trying_to_reconnect.load(Ordering::SeqCst)
    }

    /// Remember that the user declined to reconnect in this failure episode.
    pub fn dismiss_reload(&self) {
        self.reload_dismissed.store(true, Ordering::SeqCst);
    }

    /// Whether the user declined to reconnect in this failure episode.
    #[must_use]
    pub fn is_reload_dismissed(&self) -> bool {
        self.reload_dismissed.load(Ordering::SeqCst)
    }

    /// Consecutive recovery attempts since the last success.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Count one more recovery attempt; returns the new count.
    pub fn record_reconnect_attempt(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Successful recovery: reset the counter and the dismissal.
    pub fn mark_reconnected(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.reload_dismissed.store(false, Ordering::SeqCst);
        self.end_reconnect();
    }

    /// Reset the counter without ending the episode (instance found gone).
    pub fn reset_reconnect_attempts(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    /// Forget earlier recovery history: the attempt counter and the dismissal.
    pub fn reset_recovery(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.reload_dismissed.store(false, Ordering::SeqCst);
    }

    // ── Transport connections & activity ────────────────

    /// Track a new connection in the `Connecting` state.
    pub fn register_connection(&self) -> ConnectionId {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.connections).insert(id, ConnectionState::Connecting);
        self.touch();
        id
    }

    /// Mark a tracked connection as open.
    pub fn mark_connection_open(&self, id: ConnectionId) {
        match lock(&self.connections).get_mut(&id) {
            Some(state) => *state = ConnectionState::Open,
            None => warn!(connection_id = id, "open event for unknown connection"),
        }
        self.touch();
    }

    /// Forget a connection; returns whether it was tracked.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        lock(&self.connections).remove(&id).is_some()
    }

    /// Whether at least one tracked connection is open.
    #[must_use]
    pub fn has_open_connection(&self) -> bool {
        lock(&self.connections)
            .values()
            .any(|state| *state == ConnectionState::Open)
    }

    /// Number of tracked connections (any state).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Record transport activity now.
    pub fn touch(&self) {
        self.record_activity(Instant::now());
    }

    /// Record transport activity at `at`; older timestamps never win.
    pub fn record_activity(&self, at: Instant) {
        let mut last = lock(&self.last_activity);
        if last.is_none_or(|prev| at > prev) {
            *last = Some(at);
        }
    }

    /// Most recent transport activity.
    #[must_use]
    pub fn last_activity(&self) -> Option<Instant> {
        *lock(&self.last_activity)
    }

    // ── Events ───────────────────────────────────────────

    /// Publish an event for the rendering layer; dropped if nobody keeps up.
    pub fn emit(&self, event: SessionEvent) {
        if let Err(err) = self.event_tx.try_send(event) {
            debug!(%err, "session event dropped");
        }
    }
}
