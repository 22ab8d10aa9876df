//! UI-level session state and its transition rules.

use std::fmt::{Display, Formatter};

use crate::models::instance::InstanceStatus;
use crate::models::response::TerminationSignal;

/// State of the session as presented to the rendering layer.
///
/// States are mutually exclusive. The authoritative terminal states
/// (`Stopped`, `Crashed`, `LoggedOut`) win over everything else and are
/// sticky once entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No instance bound yet.
    Unbound,
    /// Instance created, waiting for it to come up.
    New,
    /// Paused instance resuming.
    Resuming,
    /// Instance reachable; embedded content shown.
    Up,
    /// Stop in progress.
    Stopping,
    /// Pause in progress.
    Pausing,
    /// Instance stopped (by the user, a timeout, or another tab).
    Stopped,
    /// Instance paused.
    Paused,
    /// Instance's application crashed.
    Crashed,
    /// Instance failed to start; carries the server's message if any.
    StartFailed(Option<String>),
    /// The user must log in again.
    LoggedOut,
    /// Recovery attempts exhausted and the full reload was declined.
    ReloadFailed,
}

impl SessionState {
    /// Initial state implied by an instance's server-side status.
    #[must_use]
    pub fn from_instance_status(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::New => Self::New,
            InstanceStatus::Up => Self::Up,
            InstanceStatus::Stopping => Self::Stopping,
            InstanceStatus::Pausing => Self::Pausing,
            InstanceStatus::Paused => Self::Paused,
            InstanceStatus::Resuming => Self::Resuming,
            InstanceStatus::Stopped => Self::Stopped,
        }
    }

    /// Terminal state an authoritative signal leads to.
    #[must_use]
    pub fn from_termination(signal: TerminationSignal) -> Self {
        match signal {
            TerminationSignal::InstanceGone => Self::Stopped,
            TerminationSignal::AppCrashed => Self::Crashed,
            TerminationSignal::AuthenticationRequired => Self::LoggedOut,
        }
    }

    /// `Stopped`, `Crashed` or `LoggedOut`.
    #[must_use]
    pub fn is_authoritative_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed | Self::LoggedOut)
    }

    /// Whether the session has finished acting on its instance.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.is_authoritative_terminal()
            || matches!(self, Self::StartFailed(_) | Self::ReloadFailed)
    }

    /// Decide how a requested transition to `next` is handled.
    #[must_use]
    pub fn transition_to(&self, next: &SessionState) -> Transition {
        if self == next {
            return Transition::Unchanged;
        }
        if self.is_authoritative_terminal() {
            return Transition::Rejected;
        }
        if next.is_authoritative_terminal() {
            return Transition::Applied;
        }
        if self.is_terminal() {
            return Transition::Rejected;
        }
        if matches!(next, Self::StartFailed(_) | Self::ReloadFailed) {
            return Transition::Applied;
        }

        let allowed = matches!(
            (self, next),
            (
                Self::Unbound,
                Self::New | Self::Resuming | Self::Up | Self::Stopping | Self::Pausing | Self::Paused
            ) | (Self::New | Self::Resuming, Self::Up)
                | (Self::Up, Self::Stopping | Self::Pausing)
                | (Self::Pausing, Self::Paused)
                | (Self::Paused, Self::Resuming)
        );
        if allowed {
            Transition::Applied
        } else {
            Transition::Rejected
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbound => write!(f, "unbound"),
            Self::New => write!(f, "new"),
            Self::Resuming => write!(f, "resuming"),
            Self::Up => write!(f, "up"),
            Self::Stopping => write!(f, "stopping"),
            Self::Pausing => write!(f, "pausing"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Crashed => write!(f, "crashed"),
            Self::StartFailed(Some(msg)) => write!(f, "start failed: {msg}"),
            Self::StartFailed(None) => write!(f, "start failed"),
            Self::LoggedOut => write!(f, "logged out"),
            Self::ReloadFailed => write!(f, "reload failed"),
        }
    }
}

/// Outcome of a requested state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The state changed.
    Applied,
    /// Already in the requested state; nothing happens.
    Unchanged,
    /// The transition is not permitted from the current state.
    Rejected,
    /// The tab is navigating away; no further UI transitions happen.
    Suppressed,
}
