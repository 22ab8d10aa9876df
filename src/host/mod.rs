//! Boundary with the hosting environment.
//!
//! The controller never touches a concrete page: the embedding frame, the
//! windows inside it, the embedded application's reconnect primitive and
//! user prompts are reached through the traits below. A browser binding
//! implements them over the DOM; [`headless`] implements them for a client
//! without embedded content.

pub mod headless;

use std::sync::Arc;

use crate::client::BoxFuture;
use crate::orchestrator::transport_monitor::TransportMonitor;
use crate::Result;

/// Placeholder text the proxy serves while the container is still booting.
pub const STARTUP_MESSAGE: &str = "is starting up, check back in a few seconds.";

/// Base URI of an empty frame.
pub const BLANK_URI: &str = "about:blank";

/// Document loading progress of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Document still being parsed.
    Loading,
    /// Parsed; sub-resources still loading.
    Interactive,
    /// Fully loaded.
    Complete,
}

/// One window inside the embedding frame (the top one or a nested one).
pub trait FrameWindow: Send + Sync {
    /// Loading progress; `None` when the document is not accessible.
    fn ready_state(&self) -> Option<ReadyState>;

    /// Whether this window's network primitives already carry the monitor's
    /// wrappers. Detected by introspecting the installed primitive.
    fn is_instrumented(&self) -> bool;

    /// Wrap the socket, request-opener and fetch primitives so they report
    /// to `monitor`.
    ///
    /// # Errors
    ///
    /// Returns an error when the window is not accessible yet.
    fn install_monitor(&self, monitor: &TransportMonitor) -> Result<()>;

    /// Windows of nested frames.
    fn child_windows(&self) -> Vec<Arc<dyn FrameWindow>>;

    /// Ask the host to instrument every document of this window before its
    /// scripts run. Returns `false` when the host offers no such hook.
    fn install_pre_script_hook(&self, monitor: &TransportMonitor) -> bool {
        let _ = monitor;
        false
    }
}

/// What the embedding frame currently shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSnapshot {
    /// Loading progress; `None` when inaccessible.
    pub ready_state: Option<ReadyState>,
    /// Base URI of the loaded document.
    pub base_uri: Option<String>,
    /// Text content of the document, if readable.
    pub text: Option<String>,
}

impl FrameSnapshot {
    /// Whether the frame shows a fully loaded, real application page.
    #[must_use]
    pub fn shows_application(&self) -> bool {
        let complete = self.ready_state == Some(ReadyState::Complete);
        let blank = self.base_uri.as_deref().is_none_or(|uri| uri == BLANK_URI);
        let placeholder = self
            .text
            .as_deref()
            .is_some_and(|text| text.contains(STARTUP_MESSAGE));
        complete && !blank && !placeholder
    }
}

/// In-place reconnect primitive exposed by some embedded applications.
///
/// Detection is best effort (see [`EmbeddedFrame::probe_reconnect`]); when
/// absent the frame is torn down and recreated instead.
pub trait ReconnectCapable: Send + Sync {
    /// Whether the application considers itself connected.
    fn is_connected(&self) -> bool;

    /// Re-open the application's channel.
    fn reconnect(&self);

    /// Whether the underlying channel reports open.
    fn channel_open(&self) -> bool;
}

/// The frame embedding the instance's content.
pub trait EmbeddedFrame: Send + Sync {
    /// Create the frame pointing at `url`.
    fn setup(&self, url: &str);

    /// Tear down and recreate the frame at its last URL.
    fn recreate(&self);

    /// Remove the frame.
    fn remove(&self);

    /// Current content of the frame.
    fn snapshot(&self) -> FrameSnapshot;

    /// Top window of the embedded content, when the frame exists.
    fn window(&self) -> Option<Arc<dyn FrameWindow>>;

    /// Feature-probe the embedded application for a reconnect primitive.
    fn probe_reconnect(&self) -> Option<Arc<dyn ReconnectCapable>>;
}

/// Blocking questions put to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    /// "Connection to server lost, try to reconnect to the application?"
    Reconnect,
    /// "Cannot restore connection to the server, reload the full page?"
    FullReload,
}

/// Asks the user to confirm a recovery step.
pub trait UserPrompt: Send + Sync {
    /// Resolve to `true` when the user accepts.
    fn confirm(&self, prompt: Prompt) -> BoxFuture<'_, bool>;
}
