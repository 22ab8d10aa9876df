//! Transport Monitor: observes the embedded content's network primitives.
//!
//! A host binding wraps the socket constructor, the request opener and the
//! fetch function of every window in the embedding frame (see
//! [`FrameWindow::install_monitor`](crate::host::FrameWindow::install_monitor)) and
//! forwards what they observe to a [`TransportMonitor`]. The monitor
//!
//! - records transport activity (used to suppress redundant heartbeats),
//! - tracks open sockets,
//! - classifies socket closes as failures unless they were clean,
//! - detects termination bodies in responses.
//!
//! Everything it concludes is sent to the controller as a [`ControlSignal`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::response::{classify, TerminationSignal};
use crate::orchestrator::session::{ConnectionId, Session};

/// Conclusions forwarded to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// A socket errored or closed uncleanly.
    TransportFailure {
        /// Connection that failed.
        connection: ConnectionId,
    },
    /// A response proved the instance or the user's session is gone.
    Terminated(TerminationSignal),
    /// The embedded document is unloading; its primitives will be replaced.
    FrameUnloading,
    /// The embedding frame was torn down and recreated.
    FrameRecreated,
    /// The embedded content navigated to `url`.
    LocationChanged(String),
}

/// Sink for observations made by wrapped primitives.
///
/// Cheap to clone; every window of the frame gets its own clone.
#[derive(Debug, Clone)]
pub struct TransportMonitor {
    session: Arc<Session>,
    signal_tx: mpsc::UnboundedSender<ControlSignal>,
}

impl TransportMonitor {
    /// Build a monitor reporting to `signal_tx`.
    #[must_use]
    pub fn new(session: Arc<Session>, signal_tx: mpsc::UnboundedSender<ControlSignal>) -> Self {
        Self { session, signal_tx }
    }

    /// A wrapped socket constructor was called.
    pub fn socket_created(&self) -> ConnectionId {
        let id = self.session.register_connection();
        debug!(connection_id = id, "socket created");
        id
    }

    /// A tracked socket finished its handshake.
    pub fn socket_opened(&self, id: ConnectionId) {
        self.session.mark_connection_open(id);
    }

    /// A tracked socket raised an error event.
    pub fn socket_error(&self, id: ConnectionId) {
        warn!(connection_id = id, "socket error");
        self.forward(ControlSignal::TransportFailure { connection: id });
    }

    /// A tracked socket closed. Only unclean closes are failures.
    pub fn socket_closed(&self, id: ConnectionId, was_clean: bool) {
        self.session.remove_connection(id);
        if was_clean {
            debug!(connection_id = id, "socket closed cleanly");
            return;
        }
        warn!(connection_id = id, "socket closed uncleanly");
        self.forward(ControlSignal::TransportFailure { connection: id });
    }

    /// A wrapped fetch or request opener sent a request.
    pub fn request_sent(&self) {
        self.session.touch();
    }

    /// A wrapped request completed with `status` and `body`.
    ///
    /// Returns the termination signal found in the response, if any.
    pub fn response_received(&self, status: u16, body: &[u8]) -> Option<TerminationSignal> {
        let signal = classify(status, body)?;
        info!(status, reason = signal.as_reason(), "embedded content observed termination");
        self.forward(ControlSignal::Terminated(signal));
        Some(signal)
    }

    /// The embedded document is about to unload.
    pub fn frame_unloading(&self) {
        self.forward(ControlSignal::FrameUnloading);
    }

    /// The embedded content changed its location (load, history push/replace, pop).
    pub fn location_changed(&self, url: &str) {
        self.forward(ControlSignal::LocationChanged(url.to_owned()));
    }

    fn forward(&self, signal: ControlSignal) {
        if self.session.is_inactive() {
            debug!(?signal, "session inactive, signal ignored");
            return;
        }
        if self.signal_tx.send(signal).is_err() {
            debug!("controller gone, signal dropped");
        }
    }
}
