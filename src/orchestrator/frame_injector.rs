//! Installs the Transport Monitor into every window of the embedding frame.
//!
//! Each reload of the embedded content replaces its network primitives with
//! fresh, unwrapped ones, so instrumentation must be redone after every
//! reload, in nested frames too. When the host offers a pre-script hook it is
//! used once and nothing else is needed. Otherwise the frame's ready state is
//! polled at a short interval and every uninstrumented window is
//! instrumented on each tick. Polling stops only once the document went
//! through a not-yet-complete state and then reached complete with every
//! window reporting the monitor's wrappers. A frame that still shows its
//! previous or blank document already reports complete, so that state alone
//! proves nothing about the document that is about to load.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::host::{EmbeddedFrame, FrameWindow, ReadyState};
use crate::orchestrator::transport_monitor::TransportMonitor;

/// How an injection run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionOutcome {
    /// The host's pre-script hook took over.
    Hooked,
    /// Polling confirmed every window is instrumented.
    Instrumented,
    /// Cancelled before confirmation.
    Cancelled,
}

/// Builder for one injection run.
pub struct FrameInjector {
    frame: Arc<dyn EmbeddedFrame>,
    monitor: TransportMonitor,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl FrameInjector {
    /// Construct an injector (does not start polling yet).
    #[must_use]
    pub fn new(
        frame: Arc<dyn EmbeddedFrame>,
        monitor: TransportMonitor,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            frame,
            monitor,
            poll_interval,
            cancel,
        }
    }

    /// Spawn the injection task.
    #[must_use]
    pub fn spawn(self) -> FrameInjectorHandle {
        let cancel = self.cancel.clone();
        let join_handle = tokio::spawn(self.run().instrument(info_span!("frame_injector")));
        FrameInjectorHandle {
            cancel,
            join_handle: Some(join_handle),
        }
    }

    async fn run(self) -> InjectionOutcome {
        if let Some(window) = self.frame.window() {
            if window.install_pre_script_hook(&self.monitor) {
                info!("instrumentation delegated to host pre-script hook");
                return InjectionOutcome::Hooked;
            }
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut saw_incomplete = false;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return InjectionOutcome::Cancelled,
                _ = ticker.tick() => {}
            }

            let Some(top) = self.frame.window() else {
                continue;
            };
            let Some(state) = top.ready_state() else {
                continue;
            };

            let windows = collect_windows(&top);
            if state == ReadyState::Complete {
                if saw_incomplete && windows.iter().all(|w| w.is_instrumented()) {
                    info!(windows = windows.len(), "frame instrumentation confirmed");
                    return InjectionOutcome::Instrumented;
                }
            } else {
                saw_incomplete = true;
            }

            for window in windows.iter().filter(|w| !w.is_instrumented()) {
                if let Err(err) = window.install_monitor(&self.monitor) {
                    debug!(%err, "window not instrumentable yet");
                }
            }
        }
    }
}

/// The top window and every nested window, breadth first.
fn collect_windows(top: &Arc<dyn FrameWindow>) -> Vec<Arc<dyn FrameWindow>> {
    let mut out = vec![Arc::clone(top)];
    let mut idx = 0;
    while idx < out.len() {
        let children = out[idx].child_windows();
        out.extend(children);
        idx += 1;
    }
    out
}

/// Handle returned from [`FrameInjector::spawn`].
pub struct FrameInjectorHandle {
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<InjectionOutcome>>,
}

impl Drop for FrameInjectorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl FrameInjectorHandle {
    /// Whether the injection run has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join_handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the run to end without cancelling it.
    pub async fn outcome(mut self) -> InjectionOutcome {
        match self.join_handle.take() {
            Some(handle) => handle.await.unwrap_or(InjectionOutcome::Cancelled),
            None => InjectionOutcome::Cancelled,
        }
    }
}
