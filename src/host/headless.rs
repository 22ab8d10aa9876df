//! Host binding for a client that renders nothing.
//!
//! The headless frame records where the content would be loaded and reports
//! it as complete immediately. It hosts no scripts, so there are no network
//! primitives to wrap and no reconnect primitive to find.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::client::BoxFuture;
use crate::host::{
    EmbeddedFrame, FrameSnapshot, FrameWindow, Prompt, ReadyState, ReconnectCapable, UserPrompt,
};
use crate::orchestrator::transport_monitor::TransportMonitor;
use crate::Result;

/// Frame without content.
#[derive(Debug, Default)]
pub struct HeadlessFrame {
    url: Mutex<Option<String>>,
}

impl HeadlessFrame {
    /// Create a frame that has not been set up yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the frame currently points at.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_url(&self, url: Option<String>) {
        *self.url.lock().unwrap_or_else(PoisonError::into_inner) = url;
    }
}

impl EmbeddedFrame for HeadlessFrame {
    fn setup(&self, url: &str) {
        info!(url, "frame set up");
        self.set_url(Some(url.to_owned()));
    }

    fn recreate(&self) {
        debug!(url = ?self.url(), "frame recreated");
    }

    fn remove(&self) {
        debug!("frame removed");
        self.set_url(None);
    }

    fn snapshot(&self) -> FrameSnapshot {
        match self.url() {
            Some(url) => FrameSnapshot {
                ready_state: Some(ReadyState::Complete),
                base_uri: Some(url),
                text: None,
            },
            None => FrameSnapshot::default(),
        }
    }

    fn window(&self) -> Option<Arc<dyn FrameWindow>> {
        self.url()
            .map(|_| Arc::new(HeadlessWindow) as Arc<dyn FrameWindow>)
    }

    fn probe_reconnect(&self) -> Option<Arc<dyn ReconnectCapable>> {
        None
    }
}

/// Window of a headless frame: always loaded, nothing to wrap.
#[derive(Debug, Clone, Copy)]
struct HeadlessWindow;

impl FrameWindow for HeadlessWindow {
    fn ready_state(&self) -> Option<ReadyState> {
        Some(ReadyState::Complete)
    }

    fn is_instrumented(&self) -> bool {
        true
    }

    fn install_monitor(&self, _monitor: &TransportMonitor) -> Result<()> {
        Ok(())
    }

    fn child_windows(&self) -> Vec<Arc<dyn FrameWindow>> {
        Vec::new()
    }

    // No document ever runs scripts here, so every document is covered.
    fn install_pre_script_hook(&self, _monitor: &TransportMonitor) -> bool {
        true
    }
}

/// Prompt answering every question with a fixed choice.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt {
    reconnect: bool,
    full_reload: bool,
}

impl FixedPrompt {
    /// Answer reconnect questions with `reconnect` and full reload
    /// questions with `full_reload`.
    #[must_use]
    pub fn new(reconnect: bool, full_reload: bool) -> Self {
        Self {
            reconnect,
            full_reload,
        }
    }
}

impl UserPrompt for FixedPrompt {
    fn confirm(&self, prompt: Prompt) -> BoxFuture<'_, bool> {
        let answer = match prompt {
            Prompt::Reconnect => self.reconnect,
            Prompt::FullReload => self.full_reload,
        };
        info!(?prompt, answer, "prompt answered");
        Box::pin(async move { answer })
    }
}
