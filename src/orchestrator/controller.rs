//! Session controller: drives one instance through its lifecycle.
//!
//! The controller binds a [`Session`] to an instance (by starting a new one
//! or attaching to a known one) and walks it through the lifecycle phases.
//! While the instance is up it owns the embedding frame, the heartbeat, the
//! frame injector and the reconnection coordinator, and routes every
//! [`ControlSignal`] the Transport Monitor produces.
//!
//! The controller never returns errors to its caller: every failure ends in
//! a defined [`SessionState`].

use std::sync::Arc;

use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::{wait_for_status_change, Parameters, StartRequest, StartResponse, StatusApi};
use crate::config::ClientConfig;
use crate::host::{EmbeddedFrame, UserPrompt};
use crate::models::instance::{DesiredStatus, Instance, InstanceStatus};
use crate::models::state::{SessionState, Transition};
use crate::orchestrator::frame_injector::{FrameInjector, FrameInjectorHandle};
use crate::orchestrator::heartbeat::{HeartbeatEmitter, HeartbeatHandle};
use crate::orchestrator::reconnect::{ReconnectCoordinator, ReconnectSettings};
use crate::orchestrator::session::{Session, SessionEvent};
use crate::orchestrator::transport_monitor::{ControlSignal, TransportMonitor};
use crate::AppError;

/// How the session obtains its instance.
#[derive(Debug, Clone)]
pub enum Binding {
    /// Create a new instance with the given parameter values.
    Start {
        /// Chosen parameter values (empty when the app has none).
        parameters: Parameters,
    },
    /// Attach to an instance the server already knows about.
    Attach(Instance),
}

/// User requests delivered to a running controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Stop the instance.
    Stop,
    /// Pause the instance.
    Pause,
    /// Resume a paused instance with optional new parameter values.
    Resume(Option<Parameters>),
}

/// Builder for a session controller.
pub struct SessionController {
    config: Arc<ClientConfig>,
    api: Arc<dyn StatusApi>,
    frame: Arc<dyn EmbeddedFrame>,
    prompt: Arc<dyn UserPrompt>,
    binding: Binding,
    after_automatic_reload: bool,
}

impl SessionController {
    /// Construct a controller (does not start anything yet).
    #[must_use]
    pub fn new(
        config: Arc<ClientConfig>,
        api: Arc<dyn StatusApi>,
        frame: Arc<dyn EmbeddedFrame>,
        prompt: Arc<dyn UserPrompt>,
        binding: Binding,
    ) -> Self {
        Self {
            config,
            api,
            frame,
            prompt,
            binding,
            after_automatic_reload: false,
        }
    }

    /// Mark this controller as the result of an automatic full reload.
    ///
    /// A crash observed right after start then ends the session instead of
    /// reloading a second time.
    #[must_use]
    pub fn after_automatic_reload(mut self, reloaded: bool) -> Self {
        self.after_automatic_reload = reloaded;
        self
    }

    /// Spawn the controller task.
    #[must_use]
    pub fn spawn(self) -> SessionHandle {
        let (session, event_rx) = Session::new(CancellationToken::new());
        let session = Arc::new(session);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let span = info_span!("session", app = %self.config.app_name);
        let task = ControllerTask {
            config: self.config,
            api: self.api,
            frame: self.frame,
            prompt: self.prompt,
            after_automatic_reload: self.after_automatic_reload,
            session: Arc::clone(&session),
            command_rx,
            heartbeat: None,
        };
        let join_handle = tokio::spawn(task.run(self.binding).instrument(span));

        SessionHandle {
            session,
            commands: command_tx,
            events: Some(event_rx),
            join_handle: Some(join_handle),
        }
    }
}

/// Lifecycle phase the controller is in.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Waiting for the instance to come up; carries the UI state to show.
    Starting(SessionState),
    /// Instance up; `fresh` when it just finished starting in this session.
    Up { fresh: bool },
    /// Stop in progress; `send` when the request must be (re)issued.
    Stopping { send: bool },
    /// Pause in progress; `send` when the request must be issued.
    Pausing { send: bool },
    /// Instance paused, waiting for a resume command.
    Paused,
    /// Nothing left to do.
    Done,
}

impl Phase {
    fn for_status(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::New | InstanceStatus::Resuming => {
                Self::Starting(SessionState::from_instance_status(status))
            }
            InstanceStatus::Up => Self::Up { fresh: false },
            InstanceStatus::Stopping => Self::Stopping { send: true },
            InstanceStatus::Pausing => Self::Pausing { send: false },
            InstanceStatus::Paused => Self::Paused,
            InstanceStatus::Stopped => Self::Done,
        }
    }
}

/// Why the up phase ended.
enum UpExit {
    Stop,
    Pause,
    Ended,
}

struct ControllerTask {
    config: Arc<ClientConfig>,
    api: Arc<dyn StatusApi>,
    frame: Arc<dyn EmbeddedFrame>,
    prompt: Arc<dyn UserPrompt>,
    after_automatic_reload: bool,
    session: Arc<Session>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    heartbeat: Option<HeartbeatHandle>,
}

impl ControllerTask {
    async fn run(mut self, binding: Binding) -> SessionState {
        let instance = match binding {
            Binding::Start { parameters } => self.start(parameters).await,
            Binding::Attach(instance) => Some(instance),
        };

        if let Some(instance) = instance {
            let mut phase = Phase::for_status(instance.status);
            if instance.status == InstanceStatus::Stopped {
                self.session.transition(SessionState::Stopped);
            }
            self.session.bind(instance);

            while phase != Phase::Done {
                if self.session.is_inactive() {
                    break;
                }
                debug!(?phase, "entering phase");
                phase = match phase {
                    Phase::Starting(state) => self.wait_for_start(state).await,
                    Phase::Up { fresh } => self.run_up(fresh).await,
                    Phase::Stopping { send } => self.stop(send).await,
                    Phase::Pausing { send } => self.pause(send).await,
                    Phase::Paused => self.wait_for_resume().await,
                    Phase::Done => Phase::Done,
                };
            }
        }

        self.heartbeat.take();
        let state = self.session.state();
        if state.is_terminal() {
            self.frame.remove();
        }
        info!(state = %state, "session controller finished");
        state
    }

    /// Create the instance; `None` when the server refused.
    async fn start(&self, parameters: Parameters) -> Option<Instance> {
        let request = StartRequest {
            parameters,
            timezone: self.config.timezone.clone(),
        };
        let cancel = self.session.cancel_token();
        let response = tokio::select! {
            () = cancel.cancelled() => return None,
            response = self.api.start_instance(
                &self.config.app_name,
                &self.config.app_instance,
                &request,
            ) => response,
        };

        match response {
            Ok(StartResponse::Started(instance)) => {
                info!(proxy_id = %instance.id, status = ?instance.status, "instance created");
                Some(instance)
            }
            Ok(StartResponse::Rejected(message)) => {
                warn!(?message, "instance creation rejected");
                self.session.transition(SessionState::StartFailed(message));
                None
            }
            Err(err) => {
                self.fail_start(&err);
                None
            }
        }
    }

    fn fail_start(&self, err: &AppError) {
        if let AppError::Unauthorized(_) = err {
            self.session.transition(SessionState::LoggedOut);
        } else {
            warn!(%err, "instance start failed");
            self.session.transition(SessionState::StartFailed(None));
        }
    }

    async fn wait_for_start(&mut self, state: SessionState) -> Phase {
        self.session.transition(state);
        match self.wait_settled().await {
            Ok(Some(instance)) if instance.status == InstanceStatus::Up => {
                self.session.bind(instance);
                Phase::Up { fresh: true }
            }
            Ok(other) => {
                debug!(status = ?other.map(|i| i.status), "instance did not come up");
                self.session.transition(SessionState::StartFailed(None));
                Phase::Done
            }
            Err(err) => {
                self.fail_start(&err);
                Phase::Done
            }
        }
    }

    async fn run_up(&mut self, fresh: bool) -> Phase {
        if !matches!(
            self.session.transition(SessionState::Up),
            Transition::Applied | Transition::Unchanged
        ) {
            return Phase::Done;
        }
        let Some(instance) = self.session.instance() else {
            return Phase::Done;
        };
        let public_path = instance.runtime_values.public_path().unwrap_or_default().to_owned();
        let frame_url = format!("{public_path}{}", self.config.container_sub_path);

        self.session.reset_recovery();

        // Each up phase gets its own channel: monitors left in windows of an
        // earlier phase report into a closed channel.
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let phase_cancel = self.session.cancel_token().child_token();
        let monitor = TransportMonitor::new(Arc::clone(&self.session), signal_tx.clone());

        self.frame.setup(&frame_url);
        self.session.emit(SessionEvent::FrameLoaded {
            url: frame_url.clone(),
        });
        let mut injector = self.spawn_injector(&monitor, &phase_cancel);

        self.heartbeat = Some(
            HeartbeatEmitter::new(
                Arc::clone(&self.session),
                Arc::clone(&self.api),
                self.config.heartbeat_rate(),
                self.session.cancel_token().child_token(),
            )
            .spawn(),
        );

        let coordinator = Arc::new(ReconnectCoordinator::new(
            Arc::clone(&self.session),
            Arc::clone(&self.api),
            Arc::clone(&self.frame),
            Arc::clone(&self.prompt),
            signal_tx,
            ReconnectSettings::resolve(&self.config, &instance.runtime_values),
            phase_cancel.clone(),
        ));

        if self.probe_for_crash(&frame_url, fresh).await {
            phase_cancel.cancel();
            return Phase::Done;
        }

        let track_url = instance.runtime_values.track_app_url();
        let exit = loop {
            tokio::select! {
                () = phase_cancel.cancelled() => break UpExit::Ended,
                Some(signal) = signal_rx.recv() => match signal {
                    ControlSignal::TransportFailure { connection } => {
                        if coordinator.handle_failure().is_some() {
                            debug!(connection_id = connection, "recovery started after transport failure");
                        }
                    }
                    ControlSignal::Terminated(signal) => {
                        self.session.transition(SessionState::from_termination(signal));
                    }
                    ControlSignal::FrameUnloading | ControlSignal::FrameRecreated => {
                        injector = self.spawn_injector(&monitor, &phase_cancel);
                    }
                    ControlSignal::LocationChanged(location) => {
                        if track_url {
                            if let Some(path) = app_sub_path(&location, &public_path) {
                                self.session.emit(SessionEvent::AppUrlChanged { path });
                            }
                        }
                    }
                },
                Some(command) = self.command_rx.recv() => match command {
                    SessionCommand::Stop => break UpExit::Stop,
                    SessionCommand::Pause => break UpExit::Pause,
                    SessionCommand::Resume(_) => debug!("resume ignored, instance is up"),
                },
            }
        };

        phase_cancel.cancel();
        drop(injector);
        match exit {
            UpExit::Stop => {
                self.frame.remove();
                Phase::Stopping { send: true }
            }
            UpExit::Pause => {
                self.frame.remove();
                Phase::Pausing { send: true }
            }
            UpExit::Ended => Phase::Done,
        }
    }

    fn spawn_injector(
        &self,
        monitor: &TransportMonitor,
        phase_cancel: &CancellationToken,
    ) -> FrameInjectorHandle {
        FrameInjector::new(
            Arc::clone(&self.frame),
            monitor.clone(),
            self.config.injector_poll_interval(),
            phase_cancel.child_token(),
        )
        .spawn()
    }

    /// Fetch the app's entry point once after it came up.
    ///
    /// Returns `true` when the session must not continue (a full reload was
    /// requested or the instance turned out gone).
    async fn probe_for_crash(&self, frame_url: &str, fresh: bool) -> bool {
        let cancel = self.session.cancel_token();
        let probed = tokio::select! {
            () = cancel.cancelled() => return true,
            probed = self.api.probe_app(frame_url) => probed,
        };
        let signal = match probed {
            Ok(Some(signal)) => signal,
            Ok(None) => return false,
            Err(err) => {
                debug!(%err, "crash probe inconclusive, assuming running");
                return false;
            }
        };

        if fresh && !self.after_automatic_reload {
            info!(reason = signal.as_reason(), "app gone right after start, reloading once");
            self.session
                .emit(SessionEvent::FullReloadRequested { automatic: true });
            self.session.navigate_away();
        } else {
            info!(reason = signal.as_reason(), "app gone");
            self.session
                .transition(SessionState::from_termination(signal));
        }
        true
    }

    async fn stop(&mut self, send: bool) -> Phase {
        self.session.transition(SessionState::Stopping);
        if send && !self.request(DesiredStatus::Stopping, None).await {
            return Phase::Done;
        }
        match self.wait_settled().await {
            Ok(_) => {
                self.session.transition(SessionState::Stopped);
            }
            Err(_) => {
                self.session.transition(SessionState::LoggedOut);
            }
        }
        Phase::Done
    }

    async fn pause(&mut self, send: bool) -> Phase {
        self.session.transition(SessionState::Pausing);
        if send && !self.request(DesiredStatus::Pausing, None).await {
            return Phase::Done;
        }
        match self.wait_settled().await {
            Ok(Some(instance)) if instance.status == InstanceStatus::Paused => {
                self.session.bind(instance);
                Phase::Paused
            }
            Ok(_) => {
                self.session.transition(SessionState::Stopped);
                Phase::Done
            }
            Err(_) => {
                self.session.transition(SessionState::LoggedOut);
                Phase::Done
            }
        }
    }

    async fn wait_for_resume(&mut self) -> Phase {
        self.heartbeat.take();
        self.session.transition(SessionState::Paused);

        let cancel = self.session.cancel_token().clone();
        let parameters = loop {
            tokio::select! {
                () = cancel.cancelled() => return Phase::Done,
                command = self.command_rx.recv() => match command {
                    Some(SessionCommand::Resume(parameters)) => break parameters,
                    Some(other) => debug!(?other, "command ignored while paused"),
                    None => return Phase::Done,
                },
            }
        };

        if !self.request(DesiredStatus::Resuming, parameters.as_ref()).await {
            return Phase::Done;
        }
        Phase::Starting(SessionState::Resuming)
    }

    /// Issue a desired-status request. Returns `false` when the session
    /// must stop because the user is logged out.
    async fn request(&self, desired: DesiredStatus, parameters: Option<&Parameters>) -> bool {
        let Some(id) = self.session.instance_id() else {
            return false;
        };
        let cancel = self.session.cancel_token();
        let result = tokio::select! {
            () = cancel.cancelled() => return false,
            result = self.api.set_desired_status(&id, desired, parameters) => result,
        };
        match result {
            Ok(()) => {
                info!(proxy_id = %id, ?desired, "status change requested");
                true
            }
            Err(AppError::Unauthorized(_)) => {
                self.session.transition(SessionState::LoggedOut);
                false
            }
            Err(err) => {
                warn!(proxy_id = %id, ?desired, %err, "status change request failed, waiting anyway");
                true
            }
        }
    }

    async fn wait_settled(&self) -> crate::Result<Option<Instance>> {
        let Some(id) = self.session.instance_id() else {
            return Ok(None);
        };
        wait_for_status_change(
            self.api.as_ref(),
            &id,
            self.config.long_poll.timeout_seconds,
            self.session.cancel_token(),
        )
        .instrument(info_span!("long_poll", proxy_id = %id))
        .await
    }
}

/// Location of the embedded content relative to the instance's public path.
///
/// `location` may be absolute or a path; `None` when it lies outside the
/// public path.
#[must_use]
pub fn app_sub_path(location: &str, public_path: &str) -> Option<String> {
    let path = match Url::parse(location) {
        Ok(url) => {
            let mut path = url.path().to_owned();
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            if let Some(fragment) = url.fragment() {
                path.push('#');
                path.push_str(fragment);
            }
            path
        }
        Err(_) => location.to_owned(),
    };
    path.strip_prefix(public_path).map(str::to_owned)
}

/// Handle of a running controller.
///
/// Dropping the handle cancels every task of the session.
pub struct SessionHandle {
    session: Arc<Session>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    join_handle: Option<JoinHandle<SessionState>>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.session.cancel_token().cancel();
    }
}

impl SessionHandle {
    /// Shared session state.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Current UI state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Subscribe to UI state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    /// Take the event stream; `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// Ask the controller to stop the instance.
    pub fn stop(&self) {
        self.send(SessionCommand::Stop);
    }

    /// Ask the controller to pause the instance.
    pub fn pause(&self) {
        self.send(SessionCommand::Pause);
    }

    /// Ask the controller to resume a paused instance.
    pub fn resume(&self, parameters: Option<Parameters>) {
        self.send(SessionCommand::Resume(parameters));
    }

    /// The tab is unloading: suppress further transitions and cancel timers.
    pub fn navigate_away(&self) {
        self.session.navigate_away();
    }

    /// Wait for the controller to finish; returns the final state.
    pub async fn join(mut self) -> SessionState {
        match self.join_handle.take() {
            Some(handle) => handle.await.unwrap_or_else(|err| {
                warn!(%err, "session controller task failed");
                self.session.state()
            }),
            None => self.session.state(),
        }
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            debug!("controller finished, command dropped");
        }
    }
}
