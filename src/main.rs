#![forbid(unsafe_code)]

//! `proxy-session`: headless keep-alive client for one proxied instance.
//!
//! Starts (or attaches to) an instance, then runs the session controller:
//! long-poll until the instance is up, heartbeats while it runs, and
//! state reporting until it ends or the process is asked to shut down.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use proxy_session::client::http::HttpStatusClient;
use proxy_session::client::{Parameters, StatusApi};
use proxy_session::host::headless::{FixedPrompt, HeadlessFrame};
use proxy_session::models::state::SessionState;
use proxy_session::orchestrator::controller::{Binding, SessionController};
use proxy_session::orchestrator::session::SessionEvent;
use proxy_session::{AppError, ClientConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "proxy-session", about = "Headless proxy session client", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Attach to an existing instance instead of starting a new one.
    #[arg(long)]
    instance: Option<String>,

    /// Parameter value for a new instance, as `name=value`. Repeatable.
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Decline reconnect prompts.
    #[arg(long)]
    decline_reconnect: bool,

    /// Decline full reload prompts.
    #[arg(long)]
    decline_full_reload: bool,
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_owned(), value.to_owned()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got `{raw}`"))
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("proxy-session bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

enum Outcome {
    Finished(SessionState),
    Shutdown(SessionState),
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = Arc::new(ClientConfig::load_from_path(&args.config)?);
    info!(server_url = %config.server_url, app = %config.app_name, "configuration loaded");

    let api: Arc<dyn StatusApi> = Arc::new(HttpStatusClient::new(&config)?);
    let prompt = Arc::new(FixedPrompt::new(
        !args.decline_reconnect,
        !args.decline_full_reload,
    ));

    let mut binding = match args.instance {
        Some(ref id) => Binding::Attach(fetch_instance(api.as_ref(), id).await?),
        None => Binding::Start {
            parameters: args.params.into_iter().collect::<Parameters>(),
        },
    };
    let mut automatic_reload = false;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    // ── Run sessions until one ends without a reload ───
    loop {
        let frame = Arc::new(HeadlessFrame::new());
        let mut handle = SessionController::new(
            Arc::clone(&config),
            Arc::clone(&api),
            frame,
            prompt.clone(),
            binding,
        )
        .after_automatic_reload(automatic_reload)
        .spawn();

        let session = Arc::clone(handle.session());
        let mut states = handle.subscribe();
        let Some(mut events) = handle.take_events() else {
            return Err(AppError::Config("session events already taken".into()));
        };
        let mut reload = None;

        let join = handle.join();
        tokio::pin!(join);

        let outcome = loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    session.navigate_away();
                    break Outcome::Shutdown((&mut join).await);
                }
                state = &mut join => break Outcome::Finished(state),
                Ok(()) = states.changed() => {
                    let state = states.borrow_and_update().clone();
                    info!(state = %state, "session state");
                }
                Some(event) = events.recv() => {
                    if let SessionEvent::FullReloadRequested { automatic } = event {
                        reload = Some(automatic);
                    }
                    report(&event);
                }
            }
        };

        while let Ok(event) = events.try_recv() {
            if let SessionEvent::FullReloadRequested { automatic } = event {
                reload = Some(automatic);
            }
            report(&event);
        }

        let state = match outcome {
            Outcome::Shutdown(state) => {
                info!(state = %state, "proxy-session shut down");
                return Ok(());
            }
            Outcome::Finished(state) => state,
        };

        let (Some(automatic), Some(id)) = (reload, session.instance_id()) else {
            info!(state = %state, "session ended");
            return Ok(());
        };
        info!(proxy_id = %id, automatic, "reloading session");
        binding = Binding::Attach(fetch_instance(api.as_ref(), &id).await?);
        automatic_reload = automatic;
    }
}

async fn fetch_instance(
    api: &dyn StatusApi,
    id: &str,
) -> Result<proxy_session::models::instance::Instance> {
    api.get_status(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::FrameLoaded { url } => info!(url, "content loaded"),
        SessionEvent::Reconnecting {
            attempt,
            max_attempts,
        } => warn!(attempt, max_attempts, "reconnecting"),
        SessionEvent::RetryCountdown {
            attempt,
            max_attempts,
            seconds_left,
        } => info!(attempt, max_attempts, seconds_left, "retrying"),
        SessionEvent::Reconnected => info!("reconnected"),
        SessionEvent::FullReloadRequested { automatic } => {
            warn!(automatic, "full reload requested");
        }
        SessionEvent::AppUrlChanged { path } => info!(path, "app url changed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
