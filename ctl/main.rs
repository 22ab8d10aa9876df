#![forbid(unsafe_code)]

//! `proxy-session-ctl`: one-shot operator commands against a proxy server.
//!
//! Each subcommand issues a single status-client call (or a long-poll loop
//! for `wait`) and prints the result as JSON.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use proxy_session::client::http::HttpStatusClient;
use proxy_session::client::{is_alive, wait_for_status_change, Liveness, Parameters, StatusApi};
use proxy_session::models::instance::{DesiredStatus, Instance};
use proxy_session::{AppError, ClientConfig, Result};

#[derive(Debug, Parser)]
#[command(
    name = "proxy-session-ctl",
    about = "Operator CLI for proxied instances",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file (same as `proxy-session`).
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the current status of an instance.
    Status {
        /// Instance ID.
        id: String,
    },

    /// Block until the instance settles on Up, Stopped or Paused.
    Wait {
        /// Instance ID.
        id: String,
    },

    /// Request the instance to stop.
    Stop {
        /// Instance ID.
        id: String,
    },

    /// Request the instance to pause.
    Pause {
        /// Instance ID.
        id: String,
    },

    /// Request a paused instance to resume.
    Resume {
        /// Instance ID.
        id: String,
        /// Parameter value as `name=value`. Repeatable.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Send one heartbeat and report whether the instance is alive.
    Heartbeat {
        /// Instance ID.
        id: String,
    },
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_owned(), value.to_owned()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got `{raw}`"))
}

fn main() {
    let args = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(execute(args)) {
        Ok(output) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output).unwrap_or_default()
            );
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

async fn execute(args: Cli) -> Result<serde_json::Value> {
    let config = ClientConfig::load_from_path(&args.config)?;
    let client = HttpStatusClient::new(&config)?;

    match args.command {
        Command::Status { id } => {
            let instance = client
                .get_status(&id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))?;
            Ok(describe(&instance))
        }
        Command::Wait { id } => {
            let cancel = CancellationToken::new();
            let instance = wait_for_status_change(
                &client,
                &id,
                config.long_poll.timeout_seconds,
                &cancel,
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))?;
            Ok(describe(&instance))
        }
        Command::Stop { id } => request(&client, &id, DesiredStatus::Stopping, None).await,
        Command::Pause { id } => request(&client, &id, DesiredStatus::Pausing, None).await,
        Command::Resume { id, params } => {
            let parameters: Parameters = params.into_iter().collect();
            let parameters = (!parameters.is_empty()).then_some(parameters);
            request(&client, &id, DesiredStatus::Resuming, parameters.as_ref()).await
        }
        Command::Heartbeat { id } => {
            let liveness = is_alive(&client, &id, config.liveness_timeout()).await;
            let value = match liveness {
                Liveness::Alive => serde_json::json!({ "id": id, "alive": true }),
                Liveness::Terminated(signal) => {
                    serde_json::json!({ "id": id, "alive": false, "reason": signal.as_reason() })
                }
                Liveness::Unknown => serde_json::json!({ "id": id, "alive": null }),
            };
            Ok(value)
        }
    }
}

async fn request(
    client: &HttpStatusClient,
    id: &str,
    desired: DesiredStatus,
    parameters: Option<&Parameters>,
) -> Result<serde_json::Value> {
    client.set_desired_status(id, desired, parameters).await?;
    Ok(serde_json::json!({ "id": id, "requested": desired }))
}

fn describe(instance: &Instance) -> serde_json::Value {
    let values = &instance.runtime_values;
    serde_json::json!({
        "id": instance.id,
        "status": instance.status,
        "displayName": instance.display_name,
        "publicPath": values.public_path(),
        "reconnectionMode": values.reconnection_mode(),
        "heartbeatTimeoutMs": values.heartbeat_timeout_ms(),
        "maxLifetimeMinutes": values.max_lifetime_minutes(),
        "uptimeSeconds": instance
            .uptime(chrono::Utc::now())
            .map(|uptime| uptime.num_seconds()),
    })
}
