//! Status Client: remote calls that query and mutate an instance's lifecycle.
//!
//! [`StatusApi`] is the seam between the controller and the proxy server.
//! [`HttpStatusClient`](http::HttpStatusClient) is the production
//! implementation; tests substitute in-memory fakes.

pub mod http;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::instance::{DesiredStatus, Instance};
use crate::models::response::TerminationSignal;
use crate::{AppError, Result};

/// Boxed, sendable future returned by the object-safe seams of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Parameter values chosen by the user when starting or resuming an instance.
pub type Parameters = HashMap<String, String>;

/// Body of an instance-creation request.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StartRequest {
    /// Chosen parameter values.
    pub parameters: Parameters,
    /// Time zone of the user, forwarded to the application.
    pub timezone: String,
}

/// Result of an instance-creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartResponse {
    /// Server accepted the request and assigned an initial status.
    Started(Instance),
    /// Server refused to start the instance; carries its message if any.
    Rejected(Option<String>),
}

/// Answer of the heartbeat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The server accepted the heartbeat.
    Alive,
    /// The server proved the instance (or the user's session) is gone.
    Terminated(TerminationSignal),
    /// No authoritative answer; treat as still alive.
    Unknown,
}

/// Remote operations on instances.
pub trait StatusApi: Send + Sync {
    /// Create an instance of `app_name`/`app_instance`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure and
    /// `AppError::Unauthorized` when the user must log in again.
    fn start_instance<'a>(
        &'a self,
        app_name: &'a str,
        app_instance: &'a str,
        request: &'a StartRequest,
    ) -> BoxFuture<'a, Result<StartResponse>>;

    /// Point query; `Ok(None)` when the instance does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure and
    /// `AppError::Unauthorized` when the user must log in again.
    fn get_status<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Instance>>>;

    /// Request a transition; progress is observed by polling.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http`, `AppError::NotFound`, `AppError::Unauthorized`
    /// or `AppError::Protocol` when the request is not accepted.
    fn set_desired_status<'a>(
        &'a self,
        id: &'a str,
        desired: DesiredStatus,
        parameters: Option<&'a Parameters>,
    ) -> BoxFuture<'a, Result<()>>;

    /// One long-poll round trip. The server holds the request for up to
    /// `timeout_seconds` and answers with the instance, changed or not.
    /// `Ok(None)` means the server did not return a usable instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure and
    /// `AppError::Unauthorized` when the user must log in again.
    fn watch_status<'a>(
        &'a self,
        id: &'a str,
        timeout_seconds: u64,
    ) -> BoxFuture<'a, Result<Option<Instance>>>;

    /// Send a heartbeat, bounded by `timeout` when given.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` when the server could not be reached.
    fn heartbeat<'a>(
        &'a self,
        id: &'a str,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<Liveness>>;

    /// Fetch the instance's public path and look for a termination body.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` when the server could not be reached.
    fn probe_app<'a>(
        &'a self,
        public_path: &'a str,
    ) -> BoxFuture<'a, Result<Option<TerminationSignal>>>;
}

/// Long-poll until the instance settles on `Up`, `Stopped` or `Paused`.
///
/// Each round trip is bounded by `timeout_seconds` on the server; the loop
/// re-issues it until a settled status arrives. Returns `Ok(None)` when the
/// server stops returning an instance, a transport error occurs, or `cancel`
/// fires.
///
/// # Errors
///
/// Returns `AppError::Unauthorized` when the user must log in again; every
/// other failure ends the wait with `Ok(None)`.
pub async fn wait_for_status_change(
    api: &dyn StatusApi,
    id: &str,
    timeout_seconds: u64,
    cancel: &CancellationToken,
) -> Result<Option<Instance>> {
    loop {
        let round = tokio::select! {
            () = cancel.cancelled() => {
                debug!(proxy_id = id, "long-poll cancelled");
                return Ok(None);
            }
            round = api.watch_status(id, timeout_seconds) => round,
        };

        match round {
            Ok(Some(instance)) if instance.status.ends_transition() => {
                debug!(proxy_id = id, status = ?instance.status, "long-poll settled");
                return Ok(Some(instance));
            }
            Ok(Some(instance)) => {
                debug!(proxy_id = id, status = ?instance.status, "long-poll window elapsed, re-issuing");
            }
            Ok(None) => return Ok(None),
            Err(AppError::Unauthorized(msg)) => return Err(AppError::Unauthorized(msg)),
            Err(err) => {
                warn!(proxy_id = id, %err, "long-poll failed");
                return Ok(None);
            }
        }
    }
}

/// Cheap "is this instance still real" probe built on the heartbeat call.
///
/// Transport errors and timeouts yield [`Liveness::Unknown`].
pub async fn is_alive(api: &dyn StatusApi, id: &str, timeout: Duration) -> Liveness {
    match api.heartbeat(id, Some(timeout)).await {
        Ok(liveness) => liveness,
        Err(err) => {
            debug!(proxy_id = id, %err, "liveness probe inconclusive");
            Liveness::Unknown
        }
    }
}
