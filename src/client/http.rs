//! reqwest-backed [`StatusApi`] implementation.

use std::time::Duration;

use reqwest::{Response, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::{
    BoxFuture, Liveness, Parameters, StartRequest, StartResponse, StatusApi,
};
use crate::config::ClientConfig;
use crate::models::instance::{DesiredStatus, Instance};
use crate::models::response::{classify, Envelope, EnvelopeStatus, TerminationSignal};
use crate::{AppError, Result};

/// Query parameter pinning a request to one proxy server.
const INSTANCE_OVERRIDE_PARAM: &str = "sp_instance_override";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DesiredStatusBody<'a> {
    desired_state: DesiredStatus,
    parameters: Option<&'a Parameters>,
}

/// Status Client talking to the proxy server's REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpStatusClient {
    http: reqwest::Client,
    base_url: Url,
    instance_override: Option<String>,
    watch_margin: Duration,
}

impl HttpStatusClient {
    /// Build a client for the server described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the server URL cannot be parsed or the
    /// HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.server_url)
            .map_err(|err| AppError::Config(format!("invalid server_url: {err}")))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            base_url,
            instance_override: config.instance_override.clone(),
            watch_margin: config.long_poll_margin(),
        })
    }

    /// Resolve `location` against the server URL.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the joined URL is invalid.
    pub fn build_url(&self, location: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .join(location)
            .map_err(|err| AppError::Config(format!("invalid url `{location}`: {err}")))?;
        if let Some(ref instance) = self.instance_override {
            url.query_pairs_mut()
                .append_pair(INSTANCE_OVERRIDE_PARAM, instance);
        }
        Ok(url)
    }

    async fn start(
        &self,
        app_name: &str,
        app_instance: &str,
        request: &StartRequest,
    ) -> Result<StartResponse> {
        let url = self.build_url(&format!("app_i/{app_name}/{app_instance}"))?;
        let resp = self.http.post(url).json(request).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        if let Some(TerminationSignal::AuthenticationRequired) = classify(status.as_u16(), &body) {
            return Err(AppError::Unauthorized("start request rejected".into()));
        }

        let Some(envelope) = Envelope::parse(&body) else {
            warn!(%status, "start response is not an envelope");
            return Ok(StartResponse::Rejected(None));
        };

        if status != StatusCode::OK || envelope.status != EnvelopeStatus::Success {
            let message = envelope.reason().map(str::to_owned);
            return Ok(StartResponse::Rejected(message));
        }

        match envelope.data {
            Some(data) => Ok(StartResponse::Started(serde_json::from_value(data)?)),
            None => Ok(StartResponse::Rejected(None)),
        }
    }

    async fn status(&self, id: &str) -> Result<Option<Instance>> {
        let url = self.build_url(&format!("api/proxy/{id}"))?;
        let resp = self.http.get(url).send().await?;
        match success_data(resp).await {
            Ok(Some(data)) => Ok(Some(serde_json::from_value(data)?)),
            Ok(None) | Err(AppError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set_status(
        &self,
        id: &str,
        desired: DesiredStatus,
        parameters: Option<&Parameters>,
    ) -> Result<()> {
        let url = self.build_url(&format!("api/{id}/status"))?;
        let body = DesiredStatusBody {
            desired_state: desired,
            parameters,
        };
        let resp = self.http.put(url).json(&body).send().await?;
        success_data(resp).await.map(|_| ())
    }

    async fn watch(&self, id: &str, timeout_seconds: u64) -> Result<Option<Instance>> {
        let mut url = self.build_url(&format!("api/{id}/status"))?;
        url.query_pairs_mut()
            .append_pair("watch", "true")
            .append_pair("timeout", &timeout_seconds.to_string());
        let resp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(timeout_seconds) + self.watch_margin)
            .send()
            .await?;
        match success_data(resp).await {
            Ok(Some(data)) => Ok(Some(serde_json::from_value(data)?)),
            Ok(None) | Err(AppError::NotFound(_) | AppError::Protocol(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn send_heartbeat(&self, id: &str, timeout: Option<Duration>) -> Result<Liveness> {
        let url = self.build_url(&format!("heartbeat/{id}"))?;
        let mut request = self.http.post(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(Liveness::Alive);
        }
        let body = resp.bytes().await?;
        match classify(status.as_u16(), &body) {
            Some(signal) => Ok(Liveness::Terminated(signal)),
            None => {
                debug!(proxy_id = id, %status, "heartbeat rejected without a termination reason");
                Ok(Liveness::Unknown)
            }
        }
    }

    async fn probe(&self, public_path: &str) -> Result<Option<TerminationSignal>> {
        let url = self.build_url(public_path)?;
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if status != StatusCode::SERVICE_UNAVAILABLE && status != StatusCode::GONE {
            return Ok(None);
        }
        let body = resp.bytes().await?;
        Ok(classify(status.as_u16(), &body))
    }
}

/// Extract `data` from a `success` envelope, mapping failures to `AppError`.
async fn success_data(resp: Response) -> Result<Option<Value>> {
    let status = resp.status();
    let body = resp.bytes().await?;

    match classify(status.as_u16(), &body) {
        Some(TerminationSignal::AuthenticationRequired) => {
            return Err(AppError::Unauthorized(status.to_string()));
        }
        Some(TerminationSignal::InstanceGone) => {
            return Err(AppError::NotFound(status.to_string()));
        }
        Some(TerminationSignal::AppCrashed) | None => {}
    }

    match status {
        StatusCode::OK => {}
        StatusCode::UNAUTHORIZED => return Err(AppError::Unauthorized(status.to_string())),
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            return Err(AppError::NotFound(status.to_string()));
        }
        other => return Err(AppError::Protocol(format!("unexpected status {other}"))),
    }

    let envelope: Envelope = serde_json::from_slice(&body)?;
    if envelope.status != EnvelopeStatus::Success {
        return Err(AppError::Protocol(format!(
            "request not successful: {}",
            envelope.reason().unwrap_or("no reason given")
        )));
    }
    Ok(envelope.data)
}

impl StatusApi for HttpStatusClient {
    fn start_instance<'a>(
        &'a self,
        app_name: &'a str,
        app_instance: &'a str,
        request: &'a StartRequest,
    ) -> BoxFuture<'a, Result<StartResponse>> {
        Box::pin(self.start(app_name, app_instance, request))
    }

    fn get_status<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Instance>>> {
        Box::pin(self.status(id))
    }

    fn set_desired_status<'a>(
        &'a self,
        id: &'a str,
        desired: DesiredStatus,
        parameters: Option<&'a Parameters>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.set_status(id, desired, parameters))
    }

    fn watch_status<'a>(
        &'a self,
        id: &'a str,
        timeout_seconds: u64,
    ) -> BoxFuture<'a, Result<Option<Instance>>> {
        Box::pin(self.watch(id, timeout_seconds))
    }

    fn heartbeat<'a>(
        &'a self,
        id: &'a str,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<Liveness>> {
        Box::pin(self.send_heartbeat(id, timeout))
    }

    fn probe_app<'a>(
        &'a self,
        public_path: &'a str,
    ) -> BoxFuture<'a, Result<Option<TerminationSignal>>> {
        Box::pin(self.probe(public_path))
    }
}
