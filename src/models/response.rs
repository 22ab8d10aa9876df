//! Response envelope and termination-signal classification.
//!
//! Every endpoint answers with `{"status": ..., "data": ..., "message": ...}`.
//! Two encodings of the termination reasons exist in the wild: the legacy one
//! (`status = "error"`, reason in `message`) and the current one
//! (`status = "fail"`, reason in `data`). Both are recognised.

use serde::Deserialize;
use serde_json::Value;

/// Reason string: the instance was stopped or never existed.
pub const APP_STOPPED_OR_NON_EXISTENT: &str = "app_stopped_or_non_existent";
/// Reason string: the instance's container crashed.
pub const APP_CRASHED: &str = "app_crashed";
/// Reason string: the user's proxy session expired.
pub const AUTHENTICATION_REQUIRED: &str = "shinyproxy_authentication_required";

/// Envelope status field.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    /// Request succeeded; `data` carries the payload.
    Success,
    /// Request rejected for a domain reason carried in `data`.
    Fail,
    /// Request rejected; reason carried in `message`.
    Error,
}

/// Generic response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Outcome of the request.
    pub status: EnvelopeStatus,
    /// Payload or failure reason.
    #[serde(default)]
    pub data: Option<Value>,
    /// Human-readable failure reason.
    #[serde(default)]
    pub message: Option<String>,
}

impl Envelope {
    /// Parse an envelope from a raw body, `None` when it is not one.
    #[must_use]
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    /// The textual reason of a `fail`/`error` envelope.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self.status {
            EnvelopeStatus::Success => None,
            EnvelopeStatus::Fail => self
                .data
                .as_ref()
                .and_then(Value::as_str)
                .or(self.message.as_deref()),
            EnvelopeStatus::Error => self
                .message
                .as_deref()
                .or_else(|| self.data.as_ref().and_then(Value::as_str)),
        }
    }
}

/// Authoritative termination signal carried by a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationSignal {
    /// The instance no longer exists.
    InstanceGone,
    /// The instance's application crashed.
    AppCrashed,
    /// The user must log in again.
    AuthenticationRequired,
}

impl TerminationSignal {
    /// Map a reason string to a signal.
    #[must_use]
    pub fn from_reason(reason: &str) -> Option<Self> {
        match reason {
            APP_STOPPED_OR_NON_EXISTENT => Some(Self::InstanceGone),
            APP_CRASHED => Some(Self::AppCrashed),
            AUTHENTICATION_REQUIRED => Some(Self::AuthenticationRequired),
            _ => None,
        }
    }

    /// Wire reason string.
    #[must_use]
    pub fn as_reason(self) -> &'static str {
        match self {
            Self::InstanceGone => APP_STOPPED_OR_NON_EXISTENT,
            Self::AppCrashed => APP_CRASHED,
            Self::AuthenticationRequired => AUTHENTICATION_REQUIRED,
        }
    }
}

/// HTTP status codes on which a termination body is looked for.
#[must_use]
pub fn may_carry_termination(status: u16) -> bool {
    matches!(status, 401 | 410 | 503)
}

/// Classify a response observed anywhere (heartbeat, embedded content, probe).
///
/// Returns `None` for every response that does not prove termination,
/// including unparseable bodies.
#[must_use]
pub fn classify(status: u16, body: &[u8]) -> Option<TerminationSignal> {
    if !may_carry_termination(status) {
        return None;
    }
    let envelope = Envelope::parse(body)?;
    envelope.reason().and_then(TerminationSignal::from_reason)
}
