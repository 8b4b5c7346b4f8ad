//! Federation-specific error types.

use thiserror::Error;
use uuid::Uuid;

use meridian_common::error::MeridianError;
use meridian_common::models::{DeliveryStatus, PeerStatus};
use meridian_db::StoreError;

/// Errors that can occur in federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    // ── Trust policy ────────────────────────────────────────────────────────

    #[error("Peer '{0}' not found")]
    PeerNotFound(String),

    #[error("Peer '{peer}' is {status}, not pending")]
    NotPending { peer: String, status: PeerStatus },

    #[error("Peer '{0}' may not federate")]
    PeerNotFederatable(String),

    #[error("Unsupported protocol version '{0}'")]
    UnsupportedProtocol(String),

    // ── Delivery ────────────────────────────────────────────────────────────

    #[error("Delivery receipt {0} not found")]
    ReceiptNotFound(Uuid),

    #[error("Delivery receipt {id} is {status} and cannot be retried")]
    ReceiptNotRetryable { id: Uuid, status: DeliveryStatus },

    #[error("Delivery receipt {id} is {status} and cannot be abandoned")]
    ReceiptNotAbandonable { id: Uuid, status: DeliveryStatus },

    // ── Key audit ───────────────────────────────────────────────────────────

    #[error("Key audit entry {0} not found")]
    AuditEntryNotFound(Uuid),

    #[error("Key audit entry {0} was already acknowledged")]
    AlreadyAcknowledged(Uuid),

    #[error("Signing key of '{0}' changed and awaits administrator review")]
    KeyChangePending(String),

    // ── Key management ──────────────────────────────────────────────────────

    #[error("No signing key found for key ID '{0}'")]
    KeyNotFound(String),

    #[error("Failed to load signing key: {0}")]
    KeyLoad(String),

    // ── Signature verification ───────────────────────────────────────────────

    #[error("Missing Authorization header on federated request")]
    MissingAuthHeader,

    #[error("Malformed Authorization header: {0}")]
    MalformedAuthHeader(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Request origin '{claimed}' does not match '{actual}'")]
    OriginMismatch { claimed: String, actual: String },

    // ── Remote communication ─────────────────────────────────────────────────

    #[error("HTTP error communicating with remote server '{0}': {1}")]
    RemoteHttp(String, String),

    #[error("Remote server '{0}' returned an unexpected response: {1}")]
    RemoteProtocol(String, String),

    // ── General ─────────────────────────────────────────────────────────────

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for FederationError {
    fn from(e: reqwest::Error) -> Self {
        let server = e.url().map(|u| u.host_str().unwrap_or("?").to_owned()).unwrap_or_default();
        FederationError::RemoteHttp(server, e.to_string())
    }
}

impl From<MeridianError> for FederationError {
    fn from(e: MeridianError) -> Self {
        match e {
            MeridianError::Validation { message } => FederationError::Validation(message),
            other => FederationError::Other(anyhow::anyhow!(other.to_string())),
        }
    }
}

impl From<FederationError> for MeridianError {
    fn from(e: FederationError) -> Self {
        use FederationError as F;
        match e {
            F::PeerNotFound(_) | F::ReceiptNotFound(_) | F::AuditEntryNotFound(_) | F::KeyNotFound(_) => {
                MeridianError::NotFound { resource: e.to_string() }
            }
            F::NotPending { .. }
            | F::ReceiptNotRetryable { .. }
            | F::ReceiptNotAbandonable { .. }
            | F::AlreadyAcknowledged(_) => MeridianError::conflict(e.to_string()),
            F::PeerNotFederatable(_) | F::KeyChangePending(_) => MeridianError::forbidden(e.to_string()),
            F::UnsupportedProtocol(_) | F::Validation(_) => {
                MeridianError::Validation { message: e.to_string() }
            }
            F::MissingAuthHeader | F::MalformedAuthHeader(_) | F::InvalidSignature | F::OriginMismatch { .. } => {
                MeridianError::Unauthorized
            }
            F::RemoteHttp(..) | F::RemoteProtocol(..) => MeridianError::Upstream { message: e.to_string() },
            F::Store(inner) => inner.into(),
            F::KeyLoad(_) | F::Serialisation(_) | F::UrlParse(_) => {
                MeridianError::Internal(anyhow::anyhow!(e.to_string()))
            }
            F::Other(inner) => MeridianError::Internal(inner),
        }
    }
}

// ─── Delivery failures ───────────────────────────────────────────────────────

/// Outcome of one failed network delivery, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Timeouts, refused connections, 5xx, 408 and 429. Eligible for retry.
    #[error("{0}")]
    Transient(String),

    /// Rejections and malformed responses. Never retried automatically.
    #[error("{0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status returned by a peer or bridge endpoint.
    pub fn from_status(status: u16, context: &str) -> Self {
        let message = format!("{context} returned HTTP {status}");
        match status {
            408 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Permanent(message),
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), "remote");
        }
        if e.is_decode() || e.is_builder() {
            Self::Permanent(e.to_string())
        } else {
            // Timeouts, connect failures and broken bodies.
            Self::Transient(e.to_string())
        }
    }
}
