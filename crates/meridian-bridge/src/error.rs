//! Bridge errors.

use thiserror::Error;
use uuid::Uuid;

use meridian_common::error::MeridianError;
use meridian_common::models::BridgeType;
use meridian_db::StoreError;
use meridian_federation::{DeliveryError, FederationError};

#[derive(Debug, Error)]
pub enum BridgeError {
    // ── Policy ──────────────────────────────────────────────────────────────

    #[error("Bridge connection {0} not found")]
    NotFound(Uuid),

    #[error("Channel mapping {0} not found")]
    MappingNotFound(Uuid),

    #[error("A {0} bridge to this remote already exists in the guild")]
    DuplicateConnection(BridgeType),

    #[error("This channel pair is already mapped on the bridge")]
    DuplicateMapping,

    #[error("Bridge connection {0} is not connected")]
    NotConnected(Uuid),

    #[error("No connector is available for {0} bridges")]
    Unsupported(BridgeType),

    #[error("Invalid bridge config: {0}")]
    InvalidConfig(String),

    #[error("Inbound request was not authenticated")]
    Unauthenticated,

    // ── Remote ──────────────────────────────────────────────────────────────

    #[error("Remote returned HTTP {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected response from remote: {0}")]
    Protocol(String),

    #[error("Timed out talking to remote")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── General ─────────────────────────────────────────────────────────────

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Delivery(#[from] FederationError),
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            BridgeError::Remote { status: status.as_u16(), body: String::new() }
        } else if e.is_decode() {
            BridgeError::Protocol(e.to_string())
        } else if e.is_timeout() {
            BridgeError::Timeout
        } else {
            BridgeError::Http(e.to_string())
        }
    }
}

impl From<MeridianError> for BridgeError {
    fn from(e: MeridianError) -> Self {
        BridgeError::Validation(e.to_string())
    }
}

impl BridgeError {
    /// Classification for the delivery engine's retry policy.
    pub fn into_delivery_error(self) -> DeliveryError {
        match self {
            BridgeError::Remote { status, .. } => DeliveryError::from_status(status, "bridge remote"),
            e @ (BridgeError::Http(_)
            | BridgeError::Timeout
            | BridgeError::Io(_)
            | BridgeError::NotConnected(_)
            | BridgeError::Store(_)) => DeliveryError::Transient(e.to_string()),
            other => DeliveryError::Permanent(other.to_string()),
        }
    }
}

impl From<BridgeError> for MeridianError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::NotFound(_) | BridgeError::MappingNotFound(_) => {
                MeridianError::NotFound { resource: e.to_string() }
            }
            BridgeError::DuplicateConnection(_) | BridgeError::DuplicateMapping | BridgeError::NotConnected(_) => {
                MeridianError::conflict(e.to_string())
            }
            BridgeError::Unsupported(_) | BridgeError::InvalidConfig(_) | BridgeError::Validation(_) => {
                MeridianError::Validation { message: e.to_string() }
            }
            BridgeError::Unauthenticated => MeridianError::Unauthorized,
            BridgeError::Remote { .. } | BridgeError::Http(_) | BridgeError::Protocol(_) | BridgeError::Timeout => {
                MeridianError::Upstream { message: e.to_string() }
            }
            BridgeError::Io(inner) => MeridianError::Internal(inner.into()),
            BridgeError::Store(inner) => inner.into(),
            BridgeError::Delivery(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_failures_are_classified() {
        let e = BridgeError::Remote { status: 502, body: String::new() }.into_delivery_error();
        assert!(e.is_transient());
        let e = BridgeError::Remote { status: 403, body: String::new() }.into_delivery_error();
        assert!(!e.is_transient());
        assert!(BridgeError::Timeout.into_delivery_error().is_transient());
        assert!(!BridgeError::InvalidConfig("x".into()).into_delivery_error().is_transient());
    }

    #[test]
    fn duplicate_mapping_is_a_conflict() {
        assert_eq!(MeridianError::from(BridgeError::DuplicateMapping).status_code().as_u16(), 409);
    }
}
