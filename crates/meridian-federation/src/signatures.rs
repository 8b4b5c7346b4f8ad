//! Federation request signing and verification.
//!
//! All server-to-server HTTP requests carry a signed Authorization header:
//!
//! ```text
//! Authorization: MeridianFederation origin="chat.example.org",
//!                key="ed25519:3f9a2c1b0d4e",
//!                sig="<base64url-encoded-signature>"
//! ```
//!
//! The signed content is the canonical JSON of a request object:
//!
//! ```json
//! {
//!   "method":      "PUT",
//!   "uri":         "/_meridian/federation/v1/send/txnABC",
//!   "origin":      "chat.example.org",
//!   "destination": "chat.other.tld",
//!   "content":     { ... }   // only present for PUT/POST
//! }
//! ```

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    error::FederationError,
    keys::{verify_signature, ServerKeyPair},
};

const SCHEME: &str = "MeridianFederation";

// ─── Signing ─────────────────────────────────────────────────────────────────

/// A parsed or freshly signed request authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FedAuth {
    pub origin: String,
    pub key_id: String,
    pub sig: String,
}

impl FedAuth {
    /// Build the `Authorization: MeridianFederation …` header value.
    pub fn to_header(&self) -> String {
        format!(
            r#"{SCHEME} origin="{}",key="{}",sig="{}""#,
            self.origin, self.key_id, self.sig,
        )
    }

    /// Parse the `MeridianFederation` Authorization header.
    pub fn parse(header: &str) -> Result<Self, FederationError> {
        let header = header
            .strip_prefix(SCHEME)
            .and_then(|h| h.strip_prefix(' '))
            .ok_or_else(|| {
                FederationError::MalformedAuthHeader(format!("must start with '{SCHEME} '"))
            })?;

        let mut origin = None;
        let mut key = None;
        let mut sig = None;

        for part in header.split(',') {
            let part = part.trim();
            if let Some(v) = part.strip_prefix("origin=\"").and_then(|s| s.strip_suffix('"')) {
                origin = Some(v.to_owned());
            } else if let Some(v) = part.strip_prefix("key=\"").and_then(|s| s.strip_suffix('"')) {
                key = Some(v.to_owned());
            } else if let Some(v) = part.strip_prefix("sig=\"").and_then(|s| s.strip_suffix('"')) {
                sig = Some(v.to_owned());
            }
        }

        Ok(Self {
            origin: origin
                .ok_or_else(|| FederationError::MalformedAuthHeader("missing 'origin'".into()))?,
            key_id: key.ok_or_else(|| FederationError::MalformedAuthHeader("missing 'key'".into()))?,
            sig: sig.ok_or_else(|| FederationError::MalformedAuthHeader("missing 'sig'".into()))?,
        })
    }
}

/// Sign an outbound federation request.
///
/// * `method`: HTTP method, any case (e.g. `"PUT"`)
/// * `uri`: request path + query (e.g. `"/_meridian/federation/v1/send/txn1"`)
/// * `content`: request body (pass `None` for GET requests)
pub fn sign_request(
    kp: &ServerKeyPair,
    origin: &str,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> FedAuth {
    let canonical = build_signing_object(origin, destination, method, uri, content);
    let sig = kp.sign_json(&canonical);
    FedAuth { origin: origin.to_owned(), key_id: kp.key_id.clone(), sig }
}

/// Verify an already parsed inbound request authorization.
///
/// `destination` is this server's name; it must match what the sender signed.
pub fn verify_request(
    auth: &FedAuth,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
    pubkey_base64: &str,
) -> Result<(), FederationError> {
    let canonical = build_signing_object(&auth.origin, destination, method, uri, content);
    verify_signature(pubkey_base64, &auth.sig, canonical.as_bytes())
}

// ─── Internals ───────────────────────────────────────────────────────────────

/// Build the canonical JSON string that is signed for an HTTP request.
fn build_signing_object(
    origin: &str,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> String {
    let mut map = serde_json::Map::new();
    map.insert("method".into(), Value::String(method.to_uppercase()));
    map.insert("uri".into(), Value::String(uri.to_owned()));
    map.insert("origin".into(), Value::String(origin.to_owned()));
    map.insert("destination".into(), Value::String(destination.to_owned()));
    if let Some(body) = content {
        map.insert("content".into(), body.clone());
    }
    canonical_json(&Value::Object(map))
}

/// Produce canonical JSON (sorted keys at every depth, no extra whitespace).
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect();
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
