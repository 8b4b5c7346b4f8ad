//! Turning a peer's server name into the base URL its federation API lives at.
//!
//! Lookup order for a name:
//!
//! 1. an operator override from `federation.peer_overrides`
//! 2. the name itself when it carries a port (`peer.example:9000`, `[::1]:8448`)
//! 3. the delegation served at `https://<name>/.well-known/meridian/server`
//! 4. `https://<name>:8448`
//!
//! Overrides never expire. Other answers are cached for the configured TTL,
//! except the port-8448 fallback, which is re-checked hourly so a newly
//! published delegation is picked up.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;
use tracing::debug;

use crate::{error::FederationError, types::WellKnownServer};

pub const DEFAULT_FED_PORT: u16 = 8448;
pub const WELL_KNOWN_PATH: &str = "/.well-known/meridian/server";

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FALLBACK_TTL: Duration = Duration::from_secs(60 * 60);

/// Which lookup step produced a base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Override,
    ExplicitPort,
    WellKnown,
    Fallback,
}

impl Via {
    fn lifetime(self, ttl: Duration) -> Option<Duration> {
        match self {
            Via::Override => None,
            Via::Fallback => Some(ttl.min(FALLBACK_TTL)),
            Via::ExplicitPort | Via::WellKnown => Some(ttl),
        }
    }
}

#[derive(Debug, Clone)]
struct Resolved {
    base_url: String,
    via: Via,
    at: Instant,
}

/// Shared, clonable resolver with a per-name cache.
#[derive(Debug, Clone)]
pub struct DiscoveryCache {
    entries: Arc<RwLock<HashMap<String, Resolved>>>,
    overrides: Arc<HashMap<String, String>>,
    ttl: Duration,
    http: reqwest::Client,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(concat!("Meridian-Federation/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build discovery http client");
        Self { entries: Arc::default(), overrides: Arc::default(), ttl, http }
    }

    /// Pin server names to fixed base URLs. Keys are matched case-insensitively;
    /// values may use plain `http://` for local deployments.
    pub fn with_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.overrides = Arc::new(
            overrides
                .into_iter()
                .map(|(name, url)| (name.to_ascii_lowercase(), url.trim_end_matches('/').to_owned()))
                .collect(),
        );
        self
    }

    pub async fn resolve(&self, server_name: &str) -> Result<String, FederationError> {
        Ok(self.lookup(server_name).await?.0)
    }

    /// Like [`resolve`](Self::resolve), also reporting which step answered.
    pub async fn lookup(&self, server_name: &str) -> Result<(String, Via), FederationError> {
        let name = server_name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(FederationError::Validation("empty server name".into()));
        }
        if let Some(url) = self.overrides.get(&name) {
            return Ok((url.clone(), Via::Override));
        }

        if let Some(hit) = self.cached(&name).await {
            debug!(server = %name, base = %hit.base_url, via = ?hit.via, "Discovery cache hit");
            return Ok((hit.base_url, hit.via));
        }

        let (base_url, via) = match split_port(&name) {
            (_, Some(_)) => (format!("https://{name}"), Via::ExplicitPort),
            (host, None) => match self.delegation(host).await {
                Some(delegated) => (base_url_for(&delegated), Via::WellKnown),
                None => (format!("https://{host}:{DEFAULT_FED_PORT}"), Via::Fallback),
            },
        };
        debug!(server = %name, base = %base_url, ?via, "Discovered peer");

        self.entries
            .write()
            .await
            .insert(name, Resolved { base_url: base_url.clone(), via, at: Instant::now() });
        Ok((base_url, via))
    }

    /// Forget the cached answer for a peer, typically after a connection failure.
    pub async fn invalidate(&self, server_name: &str) {
        self.entries.write().await.remove(&server_name.to_ascii_lowercase());
    }

    async fn cached(&self, name: &str) -> Option<Resolved> {
        let entries = self.entries.read().await;
        let entry = entries.get(name)?;
        match entry.via.lifetime(self.ttl) {
            Some(lifetime) if entry.at.elapsed() >= lifetime => None,
            _ => Some(entry.clone()),
        }
    }

    async fn delegation(&self, host: &str) -> Option<String> {
        let resp = self.http.get(format!("https://{host}{WELL_KNOWN_PATH}")).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let doc: WellKnownServer = resp.json().await.ok()?;
        let server = doc.server.trim();
        (!server.is_empty()).then(|| server.to_owned())
    }
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

fn base_url_for(server: &str) -> String {
    match split_port(server) {
        (_, Some(_)) => format!("https://{server}"),
        (host, None) => format!("https://{host}:{DEFAULT_FED_PORT}"),
    }
}

/// Split `host[:port]`, understanding bracketed IPv6 literals. A bare IPv6
/// address has no port.
fn split_port(name: &str) -> (&str, Option<u16>) {
    if let Some(rest) = name.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host, tail.strip_prefix(':').and_then(|p| p.parse().ok()));
        }
    }
    match name.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (name, None),
        },
        _ => (name, None),
    }
}
