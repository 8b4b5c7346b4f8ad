//! # Meridian Server
//!
//! Main binary that wires every Meridian service into one process:
//! - storage (PostgreSQL, or in-process maps when no database is configured)
//! - federation: signing key, peer registry, trust, key audit, admission gate
//! - the delivery engine with its worker pool and retry scanner
//! - bridges and their connectors
//! - the HTTP API (operator routes and server-to-server endpoints)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{broadcast, mpsc};

use meridian_api::{build_router, AppState};
use meridian_bridge::{BridgeDelivery, BridgeManager, ConnectorRegistry, TargetRouter};
use meridian_common::config::{AppConfig, LogFormat};
use meridian_common::inbound_event::InboundEvent;
use meridian_db::{Database, Stores};
use meridian_federation::scheduler::{dispatch_channel, recover_inflight, spawn_workers};
use meridian_federation::{
    DeliveryEngine, DiscoveryCache, FederationClient, InboundGate, KeyAuditor, KeyManager, PeerRegistry, RetryPolicy,
    RetryScanner, TrustPolicy, TrustStateMachine,
};

/// Inbound events waiting for the local message pipeline.
const EVENT_BUFFER: usize = 10_000;
/// Events pushed by session-based bridge connectors (IRC).
const BRIDGE_SINK_BUFFER: usize = 1_024;

#[derive(Debug, Parser)]
#[command(name = "meridian", version, about = "Federation trust, delivery and bridging server")]
struct Cli {
    /// Configuration file, without extension (`config` finds `config.toml`).
    #[arg(long, env = "MERIDIAN_CONFIG", default_value = "config")]
    config: PathBuf,

    /// Do not run database migrations at startup.
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = meridian_common::config::init(&cli.config.to_string_lossy())?;
    init_tracing(config);

    tracing::info!("Starting Meridian v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(server = %config.server.name, "Federation identity");

    // === Storage ===
    let (stores, storage_mode) = match &config.database.url {
        Some(url) => {
            let db = Database::connect(&config.database, url).await?;
            if cli.skip_migrations {
                tracing::warn!("Skipping database migrations");
            } else {
                db.migrate().await?;
            }
            (Stores::postgres(&db), "postgres")
        }
        None => {
            tracing::warn!("No database configured; running in lite mode with in-process storage");
            (Stores::in_memory(), "memory")
        }
    };

    // === Federation identity ===
    let key_pair = KeyManager::new(stores.signing_keys.clone())
        .load_or_generate(config.federation.signing_key_seed.as_deref())
        .await?;
    let local = PeerRegistry::register_local(stores.peers.as_ref(), &config.server.name, &key_pair).await?;
    tracing::info!(key_id = %key_pair.key_id, fingerprint = %key_pair.fingerprint(), "Federation signing key ready");

    let trust = Arc::new(TrustStateMachine::new(stores.peers.clone(), local.id));
    let auditor = Arc::new(KeyAuditor::new(
        stores.peers.clone(),
        stores.key_audits.clone(),
        config.federation.key_change_policy,
    ));
    let registry = Arc::new(PeerRegistry::new(stores.peers.clone(), trust.clone(), auditor.clone()));
    let discovery = DiscoveryCache::new(config.federation.discovery_ttl())
        .with_overrides(config.federation.peer_overrides.clone());
    let client = Arc::new(FederationClient::new(&local.domain, key_pair.clone()).with_discovery(discovery));
    let gate = Arc::new(InboundGate::new(
        &local.domain,
        stores.peers.clone(),
        trust.clone(),
        auditor.clone(),
        client.clone(),
    ));

    // === Bridges and delivery ===
    let (bridge_sink, bridge_events) = mpsc::channel(BRIDGE_SINK_BUFFER);
    let connectors = Arc::new(ConnectorRegistry::with_defaults(config.bridges.connect_timeout(), bridge_sink));
    let bridge_delivery = Arc::new(BridgeDelivery::new(stores.bridges.clone(), connectors.clone()));
    let router = Arc::new(TargetRouter::new(
        Arc::new(TrustPolicy::new(stores.peers.clone(), trust.clone())),
        client.clone(),
        bridge_delivery,
    ));

    let (jobs_tx, jobs_rx) = dispatch_channel();
    let engine = Arc::new(
        DeliveryEngine::new(
            stores.receipts.clone(),
            router.clone(),
            router,
            local.domain.clone(),
            config.federation.attempt_timeout(),
            RetryPolicy::from_config(&config.federation),
        )
        .with_dispatcher(jobs_tx),
    );

    let _workers = spawn_workers(engine.clone(), jobs_rx, config.federation.worker_concurrency);
    let recovered = recover_inflight(&engine).await?;
    if recovered > 0 {
        tracing::info!(recovered, "Re-dispatched in-flight deliveries");
    }
    let scanner = RetryScanner::new(engine.clone(), config.federation.scan_interval(), config.federation.scan_batch);
    let scanner = tokio::spawn(scanner.run());

    let (events, _) = broadcast::channel::<InboundEvent>(EVENT_BUFFER);
    let bridges = Arc::new(BridgeManager::new(
        stores.bridges.clone(),
        connectors,
        engine.clone(),
        events.clone(),
        config.bridges.connect_timeout(),
    ));
    let _pump = bridges.clone().spawn_inbound_pump(bridge_events);
    // Sessions from a previous process are gone; reopen or mark them errored.
    let resuming = bridges.clone();
    tokio::spawn(async move {
        if let Err(e) = resuming.resume_sessions().await {
            tracing::warn!(error = %e, "Failed to resume bridge sessions");
        }
    });

    // === HTTP API ===
    let state = AppState {
        server_name: local.domain.clone(),
        storage_mode,
        jwt_secret: jwt_secret(config),
        key_pair,
        client,
        peers: stores.peers.clone(),
        registry,
        trust,
        auditor,
        gate,
        engine,
        bridges,
        events,
        started_at: Instant::now(),
    };
    let app = build_router(state);

    let addr = SocketAddr::new(
        config.server.host.parse().context("server.host is not an IP address")?,
        config.server.port,
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP listening on http://{addr}");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    scanner.abort();
    tracing::info!("Meridian stopped");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "meridian=debug,tower_http=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match config.log.format {
        LogFormat::Pretty => builder.with_thread_ids(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// The configured operator token secret. Without one, operator routes are
/// locked behind a random secret nobody holds.
fn jwt_secret(config: &AppConfig) -> String {
    if !config.auth.jwt_secret.is_empty() {
        return config.auth.jwt_secret.clone();
    }
    tracing::warn!("auth.jwt_secret is not set; operator routes will reject every token");
    hex::encode(rand::random::<[u8; 32]>())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
