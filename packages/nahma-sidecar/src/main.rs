//! Nahma sidecar entry point: configuration, startup ordering, interval
//! tasks and graceful shutdown.
//!
//! Startup: open the store, register HTTP routes (specific before
//! catch-all), then bring up the metadata, document and relay listeners.
//! The invite GC ticker compares last-run-at stamps against the clock, so
//! a process that slept through several intervals runs one sweep, not a
//! flurry.
//!
//! Shutdown (ctrl-c): cancel the interval task, stop accepting on every
//! listener with a bounded grace period, drain the fan-out sets, close the
//! store last.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use nahma_core::time::now_millis;

use nahma_sidecar::relay::swarm::NullSwarmAdapter;
use nahma_sidecar::state::{
    SidecarConfig, SidecarState, INVITE_CLEANUP_INTERVAL_MS, NUCLEAR_CLEANUP_INTERVAL_MS,
};
use nahma_sidecar::{build_state, doc, http, load_or_create_master_key, meta, open_store, relay};

/// How long listeners get to flush in-flight frames on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The GC ticker granularity; actual sweep cadence is gated on last-run-at.
const CLEANUP_TICK: Duration = Duration::from_secs(60);

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "nahma-sidecar", version, about = "Nahma collaboration sidecar")]
struct Args {
    /// Metadata endpoint port
    #[arg(long, default_value_t = 8081, env = "SIDECAR_META_PORT")]
    meta_port: u16,

    /// Document (CRDT relay) endpoint port
    #[arg(long, default_value_t = 8080, env = "SIDECAR_YJS_PORT")]
    doc_port: u16,

    /// Relay plane endpoint port
    #[arg(long, default_value_t = 8082, env = "RELAY_PORT")]
    relay_port: u16,

    /// HTTP adjunct port (invite landing pages)
    #[arg(long, default_value_t = 3000, env = "PORT")]
    http_port: u16,

    /// Run without touching disk (in-memory store, ephemeral keys)
    #[arg(long, default_value_t = false, env = "NO_PERSIST")]
    no_persist: bool,

    /// Storage directory; defaults to ${HOME}/.nahma
    #[arg(long, env = "NAHMA_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> SidecarConfig {
        let storage_dir = self.storage_dir.unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".nahma")
        });
        SidecarConfig {
            meta_port: self.meta_port,
            doc_port: self.doc_port,
            relay_port: self.relay_port,
            http_port: self.http_port,
            storage_dir,
            no_persist: self.no_persist,
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nahma_sidecar=info,tower_http=info".into()),
        )
        .init();

    let config = Args::parse().into_config();

    // ── Startup: store, keys, state ───────────────────────────────────────

    let store = match open_store(&config) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open store");
            std::process::exit(1);
        }
    };
    let master_key = match load_or_create_master_key(&config.storage_dir, config.no_persist) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load storage master key");
            std::process::exit(1);
        }
    };

    let state = build_state(store, master_key, Arc::new(NullSwarmAdapter), config.clone());

    // ── Listeners ─────────────────────────────────────────────────────────

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    let http_app = http::router(state.clone())
        .layer(cors.clone())
        .layer(TraceLayer::new_for_http());
    let meta_app = meta::router(state.clone())
        .layer(cors.clone())
        .layer(TraceLayer::new_for_http());
    let doc_app = doc::router(state.clone())
        .layer(cors.clone())
        .layer(TraceLayer::new_for_http());
    let relay_app = relay::router(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let servers = vec![
        spawn_listener("http", config.http_port, http_app, &shutdown_tx).await,
        spawn_listener("meta", config.meta_port, meta_app, &shutdown_tx).await,
        spawn_listener("doc", config.doc_port, doc_app, &shutdown_tx).await,
        spawn_listener("relay", config.relay_port, relay_app, &shutdown_tx).await,
    ];

    // ── Invite GC + limiter upkeep ────────────────────────────────────────

    let cleanup_task = tokio::spawn(run_cleanup_loop(state.clone()));

    tracing::info!(
        meta = config.meta_port,
        doc = config.doc_port,
        relay = config.relay_port,
        http = config.http_port,
        "Nahma sidecar running"
    );

    // ── Shutdown ──────────────────────────────────────────────────────────

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");

    // 1. Cancel interval tasks
    cleanup_task.abort();

    // 2–3. Stop accepting and let in-flight frames flush, bounded
    let _ = shutdown_tx.send(());
    for server in servers {
        if tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
            tracing::warn!("Listener did not stop within grace period");
        }
    }

    // 4. Close live connections and drain fan-out sets
    state.drain_connections();

    // 5. Destroy the swarm adapter; the store flushes on drop
    state.swarm.destroy().await;
    tracing::info!("Shutdown complete");
}

/// Bind a listener and serve an app with graceful shutdown wired in.
async fn spawn_listener(
    name: &'static str,
    port: u16,
    app: axum::Router,
    shutdown_tx: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(endpoint = name, addr = addr.as_str(), error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(endpoint = name, addr = addr.as_str(), "Listening");

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(endpoint = name, error = %e, "Server error");
        }
    })
}

/// One ticker drives both invite sweeps, each gated on its own
/// last-run-at stamp. Sweep failures are logged and never break the loop.
async fn run_cleanup_loop(state: SidecarState) {
    let mut last_cleanup_at = now_millis();
    let mut last_nuclear_cleanup_at = now_millis();
    let mut interval = tokio::time::interval(CLEANUP_TICK);

    loop {
        interval.tick().await;
        let now = now_millis();

        if now - last_cleanup_at >= INVITE_CLEANUP_INTERVAL_MS {
            last_cleanup_at = now;
            match state.invites.expired_sweep(now) {
                Ok(0) => {}
                Ok(n) => tracing::info!(deleted = n, "Expired invite sweep"),
                Err(e) => tracing::error!(error = %e, "Expired invite sweep failed"),
            }
        }

        if now - last_nuclear_cleanup_at >= NUCLEAR_CLEANUP_INTERVAL_MS {
            last_nuclear_cleanup_at = now;
            match state.invites.nuclear_sweep(now) {
                Ok(0) => {}
                Ok(n) => tracing::info!(deleted = n, "Nuclear invite sweep"),
                Err(e) => tracing::error!(error = %e, "Nuclear invite sweep failed"),
            }
        }

        state.rate.cleanup();
    }
}
