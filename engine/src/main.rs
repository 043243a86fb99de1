use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use signage_engine::engine::Engine;
use signage_engine::roles;
use signage_engine::routes::build_router;
use signage_engine::settings::EngineSettings;
use signage_engine::signing::Signer;
use signage_engine::store::Store;
use signage_engine::uploads;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let settings = EngineSettings::from_env()?;

    // --- Persisted state ---
    let store = Store::new(settings.config_path.clone());
    let loaded = store
        .load()
        .with_context(|| format!("loading {}", store.path().display()))?;
    if loaded.first_boot {
        info!(path = %store.path().display(), "no saved configuration, starting fresh");
    }

    // Keys live for the lifetime of the process; secondaries refetch on mismatch.
    let signer = Signer::generate(settings.rsa_bits)
        .await
        .context("generating signing key")?;

    let (roles_tx, roles_rx) = mpsc::channel(16);
    let addr = settings.bind;
    let engine = Arc::new(Engine::new(settings, store, loaded, signer, roles_tx));

    // Dropping the watcher stops it.
    let _watcher = uploads::watch(engine.clone()).context("watching uploads directory")?;

    let shutdown = CancellationToken::new();
    let supervisor = tokio::spawn(roles::supervise(engine.clone(), roles_rx, shutdown.clone()));

    let app = build_router(engine).into_make_service_with_connect_info::<SocketAddr>();

    info!("Signage engine starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = supervisor.await {
        warn!("role supervisor ended abnormally: {e}");
    }
    info!("Signage engine stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
