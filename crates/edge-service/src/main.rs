use anyhow::{Context, Result};
use edge_service::{
    config::{EdgeServiceConfig, EdgeStoreType},
    create_router,
    pg_store::PgEdgeEventStore,
    state::EdgeState,
    store::{EdgeEventStore, MemoryEdgeEventStore},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _logging = telemetry::init_with_service("edge-service")?;

    let config = EdgeServiceConfig::from_env()?;
    let bind_addr = config.bind_addr;

    let store: Arc<dyn EdgeEventStore> = match config.store_type {
        EdgeStoreType::Memory => {
            warn!("using in-memory edge event store; records are lost on restart");
            Arc::new(MemoryEdgeEventStore::new())
        }
        EdgeStoreType::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL required for Postgres")?;
            info!("using PostgreSQL edge event store");
            Arc::new(PgEdgeEventStore::connect(database_url).await?)
        }
    };

    let shutdown = CancellationToken::new();
    let state = EdgeState::new(config, store, shutdown.clone())?;

    state
        .blobs()
        .init()
        .await
        .context("failed to create upload directory")?;

    if state.timelapse().encoder_available().await {
        info!(ffmpeg = %state.config().ffmpeg_path.display(), "timelapse encoder found");
    } else {
        warn!(
            ffmpeg = %state.config().ffmpeg_path.display(),
            "timelapse encoder not found; timelapse requests will fail"
        );
    }

    let app = create_router(state.clone());
    let listener = TcpListener::bind(bind_addr).await?;

    info!(
        addr = %bind_addr,
        storage_root = %state.config().storage_root.display(),
        "edge-service listening"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, cancelling timelapse runs");
    shutdown.cancel();
}
