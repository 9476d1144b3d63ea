use anyhow::Result;
use axum::Router;
use std::io::ErrorKind;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;


#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-ingest with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Wire topic, queue and engine ---
    let state = state::AppState::new(db.clone(), &cfg);
    let dispatcher = state.dispatcher(cfg.dispatcher.clone());
    let shutdown = CancellationToken::new();

    let dispatcher_task = {
        let shutdown = shutdown.clone();
        let health = state.health.clone();
        tokio::spawn(async move { dispatcher.run(shutdown, health).await })
    };
    let engine_task = {
        let engine = state.engine.clone();
        let shutdown = shutdown.clone();
        let health = state.health.clone();
        tokio::spawn(async move { engine.run(shutdown, health).await })
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!(
        worker_id = %cfg.worker_id,
        "Server listening on http://{}",
        listener.local_addr()?
    );
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", err);
            }
            tracing::info!("Shutdown requested, draining workers");
            server_shutdown.cancel();
        })
        .await?;

    // Server may also stop on its own; make sure the workers stop with it.
    shutdown.cancel();
    let (dispatcher_result, engine_result) = tokio::join!(dispatcher_task, engine_task);
    dispatcher_result?;
    engine_result?;

    tracing::info!("Shutdown complete.");
    Ok(())
}
