use axum::serve;
use osb_manager::api::routes::create_app;
use osb_manager::api::AppState;
use osb_manager::build_interceptors;
use osb_manager::config::{AppConfig, StorageBackend};
use osb_manager::operations::{Maintainer, Scheduler};
use osb_manager::osb::HttpClientFactory;
use osb_manager::store::{InMemoryRepository, PostgresRepository, TransactionalRepository};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .init();

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: server={}, storage={:?}",
        config.server_address(),
        config.storage.backend
    );

    let repository: Arc<dyn TransactionalRepository> = match config.storage.backend {
        StorageBackend::Postgres => {
            log::info!("Connecting to PostgreSQL...");
            let database_url = config.database_url()?;
            let postgres = PostgresRepository::new(
                &database_url,
                config.database.max_connections.unwrap_or(20),
            )
            .await?;
            postgres.migrate().await?;
            log::info!("Database ready");
            Arc::new(postgres)
        }
        StorageBackend::Memory => {
            log::warn!("Using in-memory storage; state is lost on restart");
            Arc::new(InMemoryRepository::new())
        }
    };

    let clients = Arc::new(HttpClientFactory::new(
        &config.osb.api_version,
        config.request_timeout(),
    ));
    let interceptable = Arc::new(build_interceptors(
        repository,
        clients,
        config.osb_settings(),
    )?);

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        interceptable,
        config.scheduler_settings(),
        shutdown.clone(),
    ));
    let maintainer = Maintainer::new(scheduler.clone(), config.maintainer_settings());

    let worker_pool = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };
    // Nothing of this process is polling yet, so every interrupted operation resumes
    match maintainer.resume_rescheduled_operations(Duration::ZERO).await {
        Ok(0) => {}
        Ok(resumed) => log::info!("Resumed {} interrupted operation(s)", resumed),
        Err(err) => log::error!("Failed to resume interrupted operations: {}", err),
    }
    let sweeps = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { maintainer.run(shutdown).await })
    };

    let app = create_app(AppState::new(scheduler));
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("OSB manager running on http://{}", bind_address);

    let signal = shutdown.clone();
    serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", err);
            }
            log::info!("Shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(worker_pool, sweeps);
    Ok(())
}
