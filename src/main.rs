use std::sync::Arc;

use job_worker::config::WorkerConfig;
use job_worker::providers::ProviderRegistry;
use job_worker::store::{JobStore, LibSqlBackend};
use job_worker::worker::{ProcessExecutor, Worker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env()?;

    eprintln!("Job worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Owner: {}", config.owner.as_deref().unwrap_or("(all)"));
    match config.default_timeout {
        Some(t) => eprintln!("   Default timeout: {} ms", t.as_millis()),
        None => eprintln!("   Default timeout: none"),
    }
    eprintln!("   Press Ctrl-C to stop.\n");

    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path.display(), e);
                std::process::exit(1);
            }),
    );

    let registry = ProviderRegistry::builtin(ProcessExecutor::new(config.kill_grace));
    tracing::info!(providers = ?registry.names(), "Providers registered");

    let handle = Worker::spawn(config, store, registry);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");
    handle.shutdown();
    handle.join().await;

    Ok(())
}
