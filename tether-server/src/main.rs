use std::sync::Arc;

use clap::Parser;
use tether_core::config::StorageBackend;
use tether_core::{
    ConnectionStore, MemoryConnectionStore, MessagingClient, PgConnectionStore, SidecarClient,
    TetherConfig,
};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use tether_server::http::{start_http_server, HttpState};
use tether_server::subsystems::sweeper::run_sweeper_loop;
use tether_server::ConnectionService;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "tether.toml")]
    config: String,

    /// Check database connectivity and exit
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match TetherConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.clone()));
    fmt().with_env_filter(filter).init();

    // Storage
    let (store, pool) = match config.storage.backend {
        StorageBackend::Postgres => {
            let pool = match tether_core::db::create_pool(&config.database).await {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            };

            if args.health {
                match tether_core::db::health_check(&pool).await {
                    Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                    Err(e) => {
                        println!("❌ PostgreSQL connection failed: {}", e);
                        std::process::exit(1);
                    }
                }
                println!("✅ Tether DB health check passed");
                return Ok(());
            }

            tether_core::db::ensure_schema(&pool).await?;
            let store: Arc<dyn ConnectionStore> = Arc::new(PgConnectionStore::new(pool.clone()));
            (store, Some(pool))
        }
        StorageBackend::Memory => {
            if args.health {
                println!("✅ In-memory storage, nothing to check");
                return Ok(());
            }
            tracing::warn!("Using in-memory storage: connections will not survive a restart");
            let store: Arc<dyn ConnectionStore> = Arc::new(MemoryConnectionStore::new());
            (store, None)
        }
    };

    // Messaging client
    let client: Arc<dyn MessagingClient> = Arc::new(SidecarClient::new(
        config.sidecar.clone(),
        config.session.event_buffer,
    )?);

    let service = Arc::new(ConnectionService::new(store, client, &config));

    let (tx, mut shutdown) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    // Restore sessions persisted as ready
    let restore_service = service.clone();
    tokio::spawn(async move {
        if let Err(e) = restore_service.restore_all().await {
            tracing::error!("Session restoration failed: {}", e);
        }
    });

    // Spawn cleanup background loop
    if config.cleanup.enabled {
        tokio::spawn(run_sweeper_loop(
            service.sweeper(),
            config.cleanup.interval_minutes,
            tx.subscribe(),
        ));
    }

    // Spawn HTTP REST API server if enabled
    if config.http.enabled {
        let state = Arc::new(HttpState {
            service: service.clone(),
            pool,
            config: config.clone(),
        });
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let _ = shutdown.recv().await;

    service.shutdown().await;
    tracing::info!("Tether stopped");
    Ok(())
}
