use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use memtap_core::store::{HttpMemoryStoreClient, MemoryStore, RetryPolicy};
use memtap_core::MemtapConfig;

use memtap_server::boundary;
use memtap_server::server::{self, FacadeState};
use memtap_server::subsystems::reflect::{run_reflection_loop, ReflectionEngine, ReflectionHandle};
use memtap_server::subsystems::sync::{run_sync_loop, SyncHandle};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "memtap.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match MemtapConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging. RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.clone()));
    fmt().with_env_filter(filter).init();

    // Store client
    let store: Arc<dyn MemoryStore> = match HttpMemoryStoreClient::new(&config.store) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to create store client: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match store.list(&config.identity.default_user_id).await {
            Ok(records) => {
                println!("✅ Memory store reachable: {} memories", records.len());
            }
            Err(e) => {
                println!("❌ Memory store unreachable: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Memtap health check passed");
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let queue_capacity = config.intercept.queue_capacity;
    let (sync_handle, sync_rx) = SyncHandle::channel(queue_capacity);
    let (reflection_handle, reflection_rx) = ReflectionHandle::channel(queue_capacity);

    // Sync loop: the single writer toward the store.
    tokio::spawn(run_sync_loop(
        sync_rx,
        sync_handle.clone(),
        store.clone(),
        RetryPolicy::from_config(&config.store),
        config.sync.clone(),
        reflection_handle.clone(),
        tx.subscribe(),
    ));

    // Reflection loop
    let engine = ReflectionEngine::new(store.clone(), sync_handle.clone(), config.reflection.clone());
    tokio::spawn(run_reflection_loop(engine, reflection_rx, tx.subscribe()));

    // Boundary listener for proxied traffic observations
    let boundary_config = config.intercept.clone();
    let boundary_user = config.identity.default_user_id.clone();
    let boundary_sync = sync_handle.clone();
    let boundary_shutdown = tx.subscribe();
    tokio::spawn(async move {
        if let Err(e) =
            boundary::run_boundary_listener(boundary_config, boundary_user, boundary_sync, boundary_shutdown)
                .await
        {
            tracing::error!("Boundary listener error: {}", e);
        }
    });

    // IPC façade
    let socket_path = config.service.socket_path.clone();
    let state = FacadeState {
        store,
        reflection: reflection_handle,
        config,
    };
    server::run_unix_server(&socket_path, state, tx.subscribe()).await?;

    Ok(())
}
