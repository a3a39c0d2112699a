mod connection;
mod rest;
mod state;
mod store;
mod ws_agent;
mod ws_observer;

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use transcast_db::config::DbConfig;
use transcast_db::{pool, queries::tasks};

use state::AppState;

#[derive(Parser)]
#[command(name = "transcast-orchestrator", about = "Distributed transcoding cluster orchestrator")]
struct Cli {
    /// Database URL (overrides TRANSCAST_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database (if absent) and run migrations
    DbInit,
    /// Run the orchestrator: REST + agent/observer WebSocket listeners
    Serve {
        /// Address to bind to
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to bind to
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

fn resolve_db_config(cli_url: Option<&str>) -> DbConfig {
    match cli_url {
        Some(url) => DbConfig::new(url),
        None => DbConfig::from_env(),
    }
}

async fn cmd_db_init(cli_url: Option<&str>) -> anyhow::Result<()> {
    let db_config = resolve_db_config(cli_url);

    println!("Initializing transcast database...");

    pool::ensure_database_exists(&db_config).await?;
    let db_pool = pool::create_pool(&db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("transcast-orchestrator db-init complete.");
    Ok(())
}

async fn cmd_serve(cli_url: Option<&str>, bind: &str, port: u16) -> anyhow::Result<()> {
    let db_config = resolve_db_config(cli_url);
    let db_pool = pool::create_pool(&db_config).await?;

    let reconciled = tasks::reconcile_dangling_on_startup(&db_pool).await?;
    if !reconciled.is_empty() {
        tracing::warn!(count = reconciled.len(), "reconciled dangling tasks from a previous run to FAILED");
    }

    let state = AppState::new(db_pool.clone());

    tokio::spawn(
        state
            .connections
            .clone()
            .run_heartbeat_sweep(db_pool.clone(), state.registry.clone(), state.scheduler.clone()),
    );

    let app = rest::build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("transcast-orchestrator listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("transcast-orchestrator shut down");
    db_pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await?,
        Commands::Serve { bind, port } => cmd_serve(cli.database_url.as_deref(), &bind, port).await?,
    }

    Ok(())
}
