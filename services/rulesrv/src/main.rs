use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use rulesrv::{create_app_state, create_routes, open_database, spawn_retention, Config};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP service with the scheduler (default)
    Serve,

    /// Validate configuration and database, then exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    rulesrv::logging::init(&config.log_level.0)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match args.command {
        Some(Commands::Serve) | None => serve(config).await,
        Some(Commands::Check) => check(config).await,
    }
}

/// Run the rule service until Ctrl+C
async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Starting Rule Service");

    let bind_address = config.bind_address();
    let state = create_app_state(config).await?;

    let scheduler = state.scheduler.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.start().await });
    let retention_handle = spawn_retention(state.clone());

    let app = create_routes(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    info!("Rule service listening on http://{}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    state.scheduler.stop();
    retention_handle.abort();
    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task err: {}", e);
    }

    info!("Rule service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Signal handler err: {}", e);
    }
    info!("Shutdown signal received");
}

/// Open the database and report what would be served
async fn check(config: Config) -> anyhow::Result<()> {
    let pool = open_database(&config.database).await?;
    let (active,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rules WHERE active = 1")
        .fetch_one(&pool)
        .await
        .context("Failed to count rules")?;

    println!("Configuration OK");
    println!("  database:  {}", config.database.path);
    println!("  listen:    {}", config.bind_address());
    println!("  active rules: {}", active);
    println!("  schedules: {}", config.schedules.len());
    for schedule in &config.schedules {
        println!(
            "    - rule {} every {}s",
            schedule.rule_id, schedule.interval_secs
        );
    }

    pool.close().await;
    Ok(())
}
