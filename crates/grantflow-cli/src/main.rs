use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grantflow_sync::{IngestConfig, Pipeline};
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "grantflow")]
#[command(about = "grants.gov ingestion pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scheduled discovery, workers and the health surface until ctrl-c.
    Run,
    /// One discovery tick.
    Discover,
    /// Workers until ctrl-c.
    Work {
        /// Drain what is visible on the queue, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Replay the dead letters recorded for one opportunity id.
    Replay { id: String },
    /// Print dead letters as JSON.
    DeadLetters,
    /// Delete opportunities not updated within the last `days` days.
    Prune {
        #[arg(long, default_value_t = 90, value_parser = clap::value_parser!(i64).range(1..))]
        days: i64,
    },
    /// Apply database migrations.
    Migrate,
    /// Health surface only.
    Serve,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("grantflow=info"))
        .context("parsing log filter")?;
    let json = std::env::var("GRANTFLOW_LOG_JSON").is_ok_and(|v| v == "1");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn stop_on_ctrl_c(pipeline: &Arc<Pipeline>) {
    let pipeline = Arc::clone(pipeline);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            pipeline.shutdown();
        }
    });
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = IngestConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            let pool = PgPool::connect(&config.database_url)
                .await
                .context("connecting to Postgres")?;
            grantflow_storage::MIGRATOR
                .run(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Run => {
            let pipeline = Pipeline::connect(&config).await?;
            stop_on_ctrl_c(&pipeline);
            let web = tokio::spawn(grantflow_web::serve(Arc::clone(&pipeline), config.web_port));
            Arc::clone(&pipeline).run().await?;
            web.await.context("joining web task")??;
        }
        Commands::Discover => {
            let pipeline = Pipeline::connect(&config).await?;
            match pipeline.run_discovery_tick().await? {
                Some(report) => print_json(&report)?,
                None => println!("discovery tick skipped; another tick is running"),
            }
        }
        Commands::Work { once } => {
            let pipeline = Pipeline::connect(&config).await?;
            if once {
                let outcomes = pipeline.drain().await?;
                println!("processed {} work items", outcomes.len());
                print_json(&pipeline.health().await.counters)?;
            } else {
                stop_on_ctrl_c(&pipeline);
                pipeline.run_workers().await?;
            }
        }
        Commands::Replay { id } => {
            let pipeline = Pipeline::connect(&config).await?;
            let outcome = pipeline.replay_dead_letter(&id).await?;
            if !outcome.found() {
                anyhow::bail!("no dead letters recorded for {id}");
            }
            print_json(&outcome)?;
        }
        Commands::DeadLetters => {
            let pipeline = Pipeline::connect(&config).await?;
            print_json(&pipeline.dead_letters().await?)?;
        }
        Commands::Prune { days } => {
            let pipeline = Pipeline::connect(&config).await?;
            let deleted = pipeline.prune_stale(chrono::Duration::days(days)).await?;
            info!(deleted, days, "prune finished");
            println!("deleted {deleted} opportunities not updated in {days} days");
        }
        Commands::Serve => {
            let pipeline = Pipeline::connect(&config).await?;
            stop_on_ctrl_c(&pipeline);
            grantflow_web::serve(pipeline, config.web_port).await?;
        }
    }

    Ok(())
}
