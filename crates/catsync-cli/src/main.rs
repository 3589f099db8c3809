use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use catsync_core::{CatalogScope, MergeOptions, SyncMode};
use catsync_storage::{PgStore, ResetOutcome};
use catsync_sync::{
    load_feed_file, log_stuck_runs, maybe_build_watchdog, render_status_markdown, ProviderRegistry,
    SyncConfig, SyncEngine, SyncRequest,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "catsync-cli")]
#[command(about = "Multi-source catalog sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply one provider feed file to a catalog scope.
    Sync {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        vertical: String,
        #[arg(long, default_value = "full")]
        mode: SyncMode,
        #[arg(long)]
        file: PathBuf,
        /// Merge even if the feed is unchanged since the last success.
        #[arg(long)]
        force: bool,
        /// Bypass priority and lock rules for every record in the feed.
        #[arg(long)]
        manual_override: bool,
        /// Lock every record this run writes to the provider.
        #[arg(long)]
        lock: bool,
    },
    /// Print run state for one provider or all of them.
    Status {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Force a provider stuck in `running` back to `error`.
    Reset {
        #[arg(long)]
        provider: String,
    },
    /// List runs that exceeded CATSYNC_MAX_RUN_MINUTES.
    Stuck,
    /// Markdown summary of every provider's run state.
    Report,
    /// Upsert the provider registry file into the database.
    Register {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing("info")?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Status { provider: None }) {
        Commands::Sync {
            provider,
            tenant,
            vertical,
            mode,
            file,
            force,
            manual_override,
            lock,
        } => {
            let engine = engine(&config).await?;
            let feed = load_feed_file(&file).await?;
            let request = SyncRequest::new(provider, CatalogScope::new(tenant, vertical), mode, feed.items)
                .with_raw_feed(feed.raw)
                .with_options(MergeOptions {
                    manual_override,
                    source_locked: lock,
                    force,
                });
            match engine.run_sync(request).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(err) => {
                    if let Some(result) = err.run_result() {
                        println!("{}", serde_json::to_string_pretty(result)?);
                    }
                    return Err(err.into());
                }
            }
        }
        Commands::Status { provider } => {
            let engine = engine(&config).await?;
            let tracker = engine.tracker();
            let out = match provider {
                Some(id) => {
                    let state = tracker
                        .current_state(&id)
                        .await?
                        .with_context(|| format!("provider {id} has no run state"))?;
                    serde_json::to_string_pretty(&state)?
                }
                None => serde_json::to_string_pretty(&tracker.list_states().await?)?,
            };
            println!("{out}");
        }
        Commands::Reset { provider } => {
            let engine = engine(&config).await?;
            match engine.tracker().reset(&provider).await? {
                ResetOutcome::Reset(state) => {
                    println!("reset {provider}: {}", serde_json::to_string_pretty(&state)?)
                }
                ResetOutcome::NotRunning(state) => {
                    println!("{provider} is not running (status={}); nothing to reset", state.status)
                }
                ResetOutcome::UnknownProvider => anyhow::bail!("provider {provider} is not registered"),
            }
        }
        Commands::Stuck => {
            let engine = engine(&config).await?;
            let stuck = log_stuck_runs(engine.tracker(), config.max_run_duration()).await?;
            println!("{}", serde_json::to_string_pretty(&stuck)?);
        }
        Commands::Report => {
            let engine = engine(&config).await?;
            let states = engine.tracker().list_states().await?;
            println!(
                "{}",
                render_status_markdown(&states, Utc::now(), config.max_run_duration())
            );
        }
        Commands::Register { file } => {
            let path = file.unwrap_or_else(|| config.providers_file.clone());
            let registry = ProviderRegistry::load(&path).await?;
            let engine = engine(&config).await?;
            engine.register_providers(&registry.providers).await?;
            println!("registered {} providers from {}", registry.providers.len(), path.display());
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.db_max_connections).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let engine = engine(&config).await?;
            let watchdog = maybe_build_watchdog(&config, engine.tracker().clone()).await?;
            if let Some(sched) = &watchdog {
                sched.start().await.context("starting watchdog")?;
            }
            info!("starting admin API");
            catsync_web::serve(catsync_web::AppState::new(engine), catsync_web::web_port_from_env()).await?;
        }
    }

    Ok(())
}

async fn engine(config: &SyncConfig) -> Result<SyncEngine> {
    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to the catalog database")?;
    Ok(SyncEngine::with_store(Arc::new(store), config))
}
