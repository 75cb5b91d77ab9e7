use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use storyline_clustering::{
    ClusterPass, MoveOutcome, PgTopicStore, RunMode, Scheduler, TopicStore,
};
use storyline_common::{load_config, AppConfig, LogFormat};

#[derive(Parser)]
#[command(name = "storyline-cluster")]
#[command(about = "Incremental topic clustering over CTM partitions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster one CTM (dry run unless --write)
    Run {
        #[arg(long)]
        ctm: Uuid,

        /// Persist decisions
        #[arg(long)]
        write: bool,
    },

    /// Cluster every due CTM through the worker pool
    RunDue {
        #[arg(long)]
        write: bool,
    },

    /// Run due CTMs on a fixed interval (write mode)
    Watch {
        /// Overrides scheduler.interval_secs from the config file
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Move a headline's membership to another topic in the same CTM
    Move {
        #[arg(long)]
        ctm: Uuid,

        #[arg(long)]
        headline: Uuid,

        /// Target topic id
        #[arg(long)]
        to: Uuid,
    },

    /// List topics awaiting summarization
    Pending {
        #[arg(long)]
        ctm: Uuid,
    },

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LogFormat::Pretty);
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_format);
    config.log_redacted();

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let store = PgTopicStore::connect(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;

    if let Commands::Migrate = cli.command {
        store.migrate().await.context("Migrations failed")?;
        info!("Migrations complete");
        return Ok(());
    }

    let clustering = Arc::new(load_config(&config.config_path)?);
    if matches!(cli.command, Commands::RunDue { .. } | Commands::Watch { .. }) {
        config.check_pool_capacity(clustering.scheduler.max_concurrent_partitions)?;
    }
    let store = Arc::new(store);
    let pass = ClusterPass::new(Arc::clone(&store), Arc::clone(&clustering));

    match cli.command {
        Commands::Run { ctm, write } => {
            let stats = pass.run(ctm, RunMode::from_write_flag(write)).await?;
            println!("{stats}");
        }
        Commands::RunDue { write } => {
            let report = Scheduler::new(pass)
                .run_due(RunMode::from_write_flag(write))
                .await?;
            println!("{report}");
            if !report.failed.is_empty() {
                anyhow::bail!("{} CTM pass(es) failed", report.failed.len());
            }
        }
        Commands::Watch { interval_secs } => {
            let secs = interval_secs.unwrap_or(clustering.scheduler.interval_secs);
            Scheduler::new(pass)
                .watch(Duration::from_secs(secs.max(1)))
                .await?;
        }
        Commands::Move { ctm, headline, to } => {
            match store.move_membership(ctm, headline, to).await? {
                MoveOutcome::Moved { from_topic } => {
                    println!("Moved headline {headline} from topic {from_topic} to {to}")
                }
                MoveOutcome::AlreadyThere => {
                    println!("Headline {headline} already in topic {to}")
                }
            }
        }
        Commands::Pending { ctm } => {
            let pending = store.pending_summaries(ctm).await?;
            println!("{}", serde_json::to_string_pretty(&pending)?);
        }
        Commands::Migrate => {}
    }

    Ok(())
}
