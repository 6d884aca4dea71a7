use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

use learning_analytics::models::Window;
use learning_analytics::synthetic::{self, SyntheticConfig};
use learning_analytics::{db, load_config, report, AnalyticsConfig, AnalyticsContext, EventStore};

#[derive(Parser)]
#[command(name = "learning-analytics")]
#[command(about = "Product analytics for a learning app event log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Event log CSV with user_id, event_type and timestamp columns
    #[arg(long, global = true)]
    csv: Option<PathBuf>,
    /// Read events from Postgres (DATABASE_URL) instead of a CSV file
    #[arg(long, global = true, conflicts_with = "csv")]
    from_db: bool,
    /// JSON file with analytics parameters
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a synthetic event log into the database
    Seed {
        #[arg(long, default_value_t = 1_000)]
        users: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Import events from a CSV file into the database
    Import { path: PathBuf },
    /// Write a synthetic event log to a CSV file
    Generate {
        #[arg(long, default_value = "events.csv")]
        out: PathBuf,
        #[arg(long, default_value_t = 1_000)]
        users: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Distinct users per funnel stage with step conversion
    Funnel {
        /// Comma separated stage names, in funnel order
        #[arg(long, value_delimiter = ',')]
        stages: Vec<String>,
    },
    /// Day-offset retention and signup cohorts
    Retention {
        #[arg(long, value_delimiter = ',')]
        offsets: Vec<i64>,
    },
    /// Active users, lesson activity and practice distribution
    Engagement {
        /// Only show active users for this window
        #[arg(long, value_enum)]
        window: Option<Window>,
    },
    /// A/B test metrics, confidence intervals and p-values
    Experiment {
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        confidence: Option<f64>,
    },
    /// Cluster users into behavioral segments
    Segment {
        #[arg(long)]
        k: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Also list the segment of every user
        #[arg(long)]
        users: bool,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn load_store(cli: &Cli) -> anyhow::Result<EventStore> {
    if cli.from_db {
        let pool = connect().await?;
        return db::fetch_events(&pool).await;
    }
    let path = cli
        .csv
        .as_deref()
        .context("pass --csv <path> or --from-db to choose an event source")?;
    Ok(EventStore::load(path)?)
}

fn emit<T: Serialize>(
    json: bool,
    value: &T,
    render: impl FnOnce(&mut String, &T),
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        let mut output = String::new();
        render(&mut output, value);
        print!("{output}");
    }
    Ok(())
}

const DEFAULT_LOG_FILTER: &str = "learning_analytics=info";

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AnalyticsConfig::default(),
    };

    match &cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { users, seed } => {
            let pool = connect().await?;
            let synthetic = SyntheticConfig {
                users: *users,
                seed: *seed,
                ..Default::default()
            };
            let inserted = db::seed(&pool, &synthetic).await?;
            println!("Inserted {inserted} synthetic events.");
        }
        Commands::Import { path } => {
            let pool = connect().await?;
            let inserted = db::import_csv(&pool, path).await?;
            println!("Inserted {inserted} events from {}.", path.display());
        }
        Commands::Generate { out, users, seed } => {
            let events = synthetic::generate(&SyntheticConfig {
                users: *users,
                seed: *seed,
                ..Default::default()
            });
            synthetic::write_csv(&events, out)?;
            println!("Wrote {} events to {}.", events.len(), out.display());
        }
        command => {
            let store = load_store(&cli).await?;
            info!(
                events = store.events().len(),
                users = store.user_count(),
                "event log ready"
            );
            let ctx = AnalyticsContext::new(store);
            run_view(&ctx, &config, command, cli.json)?;
        }
    }

    Ok(())
}

fn run_view(
    ctx: &AnalyticsContext,
    config: &AnalyticsConfig,
    command: &Commands,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::Funnel { stages } => {
            let funnel = if stages.is_empty() {
                ctx.funnel(&config.funnel_stages)?
            } else {
                ctx.funnel(stages)?
            };
            emit(json, &*funnel, report::funnel_section)
        }
        Commands::Retention { offsets } => {
            let offsets = if offsets.is_empty() {
                &config.retention_offsets
            } else {
                offsets
            };
            let retention = ctx.retention(offsets)?;
            emit(json, &*retention, report::retention_section)
        }
        Commands::Engagement { window: Some(window) } => {
            let periods = ctx.active_users(*window)?;
            emit(json, &*periods, |output, periods| {
                report::active_users_section(output, *window, periods)
            })
        }
        Commands::Engagement { window: None } => {
            let engagement = ctx.engagement()?;
            emit(json, &*engagement, report::engagement_section)
        }
        Commands::Experiment { seed, confidence } => {
            let experiment = ctx.experiment(
                seed.unwrap_or(config.experiment_seed),
                confidence.unwrap_or(config.confidence_level),
            )?;
            emit(json, &*experiment, report::experiment_section)
        }
        Commands::Segment { k, seed, users } => {
            let segmentation = ctx.segmentation(
                k.unwrap_or(config.cluster_count),
                seed.unwrap_or(config.cluster_seed),
            )?;
            emit(json, &*segmentation, |output, segmentation| {
                report::segmentation_section(output, segmentation);
                if *users {
                    let _ = writeln!(output);
                    let _ = writeln!(output, "### Users");
                    for user in &segmentation.users {
                        let _ = writeln!(
                            output,
                            "- {} cluster {} ({})",
                            user.user_id, user.cluster, user.segment
                        );
                    }
                }
            })
        }
        Commands::Report { out } => {
            let markdown = report::build_report(ctx, config)?;
            std::fs::write(out, markdown)?;
            println!("Report written to {}.", out.display());
            Ok(())
        }
        Commands::InitDb
        | Commands::Seed { .. }
        | Commands::Import { .. }
        | Commands::Generate { .. } => Ok(()),
    }
}
