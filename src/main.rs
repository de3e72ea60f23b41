use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tally::{EngineConfig, Error, Event, Query, QueryField, StatsEngine, TimeScope};

#[derive(Parser)]
#[command(name = "tally-admin")]
#[command(about = "Tally event counter management CLI", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON); TALLY_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest events from JSON lines
    Ingest {
        /// Input file, stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show action totals
    Actions {
        #[arg(long)]
        client: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Rank targets of a type by their count for an action
    Top {
        #[arg(long)]
        client: String,
        #[arg(long)]
        target_type: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        ascending: bool,
    },
    /// Sum action counts across targets, owners or tags
    Count {
        #[arg(long)]
        client: String,
        #[arg(long)]
        target_type: String,
        #[arg(long = "target")]
        targets: Vec<String>,
        #[arg(long = "owner")]
        owners: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Monthly series per action for a target
    Stats {
        #[arg(long)]
        client: String,
        #[arg(long)]
        target_type: String,
        #[arg(long = "target", required = true)]
        targets: Vec<String>,
        #[arg(long)]
        action: Option<String>,
        /// RFC 3339 or YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// RFC 3339 or YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
    },
    /// Roll raw target counters up into a stats bucket
    Rollup {
        /// Result bucket scope (h, d, w, m, a, g)
        #[arg(long)]
        scope: Option<TimeScope>,
        /// Grouping granularity (h, d, m)
        #[arg(long)]
        group_by: Option<TimeScope>,
    },
    /// Replace the owners of targets
    Owners {
        #[arg(long)]
        client: String,
        #[arg(long)]
        target_type: String,
        #[arg(long = "target")]
        targets: Vec<String>,
        #[arg(long = "owner")]
        owners: Vec<String>,
    },
    /// Replace the tags of a target
    Tags {
        #[arg(long)]
        client: String,
        #[arg(long)]
        target_type: String,
        #[arg(long)]
        target: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Drop every bucket
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Default, Serialize)]
struct IngestSummary {
    processed: u64,
    invalid: u64,
    duplicates: u64,
    failed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    let engine = StatsEngine::connect(&config)
        .await
        .context("Failed to start stats engine")?;

    match cli.command {
        Commands::Ingest { file } => {
            let reader: Box<dyn AsyncBufRead + Unpin> = match file {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("Failed to open {}", path.display()))?;
                    Box::new(BufReader::new(file))
                }
                None => Box::new(BufReader::new(tokio::io::stdin())),
            };
            let summary = ingest(&engine, reader).await?;
            print_json(&summary)?;
        }
        Commands::Actions { client, limit } => {
            let mut query = Query::new().filter_by(QueryField::ClientId, client);
            query.max_results = limit;
            print_json(&engine.get_actions(&query).await?)?;
        }
        Commands::Top {
            client,
            target_type,
            action,
            limit,
            ascending,
        } => {
            let mut query = Query::new()
                .filter_by(QueryField::ClientId, client)
                .filter_by(QueryField::TargetType, target_type)
                .filter_by(QueryField::Action, action)
                .ascending(ascending);
            query.max_results = limit;
            print_json(&engine.get_top_targets(&query).await?)?;
        }
        Commands::Count {
            client,
            target_type,
            targets,
            owners,
            tags,
        } => {
            let query = Query::new()
                .filter_by(QueryField::ClientId, client)
                .filter_by(QueryField::TargetType, target_type)
                .filter_by(QueryField::Target, targets)
                .filter_by(QueryField::TargetOwner, owners)
                .filter_by(QueryField::TargetTags, tags);
            print_json(&engine.get_target_action_count(&query).await?)?;
        }
        Commands::Stats {
            client,
            target_type,
            targets,
            action,
            from,
            to,
        } => {
            let query = Query::new()
                .filter_by(QueryField::ClientId, client)
                .filter_by(QueryField::TargetType, target_type)
                .filter_by(QueryField::Target, targets)
                .filter_by(QueryField::Action, action)
                .filter_by(QueryField::DateFrom, from)
                .filter_by(QueryField::DateTo, to);
            print_json(&engine.get_target_stats(&query).await?)?;
        }
        Commands::Rollup { scope, group_by } => {
            let report = engine.build_stats(scope, group_by).await;
            print_json(&report)?;
        }
        Commands::Owners {
            client,
            target_type,
            targets,
            owners,
        } => {
            engine
                .set_target_owners(&client, &target_type, targets, &owners)
                .await?;
            println!("✓ Owners updated");
        }
        Commands::Tags {
            client,
            target_type,
            target,
            tags,
        } => {
            engine
                .set_target_tags(&client, &target_type, &target, &tags)
                .await?;
            println!("✓ Tags updated for '{}'", target);
        }
        Commands::Reset { yes } => {
            if !yes {
                println!("⚠ Refusing to drop every bucket without --yes");
                return Ok(());
            }
            engine.reset().await?;
            println!("✓ All buckets dropped");
        }
    }

    Ok(())
}

async fn ingest(engine: &StatsEngine, reader: Box<dyn AsyncBufRead + Unpin>) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Line {}: unreadable event: {}", line_no, e);
                summary.invalid += 1;
                continue;
            }
        };

        match engine.handle_event(&event).await {
            Ok(()) => summary.processed += 1,
            Err(Error::InvalidEvent(e)) => {
                warn!("Line {}: {}", line_no, e);
                summary.invalid += 1;
            }
            Err(Error::DuplicateEvent { event }) => {
                warn!("Line {}: duplicate event {}", line_no, event);
                summary.duplicates += 1;
            }
            Err(e) => {
                warn!("Line {}: {}", line_no, e);
                summary.failed += 1;
            }
        }
    }

    info!(
        "Ingested {} events ({} invalid, {} duplicates, {} failed)",
        summary.processed, summary.invalid, summary.duplicates, summary.failed
    );
    Ok(summary)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
