//! Tributary CLI - operator tool over the event store.
//!
//! Uses the same configuration as the server (`TRIBUTARY__*` environment or
//! `--config`).

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tributary_core::{
    bundle::connect_transport,
    config::Config,
    fes::{type_matcher, Aggregate, Event, EventStore, SubscriptionOptions},
    telemetry::{init_logging, LogFormat, Telemetry},
    transport::SubjectMatcher,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "tributary",
    version,
    about = "Tributary - inspect and append to the event store",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true, env = "TRIBUTARY_CONFIG")]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List aggregates
    List {
        /// Only aggregates of this type
        #[arg(short = 't', long = "type")]
        aggregate_type: Option<String>,
    },

    /// Print the events of an aggregate
    Get {
        /// Aggregate type
        aggregate_type: String,
        /// Aggregate id
        id: String,
    },

    /// Append an event to an aggregate
    Append {
        /// Aggregate type
        aggregate_type: String,
        /// Aggregate id
        id: String,
        /// Event type
        event_type: String,
        /// JSON payload
        #[arg(short, long, default_value = "null")]
        data: String,
        /// Fold the event into this parent (`type/id`)
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Follow the events of an aggregate type until interrupted
    Watch {
        /// Aggregate type
        aggregate_type: String,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .context("invalid configuration")?;

    let level = if cli.verbose { "debug" } else { "warn" };
    init_logging(level, &LogFormat::Compact)?;

    let transport = connect_transport(&config.transport).await?;
    let store = Arc::new(EventStore::new(
        transport,
        config.event_store.clone(),
        Telemetry::disabled("cli"),
    ));

    let result = run(&cli, &store).await;
    store.close().await?;
    result
}

async fn run(cli: &Cli, store: &Arc<EventStore>) -> Result<()> {
    match &cli.command {
        Commands::List { aggregate_type } => {
            let matcher = match aggregate_type {
                Some(t) => type_matcher(t),
                None => SubjectMatcher::All,
            };
            let aggregates = store.list(&matcher).await?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&aggregates)?),
                OutputFormat::Text => {
                    for aggregate in &aggregates {
                        println!("{}", aggregate);
                    }
                    println!("{} aggregate(s)", aggregates.len());
                }
            }
        }

        Commands::Get { aggregate_type, id } => {
            let events = store.get(&Aggregate::new(aggregate_type, id)).await?;
            for event in &events {
                print_event(cli.format, event)?;
            }
        }

        Commands::Append {
            aggregate_type,
            id,
            event_type,
            data,
            parent,
        } => {
            let data: Value = serde_json::from_str(data).context("--data is not valid JSON")?;
            let mut event = Event::new(event_type, Aggregate::new(aggregate_type, id), data);
            if let Some(parent) = parent {
                event = event.with_parent(parse_aggregate(parent)?);
            }
            let sequence = store.append(&event).await?;
            println!("appended {} to {} at sequence {}", event.event_type, event.stream_aggregate(), sequence);
        }

        Commands::Watch { aggregate_type } => {
            let mut events = store.subscribe(SubscriptionOptions::default());
            store.watch(aggregate_type).await?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => print_event(cli.format, &event)?,
                        None => break,
                    },
                }
            }
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_aggregate(raw: &str) -> Result<Aggregate> {
    match raw.split_once('/') {
        Some((typ, id)) if !typ.is_empty() && !id.is_empty() => Ok(Aggregate::new(typ, id)),
        _ => bail!("expected `type/id`, got '{}'", raw),
    }
}

fn print_event(format: OutputFormat, event: &Event) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Text => println!(
            "{:>6}  {}  {:<28} {}  {}",
            event.sequence.map(|s| s.to_string()).unwrap_or_default(),
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.event_type,
            event.aggregate,
            event.data
        ),
    }
    Ok(())
}
