mod events;
mod output;
mod scenario_bootstrap;
mod scenario_capacity;
mod scenario_common;
mod scenario_failover;
mod scenario_flood;
mod scenario_runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use events::{emit, EventStarted};

/// Seeds are one byte; leave room for rendezvous seeds above 200.
const MAX_EDGES: usize = 150;

#[derive(Parser)]
#[command(name = "rdv-sim", about = "Rendezvous overlay scenarios on an in-process network")]
struct Cli {
    /// Peer group every simulated peer joins.
    #[arg(short, long, default_value = "rdv-sim")]
    group: String,

    /// Also write JSONL events to a file in this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Edges start with no candidates, then lease once one is announced.
    Bootstrap {
        #[arg(long, default_value = "5")]
        edges: usize,
    },

    /// More edges than the rendezvous admits.
    Capacity {
        #[arg(long, default_value = "3")]
        max_clients: usize,
        #[arg(long, default_value = "5")]
        edges: usize,
    },

    /// Crash the held rendezvous and watch the edge move.
    Failover {
        #[arg(long, default_value = "3")]
        rendezvous: usize,
    },

    /// Propagate a batch and check single delivery, then walk a ring.
    Flood {
        #[arg(long, default_value = "6")]
        edges: usize,
        #[arg(long, default_value = "20")]
        messages: usize,
    },

    /// Every scenario with default settings.
    All,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Bootstrap { .. } => "bootstrap",
            Command::Capacity { .. } => "capacity",
            Command::Failover { .. } => "failover",
            Command::Flood { .. } => "flood",
            Command::All => "all",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let scenario = cli.command.name();

    if let Some(dir) = &cli.output_dir {
        let path = output::run_file(dir, &cli.group, scenario)?;
        output::open(&path)?;
        eprintln!("JSONL: {}", path.display());
    }

    eprintln!("rdv-sim v{}", env!("CARGO_PKG_VERSION"));
    emit(&EventStarted::new(scenario, &cli.group));

    let group = cli.group.as_str();
    let result = match cli.command {
        Command::Bootstrap { edges } => {
            scenario_bootstrap::run(group, edges.clamp(1, MAX_EDGES)).await?
        }
        Command::Capacity { max_clients, edges } => {
            scenario_capacity::run(group, max_clients, edges.clamp(1, MAX_EDGES)).await?
        }
        Command::Failover { rendezvous } => {
            scenario_failover::run(group, rendezvous.clamp(2, 20)).await?
        }
        Command::Flood { edges, messages } => {
            scenario_flood::run(group, edges.clamp(2, MAX_EDGES), messages).await?
        }
        Command::All => {
            if !scenario_runner::run(group).await {
                std::process::exit(1);
            }
            return Ok(());
        }
    };

    result.print_summary();
    emit(&result);
    if !result.success() {
        std::process::exit(1);
    }
    Ok(())
}
