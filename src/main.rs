use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use herd::agent::HerdAgent;
use herd::batch::{ExperimentBatch, LoadOptions, UnitSelection};
use herd::config::{
    AgentConfig, DispatcherConfig, RetryPolicy, DEFAULT_DISCOVERY_PORT, DEFAULT_JOB_PORT,
};
use herd::dashboard::{run_dashboard, DashboardState};
use herd::dispatcher::{BatchReport, Dispatcher};
use herd::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "herd")]
#[command(version)]
#[command(about = "Distributes experiment batches over discovered agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an agent that executes units for dispatchers
    Agent(AgentArgs),

    /// Run one or more batches on the agents found on the network
    Dispatch(DispatchArgs),

    /// Inspect or clean a batch without running it
    Batch {
        #[command(subcommand)]
        command: BatchCommands,
    },
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Address to bind both sockets to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// UDP port answering discovery probes
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// TCP port accepting job transfers
    #[arg(long, default_value_t = DEFAULT_JOB_PORT)]
    job_port: u16,

    /// Core count to advertise (defaults to the machine's)
    #[arg(long)]
    cores: Option<usize>,

    /// Parent directory of per-job scratch directories
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Keep scratch directories after jobs finish
    #[arg(long)]
    keep_scratch: bool,

    /// Seconds to wait for a connection after answering a probe
    #[arg(long, default_value = "10")]
    reservation_timeout: u64,
}

// =============================================================================
// Dispatch Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DispatchArgs {
    /// Batch descriptor files
    #[arg(required = true)]
    batches: Vec<PathBuf>,

    /// Where discovery probes are sent
    #[arg(long, default_value = "255.255.255.255:2333")]
    target: SocketAddr,

    /// Job port of agents that do not advertise one
    #[arg(long, default_value_t = DEFAULT_JOB_PORT)]
    job_port: u16,

    /// Port for the HTTP status server (optional)
    #[arg(long)]
    status_port: Option<u16>,

    /// Delete logs left by a previous run before loading
    #[arg(long)]
    clean: bool,

    /// Which units to queue, judged by their logs
    #[arg(long, default_value = "all")]
    select: Selection,

    /// Attempts per unit, the first one included
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Do not retry units whose job reported an error
    #[arg(long)]
    no_retry_errors: bool,

    /// Seconds without data before a transfer is abandoned
    #[arg(long, default_value = "30")]
    io_timeout: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(clap::Subcommand, Debug)]
enum BatchCommands {
    /// Count the units of a batch
    Count {
        batch: PathBuf,

        #[arg(long, default_value = "all")]
        select: Selection,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
    /// Delete the logs of every unit of a batch
    Clean { batch: PathBuf },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Selection {
    All,
    Finished,
    Unfinished,
}

impl From<Selection> for UnitSelection {
    fn from(selection: Selection) -> Self {
        match selection {
            Selection::All => UnitSelection::All,
            Selection::Finished => UnitSelection::OnlyFinished,
            Selection::Unfinished => UnitSelection::OnlyUnfinished,
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct CountOutput {
    batch: PathBuf,
    selection: UnitSelection,
    units: usize,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AgentConfig::new(
        SocketAddr::new(args.bind, args.discovery_port),
        SocketAddr::new(args.bind, args.job_port),
    );
    if let Some(cores) = args.cores {
        config = config.with_cores(cores);
    }
    if let Some(dir) = args.scratch_dir {
        config = config.with_scratch_root(dir);
    }
    config.keep_scratch = args.keep_scratch;
    config.reservation_timeout = Duration::from_secs(args.reservation_timeout);

    tracing::info!(
        discovery_addr = %config.discovery_addr,
        job_addr = %config.job_addr,
        cores = config.cores,
        scratch_root = %config.scratch_root.display(),
        "Starting herd agent"
    );

    let shutdown = install_shutdown_handler()?;
    let agent = HerdAgent::bind(config).await?;
    agent.run(shutdown).await?;
    Ok(())
}

async fn run_dispatch(args: DispatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let retry = RetryPolicy {
        max_attempts: args.max_attempts.max(1),
        retry_job_errors: !args.no_retry_errors,
        ..RetryPolicy::default()
    };
    let mut config = DispatcherConfig::new(args.target).with_retry(retry);
    config.default_job_port = args.job_port;
    config.io_timeout = Duration::from_secs(args.io_timeout);
    if let Some(port) = args.status_port {
        config = config.with_status_addr(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    let options = LoadOptions {
        selection: args.select.into(),
    };
    let mut batches = Vec::with_capacity(args.batches.len());
    for path in &args.batches {
        if args.clean {
            ExperimentBatch::delete_log_files(path)?;
        }
        batches.push(ExperimentBatch::load(path, options)?);
    }

    let status_addr = config.status_addr;
    let mut dispatcher = Dispatcher::new(config).await?;
    for batch in batches {
        dispatcher.add_batch(batch);
    }

    let shutdown = install_shutdown_handler()?;
    if let Some(addr) = status_addr {
        let state = DashboardState {
            report: dispatcher.subscribe(),
            agents: dispatcher.agents(),
            cancel: shutdown.clone(),
        };
        tokio::spawn(run_dashboard(addr, state));
    }

    let report = dispatcher.run(shutdown).await?;
    print_report(&report, &args.output)?;
    Ok(())
}

fn print_report(
    report: &BatchReport,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<10} {:<30} {:<10} {:<8} AGENT",
                "UNIT", "NAME", "STATUS", "ATTEMPTS"
            );
            println!("{}", "-".repeat(78));
            for unit in &report.units {
                let agent = unit
                    .agent
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let name = if unit.name.chars().count() > 30 {
                    format!("{}...", unit.name.chars().take(27).collect::<String>())
                } else {
                    unit.name.clone()
                };
                println!(
                    "{:<10} {:<30} {:<10} {:<8} {}",
                    unit.id.to_string(),
                    name,
                    unit.status.to_string(),
                    unit.attempts,
                    agent
                );
                if let Some(error) = &unit.last_error {
                    println!("           error: {}", error);
                }
            }
            println!();
            println!(
                "Finished: {}  Unfinished: {}  Total: {}",
                report.finished,
                report.unfinished,
                report.total()
            );
        }
    }
    Ok(())
}

fn handle_batch(command: BatchCommands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        BatchCommands::Count {
            batch,
            select,
            output,
        } => {
            let selection = UnitSelection::from(select);
            let units = ExperimentBatch::count_experimental_units(&batch, selection)?;
            match output {
                OutputFormat::Json => {
                    let output = CountOutput {
                        batch,
                        selection,
                        units,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => println!("{}", units),
            }
        }
        BatchCommands::Clean { batch } => {
            let deleted = ExperimentBatch::delete_log_files(&batch)?;
            println!("Deleted logs of {} units", deleted);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Agent(agent_args) => run_agent(agent_args).await?,
        Commands::Dispatch(dispatch_args) => run_dispatch(dispatch_args).await?,
        Commands::Batch { command } => handle_batch(command)?,
    }

    Ok(())
}
