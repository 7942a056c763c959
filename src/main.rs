use clap::{Parser, Subcommand};
use color_print::cformat;
use std::{error::Error, path::PathBuf};
use suzuki_kasami::{
    config::{ClusterConfig, WorkloadConfig},
    log,
    peer::{run_workload, Peer},
    sim::{SimConfig, Simulation},
    transport, ProcessId, ProtocolEngine, RATE,
};

#[derive(Parser)]
#[command(version, about = "Token-based mutual exclusion between peers")]
struct Args {
    /// Print every protocol step
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one peer of a TCP cluster
    Peer {
        /// JSON file describing the cluster
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        id: usize,
        /// Critical section entries to perform before idling
        #[arg(long, default_value_t = 10)]
        rounds: u32,
        /// Mean requests per second
        #[arg(long, default_value_t = RATE)]
        rate: f64,
        /// Time spent inside the critical section
        #[arg(long, default_value_t = 100)]
        hold_ms: u64,
        /// Seed of the request schedule, defaults to the peer id
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run a whole cluster in one process with randomized delivery
    Simulate {
        #[arg(long, default_value_t = 3)]
        peers: usize,
        #[arg(long, default_value_t = 5)]
        rounds: u32,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Probability that a request is delivered again
        #[arg(long, default_value_t = 0.0)]
        duplicate_rate: f64,
        #[arg(long, default_value_t = 200_000)]
        max_steps: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args = Args::parse();
    if args.verbose {
        log::set_level(log::Level::Debug);
    }

    match args.command {
        Command::Peer {
            config,
            id,
            rounds,
            rate,
            hold_ms,
            seed,
        } => {
            let workload = WorkloadConfig {
                rounds,
                rate,
                hold_ms,
                seed: seed.unwrap_or(id as u64),
            };
            run_peer(ClusterConfig::load(config)?, ProcessId(id), workload).await
        }
        Command::Simulate {
            peers,
            rounds,
            seed,
            duplicate_rate,
            max_steps,
        } => simulate(SimConfig {
            peers,
            rounds,
            seed,
            duplicate_rate,
            max_steps,
            ..SimConfig::default()
        }),
    }
}

async fn run_peer(
    config: ClusterConfig,
    id: ProcessId,
    workload: WorkloadConfig,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    workload.validate()?;

    let (channel, inbox, _accept) = transport::bind(id, &config).await?;
    let mut engine = ProtocolEngine::new(id, channel)?;
    engine.bootstrap(id == config.initial_holder)?;
    let (handle, mut actor) = Peer::spawn(engine, inbox);

    tokio::select! {
        result = run_workload(&handle, &workload) => {
            result?;
            log::info(&cformat!(
                "{} finished its <bold>{}</bold> rounds and keeps serving the others. Press Ctrl-C to stop.",
                id,
                workload.rounds
            ));
        }
        result = &mut actor => {
            result??;
            return Ok(());
        }
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            handle.shutdown().await?;
            actor.await??;
        }
        result = &mut actor => result??,
    }
    Ok(())
}

fn simulate(config: SimConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let peers = config.peers;
    let report = Simulation::new(config)?.run()?;

    let order = report
        .entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    log::info(&cformat!("Entry order: <bold>{}</bold>", order));
    log::info(&cformat!(
        "<bold>{}</bold> entries in <bold>{}</bold> steps with <bold>{}</bold> requests and <bold>{}</bold> token transfers ({} duplicated deliveries).",
        report.entries.len(),
        report.steps,
        report.requests_sent,
        report.tokens_sent,
        report.duplicates_delivered
    ));
    log::info(&cformat!(
        "Longest wait after joining the queue: <bold>{}</bold> grants (bound {}).",
        report.max_grants_waited,
        peers.saturating_sub(1)
    ));
    if let Some(holder) = report.snapshots.iter().find(|s| s.holds_token) {
        log::info(&cformat!(
            "{} keeps the <yellow, bold>token</yellow, bold>.",
            holder.id
        ));
    }
    Ok(())
}
