use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use parenum::chunk::ChunkOrder;
use parenum::config::{DistributedConfig, EnumeratorKind, RunConfig, SystemKind};
use parenum::format::GraphFormat;
use parenum::search::{RunOutcome, run_enumeration};

/// Enumerate maximal cliques or maximal diameter-2 k-plexes of a graph.
#[derive(Debug, Parser)]
#[command(name = "parenum", version, about)]
struct Cli {
    /// Graph file.
    #[arg(env = "PARENUM_GRAPH")]
    graph: PathBuf,

    /// Structures to enumerate.
    #[arg(long, value_enum, default_value_t, env = "PARENUM_SYSTEM")]
    system: SystemKind,

    /// Scheduler.
    #[arg(long, value_enum, default_value_t, env = "PARENUM_ENUMERATOR")]
    enumerator: EnumeratorKind,

    /// Worker threads (per rank for distributed runs) [default: number of CPUs].
    #[arg(short = 'n', long, env = "PARENUM_THREADS")]
    threads: Option<usize>,

    /// Roots per chunk for distributed runs; 0 assigns one fixed range per rank.
    #[arg(long, default_value_t = 100, env = "PARENUM_CHUNK_SIZE")]
    chunk_size: usize,

    /// Order in which chunks are handed out.
    #[arg(long, value_enum, default_value_t, env = "PARENUM_CHUNK_ORDER")]
    chunk_order: ChunkOrder,

    /// The k of the k-plexes.
    #[arg(long, default_value_t = 2, env = "PARENUM_K")]
    k: usize,

    /// Minimum k-plex size.
    #[arg(long, default_value_t = 1, env = "PARENUM_Q")]
    q: usize,

    /// Pivot branching in the k-plex search.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "PARENUM_ENABLE_PIVOTING"
    )]
    enable_pivoting: bool,

    /// Graph file format.
    #[arg(long, value_enum, default_value_t, env = "PARENUM_GRAPH_FORMAT")]
    graph_format: GraphFormat,

    /// Vertex ids in the file start at 1 (oly only).
    #[arg(long, env = "PARENUM_ONE_BASED")]
    one_based: bool,

    /// Use 64-bit vertex ids.
    #[arg(long, env = "PARENUM_HUGE_GRAPH")]
    huge_graph: bool,

    /// Print the items, one per line, after the statistics.
    #[arg(long)]
    print_items: bool,

    /// Check every item after the run.
    #[arg(long)]
    validate: bool,

    /// Deterministic seed for victim selection.
    #[arg(long, env = "PARENUM_SEED")]
    seed: Option<u64>,

    /// In-process ranks for distributed runs without --coordinator.
    #[arg(long, default_value_t = 2, env = "PARENUM_RANKS")]
    ranks: usize,

    /// This process's rank in a TCP cluster.
    #[arg(long, env = "PARENUM_RANK")]
    rank: Option<usize>,

    /// Number of processes in a TCP cluster.
    #[arg(long, env = "PARENUM_WORLD_SIZE")]
    world_size: Option<usize>,

    /// Address rank 0 listens on and the other ranks connect to.
    #[arg(long, env = "PARENUM_COORDINATOR")]
    coordinator: Option<String>,

    /// Print nothing but errors (and items with --print-items).
    #[arg(long)]
    quiet: bool,

    /// More logging (-v info, -vv debug, -vvv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn to_config(&self) -> RunConfig {
        let defaults = RunConfig::default();
        RunConfig {
            graph_path: self.graph.clone(),
            graph_format: self.graph_format,
            one_based: self.one_based,
            huge_graph: self.huge_graph,
            system: self.system,
            k: self.k,
            q: self.q,
            pivoting: self.enable_pivoting,
            enumerator: self.enumerator,
            threads: self.threads.unwrap_or(defaults.threads),
            seed: self.seed,
            distributed: DistributedConfig {
                ranks: self.ranks,
                chunk_size: self.chunk_size,
                chunk_order: self.chunk_order,
                rank: self.rank,
                world_size: self.world_size,
                coordinator: self.coordinator.clone(),
            },
            retain_items: self.print_items,
            validate: self.validate,
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        match verbose {
            0 => tracing_subscriber::EnvFilter::new("warn"),
            1 => tracing_subscriber::EnvFilter::new("info"),
            2 => tracing_subscriber::EnvFilter::new("debug"),
            _ => tracing_subscriber::EnvFilter::new("trace"),
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn print_outcome(outcome: &RunOutcome, quiet: bool) -> io::Result<()> {
    let mut out = BufWriter::new(io::stdout().lock());
    if !quiet {
        writeln!(out, "{}", outcome.stats)?;
    }
    for item in outcome.items.iter().flatten() {
        let mut ids = item.iter();
        if let Some(first) = ids.next() {
            write!(out, "{first}")?;
        }
        for id in ids {
            write!(out, " {id}")?;
        }
        writeln!(out)?;
    }
    out.flush()
}

fn run(cli: &Cli) -> Result<()> {
    let cfg = cli.to_config();
    let outcome = run_enumeration(&cfg)
        .with_context(|| format!("enumeration of {} failed", cli.graph.display()))?;
    if outcome.is_reporting_rank {
        print_outcome(&outcome, cli.quiet).context("could not write results")?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
