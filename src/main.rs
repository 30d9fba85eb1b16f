use std::path::PathBuf;
use std::process;

use clap::Parser;

use vpsim::config::InterconnectConfig;
use vpsim::error::fatal;
use vpsim::{Platform, PlatformConfig, PlatformSnapshot, Result, SimTime};

#[derive(Parser)]
#[command(name = "vpsim", version, about = "Loosely-timed virtual platform simulator")]
struct Cli {
    /// Platform description (TOML)
    config: PathBuf,

    /// Simulated time to run for, e.g. "10 ms". Runs to completion if omitted
    #[arg(long)]
    time: Option<SimTime>,

    /// Write a snapshot here when the run ends
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Start from a snapshot taken with the same description
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Dump the NoC topology and routes in CONNECT format into this directory
    #[arg(long)]
    connect_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    // Verbosity from VPSIM_LOG, falling back to RUST_LOG
    let filter = tracing_subscriber::EnvFilter::try_from_env("VPSIM_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if let Err(e) = run(&cli) {
        let line = fatal(&e, "vpsim", SimTime::ZERO);
        eprintln!("{}", line);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut cfg = PlatformConfig::from_file(&cli.config)?;
    if let (Some(dir), InterconnectConfig::Noc { noc, .. }) = (&cli.connect_dir, &mut cfg.interconnect) {
        noc.connect_dir = Some(dir.clone());
    }

    let mut platform = Platform::from_config(&cfg)?;
    if let Some(path) = &cli.restore {
        platform.restore(&PlatformSnapshot::load(path)?)?;
    }

    println!("vpsim: {} CPU(s), starting at {}", platform.cpus().len(), platform.kernel().now());
    let end = match cli.time {
        Some(dt) => platform.run_for(dt)?,
        None => platform.run()?,
    };
    println!("vpsim: simulation ended at {}", end);

    for cpu in platform.cpus() {
        let s = cpu.stats();
        println!(
            "  {}: {} direct, {} blocking, {} DMI queries, {} syncs",
            cpu.name(),
            s.direct,
            s.blocking,
            s.dmi_queries,
            cpu.sync_count()
        );
    }
    for g in platform.generators() {
        let s = g.stats();
        match g.avg_latency() {
            Some(avg) => println!("  {}: {} requests, {} errors, mean latency {}", g.name(), s.completed, s.errors, avg),
            None => println!("  {}: {} requests, {} errors", g.name(), s.completed, s.errors),
        }
    }

    if let Some(path) = &cli.snapshot {
        let n = platform.snapshot().save(path)?;
        println!("vpsim: snapshot written to {} ({} bytes)", path.display(), n);
    }
    Ok(())
}
