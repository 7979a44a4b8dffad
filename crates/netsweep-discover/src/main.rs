//! CLI entry point for the netsweep network sweeper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ipnet::Ipv4Net;
use tracing_subscriber::{fmt, EnvFilter};

use netsweep_core::types::{parse_range, private_ranges};

use netsweep_discover::aggregate::{ResultAggregator, SweepReport};
use netsweep_discover::config::{self, SweepConfig, SweepMode};
use netsweep_discover::error::DiscoverError;
use netsweep_discover::journal::ResultJournal;
use netsweep_discover::liveness::LivenessProber;
use netsweep_discover::partition::Partitioner;
use netsweep_discover::ports::parse_port_list;
use netsweep_discover::privilege;
use netsweep_discover::probe::{FollowUpProber, Prober};
use netsweep_discover::progress::FileProgressStore;
use netsweep_discover::report::{JsonReport, ReportWriter};
use netsweep_discover::scanner::NmapScanner;
use netsweep_discover::scheduler::{ScanScheduler, SchedulerSettings, SweepOutcome};
use netsweep_discover::service::ServiceProber;
use netsweep_discover::targets::TargetList;
use netsweep_discover::vlan::{self, VlanProber};

#[derive(Parser)]
#[command(name = "netsweep", version)]
#[command(about = "Resumable network sweeps: active subnets, live hosts and VLANs, SMB services")]
struct Cli {
    /// Config file prefix (default: netsweep).
    #[arg(short, long, default_value = "netsweep", global = true)]
    config: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by every sweep.
#[derive(Args, Clone)]
struct RunArgs {
    /// Worker pool size (default depends on the sweep).
    #[arg(short = 't', long)]
    workers: Option<usize>,

    /// Seconds a single unit may run before it is abandoned.
    #[arg(long)]
    timeout: Option<u64>,

    /// Checkpoint file; an interrupted sweep resumes from it.
    #[arg(long)]
    progress_file: Option<PathBuf>,

    /// Per-unit findings journal, replayed into the report on resume
    /// (default: beside the checkpoint).
    #[arg(long)]
    results_log: Option<PathBuf>,

    /// Also write the full report as JSON.
    #[arg(long)]
    json_report: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Ping-sweep subnets and list those with live hosts.
    Subnets {
        /// Base range to partition (repeatable).
        #[arg(short, long = "range", default_value = "10.0.0.0/8")]
        ranges: Vec<String>,

        /// Subnet unit size.
        #[arg(short, long)]
        prefix: Option<u8>,

        /// Active subnet list.
        #[arg(short, long, default_value = "active_subnets.txt")]
        output: PathBuf,

        /// Per-subnet host membership.
        #[arg(long, default_value = "subnet_hosts.txt")]
        hosts_output: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Ping every host in the private ranges and probe live ones for VLAN tags.
    Hosts {
        /// Range to sweep (repeatable; default: all RFC 1918 blocks).
        #[arg(short, long = "range")]
        ranges: Vec<String>,

        /// Live host list.
        #[arg(short, long, default_value = "live_hosts.txt")]
        output: PathBuf,

        /// VLAN findings.
        #[arg(long, default_value = "vlan_results.txt")]
        vlan_output: PathBuf,

        /// Skip 802.1Q probing.
        #[arg(long)]
        no_vlan: bool,

        /// Interface for tagged frames.
        #[arg(short, long)]
        interface: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Port-check hosts from a file and enumerate open SMB services.
    Services {
        /// Target file: one IP or CIDR per line.
        #[arg(short, long)]
        input: PathBuf,

        /// Comma-separated ports that mark a host worth enumerating.
        #[arg(short, long, default_value = "139,445")]
        ports: String,

        /// Per-host service report.
        #[arg(short, long, default_value = "smb_results.txt")]
        output: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },
}

impl Command {
    fn mode(&self) -> SweepMode {
        match self {
            Self::Subnets { .. } => SweepMode::Subnets,
            Self::Hosts { .. } => SweepMode::Hosts,
            Self::Services { .. } => SweepMode::Services,
        }
    }

    fn run_args(&self) -> &RunArgs {
        match self {
            Self::Subnets { run, .. } | Self::Hosts { run, .. } | Self::Services { run, .. } => run,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mode = cli.command.mode();
    let run = cli.command.run_args().clone();

    let mut config = config::load(&cli.config)?;
    apply_overrides(&mut config, &cli.command, &run);
    config.validate()?;
    privilege::check(mode)?;

    let settings = SchedulerSettings {
        workers: config.workers.for_mode(mode),
        unit_timeout: config.unit_timeout(),
    };
    let store = FileProgressStore::new(
        run.progress_file
            .clone()
            .unwrap_or_else(|| default_progress_path(mode)),
    );
    let journal_path = run
        .results_log
        .clone()
        .unwrap_or_else(|| default_journal_path(store.path()));
    tracing::info!(
        mode = %mode,
        workers = settings.workers,
        unit_timeout_secs = settings.unit_timeout.as_secs(),
        progress_file = %store.path().display(),
        results_log = %journal_path.display(),
        "Starting sweep"
    );
    let scheduler =
        ScanScheduler::new(settings, store)?.with_journal(ResultJournal::new(journal_path));
    let mut aggregator = ResultAggregator::new(config.subnet_prefix, config.activity_threshold)?;

    let (outcome, mut writer) = match &cli.command {
        Command::Subnets {
            ranges,
            output,
            hosts_output,
            ..
        } => {
            let partition = Partitioner::with_ranges(parse_ranges(ranges)?, config.subnet_prefix)?;
            tracing::info!(units = partition.len(), prefix = config.subnet_prefix, "Partitioned ranges");

            let scanner = verified_scanner(&config).await?;
            let prober: Arc<dyn Prober> = Arc::new(LivenessProber::ping_sweep(scanner));
            let outcome = scheduler.run(&partition, prober, &mut aggregator).await?;

            let writer = ReportWriter {
                active_subnets: Some(output.clone()),
                memberships: Some(hosts_output.clone()),
                ..Default::default()
            };
            (outcome, writer)
        }
        Command::Hosts {
            ranges,
            output,
            vlan_output,
            no_vlan,
            interface,
            ..
        } => {
            let ranges = if ranges.is_empty() {
                private_ranges()
            } else {
                parse_ranges(ranges)?
            };
            let partition = Partitioner::usable_hosts(ranges)?;
            tracing::info!(units = partition.len(), "Partitioned ranges");

            let liveness: Arc<dyn Prober> = Arc::new(LivenessProber::icmp(&config.ping_path));
            let probe_vlans = config.vlan.enabled && !*no_vlan;
            let prober: Arc<dyn Prober> = if probe_vlans {
                let name = interface.as_deref().or(config.vlan.interface.as_deref());
                let iface = vlan::select_interface(name)?;
                tracing::info!(interface = %iface.name, vlan_id = config.vlan.probe_vlan_id, "VLAN probing enabled");
                let tagger = VlanProber::new(
                    iface,
                    config.vlan.probe_vlan_id,
                    Duration::from_millis(config.vlan.reply_timeout_ms),
                );
                Arc::new(FollowUpProber::new(liveness, Arc::new(tagger)))
            } else {
                liveness
            };
            let outcome = scheduler.run(&partition, prober, &mut aggregator).await?;

            let writer = ReportWriter {
                live_hosts: Some(output.clone()),
                vlans: probe_vlans.then(|| vlan_output.clone()),
                ..Default::default()
            };
            (outcome, writer)
        }
        Command::Services {
            input,
            ports,
            output,
            ..
        } => {
            let targets = read_targets(input)?;
            let candidate_ports = parse_port_list(ports).map_err(DiscoverError::Setup)?;
            tracing::info!(hosts = targets.len(), ports = ?candidate_ports, "Loaded targets");

            let scanner = verified_scanner(&config).await?;
            let prober: Arc<dyn Prober> = Arc::new(ServiceProber::new(
                scanner,
                candidate_ports,
                config.smb_ports.clone(),
                config.smb_scripts.clone(),
            ));
            let outcome = scheduler.run(&targets, prober, &mut aggregator).await?;

            let writer = ReportWriter {
                services: Some(output.clone()),
                ..Default::default()
            };
            (outcome, writer)
        }
    };
    writer.json = run.json_report.clone();

    let report = aggregator.finish();

    writer.write(&report, &JsonReport::new(mode, &outcome, &report))?;
    print_summary(mode, &outcome, &report);

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn apply_overrides(config: &mut SweepConfig, command: &Command, run: &RunArgs) {
    if let Some(secs) = run.timeout {
        config.unit_timeout_secs = secs;
    }
    if let Some(workers) = run.workers {
        match command.mode() {
            SweepMode::Subnets => config.workers.subnets = workers,
            SweepMode::Hosts => config.workers.hosts = workers,
            SweepMode::Services => config.workers.services = workers,
        }
    }
    if let Command::Subnets {
        prefix: Some(prefix),
        ..
    } = command
    {
        config.subnet_prefix = *prefix;
    }
}

fn default_progress_path(mode: SweepMode) -> PathBuf {
    PathBuf::from(format!("netsweep-{mode}.progress"))
}

fn default_journal_path(progress: &Path) -> PathBuf {
    progress.with_extension("results.jsonl")
}

fn parse_ranges(inputs: &[String]) -> anyhow::Result<Vec<Ipv4Net>> {
    inputs
        .iter()
        .map(|r| parse_range(r).map_err(anyhow::Error::from))
        .collect()
}

fn read_targets(path: &Path) -> anyhow::Result<TargetList> {
    let targets = TargetList::from_file(path)?;
    if targets.is_empty() {
        anyhow::bail!("No targets found in {}", path.display());
    }
    Ok(targets)
}

async fn verified_scanner(config: &SweepConfig) -> anyhow::Result<NmapScanner> {
    let scanner = NmapScanner::new(&config.nmap_path);
    let version = scanner.verify_installation().await?;
    tracing::info!(nmap_path = scanner.path(), nmap_version = %version.trim(), "Nmap verified");
    Ok(scanner)
}

fn print_summary(mode: SweepMode, outcome: &SweepOutcome, report: &SweepReport) {
    let stats = &outcome.stats;
    println!("Sweep {} ({mode}) finished", outcome.sweep_id);
    println!(
        "  units: {} dispatched, {} completed, {} failed, {} timed out",
        stats.dispatched, stats.completed, stats.failed, stats.timed_out
    );
    println!("  results: {}", stats.results);
    if stats.replayed > 0 {
        println!("  carried over from the interrupted run: {} unit(s)", stats.replayed);
    }
    match mode {
        SweepMode::Subnets => println!("  active subnets: {}", report.active_subnets().len()),
        SweepMode::Hosts => println!(
            "  live hosts: {}, VLAN findings: {}",
            report.live_hosts.len(),
            report.vlans.len()
        ),
        SweepMode::Services => println!("  hosts with open services: {}", report.services.len()),
    }
    if let Some(marker) = outcome.checkpoint {
        println!("  checkpoint: {marker}");
    }
    if outcome.persistence_degraded() {
        println!(
            "WARNING: {} checkpoint or journal write(s) failed; saved progress is incomplete",
            stats.persistence_errors
        );
    }
}
