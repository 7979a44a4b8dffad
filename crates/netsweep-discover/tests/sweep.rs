//! End-to-end sweeps against deterministic fake probers.
//!
//! No network access or privileges needed: the probers synthesize findings
//! from the unit address, so every run of a fixture is reproducible.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use netsweep_core::{Finding, ScanResult, ScanUnit, ScriptOutcome};
use netsweep_discover::aggregate::{ResultAggregator, SweepReport};
use netsweep_discover::error::{DiscoverError, ProbeError};
use netsweep_discover::journal::ResultJournal;
use netsweep_discover::partition::{Partitioner, UnitSource};
use netsweep_discover::probe::Prober;
use netsweep_discover::progress::{FileProgressStore, MemoryProgressStore, ProgressStore};
use netsweep_discover::scheduler::{FailureKind, ScanScheduler, SchedulerSettings, SweepOutcome};
use netsweep_discover::targets::TargetList;

// ── Fixtures ──────────────────────────────────────────────────────

/// Ping-sweep stand-in: every /24 answers on .5; even-numbered /24s also on .9.
/// .200 is always reported down.
#[derive(Default)]
struct FixtureProber {
    probed: Mutex<Vec<ScanUnit>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
    delay: Duration,
    hang_on: Option<ScanUnit>,
    fail_on: Option<ScanUnit>,
    panic_on: Option<ScanUnit>,
}

impl FixtureProber {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn hang_on(mut self, unit: &str) -> Self {
        self.hang_on = Some(unit.parse().unwrap());
        self
    }

    fn fail_on(mut self, unit: &str) -> Self {
        self.fail_on = Some(unit.parse().unwrap());
        self
    }

    fn panic_on(mut self, unit: &str) -> Self {
        self.panic_on = Some(unit.parse().unwrap());
        self
    }

    fn probed(&self) -> Vec<ScanUnit> {
        let mut units = self.probed.lock().unwrap().clone();
        units.sort();
        units
    }
}

/// Decrements the in-flight count even when the probe future is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Prober for FixtureProber {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn probe(&self, unit: &ScanUnit) -> Result<Vec<ScanResult>, ProbeError> {
        self.probed.lock().unwrap().push(*unit);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        if self.hang_on == Some(*unit) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panic_on == Some(*unit) {
            panic!("malformed reply from {unit}");
        }
        if self.fail_on == Some(*unit) {
            return Err(ProbeError::ToolFailed {
                code: 1,
                stderr: "simulated failure".to_string(),
            });
        }

        let [a, b, c, _] = unit.base().octets();
        let mut last_octets = vec![(5, true), (200, false)];
        if c % 2 == 0 {
            last_octets.push((9, true));
        }
        Ok(last_octets
            .into_iter()
            .map(|(d, alive)| {
                ScanResult::new(
                    *unit,
                    Finding::Liveness {
                        host: Ipv4Addr::new(a, b, c, d),
                        alive,
                        hostname: None,
                    },
                )
            })
            .collect())
    }
}

/// SMB enumeration stand-in: 445 is open everywhere, and `smb-enum-users`
/// fails on hosts with an even last octet.
struct FixtureServiceProber;

#[async_trait]
impl Prober for FixtureServiceProber {
    fn name(&self) -> &'static str {
        "fixture-service"
    }

    async fn probe(&self, unit: &ScanUnit) -> Result<Vec<ScanResult>, ProbeError> {
        let host = unit.host().ok_or_else(|| ProbeError::Unsupported {
            prober: "fixture-service",
            target: unit.to_string(),
        })?;
        let mut results = vec![
            ScanResult::new(*unit, Finding::PortState { host, port: 139, open: false }),
            ScanResult::new(*unit, Finding::PortState { host, port: 445, open: true }),
        ];
        for script in ["smb-os-discovery", "smb-enum-users"] {
            let outcome = if script == "smb-enum-users" && host.octets()[3] % 2 == 0 {
                ScriptOutcome::Failed("NT_STATUS_ACCESS_DENIED".to_string())
            } else {
                ScriptOutcome::Output(format!("{script} on {host}"))
            };
            results.push(ScanResult::new(
                *unit,
                Finding::Service {
                    host,
                    port: 445,
                    script: script.to_string(),
                    outcome,
                },
            ));
        }
        Ok(results)
    }
}

fn unit(s: &str) -> ScanUnit {
    s.parse().unwrap()
}

fn partition() -> Partitioner {
    Partitioner::new("10.0.0.0/20".parse().unwrap(), 24).unwrap()
}

fn settings(workers: usize, timeout: Duration) -> SchedulerSettings {
    SchedulerSettings {
        workers,
        unit_timeout: timeout,
    }
}

async fn sweep<S: UnitSource>(
    source: &S,
    prober: Arc<dyn Prober>,
    settings: SchedulerSettings,
    store: impl ProgressStore + 'static,
) -> (SweepOutcome, SweepReport) {
    let scheduler = ScanScheduler::new(settings, store).unwrap();
    run(&scheduler, source, prober).await
}

/// A sweep whose checkpoint and findings journal live in `dir`.
async fn sweep_in<S: UnitSource>(
    dir: &Path,
    source: &S,
    prober: Arc<dyn Prober>,
) -> (SweepOutcome, SweepReport) {
    let scheduler = ScanScheduler::new(
        settings(4, Duration::from_secs(5)),
        FileProgressStore::new(dir.join("progress.txt")),
    )
    .unwrap()
    .with_journal(ResultJournal::new(dir.join("results.jsonl")));
    run(&scheduler, source, prober).await
}

async fn run<S: UnitSource>(
    scheduler: &ScanScheduler,
    source: &S,
    prober: Arc<dyn Prober>,
) -> (SweepOutcome, SweepReport) {
    let mut agg = ResultAggregator::new(24, 2).unwrap();
    let outcome = scheduler.run(source, prober, &mut agg).await.unwrap();
    (outcome, agg.finish())
}

fn even_subnets() -> Vec<Ipv4Net> {
    (0..16u8)
        .step_by(2)
        .map(|c| format!("10.0.{c}.0/24").parse().unwrap())
        .collect()
}

fn assert_strictly_ascending(history: &[ScanUnit]) {
    for pair in history.windows(2) {
        assert!(pair[0] < pair[1], "checkpoint regressed: {} then {}", pair[0], pair[1]);
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[tokio::test]
async fn full_sweep_reports_even_subnets_active() {
    let store = MemoryProgressStore::new();
    let prober = Arc::new(FixtureProber::new());
    let (outcome, report) = sweep(
        &partition(),
        prober.clone(),
        settings(4, Duration::from_secs(5)),
        store.clone(),
    )
    .await;

    assert_eq!(outcome.stats.dispatched, 16);
    assert_eq!(outcome.stats.completed, 16);
    // Only the live hosts count; the down .200 observations are dropped.
    assert_eq!(outcome.stats.results, 24);
    assert_eq!(outcome.checkpoint, Some(unit("10.0.15.0/24")));
    assert_eq!(store.marker(), Some(unit("10.0.15.0/24")));
    assert_strictly_ascending(&store.history());
    assert_eq!(prober.probed().len(), 16);

    assert_eq!(report.active_subnets(), even_subnets());
    assert_eq!(report.subnets.len(), 16);
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn timed_out_unit_is_recorded_and_passed() {
    let store = MemoryProgressStore::new();
    let prober = Arc::new(FixtureProber::new().hang_on("10.0.3.0/24"));
    let (outcome, _) = sweep(
        &partition(),
        prober.clone(),
        settings(4, Duration::from_millis(200)),
        store.clone(),
    )
    .await;

    assert_eq!(outcome.stats.timed_out, 1);
    assert_eq!(outcome.stats.completed, 15);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].unit, unit("10.0.3.0/24"));
    assert_eq!(outcome.failures[0].kind, FailureKind::Timeout);

    assert_eq!(store.marker(), Some(unit("10.0.15.0/24")));
    assert_strictly_ascending(&store.history());
    // The abandoned probe was dropped, not left running.
    assert_eq!(prober.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_unit_does_not_stop_the_sweep() {
    let prober = Arc::new(FixtureProber::new().fail_on("10.0.7.0/24"));
    let (outcome, report) = sweep(
        &partition(),
        prober,
        settings(2, Duration::from_secs(5)),
        MemoryProgressStore::new(),
    )
    .await;

    assert_eq!(outcome.stats.failed, 1);
    assert_eq!(outcome.stats.completed, 15);
    assert_eq!(outcome.checkpoint, Some(unit("10.0.15.0/24")));

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, FailureKind::ProbeFailure);
    assert!(report.failures[0].detail.contains("simulated failure"));
    assert!(report
        .subnets
        .iter()
        .all(|s| s.subnet != "10.0.7.0/24".parse::<Ipv4Net>().unwrap()));
}

#[tokio::test]
async fn worker_pool_bounds_concurrency() {
    let prober = Arc::new(FixtureProber::new().with_delay(Duration::from_millis(20)));
    let (outcome, _) = sweep(
        &partition(),
        prober.clone(),
        settings(3, Duration::from_secs(5)),
        MemoryProgressStore::new(),
    )
    .await;

    assert_eq!(outcome.stats.completed, 16);
    let peak = prober.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak} exceeded pool size");
    assert!(peak > 1, "workers never overlapped");
}

#[tokio::test]
async fn completions_in_any_order_never_regress_checkpoint() {
    // Later units finish first while early ones are still sleeping.
    let store = MemoryProgressStore::new();
    let prober = Arc::new(FixtureProber::new().hang_on("10.0.0.0/24"));
    let (outcome, _) = sweep(
        &partition(),
        prober,
        settings(8, Duration::from_millis(300)),
        store.clone(),
    )
    .await;

    assert_eq!(outcome.stats.timed_out, 1);
    let history = store.history();
    assert!(!history.is_empty());
    assert_strictly_ascending(&history);
    assert_eq!(history.last(), Some(&unit("10.0.15.0/24")));
}

#[tokio::test]
async fn resume_rescans_the_marker_unit() {
    let store = MemoryProgressStore::with_marker(unit("10.0.5.0/24"));
    let prober = Arc::new(FixtureProber::new());
    let (outcome, _) = sweep(
        &partition(),
        prober.clone(),
        settings(4, Duration::from_secs(5)),
        store.clone(),
    )
    .await;

    let expected: Vec<ScanUnit> = (5..16u8).map(|c| unit(&format!("10.0.{c}.0/24"))).collect();
    assert_eq!(prober.probed(), expected);
    assert_eq!(outcome.resumed_from, Some(unit("10.0.5.0/24")));
    assert_eq!(outcome.stats.dispatched, 11);
    assert_eq!(store.marker(), Some(unit("10.0.15.0/24")));
    assert!(store.history().iter().all(|u| *u > unit("10.0.5.0/24")));
}

#[tokio::test]
async fn resume_from_checkpoint_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.txt");
    std::fs::write(&path, "10.0.12.0/24\n").unwrap();

    let prober = Arc::new(FixtureProber::new());
    let (outcome, _) = sweep(
        &partition(),
        prober.clone(),
        settings(2, Duration::from_secs(5)),
        FileProgressStore::new(&path),
    )
    .await;

    assert_eq!(prober.probed().len(), 4);
    assert_eq!(outcome.checkpoint, Some(unit("10.0.15.0/24")));
    assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "10.0.15.0/24");
}

#[tokio::test]
async fn malformed_checkpoint_file_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.txt");
    std::fs::write(&path, "not a unit").unwrap();

    let prober = Arc::new(FixtureProber::new());
    let (outcome, _) = sweep(
        &partition(),
        prober.clone(),
        settings(4, Duration::from_secs(5)),
        FileProgressStore::new(&path),
    )
    .await;

    assert_eq!(outcome.resumed_from, None);
    assert_eq!(prober.probed().len(), 16);
}

#[tokio::test]
async fn unwritable_checkpoint_degrades_but_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing-dir").join("progress.txt");

    let (outcome, report) = sweep(
        &partition(),
        Arc::new(FixtureProber::new()),
        settings(4, Duration::from_secs(5)),
        FileProgressStore::new(&path),
    )
    .await;

    assert!(outcome.persistence_degraded());
    assert_eq!(outcome.stats.checkpoint_writes, 0);
    assert_eq!(outcome.checkpoint, None);
    assert_eq!(outcome.stats.completed, 16);
    assert_eq!(report.active_subnets().len(), 8);
}

#[tokio::test]
async fn repeated_sweeps_produce_identical_reports() {
    let (first, first_report) = sweep(
        &partition(),
        Arc::new(FixtureProber::new()),
        settings(5, Duration::from_secs(5)),
        MemoryProgressStore::new(),
    )
    .await;
    let (second, second_report) = sweep(
        &partition(),
        Arc::new(FixtureProber::new().with_delay(Duration::from_millis(1))),
        settings(3, Duration::from_secs(5)),
        MemoryProgressStore::new(),
    )
    .await;

    assert_ne!(first.sweep_id, second.sweep_id);
    assert_eq!(first_report, second_report);
}

#[tokio::test]
async fn service_sweep_keeps_partial_enumeration() {
    let targets = TargetList::parse("10.0.0.20\n10.0.0.21\n").unwrap();
    let (_, report) = sweep(
        &targets,
        Arc::new(FixtureServiceProber),
        settings(5, Duration::from_secs(5)),
        MemoryProgressStore::new(),
    )
    .await;

    assert_eq!(report.services.len(), 2);
    let even = &report.services[0];
    assert_eq!(even.host, Ipv4Addr::new(10, 0, 0, 20));
    assert_eq!(even.open_ports.iter().copied().collect::<Vec<_>>(), vec![445]);

    let scripts: HashSet<(&str, bool)> = even
        .enumeration
        .iter()
        .map(|e| (e.script.as_str(), e.outcome.is_failure()))
        .collect();
    assert!(scripts.contains(&("smb-os-discovery", false)));
    assert!(scripts.contains(&("smb-enum-users", true)));

    let odd = &report.services[1];
    assert!(odd.enumeration.iter().all(|e| !e.outcome.is_failure()));
}

#[tokio::test]
async fn subnet_units_rejected_by_host_prober_are_failures() {
    let (outcome, report) = sweep(
        &partition(),
        Arc::new(FixtureServiceProber),
        settings(4, Duration::from_secs(5)),
        MemoryProgressStore::new(),
    )
    .await;

    assert_eq!(outcome.stats.failed, 16);
    assert_eq!(outcome.checkpoint, Some(unit("10.0.15.0/24")));
    assert!(report.services.is_empty());
}

#[tokio::test]
async fn panicking_prober_fails_only_its_unit() {
    let store = MemoryProgressStore::new();
    let prober = Arc::new(FixtureProber::new().panic_on("10.0.2.0/24"));
    let (outcome, report) = sweep(
        &partition(),
        prober.clone(),
        settings(4, Duration::from_secs(5)),
        store.clone(),
    )
    .await;

    assert_eq!(outcome.stats.failed, 1);
    assert_eq!(outcome.stats.completed, 15);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].unit, unit("10.0.2.0/24"));
    assert_eq!(outcome.failures[0].kind, FailureKind::ProbeFailure);
    assert!(outcome.failures[0].detail.contains("malformed reply"));

    // The checkpoint still reaches the end.
    assert_eq!(outcome.checkpoint, Some(unit("10.0.15.0/24")));
    assert_eq!(store.marker(), Some(unit("10.0.15.0/24")));
    assert_strictly_ascending(&store.history());
    assert_eq!(prober.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(report.active_subnets().len(), 7);
}

#[tokio::test]
async fn resumed_sweep_reports_the_whole_range() {
    let dir = tempfile::tempdir().unwrap();

    // The first run only gets through the lower half before stopping.
    let lower_half = Partitioner::new("10.0.0.0/21".parse().unwrap(), 24).unwrap();
    let (first, _) = sweep_in(dir.path(), &lower_half, Arc::new(FixtureProber::new())).await;
    assert_eq!(first.checkpoint, Some(unit("10.0.7.0/24")));

    let prober = Arc::new(FixtureProber::new());
    let (resumed, report) = sweep_in(dir.path(), &partition(), prober.clone()).await;
    assert_eq!(resumed.resumed_from, Some(unit("10.0.7.0/24")));
    assert_eq!(resumed.stats.replayed, 7);
    assert_eq!(resumed.stats.dispatched, 9);
    assert_eq!(prober.probed().first(), Some(&unit("10.0.7.0/24")));

    let (_, uninterrupted) = sweep(
        &partition(),
        Arc::new(FixtureProber::new()),
        settings(4, Duration::from_secs(5)),
        MemoryProgressStore::new(),
    )
    .await;
    assert_eq!(report.active_subnets(), even_subnets());
    assert_eq!(report, uninterrupted);
}

#[tokio::test]
async fn finished_sweep_starts_over_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let (first, _) = sweep_in(dir.path(), &partition(), Arc::new(FixtureProber::new())).await;
    assert_eq!(first.checkpoint, Some(unit("10.0.15.0/24")));

    let prober = Arc::new(FixtureProber::new());
    let (second, report) = sweep_in(dir.path(), &partition(), prober.clone()).await;
    assert_eq!(second.resumed_from, None);
    assert_eq!(second.stats.replayed, 0);
    assert_eq!(second.stats.dispatched, 16);
    assert_eq!(prober.probed().len(), 16);
    assert_eq!(report.active_subnets(), even_subnets());

    // One journal line per unit; the first run's records were discarded.
    let journal = std::fs::read_to_string(dir.path().join("results.jsonl")).unwrap();
    assert_eq!(journal.lines().count(), 16);
    assert!(!journal.contains("10.0.0.200"));
}

#[tokio::test]
async fn unwritable_journal_is_fatal_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = ScanScheduler::new(settings(2, Duration::from_secs(5)), MemoryProgressStore::new())
        .unwrap()
        .with_journal(ResultJournal::new(dir.path().join("missing").join("results.jsonl")));
    let prober = Arc::new(FixtureProber::new());
    let mut agg = ResultAggregator::new(24, 2).unwrap();

    let err = scheduler
        .run(&partition(), prober.clone(), &mut agg)
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoverError::Persistence { .. }));
    assert!(prober.probed().is_empty());
}
