//! Sweep scheduling engine.
//!
//! A fixed pool of tokio worker tasks pulls units from a shared queue, runs
//! the prober on each under a per-unit timeout, and reports back over a
//! channel. The receiving side is the only writer of the checkpoint and the
//! result journal, and feeds the aggregator as reports arrive.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netsweep_core::{ScanResult, ScanUnit};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::timeout;
use uuid::Uuid;

use crate::aggregate::ResultAggregator;
use crate::config::MAX_WORKERS;
use crate::error::{DiscoverError, ProbeError, Result};
use crate::journal::{JournalRecord, ResultJournal};
use crate::partition::UnitSource;
use crate::probe::Prober;
use crate::progress::ProgressStore;

/// Pool size and per-unit time budget.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub unit_timeout: Duration,
}

/// How one unit ended.
#[derive(Debug)]
pub enum UnitOutcome {
    Completed(Vec<ScanResult>),
    Failed(ProbeError),
    TimedOut,
}

#[derive(Debug)]
struct UnitReport {
    seq: u64,
    unit: ScanUnit,
    outcome: UnitOutcome,
    elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ProbeFailure,
    InsufficientPrivilege,
}

/// A unit that produced no results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit: ScanUnit,
    pub prober: String,
    pub kind: FailureKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Positive findings from this run.
    pub results: u64,
    /// Journal records carried over from an interrupted run.
    pub replayed: u64,
    pub checkpoint_writes: u64,
    pub persistence_errors: u64,
}

/// What a sweep did. Findings go to the aggregator, not here.
#[derive(Debug)]
pub struct SweepOutcome {
    pub sweep_id: Uuid,
    pub resumed_from: Option<ScanUnit>,
    pub checkpoint: Option<ScanUnit>,
    /// Failures from this run only.
    pub failures: Vec<UnitFailure>,
    pub stats: SweepStats,
}

impl SweepOutcome {
    /// True when a checkpoint or journal write failed, so persisted state
    /// lags behind the work actually done.
    pub fn persistence_degraded(&self) -> bool {
        self.stats.persistence_errors > 0
    }
}

/// Drives a bounded-concurrency sweep and owns the persisted sweep state.
pub struct ScanScheduler {
    settings: SchedulerSettings,
    progress: Mutex<Box<dyn ProgressStore>>,
    journal: Mutex<Option<ResultJournal>>,
}

impl ScanScheduler {
    pub fn new(settings: SchedulerSettings, progress: impl ProgressStore + 'static) -> Result<Self> {
        if settings.workers == 0 || settings.workers > MAX_WORKERS {
            return Err(DiscoverError::Setup(format!(
                "worker pool size must be within 1..={MAX_WORKERS}, got {}",
                settings.workers
            )));
        }
        if settings.unit_timeout.is_zero() {
            return Err(DiscoverError::Setup(
                "unit timeout must be positive".to_string(),
            ));
        }
        Ok(Self {
            settings,
            progress: Mutex::new(Box::new(progress)),
            journal: Mutex::new(None),
        })
    }

    /// Keep per-unit findings in `journal` so a resumed sweep can report
    /// what earlier runs found.
    pub fn with_journal(self, journal: ResultJournal) -> Self {
        Self {
            journal: Mutex::new(Some(journal)),
            ..self
        }
    }

    /// Sweep every unit of `source` that does not sort before the stored
    /// checkpoint, running `prober` once per unit and streaming findings
    /// into `aggregator`.
    ///
    /// A checkpoint at the source's final unit means the previous sweep
    /// finished, so the sweep starts over. On resume, journaled findings for
    /// the units already covered are replayed into `aggregator` first.
    ///
    /// Per-unit failures, timeouts and panics are recorded and never abort
    /// the sweep. Only an unreadable checkpoint or journal is fatal.
    pub async fn run<S: UnitSource>(
        &self,
        source: &S,
        prober: Arc<dyn Prober>,
        aggregator: &mut ResultAggregator,
    ) -> Result<SweepOutcome> {
        let sweep_id = Uuid::new_v4();
        let resumed_from = match self.with_store(|store| store.load())? {
            Some(marker) if source.last().is_some_and(|last| marker >= last) => {
                tracing::info!(marker = %marker, "Previous sweep finished, starting over");
                None
            }
            other => other,
        };
        let started = Instant::now();

        let mut outcome = SweepOutcome {
            sweep_id,
            resumed_from,
            checkpoint: resumed_from,
            failures: Vec::new(),
            stats: SweepStats::default(),
        };

        let replay = self.journal_op(|journal| journal.resume(resumed_from.as_ref()))?;
        for record in replay.into_iter().flatten() {
            outcome.stats.replayed += 1;
            aggregator.ingest_all(record.results);
            aggregator.record_failures(record.failure);
        }

        tracing::info!(
            sweep_id = %sweep_id,
            prober = prober.name(),
            workers = self.settings.workers,
            unit_timeout_secs = self.settings.unit_timeout.as_secs(),
            resumed_from = ?resumed_from.map(|u| u.to_string()),
            replayed = outcome.stats.replayed,
            "Sweep started"
        );

        let queue = Arc::new(Mutex::new(WorkQueue::new(
            source.resume_from(resumed_from.as_ref()),
        )));
        let (tx, mut rx) = mpsc::channel::<UnitReport>(self.settings.workers * 2);

        let mut handles = Vec::with_capacity(self.settings.workers);
        for worker in 0..self.settings.workers {
            let handle = tokio::spawn(worker_loop(
                worker,
                queue.clone(),
                prober.clone(),
                tx.clone(),
                self.settings.unit_timeout,
            ));
            handles.push(handle);
        }
        drop(tx);

        let mut collector = Collector {
            prober: prober.name(),
            watermark: Watermark::new(resumed_from),
            outcome,
            aggregator,
            journal_intact: true,
        };
        while let Some(report) = rx.recv().await {
            self.record(report, &mut collector);
        }
        let outcome = collector.outcome;

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(sweep_id = %sweep_id, error = %e, "Sweep worker panicked");
            }
        }

        let stats = &outcome.stats;
        tracing::info!(
            sweep_id = %sweep_id,
            dispatched = stats.dispatched,
            completed = stats.completed,
            failed = stats.failed,
            timed_out = stats.timed_out,
            results = stats.results,
            checkpoint = ?outcome.checkpoint.map(|u| u.to_string()),
            duration_ms = started.elapsed().as_millis() as u64,
            "Sweep complete"
        );
        if outcome.persistence_degraded() {
            tracing::warn!(
                sweep_id = %sweep_id,
                persistence_errors = stats.persistence_errors,
                "Sweep state writes failed during the sweep; persisted progress is incomplete"
            );
        }

        Ok(outcome)
    }

    fn record(&self, report: UnitReport, c: &mut Collector<'_>) {
        let UnitReport {
            seq,
            unit,
            outcome: unit_outcome,
            elapsed,
        } = report;
        c.outcome.stats.dispatched += 1;

        let mut entry = JournalRecord {
            unit,
            results: Vec::new(),
            failure: None,
        };
        match unit_outcome {
            UnitOutcome::Completed(mut results) => {
                tracing::debug!(
                    unit = %unit,
                    results = results.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Unit complete"
                );
                results.retain(|r| r.finding.is_positive());
                c.outcome.stats.completed += 1;
                c.outcome.stats.results += results.len() as u64;
                entry.results = results;
            }
            UnitOutcome::Failed(e) => {
                tracing::warn!(unit = %unit, prober = c.prober, error = %e, "Unit probe failed");
                c.outcome.stats.failed += 1;
                let kind = match e {
                    ProbeError::InsufficientPrivilege(_) => FailureKind::InsufficientPrivilege,
                    _ => FailureKind::ProbeFailure,
                };
                entry.failure = Some(UnitFailure {
                    unit,
                    prober: c.prober.to_string(),
                    kind,
                    detail: e.to_string(),
                });
            }
            UnitOutcome::TimedOut => {
                tracing::warn!(
                    unit = %unit,
                    prober = c.prober,
                    timeout_secs = self.settings.unit_timeout.as_secs(),
                    "Unit timed out"
                );
                c.outcome.stats.timed_out += 1;
                entry.failure = Some(UnitFailure {
                    unit,
                    prober: c.prober.to_string(),
                    kind: FailureKind::Timeout,
                    detail: format!("no result within {:?}", self.settings.unit_timeout),
                });
            }
        }

        if c.journal_intact && !entry.is_empty() {
            if let Err(e) = self.journal_op(|journal| journal.append(&entry)) {
                tracing::error!(
                    unit = %unit,
                    error = %e,
                    "Result journal write failed; checkpoint held at its current unit"
                );
                c.outcome.stats.persistence_errors += 1;
                c.journal_intact = false;
            }
        }

        let JournalRecord {
            results, failure, ..
        } = entry;
        c.aggregator.ingest_all(results);
        if let Some(failure) = failure {
            c.outcome.failures.push(failure.clone());
            c.aggregator.record_failures([failure]);
        }

        // Past a journal gap, a resume would lose findings, so stop advancing.
        if let Some(marker) = c.watermark.finish(seq, unit).filter(|_| c.journal_intact) {
            match self.with_store(|store| store.save(&marker)) {
                Ok(()) => {
                    c.outcome.stats.checkpoint_writes += 1;
                    c.outcome.checkpoint = Some(marker);
                }
                Err(e) => {
                    tracing::error!(marker = %marker, error = %e, "Checkpoint write failed");
                    c.outcome.stats.persistence_errors += 1;
                }
            }
        }

        if c.outcome.stats.dispatched % 256 == 0 {
            tracing::info!(
                finished = c.outcome.stats.dispatched,
                results = c.outcome.stats.results,
                "Sweep progress"
            );
        }
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut dyn ProgressStore) -> Result<T>) -> Result<T> {
        let mut store = self
            .progress
            .lock()
            .map_err(|_| DiscoverError::Setup("progress store lock poisoned".to_string()))?;
        f(store.as_mut())
    }

    /// Run `f` on the journal, if one is attached.
    fn journal_op<T>(&self, f: impl FnOnce(&mut ResultJournal) -> Result<T>) -> Result<Option<T>> {
        let mut journal = self
            .journal
            .lock()
            .map_err(|_| DiscoverError::Setup("result journal lock poisoned".to_string()))?;
        journal.as_mut().map(f).transpose()
    }
}

/// Collector-side state for one sweep.
struct Collector<'a> {
    prober: &'static str,
    watermark: Watermark,
    outcome: SweepOutcome,
    aggregator: &'a mut ResultAggregator,
    journal_intact: bool,
}

/// Units not yet claimed, numbered in claim order.
struct WorkQueue<I> {
    units: I,
    next_seq: u64,
}

impl<I: Iterator<Item = ScanUnit>> WorkQueue<I> {
    fn new(units: I) -> Self {
        Self { units, next_seq: 0 }
    }

    fn claim(&mut self) -> Option<(u64, ScanUnit)> {
        let unit = self.units.next()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        Some((seq, unit))
    }
}

async fn worker_loop<I>(
    worker: usize,
    queue: Arc<Mutex<WorkQueue<I>>>,
    prober: Arc<dyn Prober>,
    tx: mpsc::Sender<UnitReport>,
    unit_timeout: Duration,
) where
    I: Iterator<Item = ScanUnit>,
{
    loop {
        let claimed = match queue.lock() {
            Ok(mut q) => q.claim(),
            Err(_) => {
                tracing::error!(worker, "Work queue lock poisoned, worker exiting");
                break;
            }
        };
        let Some((seq, unit)) = claimed else {
            break;
        };

        let started = Instant::now();
        let task_prober = prober.clone();
        // Its own task, so a panicking prober fails this unit and nothing else.
        let mut task = tokio::spawn(async move { task_prober.probe(&unit).await });
        let outcome = match timeout(unit_timeout, &mut task).await {
            Ok(Ok(Ok(results))) => UnitOutcome::Completed(results),
            Ok(Ok(Err(e))) => UnitOutcome::Failed(e),
            Ok(Err(e)) => UnitOutcome::Failed(ProbeError::Panicked(join_failure(e))),
            Err(_) => {
                task.abort();
                // Wait for the cancelled probe to be dropped so its resources go with it.
                let _ = task.await;
                UnitOutcome::TimedOut
            }
        };

        let report = UnitReport {
            seq,
            unit,
            outcome,
            elapsed: started.elapsed(),
        };
        if tx.send(report).await.is_err() {
            break;
        }
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Low-watermark over finished units.
///
/// The marker is the last unit of the longest prefix of claimed units that
/// have all finished. It never moves backwards, and never passes a unit that
/// is still in flight, so resuming from it cannot skip unfinished work.
#[derive(Debug)]
struct Watermark {
    next_seq: u64,
    finished: BTreeMap<u64, ScanUnit>,
    marker: Option<ScanUnit>,
}

impl Watermark {
    fn new(marker: Option<ScanUnit>) -> Self {
        Self {
            next_seq: 0,
            finished: BTreeMap::new(),
            marker,
        }
    }

    /// Record `seq` as finished. Returns the new marker if it advanced.
    fn finish(&mut self, seq: u64, unit: ScanUnit) -> Option<ScanUnit> {
        self.finished.insert(seq, unit);

        let mut advanced = None;
        while let Some(unit) = self.finished.remove(&self.next_seq) {
            self.next_seq += 1;
            advanced = Some(unit);
        }

        let candidate = advanced?;
        if self.marker.is_some_and(|m| candidate <= m) {
            return None;
        }
        self.marker = Some(candidate);
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::MemoryProgressStore;

    fn unit(s: &str) -> ScanUnit {
        s.parse().unwrap()
    }

    #[test]
    fn watermark_waits_for_gaps() {
        let mut wm = Watermark::new(None);
        assert_eq!(wm.finish(1, unit("10.0.1.0/24")), None);
        assert_eq!(wm.finish(2, unit("10.0.2.0/24")), None);
        assert_eq!(wm.finish(0, unit("10.0.0.0/24")), Some(unit("10.0.2.0/24")));
        assert_eq!(wm.finish(3, unit("10.0.3.0/24")), Some(unit("10.0.3.0/24")));
    }

    #[test]
    fn watermark_never_regresses_below_resume_marker() {
        let mut wm = Watermark::new(Some(unit("10.0.5.0/24")));
        // The resume marker itself is re-scanned first; finishing it is not an advance.
        assert_eq!(wm.finish(0, unit("10.0.5.0/24")), None);
        assert_eq!(wm.finish(1, unit("10.0.6.0/24")), Some(unit("10.0.6.0/24")));
    }

    #[test]
    fn work_queue_numbers_claims() {
        let mut queue = WorkQueue::new(vec![unit("10.0.0.0/24"), unit("10.0.1.0/24")].into_iter());
        assert_eq!(queue.claim(), Some((0, unit("10.0.0.0/24"))));
        assert_eq!(queue.claim(), Some((1, unit("10.0.1.0/24"))));
        assert_eq!(queue.claim(), None);
    }

    #[test]
    fn rejects_empty_pool_and_zero_timeout() {
        let zero_workers = SchedulerSettings {
            workers: 0,
            unit_timeout: Duration::from_secs(1),
        };
        assert!(ScanScheduler::new(zero_workers, MemoryProgressStore::new()).is_err());

        let zero_timeout = SchedulerSettings {
            workers: 4,
            unit_timeout: Duration::ZERO,
        };
        assert!(ScanScheduler::new(zero_timeout, MemoryProgressStore::new()).is_err());

        let oversized = SchedulerSettings {
            workers: MAX_WORKERS + 1,
            unit_timeout: Duration::from_secs(1),
        };
        assert!(ScanScheduler::new(oversized, MemoryProgressStore::new()).is_err());
    }

    #[tokio::test]
    async fn panic_payload_is_kept() {
        let err = tokio::spawn(async { panic!("bad frame") }).await.unwrap_err();
        assert_eq!(join_failure(err), "bad frame");

        let owned = tokio::spawn(async { panic!("unit {}", 7) }).await.unwrap_err();
        assert_eq!(join_failure(owned), "unit 7");
    }
}
