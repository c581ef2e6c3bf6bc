//! Runs every configured source concurrently and feeds the results through
//! the reconciler.
//!
//! Each source gets its own scoped thread. Storage is shared behind a mutex
//! taken per call, and each collection has its own lock held across the
//! whole read-plan-commit sequence so two sources never reconcile the same
//! history at once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use campus_covid_core::{
    format_day, format_rfc3339, now_utc, CollectionId, CovidError, HistoryReader, Observation,
    Reconciler, Reconciliation, Record, RecordStore, Write,
};
use serde::Serialize;
use time::Date;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::sources::SourceExtractor;

pub const RUN_REPORT_CONTRACT_VERSION: &str = "run_report.v1";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct IngestConfig {
    /// Total extraction attempts per source, including the first.
    pub attempts: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_millis(1_000),
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            bail!("attempts MUST be >= 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct SourceReport {
    pub source: String,
    pub status: SourceStatus,
    pub attempts: u32,
    pub observations: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl SourceReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            status: SourceStatus::Succeeded,
            attempts: 0,
            observations: 0,
            inserted: 0,
            replaced: 0,
            unchanged: 0,
            errors: Vec::new(),
            elapsed_ms: 0,
        }
    }

    fn tally(&mut self, outcomes: &[Reconciliation]) {
        for outcome in outcomes {
            match outcome {
                Reconciliation::Insert { .. } => self.inserted += 1,
                Reconciliation::Replace { .. } => self.replaced += 1,
                Reconciliation::Unchanged { .. } => self.unchanged += 1,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct RunReport {
    pub contract_version: String,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub all_succeeded: bool,
    pub sources: Vec<SourceReport>,
}

/// One lock per collection, created on first use.
#[derive(Debug, Default)]
struct CollectionLocks {
    table: Mutex<BTreeMap<CollectionId, Arc<Mutex<()>>>>,
}

impl CollectionLocks {
    fn lock_for(&self, collection_id: CollectionId) -> Result<Arc<Mutex<()>>, CovidError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| CovidError::Storage("collection lock table poisoned".to_string()))?;
        Ok(Arc::clone(table.entry(collection_id).or_default()))
    }
}

/// Store access that takes the shared mutex for each call.
struct StoreHandle<'a, S> {
    store: &'a Mutex<S>,
}

impl<S> StoreHandle<'_, S> {
    fn with<T>(&self, f: impl FnOnce(&mut S) -> Result<T, CovidError>) -> Result<T, CovidError> {
        let mut guard = self
            .store
            .lock()
            .map_err(|_| CovidError::Storage("record store mutex poisoned".to_string()))?;
        f(&mut guard)
    }
}

impl<S: RecordStore> HistoryReader for StoreHandle<'_, S> {
    fn find_by_collection_and_date(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        self.with(|store| store.find_by_collection_and_date(collection_id, date))
    }

    fn find_latest_before(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        self.with(|store| store.find_latest_before(collection_id, date))
    }

    fn find_earliest_after(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        self.with(|store| store.find_earliest_after(collection_id, date))
    }
}

impl<S: RecordStore> RecordStore for StoreHandle<'_, S> {
    fn insert(&mut self, record: &Record) -> Result<(), CovidError> {
        self.with(|store| store.insert(record))
    }

    fn delete_by_collection_and_date(
        &mut self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<(), CovidError> {
        self.with(|store| store.delete_by_collection_and_date(collection_id, date))
    }

    fn commit(&mut self, writes: &[Write]) -> Result<(), CovidError> {
        self.with(|store| store.commit(writes))
    }

    fn list(&self, collection_id: CollectionId) -> Result<Vec<Record>, CovidError> {
        self.with(|store| store.list(collection_id))
    }
}

pub struct IngestDriver<'a, S> {
    reconciler: Reconciler<'a>,
    store: &'a Mutex<S>,
    locks: CollectionLocks,
    config: IngestConfig,
}

impl<'a, S: RecordStore + Send> IngestDriver<'a, S> {
    pub fn new(
        reconciler: Reconciler<'a>,
        store: &'a Mutex<S>,
        config: IngestConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            reconciler,
            store,
            locks: CollectionLocks::default(),
            config,
        })
    }

    pub fn run(&self, sources: &[Box<dyn SourceExtractor>]) -> Result<RunReport> {
        let run_id = Ulid::new();
        let started_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        info!(%run_id, sources = sources.len(), "scraping data");
        let clock = Instant::now();

        let reports: Vec<SourceReport> = thread::scope(|scope| {
            let handles: Vec<_> = sources
                .iter()
                .map(|source| scope.spawn(move || self.run_source(source.as_ref())))
                .collect();

            handles
                .into_iter()
                .zip(sources)
                .map(|(handle, source)| {
                    handle.join().unwrap_or_else(|_| {
                        let mut report = SourceReport::new(source.name());
                        report.status = SourceStatus::Failed;
                        report.errors.push("source thread panicked".to_string());
                        report
                    })
                })
                .collect()
        });

        let all_succeeded = reports
            .iter()
            .all(|report| report.status == SourceStatus::Succeeded);
        if all_succeeded {
            info!(%run_id, elapsed_ms = elapsed_ms(clock), "scraping completed");
        } else {
            error!(%run_id, "at least one of the scrapes failed");
        }

        Ok(RunReport {
            contract_version: RUN_REPORT_CONTRACT_VERSION.to_string(),
            run_id: run_id.to_string(),
            started_at,
            finished_at: format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
            all_succeeded,
            sources: reports,
        })
    }

    fn run_source(&self, source: &dyn SourceExtractor) -> SourceReport {
        let name = source.name();
        let mut report = SourceReport::new(name);
        let clock = Instant::now();
        info!(source = name, "> starting");

        let extracted = loop {
            report.attempts += 1;
            match source.extract() {
                Ok(observations) => break Ok(observations),
                Err(err) if report.attempts < self.config.attempts => {
                    warn!(
                        source = name,
                        attempt = report.attempts,
                        error = %format!("{err:#}"),
                        "extraction failed, retrying"
                    );
                    thread::sleep(self.config.retry_delay);
                }
                Err(err) => break Err(err),
            }
        };

        let observations = match extracted {
            Ok(observations) => {
                info!(source = name, elapsed_ms = elapsed_ms(clock), "= finished");
                observations
            }
            Err(err) => {
                error!(
                    source = name,
                    attempts = report.attempts,
                    elapsed_ms = elapsed_ms(clock),
                    error = %format!("{err:#}"),
                    "! errored"
                );
                report.status = SourceStatus::Failed;
                report.errors.push(format!("{err:#}"));
                report.elapsed_ms = elapsed_ms(clock);
                return report;
            }
        };

        report.observations = observations.len();
        for observation in &observations {
            match self.ingest(observation) {
                Ok(outcomes) => {
                    log_outcomes(name, &outcomes);
                    report.tally(&outcomes);
                }
                Err(err) => {
                    warn!(
                        source = name,
                        collection = %observation.collection_id(),
                        date = %format_day(observation.date()),
                        error = %err,
                        "observation rejected"
                    );
                    report.errors.push(format!(
                        "{} {}: {err}",
                        observation.collection_id(),
                        format_day(observation.date())
                    ));
                }
            }
        }

        if !report.errors.is_empty() {
            report.status = SourceStatus::Failed;
        }
        report.elapsed_ms = elapsed_ms(clock);
        report
    }

    /// Reconciles one observation while holding its collection's lock.
    pub fn ingest(&self, observation: &Observation) -> Result<Vec<Reconciliation>, CovidError> {
        let lock = self.locks.lock_for(observation.collection_id())?;
        let _guard = lock
            .lock()
            .map_err(|_| CovidError::Storage("collection lock poisoned".to_string()))?;

        let mut handle = StoreHandle { store: self.store };
        self.reconciler.ingest(&mut handle, observation)
    }
}

fn log_outcomes(source: &str, outcomes: &[Reconciliation]) {
    for outcome in outcomes {
        let record = outcome.record();
        match outcome {
            Reconciliation::Unchanged { .. } => {
                debug!(source, %record, "< data is the same");
            }
            Reconciliation::Replace { previous, .. } => {
                info!(source, %record, %previous, "< data is different, replacing the old entry");
            }
            Reconciliation::Insert { .. } => {
                info!(source, %record, "< data saved");
            }
        }
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}
