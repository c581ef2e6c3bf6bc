//! Upsert reconciliation keyed by `(collection, date)`.
//!
//! The decision only ever looks at the record stored for the exact same day.
//! Comparing against "the most recent record" instead would turn every
//! re-scrape of an older day into a duplicate insert.

use serde::Serialize;

use crate::gap_fill::{self, FilledKind, FilledRecord, WeeklyObservation};
use crate::store::{HistoryReader, PendingHistory, RecordStore, Write};
use crate::{format_day, Catalog, CovidError, Observation, Record};

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Reconciliation {
    Insert { record: Record },
    Unchanged { record: Record },
    Replace { record: Record, previous: Record },
}

impl Reconciliation {
    #[must_use]
    pub fn record(&self) -> &Record {
        match self {
            Self::Insert { record }
            | Self::Unchanged { record }
            | Self::Replace { record, .. } => record,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Unchanged { .. } => "unchanged",
            Self::Replace { .. } => "replace",
        }
    }

    /// The store mutation this decision requires, if any.
    #[must_use]
    pub fn write(&self) -> Option<Write> {
        match self {
            Self::Insert { record } => Some(Write::Insert(*record)),
            Self::Replace { record, .. } => Some(Write::Replace(*record)),
            Self::Unchanged { .. } => None,
        }
    }
}

/// Reconciliation of one gap-filled day, tagged with how its counts were
/// derived.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct WeeklyOutcome {
    pub kind: FilledKind,
    #[serde(flatten)]
    pub outcome: Reconciliation,
}

/// Pure upsert decision for `new` given the record stored on the same day.
#[must_use]
pub fn decide(new: &Record, existing: Option<&Record>) -> Reconciliation {
    match existing {
        None => Reconciliation::Insert { record: *new },
        Some(existing) if existing.same_counts(new) => Reconciliation::Unchanged {
            record: *existing,
        },
        Some(existing) => Reconciliation::Replace {
            record: *new,
            previous: *existing,
        },
    }
}

/// Applies upsert decisions against a store, validating against `catalog`.
///
/// Callers serialize work per collection; the reconciler itself holds no
/// state between calls.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler<'a> {
    catalog: &'a Catalog,
}

impl<'a> Reconciler<'a> {
    #[must_use]
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    #[must_use]
    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    /// Decides what to do with `record` without writing anything.
    ///
    /// # Errors
    /// Returns [`CovidError::UnknownCollection`], [`CovidError::InvalidRecord`],
    /// [`CovidError::NonMonotonic`] or [`CovidError::Storage`].
    pub fn plan<H: HistoryReader + ?Sized>(
        &self,
        history: &H,
        record: &Record,
    ) -> Result<Reconciliation, CovidError> {
        self.catalog.require(record.collection_id)?;
        record.validate()?;

        let existing = history.find_by_collection_and_date(record.collection_id, record.date)?;
        let decision = decide(record, existing.as_ref());
        if decision.write().is_some() {
            check_monotonic(history, record)?;
        }
        Ok(decision)
    }

    /// Reconciles a single record; a replace is committed as one atomic write.
    ///
    /// # Errors
    /// See [`Reconciler::plan`]. Nothing is written on error.
    pub fn reconcile<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        record: &Record,
    ) -> Result<Reconciliation, CovidError> {
        let decision = self.plan(&*store, record)?;
        if let Some(write) = decision.write() {
            store.commit(&[write])?;
        }
        Ok(decision)
    }

    /// Plans `records` in order, each one seeing the writes planned before it.
    ///
    /// # Errors
    /// Fails on the first record that [`Reconciler::plan`] rejects.
    pub fn plan_batch<H: HistoryReader + ?Sized>(
        &self,
        history: &H,
        records: &[Record],
    ) -> Result<Vec<Reconciliation>, CovidError> {
        let mut pending = PendingHistory::new(history);
        let mut decisions = Vec::with_capacity(records.len());
        for record in records {
            let decision = self.plan(&pending, record)?;
            if let Some(write) = decision.write() {
                pending.stage(&write);
            }
            decisions.push(decision);
        }
        Ok(decisions)
    }

    /// Reconciles `records` as a unit: either every write lands or none.
    ///
    /// # Errors
    /// See [`Reconciler::plan_batch`]; storage failures abort the whole batch.
    pub fn reconcile_batch<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        records: &[Record],
    ) -> Result<Vec<Reconciliation>, CovidError> {
        let decisions = self.plan_batch(&*store, records)?;
        let writes: Vec<Write> = decisions.iter().filter_map(Reconciliation::write).collect();
        if !writes.is_empty() {
            store.commit(&writes)?;
        }
        Ok(decisions)
    }

    /// Routes one observation through the gap filler (weekly counts) and the
    /// reconciler, then commits.
    ///
    /// # Errors
    /// Any [`CovidError`]; stored state is unchanged on error.
    pub fn ingest<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        observation: &Observation,
    ) -> Result<Vec<Reconciliation>, CovidError> {
        match observation {
            Observation::Cumulative(record) => Ok(vec![self.reconcile(store, record)?]),
            Observation::Weekly(weekly) => Ok(untag(self.ingest_weekly(store, weekly)?)),
        }
    }

    /// Same as [`Reconciler::ingest`] but only plans.
    ///
    /// # Errors
    /// Any [`CovidError`].
    pub fn preview<H: HistoryReader + ?Sized>(
        &self,
        history: &H,
        observation: &Observation,
    ) -> Result<Vec<Reconciliation>, CovidError> {
        match observation {
            Observation::Cumulative(record) => Ok(vec![self.plan(history, record)?]),
            Observation::Weekly(weekly) => Ok(untag(self.preview_weekly(history, weekly)?)),
        }
    }

    /// Gap-fills `weekly` and commits the result as one batch, keeping the
    /// interpolated/observed tag of every day.
    ///
    /// # Errors
    /// Any [`CovidError`]; stored state is unchanged on error.
    pub fn ingest_weekly<S: RecordStore + ?Sized>(
        &self,
        store: &mut S,
        weekly: &WeeklyObservation,
    ) -> Result<Vec<WeeklyOutcome>, CovidError> {
        let filled = self.expand_weekly(&*store, weekly)?;
        let records: Vec<Record> = filled.iter().map(|entry| entry.record).collect();
        let decisions = self.reconcile_batch(store, &records)?;
        Ok(tag(&filled, decisions))
    }

    /// Same as [`Reconciler::ingest_weekly`] but only plans.
    ///
    /// # Errors
    /// Any [`CovidError`].
    pub fn preview_weekly<H: HistoryReader + ?Sized>(
        &self,
        history: &H,
        weekly: &WeeklyObservation,
    ) -> Result<Vec<WeeklyOutcome>, CovidError> {
        let filled = self.expand_weekly(history, weekly)?;
        let records: Vec<Record> = filled.iter().map(|entry| entry.record).collect();
        let decisions = self.plan_batch(history, &records)?;
        Ok(tag(&filled, decisions))
    }

    fn expand_weekly<H: HistoryReader + ?Sized>(
        &self,
        history: &H,
        weekly: &WeeklyObservation,
    ) -> Result<Vec<FilledRecord>, CovidError> {
        self.catalog.require(weekly.collection_id)?;
        let mut filled = gap_fill::fill(history, weekly)?;
        filled.sort_by_key(|entry| entry.record.date);
        Ok(filled)
    }
}

fn tag(filled: &[FilledRecord], decisions: Vec<Reconciliation>) -> Vec<WeeklyOutcome> {
    filled
        .iter()
        .zip(decisions)
        .map(|(entry, outcome)| WeeklyOutcome {
            kind: entry.kind,
            outcome,
        })
        .collect()
}

fn untag(outcomes: Vec<WeeklyOutcome>) -> Vec<Reconciliation> {
    outcomes.into_iter().map(|entry| entry.outcome).collect()
}

fn check_monotonic<H: HistoryReader + ?Sized>(
    history: &H,
    record: &Record,
) -> Result<(), CovidError> {
    if let Some(before) = history.find_latest_before(record.collection_id, record.date)? {
        if record.tested < before.tested || record.positive < before.positive {
            return Err(CovidError::NonMonotonic(format!(
                "{record} falls below earlier record on {} (tested={}, positive={})",
                format_day(before.date),
                before.tested,
                before.positive
            )));
        }
    }

    if let Some(after) = history.find_earliest_after(record.collection_id, record.date)? {
        if record.tested > after.tested || record.positive > after.positive {
            return Err(CovidError::NonMonotonic(format!(
                "{record} exceeds later record on {} (tested={}, positive={})",
                format_day(after.date),
                after.tested,
                after.positive
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::store::MemoryRecordStore;
    use crate::test_support::{day, must};
    use crate::CollectionId;

    const ID: CollectionId = CollectionId::WellesleyCollege;

    fn record(date: &str, tested: u64, positive: u64) -> Record {
        Record::new(ID, day(date), tested, positive)
    }

    fn assert_unique_and_non_decreasing(records: &[Record]) {
        for pair in records.windows(2) {
            assert!(pair[0].date < pair[1].date, "duplicate or unordered dates");
            assert!(pair[0].tested <= pair[1].tested);
            assert!(pair[0].positive <= pair[1].positive);
        }
    }

    #[test]
    fn decide_covers_insert_unchanged_and_replace() {
        let new = record("2021-01-05", 120, 10);
        assert_eq!(decide(&new, None), Reconciliation::Insert { record: new });

        let same = record("2021-01-05", 120, 10);
        assert_eq!(
            decide(&new, Some(&same)),
            Reconciliation::Unchanged { record: same }
        );

        let old = record("2021-01-05", 100, 10);
        assert_eq!(
            decide(&new, Some(&old)),
            Reconciliation::Replace {
                record: new,
                previous: old
            }
        );
    }

    #[test]
    fn reconciling_twice_stores_one_record() {
        let catalog = Catalog::standard();
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();
        let new = record("2021-01-05", 100, 10);

        let first = must(reconciler.reconcile(&mut store, &new));
        let second = must(reconciler.reconcile(&mut store, &new));

        assert_eq!(first.as_str(), "insert");
        assert_eq!(second.as_str(), "unchanged");
        assert_eq!(must(store.list(ID)), vec![new]);
    }

    #[test]
    fn same_day_correction_replaces_the_stored_record() {
        let catalog = Catalog::standard();
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();
        must(reconciler.reconcile(&mut store, &record("2021-01-05", 100, 10)));

        let outcome = must(reconciler.reconcile(&mut store, &record("2021-01-05", 120, 10)));

        assert_eq!(
            outcome,
            Reconciliation::Replace {
                record: record("2021-01-05", 120, 10),
                previous: record("2021-01-05", 100, 10),
            }
        );
        assert_eq!(must(store.list(ID)), vec![record("2021-01-05", 120, 10)]);
    }

    #[test]
    fn older_day_is_matched_by_exact_date_not_latest_record() {
        let catalog = Catalog::standard();
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();
        must(reconciler.reconcile(&mut store, &record("2021-01-05", 100, 10)));
        must(reconciler.reconcile(&mut store, &record("2021-01-06", 110, 11)));

        let outcome = must(reconciler.reconcile(&mut store, &record("2021-01-05", 100, 10)));

        assert_eq!(outcome.as_str(), "unchanged");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn collection_outside_catalog_is_rejected_without_writes() {
        let catalog = Catalog::restricted(&[CollectionId::TuftsUniversity]);
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();

        let result = reconciler.reconcile(&mut store, &record("2021-01-05", 100, 10));

        assert!(matches!(result, Err(CovidError::UnknownCollection(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn writes_that_break_monotonicity_are_rejected() {
        let catalog = Catalog::standard();
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();
        must(reconciler.reconcile(&mut store, &record("2021-01-05", 100, 10)));
        must(reconciler.reconcile(&mut store, &record("2021-01-09", 200, 20)));

        for bad in [
            record("2021-01-07", 90, 15),
            record("2021-01-07", 150, 25),
            record("2021-01-04", 101, 1),
            record("2021-01-05", 201, 10),
        ] {
            match reconciler.reconcile(&mut store, &bad) {
                Err(CovidError::NonMonotonic(_)) => {}
                other => panic!("expected NonMonotonic for {bad}, got {other:?}"),
            }
        }

        assert_eq!(store.len(), 2);
        assert_unique_and_non_decreasing(&must(store.list(ID)));
    }

    #[test]
    fn invalid_counts_are_rejected() {
        let catalog = Catalog::standard();
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();

        let result = reconciler.reconcile(&mut store, &record("2021-01-05", 1, 2));

        assert!(matches!(result, Err(CovidError::InvalidRecord(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn weekly_observation_lands_as_one_batch() {
        let catalog = Catalog::standard();
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();
        let observation = Observation::Weekly(WeeklyObservation::new(ID, day("2021-01-08"), 35, 7));

        let preview = must(reconciler.preview(&store, &observation));
        assert_eq!(preview.len(), 8);
        assert!(store.is_empty());

        let outcome = must(reconciler.ingest(&mut store, &observation));
        assert_eq!(outcome, preview);

        let stored = must(store.list(ID));
        assert_eq!(stored.len(), 8);
        assert_eq!(stored.last(), Some(&record("2021-01-08", 35, 7)));
        assert_unique_and_non_decreasing(&stored);

        let again = must(reconciler.ingest(&mut store, &observation));
        assert_eq!(
            again.iter().map(Reconciliation::as_str).collect::<Vec<_>>(),
            vec!["unchanged"]
        );
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn weekly_outcomes_keep_interpolated_and_observed_tags() {
        let catalog = Catalog::standard();
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();
        let weekly = WeeklyObservation::new(ID, day("2021-01-08"), 35, 7);

        let preview = must(reconciler.preview_weekly(&store, &weekly));
        let outcomes = must(reconciler.ingest_weekly(&mut store, &weekly));
        assert_eq!(outcomes, preview);

        let kinds: Vec<FilledKind> = outcomes.iter().map(|entry| entry.kind).collect();
        assert_eq!(kinds.last(), Some(&FilledKind::Observed));
        assert_eq!(
            kinds
                .iter()
                .filter(|kind| **kind == FilledKind::Interpolated)
                .count(),
            7
        );
        assert_eq!(
            outcomes[7].outcome,
            Reconciliation::Insert {
                record: record("2021-01-08", 35, 7)
            }
        );

        let json = must(serde_json::to_value(outcomes[0]));
        assert_eq!(json["kind"], "interpolated");
        assert_eq!(json["action"], "insert");
        assert_eq!(json["record"]["date"], "2021-01-01");
    }

    #[test]
    fn rejected_weekly_result_writes_nothing() {
        let catalog = Catalog::standard();
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();
        must(reconciler.reconcile(&mut store, &record("2021-01-01", 50, 5)));
        must(reconciler.reconcile(&mut store, &record("2021-01-10", 60, 6)));

        // 50 + 20 = 70 exceeds the record stored two days later.
        let observation = Observation::Weekly(WeeklyObservation::new(ID, day("2021-01-08"), 20, 2));
        let result = reconciler.ingest(&mut store, &observation);

        assert!(matches!(result, Err(CovidError::NonMonotonic(_))));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn week_old_record_with_later_neighbour_is_clamped_and_accepted() {
        let catalog = Catalog::standard();
        let reconciler = Reconciler::new(&catalog);
        let mut store = MemoryRecordStore::new();
        must(reconciler.reconcile(&mut store, &record("2021-01-01", 50, 5)));
        must(reconciler.reconcile(&mut store, &record("2021-01-10", 80, 9)));

        let observation = Observation::Weekly(WeeklyObservation::new(ID, day("2021-01-08"), 20, 2));
        let outcome = must(reconciler.ingest(&mut store, &observation));

        assert_eq!(
            outcome,
            vec![Reconciliation::Insert {
                record: record("2021-01-08", 80, 9)
            }]
        );
    }

    fn series_and_order() -> impl Strategy<Value = (Vec<(u64, u64)>, Vec<usize>)> {
        prop::collection::vec((0_u64..500, 0_u64..50), 1..25).prop_flat_map(|steps| {
            let order: Vec<usize> = (0..steps.len()).collect();
            (Just(steps), Just(order).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn out_of_order_replays_keep_one_monotonic_record_per_day(
            (steps, order) in series_and_order()
        ) {
            let catalog = Catalog::standard();
            let reconciler = Reconciler::new(&catalog);
            let mut store = MemoryRecordStore::new();

            let start = day("2020-09-01");
            let mut tested = 0_u64;
            let mut positive = 0_u64;
            let mut series = Vec::with_capacity(steps.len());
            for (offset, (more_tested, more_positive)) in (0_i64..).zip(steps.iter()) {
                tested += more_tested;
                positive += (*more_positive).min(*more_tested);
                let date = start + time::Duration::days(offset);
                series.push(Record::new(ID, date, tested, positive));
            }

            for _ in 0..2 {
                for index in &order {
                    let outcome = reconciler.reconcile(&mut store, &series[*index]);
                    prop_assert!(
                        outcome.is_ok(),
                        "rejected {}: {:?}",
                        series[*index],
                        outcome
                    );
                }
            }

            let stored = must(store.list(ID));
            prop_assert_eq!(&stored, &series);
            for pair in stored.windows(2) {
                prop_assert!(pair[0].date < pair[1].date);
                prop_assert!(pair[0].tested <= pair[1].tested);
                prop_assert!(pair[0].positive <= pair[1].positive);
            }
        }
    }
}
