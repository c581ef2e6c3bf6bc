//! Storage collaborator contract consumed by the reconciler and gap filler.
//!
//! Every lookup is scoped to a single collection. Writers go through
//! [`RecordStore::commit`] so a same-day correction (delete + insert) or a
//! whole gap-fill batch lands atomically.

use std::collections::BTreeMap;
use std::ops::Bound;

use time::Date;

use crate::{format_day, CollectionId, CovidError, Record};

pub trait HistoryReader {
    /// Record stored for exactly `(collection_id, date)`.
    fn find_by_collection_and_date(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError>;

    /// Latest record with a date strictly before `date`.
    fn find_latest_before(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError>;

    /// Earliest record with a date strictly after `date`.
    fn find_earliest_after(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError>;
}

/// A single planned mutation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Write {
    Insert(Record),
    /// Delete whatever is stored for the record's `(collection, date)` and
    /// insert the record in its place.
    Replace(Record),
}

impl Write {
    #[must_use]
    pub fn record(&self) -> &Record {
        match self {
            Self::Insert(record) | Self::Replace(record) => record,
        }
    }
}

pub trait RecordStore: HistoryReader {
    /// # Errors
    /// Returns [`CovidError::Storage`] when the key is already taken or the
    /// backend fails.
    fn insert(&mut self, record: &Record) -> Result<(), CovidError>;

    /// # Errors
    /// Returns [`CovidError::Storage`] when the backend fails.
    fn delete_by_collection_and_date(
        &mut self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<(), CovidError>;

    /// Applies all `writes` or none of them.
    ///
    /// # Errors
    /// Returns [`CovidError::Storage`] when any write fails; the store is
    /// left untouched in that case.
    fn commit(&mut self, writes: &[Write]) -> Result<(), CovidError>;

    /// Every record for `collection_id`, ascending by date.
    ///
    /// # Errors
    /// Returns [`CovidError::Storage`] when the backend fails.
    fn list(&self, collection_id: CollectionId) -> Result<Vec<Record>, CovidError>;
}

/// In-process store keyed by `(collection, date)`.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: BTreeMap<(CollectionId, Date), Record>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn apply(
        records: &mut BTreeMap<(CollectionId, Date), Record>,
        write: &Write,
    ) -> Result<(), CovidError> {
        match write {
            Write::Insert(record) => {
                let key = (record.collection_id, record.date);
                if records.contains_key(&key) {
                    return Err(duplicate_key(record));
                }
                records.insert(key, *record);
            }
            Write::Replace(record) => {
                records.insert((record.collection_id, record.date), *record);
            }
        }
        Ok(())
    }
}

fn duplicate_key(record: &Record) -> CovidError {
    CovidError::Storage(format!(
        "record already stored for {} on {}",
        record.collection_id,
        format_day(record.date)
    ))
}

impl HistoryReader for MemoryRecordStore {
    fn find_by_collection_and_date(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        Ok(self.records.get(&(collection_id, date)).copied())
    }

    fn find_latest_before(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        Ok(self
            .records
            .range((collection_id, Date::MIN)..(collection_id, date))
            .next_back()
            .map(|(_, record)| *record))
    }

    fn find_earliest_after(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        Ok(self
            .records
            .range((
                Bound::Excluded((collection_id, date)),
                Bound::Included((collection_id, Date::MAX)),
            ))
            .next()
            .map(|(_, record)| *record))
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert(&mut self, record: &Record) -> Result<(), CovidError> {
        Self::apply(&mut self.records, &Write::Insert(*record))
    }

    fn delete_by_collection_and_date(
        &mut self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<(), CovidError> {
        self.records.remove(&(collection_id, date));
        Ok(())
    }

    fn commit(&mut self, writes: &[Write]) -> Result<(), CovidError> {
        let mut staged = self.records.clone();
        for write in writes {
            Self::apply(&mut staged, write)?;
        }
        self.records = staged;
        Ok(())
    }

    fn list(&self, collection_id: CollectionId) -> Result<Vec<Record>, CovidError> {
        Ok(self
            .records
            .range((collection_id, Date::MIN)..=(collection_id, Date::MAX))
            .map(|(_, record)| *record)
            .collect())
    }
}

/// Stored history seen through a batch of not-yet-committed writes.
///
/// Used to plan a batch so that later entries observe earlier ones.
pub struct PendingHistory<'a, H: HistoryReader + ?Sized> {
    base: &'a H,
    pending: BTreeMap<(CollectionId, Date), Record>,
}

impl<'a, H: HistoryReader + ?Sized> PendingHistory<'a, H> {
    pub fn new(base: &'a H) -> Self {
        Self {
            base,
            pending: BTreeMap::new(),
        }
    }

    pub fn stage(&mut self, write: &Write) {
        let record = write.record();
        self.pending
            .insert((record.collection_id, record.date), *record);
    }
}

impl<H: HistoryReader + ?Sized> HistoryReader for PendingHistory<'_, H> {
    fn find_by_collection_and_date(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        if let Some(record) = self.pending.get(&(collection_id, date)) {
            return Ok(Some(*record));
        }
        self.base.find_by_collection_and_date(collection_id, date)
    }

    fn find_latest_before(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        let staged = self
            .pending
            .range((collection_id, Date::MIN)..(collection_id, date))
            .next_back()
            .map(|(_, record)| *record);
        let stored = self.base.find_latest_before(collection_id, date)?;
        Ok(match (staged, stored) {
            (Some(a), Some(b)) => Some(if a.date >= b.date { a } else { b }),
            (a, b) => a.or(b),
        })
    }

    fn find_earliest_after(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        let staged = self
            .pending
            .range((
                Bound::Excluded((collection_id, date)),
                Bound::Included((collection_id, Date::MAX)),
            ))
            .next()
            .map(|(_, record)| *record);
        let stored = self.base.find_earliest_after(collection_id, date)?;
        Ok(match (staged, stored) {
            (Some(a), Some(b)) => Some(if a.date <= b.date { a } else { b }),
            (a, b) => a.or(b),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{day, must};

    fn record(date: &str, tested: u64, positive: u64) -> Record {
        Record::new(CollectionId::WellesleyCollege, day(date), tested, positive)
    }

    #[test]
    fn neighbour_lookups_are_strict_and_scoped_to_one_collection() {
        let mut store = MemoryRecordStore::new();
        must(store.insert(&record("2021-01-01", 10, 1)));
        must(store.insert(&record("2021-01-05", 20, 2)));
        must(store.insert(&Record::new(
            CollectionId::TuftsUniversity,
            day("2021-01-03"),
            99,
            9,
        )));

        let at = day("2021-01-05");
        let before = must(store.find_latest_before(CollectionId::WellesleyCollege, at));
        assert_eq!(before.map(|r| r.date), Some(day("2021-01-01")));

        let after = must(store.find_earliest_after(CollectionId::WellesleyCollege, at));
        assert_eq!(after, None);

        let first = day("2021-01-01");
        let after = must(store.find_earliest_after(CollectionId::WellesleyCollege, first));
        assert_eq!(after.map(|r| r.tested), Some(20));

        let none = must(store.find_latest_before(CollectionId::WellesleyCollege, first));
        assert_eq!(none, None);
    }

    #[test]
    fn insert_on_taken_key_is_a_storage_failure() {
        let mut store = MemoryRecordStore::new();
        must(store.insert(&record("2021-01-01", 10, 1)));
        assert!(matches!(
            store.insert(&record("2021-01-01", 11, 1)),
            Err(CovidError::Storage(_))
        ));
    }

    #[test]
    fn failed_commit_leaves_store_untouched() {
        let mut store = MemoryRecordStore::new();
        must(store.insert(&record("2021-01-02", 10, 1)));

        let result = store.commit(&[
            Write::Insert(record("2021-01-01", 5, 0)),
            Write::Insert(record("2021-01-02", 12, 1)),
        ]);
        assert!(matches!(result, Err(CovidError::Storage(_))));
        assert_eq!(store.len(), 1);
        let first = day("2021-01-01");
        assert_eq!(
            must(store.find_by_collection_and_date(CollectionId::WellesleyCollege, first)),
            None
        );
    }

    #[test]
    fn pending_history_overlays_staged_writes() {
        let mut store = MemoryRecordStore::new();
        must(store.insert(&record("2021-01-01", 10, 1)));
        must(store.insert(&record("2021-01-09", 40, 4)));

        let mut pending = PendingHistory::new(&store);
        pending.stage(&Write::Insert(record("2021-01-04", 20, 2)));

        let id = CollectionId::WellesleyCollege;
        let before = must(pending.find_latest_before(id, day("2021-01-06")));
        assert_eq!(before.map(|r| r.tested), Some(20));

        let after = must(pending.find_earliest_after(id, day("2021-01-02")));
        assert_eq!(after.map(|r| r.tested), Some(20));

        let exact = must(pending.find_by_collection_and_date(id, day("2021-01-04")));
        assert!(exact.is_some());
        assert_eq!(store.len(), 2);
    }
}
