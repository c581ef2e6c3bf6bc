#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use campus_covid_core::{
    format_day, format_rfc3339, now_utc, parse_day, CollectionId, CovidError, HistoryReader,
    Record, RecordStore, Write,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::Date;

const RECORDS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RECORDS_V1: &str = r"
CREATE TABLE IF NOT EXISTS covid_records (
  collection_id TEXT NOT NULL,
  date TEXT NOT NULL CHECK (length(date) = 10),
  tested INTEGER NOT NULL CHECK (tested >= 0),
  positive INTEGER NOT NULL CHECK (positive >= 0 AND positive <= tested),
  recorded_at TEXT NOT NULL,
  PRIMARY KEY (collection_id, date)
);
";

const RECORD_COLUMNS: &str = "collection_id, date, tested, positive";

pub struct SqliteRecordStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct CollectionSummary {
    pub collection_id: CollectionId,
    pub records: usize,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RECORDS_V1)
            .context("failed to apply covid_records schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RECORDS_MIGRATION_VERSION, now],
            )
            .context("failed to register covid_records schema migration")?;

        Ok(())
    }

    pub fn get_record(&self, collection_id: CollectionId, date: Date) -> Result<Option<Record>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM covid_records
                     WHERE collection_id = ?1 AND date = ?2"
                ),
                params![collection_id.as_str(), format_day(date)],
                parse_record_row,
            )
            .optional()
            .with_context(|| {
                format!(
                    "failed to load record for {collection_id} on {}",
                    format_day(date)
                )
            })
    }

    pub fn latest_before(&self, collection_id: CollectionId, date: Date) -> Result<Option<Record>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM covid_records
                     WHERE collection_id = ?1 AND date < ?2
                     ORDER BY date DESC
                     LIMIT 1"
                ),
                params![collection_id.as_str(), format_day(date)],
                parse_record_row,
            )
            .optional()
            .with_context(|| {
                format!(
                    "failed to load latest record before {} for {collection_id}",
                    format_day(date)
                )
            })
    }

    pub fn earliest_after(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM covid_records
                     WHERE collection_id = ?1 AND date > ?2
                     ORDER BY date ASC
                     LIMIT 1"
                ),
                params![collection_id.as_str(), format_day(date)],
                parse_record_row,
            )
            .optional()
            .with_context(|| {
                format!(
                    "failed to load earliest record after {} for {collection_id}",
                    format_day(date)
                )
            })
    }

    pub fn insert_record(&self, record: &Record) -> Result<()> {
        let recorded_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        insert_row(&self.conn, record, &recorded_at)
    }

    pub fn delete_record(&self, collection_id: CollectionId, date: Date) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM covid_records WHERE collection_id = ?1 AND date = ?2",
                params![collection_id.as_str(), format_day(date)],
            )
            .with_context(|| {
                format!(
                    "failed to delete record for {collection_id} on {}",
                    format_day(date)
                )
            })
    }

    /// Applies `writes` inside one transaction.
    pub fn apply(&mut self, writes: &[Write]) -> Result<()> {
        let recorded_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start record transaction")?;

        for write in writes {
            if let Write::Replace(record) = write {
                tx.execute(
                    "DELETE FROM covid_records WHERE collection_id = ?1 AND date = ?2",
                    params![record.collection_id.as_str(), format_day(record.date)],
                )
                .with_context(|| format!("failed to delete superseded record {record}"))?;
            }
            insert_row(&tx, write.record(), &recorded_at)?;
        }

        tx.commit().context("failed to commit record transaction")?;
        Ok(())
    }

    pub fn list_records(
        &self,
        collection_id: CollectionId,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        let mut query = format!(
            "SELECT {RECORD_COLUMNS} FROM covid_records
             WHERE collection_id = ?1
             ORDER BY date ASC"
        );

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![collection_id.as_str()], parse_record_row)?;

        collect_rows(rows)
            .with_context(|| format!("failed to list records for {collection_id}"))
    }

    pub fn all_records(&self) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM covid_records
             ORDER BY collection_id ASC, date ASC"
        ))?;
        let rows = stmt.query_map([], parse_record_row)?;

        collect_rows(rows).context("failed to list records")
    }

    pub fn collection_summaries(&self) -> Result<Vec<CollectionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT collection_id, COUNT(*), MIN(date), MAX(date)
             FROM covid_records
             GROUP BY collection_id
             ORDER BY collection_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let collection_id = parse_collection_id(row, 0)?;
            let count: i64 = row.get(1)?;
            let records = usize::try_from(count).map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Integer,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid record count: {count}"),
                    )),
                )
            })?;
            Ok(CollectionSummary {
                collection_id,
                records,
                first_date: row.get(2)?,
                last_date: row.get(3)?,
            })
        })?;

        collect_rows(rows).context("failed to summarize collections")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl HistoryReader for SqliteRecordStore {
    fn find_by_collection_and_date(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        self.get_record(collection_id, date).map_err(storage_error)
    }

    fn find_latest_before(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        self.latest_before(collection_id, date)
            .map_err(storage_error)
    }

    fn find_earliest_after(
        &self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<Option<Record>, CovidError> {
        self.earliest_after(collection_id, date)
            .map_err(storage_error)
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert(&mut self, record: &Record) -> Result<(), CovidError> {
        self.insert_record(record).map_err(storage_error)
    }

    fn delete_by_collection_and_date(
        &mut self,
        collection_id: CollectionId,
        date: Date,
    ) -> Result<(), CovidError> {
        self.delete_record(collection_id, date)
            .map(|_| ())
            .map_err(storage_error)
    }

    fn commit(&mut self, writes: &[Write]) -> Result<(), CovidError> {
        self.apply(writes).map_err(storage_error)
    }

    fn list(&self, collection_id: CollectionId) -> Result<Vec<Record>, CovidError> {
        self.list_records(collection_id, None)
            .map_err(storage_error)
    }
}

fn storage_error(err: anyhow::Error) -> CovidError {
    CovidError::Storage(format!("{err:#}"))
}

fn insert_row(conn: &Connection, record: &Record, recorded_at: &str) -> Result<()> {
    let tested = i64::try_from(record.tested)
        .with_context(|| format!("tested out of range for sqlite: {}", record.tested))?;
    let positive = i64::try_from(record.positive)
        .with_context(|| format!("positive out of range for sqlite: {}", record.positive))?;

    conn.execute(
        "INSERT INTO covid_records(collection_id, date, tested, positive, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.collection_id.as_str(),
            format_day(record.date),
            tested,
            positive,
            recorded_at,
        ],
    )
    .with_context(|| format!("failed to insert record {record}"))?;

    Ok(())
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let collection_id = parse_collection_id(row, 0)?;
    let date_raw: String = row.get(1)?;
    let tested_i64: i64 = row.get(2)?;
    let positive_i64: i64 = row.get(3)?;

    let date = parse_day(&date_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })?;

    let tested = u64::try_from(tested_i64).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid tested: {tested_i64}"),
            )),
        )
    })?;

    let positive = u64::try_from(positive_i64).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid positive: {positive_i64}"),
            )),
        )
    })?;

    Ok(Record::new(collection_id, date, tested, positive))
}

fn parse_collection_id(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<CollectionId> {
    let raw: String = row.get(index)?;
    CollectionId::parse(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
