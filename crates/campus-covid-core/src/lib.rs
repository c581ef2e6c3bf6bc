//! Core record model and ingestion rules for campus COVID testing series.
//!
//! Two components carry the logic of this crate:
//! - [`reconcile`]: keeps at most one record per `(collection, date)` and
//!   turns repeated observations into no-ops or same-day corrections.
//! - [`gap_fill`]: turns a 7-day trailing count into cumulative records,
//!   interpolating the days that are missing from stored history.
//!
//! Storage is reached only through the traits in [`store`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{Date, Month, OffsetDateTime, UtcOffset};

pub mod catalog;
pub mod gap_fill;
pub mod reconcile;
pub mod store;

pub use catalog::{Catalog, Collection, KeyDate};
pub use gap_fill::{FilledKind, FilledRecord, WeeklyObservation};
pub use reconcile::{Reconciler, Reconciliation, WeeklyOutcome};
pub use store::{HistoryReader, MemoryRecordStore, RecordStore, Write};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CovidError {
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    #[error("invalid history ordering: {0}")]
    InvalidHistoryOrdering(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("non-monotonic record: {0}")]
    NonMonotonic(String),
    #[error("invalid date: {0}")]
    InvalidDate(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CollectionId {
    BostonCollege,
    BostonCollegeUndergrads,
    BostonCollegeCommunity,
    BabsonCollege,
    BentleyUniversity,
    BrandeisUniversity,
    BostonUniversity,
    HarvardUniversity,
    HarvardUniversityUndergrad,
    HarvardUniversityGrad,
    HarvardUniversityOther,
    MassachusettsInstituteOfTechnology,
    NortheasternUniversity,
    TuftsUniversity,
    UmassAmherst,
    WellesleyCollege,
    Massachusetts,
}

impl CollectionId {
    pub const ALL: [Self; 17] = [
        Self::BostonCollege,
        Self::BostonCollegeUndergrads,
        Self::BostonCollegeCommunity,
        Self::BabsonCollege,
        Self::BentleyUniversity,
        Self::BrandeisUniversity,
        Self::BostonUniversity,
        Self::HarvardUniversity,
        Self::HarvardUniversityUndergrad,
        Self::HarvardUniversityGrad,
        Self::HarvardUniversityOther,
        Self::MassachusettsInstituteOfTechnology,
        Self::NortheasternUniversity,
        Self::TuftsUniversity,
        Self::UmassAmherst,
        Self::WellesleyCollege,
        Self::Massachusetts,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BostonCollege => "boston-college",
            Self::BostonCollegeUndergrads => "boston-college-undergrads",
            Self::BostonCollegeCommunity => "boston-college-community",
            Self::BabsonCollege => "babson-college",
            Self::BentleyUniversity => "bentley-university",
            Self::BrandeisUniversity => "brandeis-university",
            Self::BostonUniversity => "boston-university",
            Self::HarvardUniversity => "harvard-university",
            Self::HarvardUniversityUndergrad => "harvard-university-undergrad",
            Self::HarvardUniversityGrad => "harvard-university-grad",
            Self::HarvardUniversityOther => "harvard-university-other",
            Self::MassachusettsInstituteOfTechnology => "massachusetts-institute-of-technology",
            Self::NortheasternUniversity => "northeastern-university",
            Self::TuftsUniversity => "tufts-university",
            Self::UmassAmherst => "umass-amherst",
            Self::WellesleyCollege => "wellesley-college",
            Self::Massachusetts => "massachusetts",
        }
    }

    /// Resolves a wire identifier such as `wellesley-college`.
    ///
    /// # Errors
    /// Returns [`CovidError::UnknownCollection`] when the identifier is not
    /// part of the compiled catalog.
    pub fn parse(value: &str) -> Result<Self, CovidError> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == value)
            .ok_or_else(|| CovidError::UnknownCollection(value.to_string()))
    }
}

impl Display for CollectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CollectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CollectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// One cumulative data point for a collection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub collection_id: CollectionId,
    #[serde(with = "day_format")]
    pub date: Date,
    pub tested: u64,
    pub positive: u64,
}

impl Record {
    #[must_use]
    pub fn new(collection_id: CollectionId, date: Date, tested: u64, positive: u64) -> Self {
        Self {
            collection_id,
            date,
            tested,
            positive,
        }
    }

    /// Checks the per-record count invariant.
    ///
    /// # Errors
    /// Returns [`CovidError::InvalidRecord`] when `positive > tested`.
    pub fn validate(&self) -> Result<(), CovidError> {
        if self.positive > self.tested {
            return Err(CovidError::InvalidRecord(format!(
                "{} on {}: positive ({}) MUST be <= tested ({})",
                self.collection_id,
                format_day(self.date),
                self.positive,
                self.tested
            )));
        }
        Ok(())
    }

    /// True when both counters match, regardless of date.
    #[must_use]
    pub fn same_counts(&self, other: &Self) -> bool {
        self.tested == other.tested && self.positive == other.positive
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} tested={} positive={}",
            self.collection_id,
            format_day(self.date),
            self.tested,
            self.positive
        )
    }
}

/// Raw input handed over by a source extractor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Cumulative(Record),
    Weekly(WeeklyObservation),
}

impl Observation {
    #[must_use]
    pub fn collection_id(&self) -> CollectionId {
        match self {
            Self::Cumulative(record) => record.collection_id,
            Self::Weekly(weekly) => weekly.collection_id,
        }
    }

    #[must_use]
    pub fn date(&self) -> Date {
        match self {
            Self::Cumulative(record) => record.date,
            Self::Weekly(weekly) => weekly.observed_date,
        }
    }

    /// Validates counters before the observation reaches the core.
    ///
    /// # Errors
    /// Returns [`CovidError::InvalidRecord`] when positives exceed tests.
    pub fn validate(&self) -> Result<(), CovidError> {
        match self {
            Self::Cumulative(record) => record.validate(),
            Self::Weekly(weekly) => weekly.validate(),
        }
    }
}

/// Decodes a JSON array of observations.
///
/// # Errors
/// Returns [`CovidError::UnknownCollection`] for identifiers outside the
/// catalog and [`CovidError::InvalidRecord`] for any other decoding or
/// validation failure.
pub fn parse_observations(json: &str) -> Result<Vec<Observation>, CovidError> {
    let observations: Vec<Observation> = serde_json::from_str(json).map_err(|err| {
        let message = err.to_string();
        match message.strip_prefix("unknown collection: ") {
            Some(rest) => CovidError::UnknownCollection(
                rest.split(" at line").next().unwrap_or(rest).to_string(),
            ),
            None => CovidError::InvalidRecord(format!("invalid observation JSON: {message}")),
        }
    })?;

    for observation in &observations {
        observation.validate()?;
    }

    Ok(observations)
}

/// Parses a `YYYY-MM-DD` calendar day.
///
/// # Errors
/// Returns [`CovidError::InvalidDate`] when the value is not a valid day.
pub fn parse_day(value: &str) -> Result<Date, CovidError> {
    let invalid = || CovidError::InvalidDate(format!("expected YYYY-MM-DD, got {value:?}"));

    let mut parts = value.split('-');
    let (Some(year), Some(month), Some(day), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    let digits = |part: &str, len: usize| {
        part.len() == len && part.bytes().all(|byte| byte.is_ascii_digit())
    };
    if !digits(year, 4) || !digits(month, 2) || !digits(day, 2) {
        return Err(invalid());
    }

    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u8 = month.parse().map_err(|_| invalid())?;
    let day: u8 = day.parse().map_err(|_| invalid())?;
    let month = Month::try_from(month).map_err(|_| invalid())?;

    Date::from_calendar_date(year, month, day)
        .map_err(|err| CovidError::InvalidDate(format!("{value:?}: {err}")))
}

#[must_use]
pub fn format_day(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CovidError::InvalidDate`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CovidError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            CovidError::InvalidDate(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

pub(crate) mod day_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_day(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_day(&raw).map_err(serde::de::Error::custom)
    }
}
