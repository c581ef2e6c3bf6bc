//! Reconstructs daily cumulative records from a trailing 7-day count.
//!
//! Some sources only publish "tests in the past 7 days". When the stored
//! history has the record from exactly one week earlier, the new cumulative
//! total is that record plus the weekly count. Otherwise the missing span is
//! bridged by linear interpolation between the nearest known points.
//!
//! Interpolated values are estimates. They keep the curve non-decreasing
//! but say nothing precise about any individual day.

use serde::{Deserialize, Serialize};
use time::{Date, Duration};

use crate::store::HistoryReader;
use crate::{format_day, CollectionId, CovidError, Record};

/// Days covered by one weekly observation.
pub const WEEK_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct WeeklyObservation {
    pub collection_id: CollectionId,
    #[serde(with = "crate::day_format")]
    pub observed_date: Date,
    pub week_tested: u64,
    pub week_positive: u64,
}

impl WeeklyObservation {
    #[must_use]
    pub fn new(
        collection_id: CollectionId,
        observed_date: Date,
        week_tested: u64,
        week_positive: u64,
    ) -> Self {
        Self {
            collection_id,
            observed_date,
            week_tested,
            week_positive,
        }
    }

    /// # Errors
    /// Returns [`CovidError::InvalidRecord`] when `week_positive > week_tested`.
    pub fn validate(&self) -> Result<(), CovidError> {
        if self.week_positive > self.week_tested {
            return Err(CovidError::InvalidRecord(format!(
                "{} week ending {}: positive ({}) MUST be <= tested ({})",
                self.collection_id,
                format_day(self.observed_date),
                self.week_positive,
                self.week_tested
            )));
        }
        Ok(())
    }

    /// The day exactly one week before `observed_date`.
    ///
    /// # Errors
    /// Returns [`CovidError::InvalidDate`] when the date underflows the
    /// supported calendar range.
    pub fn prior_date(&self) -> Result<Date, CovidError> {
        self.observed_date
            .checked_sub(Duration::days(WEEK_DAYS))
            .ok_or_else(|| {
                CovidError::InvalidDate(format!(
                    "no day one week before {}",
                    format_day(self.observed_date)
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FilledKind {
    /// Estimated by interpolation between two known points.
    Interpolated,
    /// Derived directly from the weekly observation.
    Observed,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct FilledRecord {
    #[serde(flatten)]
    pub record: Record,
    pub kind: FilledKind,
}

impl FilledRecord {
    fn interpolated(record: Record) -> Self {
        Self {
            record,
            kind: FilledKind::Interpolated,
        }
    }

    fn observed(record: Record) -> Self {
        Self {
            record,
            kind: FilledKind::Observed,
        }
    }
}

/// One end of an interpolation span.
///
/// `stored` anchors already exist in history and are never re-emitted.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Anchor {
    pub record: Record,
    pub stored: bool,
}

impl Anchor {
    #[must_use]
    pub fn stored(record: Record) -> Self {
        Self {
            record,
            stored: true,
        }
    }

    #[must_use]
    pub fn synthetic(record: Record) -> Self {
        Self {
            record,
            stored: false,
        }
    }
}

/// Turns a weekly observation into the cumulative records to reconcile,
/// ordered by date.
///
/// Nothing is written; `history` is only read.
///
/// # Errors
/// Returns [`CovidError::InvalidHistoryOrdering`] when the anchors found in
/// history do not span a positive number of days, or
/// [`CovidError::Storage`] when a lookup fails.
pub fn fill<H: HistoryReader + ?Sized>(
    history: &H,
    observation: &WeeklyObservation,
) -> Result<Vec<FilledRecord>, CovidError> {
    observation.validate()?;

    let id = observation.collection_id;
    let observed_date = observation.observed_date;
    let prior_date = observation.prior_date()?;

    if let Some(prior) = history.find_by_collection_and_date(id, prior_date)? {
        let mut tested = observation.week_tested.saturating_add(prior.tested);
        let mut positive = observation.week_positive.saturating_add(prior.positive);

        // Never fall below a neighbour that is already stored.
        let neighbours = [
            history.find_latest_before(id, observed_date)?,
            history.find_earliest_after(id, observed_date)?,
        ];
        for neighbour in neighbours.iter().flatten() {
            tested = tested.max(neighbour.tested);
            positive = positive.max(neighbour.positive);
        }

        return Ok(vec![FilledRecord::observed(Record::new(
            id,
            observed_date,
            tested,
            positive,
        ))]);
    }

    let newest_before = match history.find_latest_before(id, prior_date)? {
        Some(record) => Anchor::stored(record),
        None => Anchor::synthetic(Record::new(id, prior_date, 0, 0)),
    };
    let oldest_after = match history.find_earliest_after(id, prior_date)? {
        Some(record) => Anchor::stored(record),
        None => Anchor::synthetic(Record::new(
            id,
            observed_date,
            observation.week_tested,
            observation.week_positive,
        )),
    };

    let interpolated = interpolate(&newest_before, &oldest_after)?;

    let one_week_prior = interpolated
        .iter()
        .find(|record| record.date == prior_date)
        .copied()
        .ok_or_else(|| {
            CovidError::InvalidHistoryOrdering(format!(
                "{id}: interpolation between {} and {} does not cover {}",
                format_day(newest_before.record.date),
                format_day(oldest_after.record.date),
                format_day(prior_date)
            ))
        })?;

    let mut filled: Vec<FilledRecord> = interpolated
        .into_iter()
        .map(FilledRecord::interpolated)
        .collect();

    if !oldest_after.stored {
        let tested = observation
            .week_tested
            .saturating_add(one_week_prior.tested)
            .max(oldest_after.record.tested);
        let positive = observation
            .week_positive
            .saturating_add(one_week_prior.positive)
            .max(oldest_after.record.positive);

        // The observation supersedes the interpolated endpoint on the same day.
        filled.retain(|entry| entry.record.date != observed_date);
        filled.push(FilledRecord::observed(Record::new(
            id,
            observed_date,
            tested,
            positive,
        )));
    }

    Ok(filled)
}

/// Linear interpolation from `start` to `end`, one record per day,
/// truncating toward zero.
///
/// Stored anchors are excluded from the output.
///
/// # Errors
/// Returns [`CovidError::InvalidHistoryOrdering`] when `end` is not strictly
/// after `start`.
pub fn interpolate(start: &Anchor, end: &Anchor) -> Result<Vec<Record>, CovidError> {
    let span_days = (end.record.date - start.record.date).whole_days();
    let span = match u64::try_from(span_days) {
        Ok(span) if span > 0 => span,
        _ => {
            return Err(CovidError::InvalidHistoryOrdering(format!(
                "{}: cannot interpolate from {} to {} ({span_days} days)",
                start.record.collection_id,
                format_day(start.record.date),
                format_day(end.record.date)
            )))
        }
    };

    let from = start.record;
    let diff_tested = end.record.tested.saturating_sub(from.tested);
    let diff_positive = end.record.positive.saturating_sub(from.positive);

    let mut records = Vec::new();
    let mut date = from.date;
    for i in 0..=span {
        let skip = (i == 0 && start.stored) || (i == span && end.stored);
        if !skip {
            records.push(Record::new(
                from.collection_id,
                date,
                from.tested.saturating_add(step(diff_tested, i, span)),
                from.positive.saturating_add(step(diff_positive, i, span)),
            ));
        }
        if i < span {
            date = date.next_day().ok_or_else(|| {
                CovidError::InvalidDate(format!("no day after {}", format_day(date)))
            })?;
        }
    }

    Ok(records)
}

fn step(diff: u64, i: u64, span: u64) -> u64 {
    let value = u128::from(diff) * u128::from(i) / u128::from(span);
    u64::try_from(value).unwrap_or(diff)
}
