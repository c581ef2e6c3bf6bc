//! Boston College publishes community-wide totals next to undergraduate
//! totals. The community sub-collection is the difference of the two.

use anyhow::{anyhow, bail, Context, Result};
use campus_covid_core::{now_utc, CollectionId, Observation, Record};
use reqwest::blocking::Client;
use scraper::{ElementRef, Html};
use time::{Date, Month};

use super::{changed_labels, fetch_text, parse_count, selector, visible_text, SourceExtractor};

pub const DASHBOARD_URL: &str =
    "https://www.bc.edu/content/bc-web/sites/reopening-boston-college.html";

const EXPECTED_LABELS: [&str; 4] = [
    "BC Community tests performed",
    "Total Positives",
    "Total Undergraduate Tests",
    "Undergrads Testing Positive",
];

const DATA_SELECTOR: &str =
    ".fact-gray-new > div:nth-child(1) > div:nth-child(1) > div:nth-child(1)";
const UPDATED_SELECTOR: &str = "div.bc-padded-section:nth-child(3) > section:nth-child(1) \
     > div:nth-child(1) > div:nth-child(1) > div:nth-child(1) > div:nth-child(1) \
     > div:nth-child(1) > p:nth-child(2)";

/// Every published range starts on the first testing day of the semester.
const RANGE_PREFIX: &str = "8/16 through ";

pub struct BostonCollegeDashboard {
    client: Client,
    url: String,
}

impl BostonCollegeDashboard {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self::with_url(client, DASHBOARD_URL)
    }

    #[must_use]
    pub fn with_url(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl SourceExtractor for BostonCollegeDashboard {
    fn name(&self) -> &str {
        "bc"
    }

    fn extract(&self) -> Result<Vec<Observation>> {
        let body = fetch_text(&self.client, &self.url)?;
        let records = parse_dashboard(&body, now_utc().date())?;
        Ok(records.into_iter().map(Observation::Cumulative).collect())
    }
}

/// Extracts the undergraduate and remaining-community records.
///
/// The page gives the end of the reporting range without a year; it resolves
/// to the latest such day not after `today`.
pub fn parse_dashboard(html: &str, today: Date) -> Result<[Record; 2]> {
    let document = Html::parse_document(html);

    let boxes: Vec<ElementRef<'_>> = document.select(&selector(DATA_SELECTOR)?).collect();
    let [data] = boxes.as_slice() else {
        bail!("did not find the data boxes ({} matches)", boxes.len());
    };

    let figure = selector(".figure")?;
    let fact = selector(".fact")?;
    let fields: Vec<String> = data.select(&figure).map(visible_text).collect();
    let labels: Vec<String> = data.select(&fact).map(visible_text).collect();
    if fields.len() != EXPECTED_LABELS.len() || labels.len() != EXPECTED_LABELS.len() {
        bail!(
            "did not find the correct number of data fields: {} labels, {} numbers",
            labels.len(),
            fields.len()
        );
    }

    let changed = changed_labels(&EXPECTED_LABELS, &labels);
    if !changed.is_empty() {
        bail!("labels have changed: {}", changed.join(", "));
    }

    let counts = fields
        .iter()
        .map(|field| parse_count(field))
        .collect::<Result<Vec<u64>>>()?;
    let &[total_tested, total_positive, undergrad_tested, undergrad_positive] = counts.as_slice()
    else {
        bail!(
            "expected {} counts, found {}",
            EXPECTED_LABELS.len(),
            counts.len()
        );
    };

    let headings: Vec<ElementRef<'_>> = document.select(&selector(UPDATED_SELECTOR)?).collect();
    let [heading] = headings.as_slice() else {
        bail!("did not find the updated date ({} matches)", headings.len());
    };
    let date = parse_range_end(&visible_text(*heading), today)?;

    let community_tested = total_tested
        .checked_sub(undergrad_tested)
        .ok_or_else(|| anyhow!("undergraduate tests exceed community total"))?;
    let community_positive = total_positive
        .checked_sub(undergrad_positive)
        .ok_or_else(|| anyhow!("undergraduate positives exceed community total"))?;

    let records = [
        Record::new(
            CollectionId::BostonCollegeUndergrads,
            date,
            undergrad_tested,
            undergrad_positive,
        ),
        Record::new(
            CollectionId::BostonCollegeCommunity,
            date,
            community_tested,
            community_positive,
        ),
    ];
    for record in &records {
        record
            .validate()
            .map_err(|err| anyhow!("dashboard counts rejected: {err}"))?;
    }
    Ok(records)
}

/// Parses `8/16 through <M>/<D>` into the latest such day not after `today`.
fn parse_range_end(text: &str, today: Date) -> Result<Date> {
    let invalid = || anyhow!("updated date format invalid: {text:?}");

    let rest = text.strip_prefix(RANGE_PREFIX).ok_or_else(invalid)?;
    let (month_raw, day_raw) = rest.split_once('/').ok_or_else(invalid)?;
    let short_number = |value: &str| {
        (1..=2).contains(&value.len()) && value.chars().all(|ch| ch.is_ascii_digit())
    };
    if !short_number(month_raw) || !short_number(day_raw) {
        return Err(invalid());
    }

    let month: u8 = month_raw.parse().map_err(|_| invalid())?;
    let month = Month::try_from(month).map_err(|_| invalid())?;
    let day: u8 = day_raw.parse().map_err(|_| invalid())?;

    let this_year = Date::from_calendar_date(today.year(), month, day);
    match this_year {
        Ok(date) if date <= today => Ok(date),
        _ => Date::from_calendar_date(today.year() - 1, month, day)
            .with_context(|| format!("updated date out of range: {text:?}")),
    }
}
