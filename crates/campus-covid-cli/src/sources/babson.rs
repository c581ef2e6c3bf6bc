//! Babson College reports cumulative tests in one box and positives split
//! across population rows.

use anyhow::{anyhow, bail, Context, Result};
use campus_covid_core::{CollectionId, Observation, Record};
use reqwest::blocking::Client;
use scraper::{ElementRef, Html};
use time::Date;

use super::{
    changed_labels, fetch_text, month_from_name, parse_count, selector, visible_text,
    SourceExtractor,
};

pub const DASHBOARD_URL: &str =
    "https://www.babson.edu/emergency-preparedness/return-to-campus/covid-dashboard/";

const TESTED_LABEL: &str = "Tests Conducted";
const POSITIVE_ROWS: [&str; 3] = ["Students", "Employees", "Service Providers**"];

const TESTED_SELECTOR: &str = "#id-1248929 > table:nth-child(2) > thead:nth-child(1) \
     > tr:nth-child(2) > td:nth-child(1)";
const POSITIVES_SELECTOR: &str = "#id-1248929 > table:nth-child(2) > thead:nth-child(1) \
     > tr:nth-child(2) > td:nth-child(3) > table:nth-child(2)";
const UPDATED_SELECTOR: &str = "#id-1245136 > p:nth-child(3)";

pub struct BabsonDashboard {
    client: Client,
    url: String,
}

impl BabsonDashboard {
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

impl SourceExtractor for BabsonDashboard {
    fn name(&self) -> &str {
        "babson"
    }

    fn extract(&self) -> Result<Vec<Observation>> {
        let body = fetch_text(&self.client, &self.url)?;
        Ok(vec![Observation::Cumulative(parse_dashboard(&body)?)])
    }
}

/// Extracts cumulative tests, summed positives and the "Data as of" date.
pub fn parse_dashboard(html: &str) -> Result<Record> {
    let document = Html::parse_document(html);

    let tested_box = single(&document, TESTED_SELECTOR, "tested box")?;
    let titles: Vec<ElementRef<'_>> = tested_box.select(&selector("p")?).collect();
    let values: Vec<ElementRef<'_>> = tested_box.select(&selector("h2")?).collect();
    let ([title], [value]) = (titles.as_slice(), values.as_slice()) else {
        bail!(
            "did not find the correct tested box: {} titles, {} values",
            titles.len(),
            values.len()
        );
    };
    if visible_text(*title) != TESTED_LABEL {
        bail!("labels have changed: {TESTED_LABEL}");
    }
    let tested = parse_count(&visible_text(*value))?;

    let positives_table = single(&document, POSITIVES_SELECTOR, "positives table")?;
    let cell = selector("td")?;
    let rows: Vec<ElementRef<'_>> = positives_table.select(&selector("tr")?).collect();
    if rows.len() != POSITIVE_ROWS.len() {
        bail!(
            "did not find the correct number of positive rows: expected {}, found {}",
            POSITIVE_ROWS.len(),
            rows.len()
        );
    }

    let mut labels = Vec::with_capacity(rows.len());
    let mut positive: u64 = 0;
    for row in rows {
        let cols: Vec<ElementRef<'_>> = row.select(&cell).collect();
        let [label, value] = cols.as_slice() else {
            bail!(
                "invalid positives table structure: {} cells in a row",
                cols.len()
            );
        };
        labels.push(visible_text(*label));
        positive = positive
            .checked_add(digits_only(&visible_text(*value))?)
            .ok_or_else(|| anyhow!("positive count overflow"))?;
    }

    let changed = changed_labels(&POSITIVE_ROWS, &labels);
    if !changed.is_empty() {
        bail!("labels have changed: {}", changed.join(", "));
    }

    let updated = single(&document, UPDATED_SELECTOR, "updated date")?;
    let date = parse_data_as_of(&visible_text(updated))?;

    let record = Record::new(CollectionId::BabsonCollege, date, tested, positive);
    record
        .validate()
        .map_err(|err| anyhow!("dashboard counts rejected: {err}"))?;
    Ok(record)
}

fn single<'a>(document: &'a Html, css: &str, what: &str) -> Result<ElementRef<'a>> {
    let found: Vec<ElementRef<'a>> = document.select(&selector(css)?).collect();
    match found.as_slice() {
        [element] => Ok(*element),
        _ => bail!("did not find the {what} ({} matches)", found.len()),
    }
}

/// Counts on the positives rows carry footnote markers such as `4*`.
fn digits_only(raw: &str) -> Result<u64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits
        .parse()
        .with_context(|| format!("invalid count {raw:?}"))
}

/// Parses `Data as of <Month> <D>, <YYYY>` with a capitalized month name.
fn parse_data_as_of(text: &str) -> Result<Date> {
    let invalid = || anyhow!("updated date format invalid: {text:?}");

    let rest = text.strip_prefix("Data as of ").ok_or_else(invalid)?;
    let (month_raw, rest) = rest.split_once(' ').ok_or_else(invalid)?;
    let (day_raw, year_raw) = rest.split_once(", ").ok_or_else(invalid)?;

    let capitalized = month_raw.len() > 1
        && month_raw.starts_with(|ch: char| ch.is_ascii_uppercase())
        && month_raw[1..].chars().all(|ch| ch.is_ascii_lowercase());
    let all_digits = |value: &str| value.chars().all(|ch| ch.is_ascii_digit());
    if !capitalized
        || !(1..=2).contains(&day_raw.len())
        || !all_digits(day_raw)
        || year_raw.len() != 4
        || !all_digits(year_raw)
    {
        return Err(invalid());
    }

    let month = month_from_name(month_raw)?;
    let day: u8 = day_raw.parse().map_err(|_| invalid())?;
    let year: i32 = year_raw.parse().map_err(|_| invalid())?;

    Date::from_calendar_date(year, month, day)
        .with_context(|| format!("updated date out of range: {text:?}"))
}
