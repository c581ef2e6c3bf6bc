//! Tufts University publishes its metrics as an image. The accessible long
//! description links to a plain-text file holding the cumulative totals.

use anyhow::{anyhow, bail, Context, Result};
use campus_covid_core::{CollectionId, Observation, Record};
use reqwest::blocking::Client;
use reqwest::Url;
use scraper::Html;
use time::{Date, Month};
use tracing::debug;

use super::{fetch_text, parse_count, selector, SourceExtractor};

pub const METRICS_URL: &str = "https://coronavirus.tufts.edu/testing-metrics";

const ALT_PREFIX: &str = "Tufts COVID-19 testing metrics displayed in tables and graphs. \
     The information reflects test samples collected through ";
const ALT_RESULTS: &str = " and results that were received through ";

const CUMULATIVE_LABEL: &str = "Cumulative from August 3, 2020";
const TESTED_LABEL: &str = "Total Number of Tests with Results: ";
const POSITIVE_LABEL: &str = "Positive Tests: ";

/// What the metrics page says about the current data set.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MetricsPage {
    pub collected_through: Date,
    pub text_url: Url,
}

pub struct TuftsMetrics {
    client: Client,
    url: String,
}

impl TuftsMetrics {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self::with_url(client, METRICS_URL)
    }

    #[must_use]
    pub fn with_url(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl SourceExtractor for TuftsMetrics {
    fn name(&self) -> &str {
        "tufts"
    }

    fn extract(&self) -> Result<Vec<Observation>> {
        let base = Url::parse(&self.url).with_context(|| format!("invalid url {}", self.url))?;
        let page = parse_metrics_page(&fetch_text(&self.client, &self.url)?, &base)?;
        debug!(text_url = %page.text_url, "following metrics description");

        let text = fetch_text(&self.client, page.text_url.as_str())?;
        let (tested, positive) = parse_cumulative_totals(&text)?;

        let record = Record::new(
            CollectionId::TuftsUniversity,
            page.collected_through,
            tested,
            positive,
        );
        record
            .validate()
            .map_err(|err| anyhow!("metrics counts rejected: {err}"))?;
        Ok(vec![Observation::Cumulative(record)])
    }
}

/// Finds the metrics image and reads the collection date and the text link
/// from its attributes. Relative links resolve against `base`.
pub fn parse_metrics_page(html: &str, base: &Url) -> Result<MetricsPage> {
    let document = Html::parse_document(html);

    let images: Vec<(&str, &str)> = document
        .select(&selector("img[alt][longdesc]")?)
        .filter_map(|img| {
            let alt = img.value().attr("alt")?;
            let longdesc = img.value().attr("longdesc")?;
            alt.starts_with(ALT_PREFIX).then_some((alt, longdesc))
        })
        .collect();
    let [(alt, longdesc)] = images.as_slice() else {
        bail!(
            "could not find the metrics image ({} matches)",
            images.len()
        );
    };

    let collected = alt
        .strip_prefix(ALT_PREFIX)
        .and_then(|rest| rest.split_once(ALT_RESULTS))
        .map(|(collected, _)| collected)
        .ok_or_else(|| anyhow!("metrics description format invalid: {alt:?}"))?;
    let collected_through = parse_short_date(collected)?;

    let text_url = base
        .join(longdesc.trim())
        .with_context(|| format!("invalid description link {longdesc:?}"))?;

    Ok(MetricsPage {
        collected_through,
        text_url,
    })
}

/// Reads the cumulative tested and positive totals from the description text.
pub fn parse_cumulative_totals(text: &str) -> Result<(u64, u64)> {
    let Some(start) = text.find(CUMULATIVE_LABEL) else {
        bail!("cumulative data label has changed: expected {CUMULATIVE_LABEL:?}");
    };
    let cumulative = &text[start..];

    let tested = labelled_count(cumulative, TESTED_LABEL)?;
    let positive = labelled_count(cumulative, POSITIVE_LABEL)?;
    Ok((tested, positive))
}

fn labelled_count(text: &str, label: &str) -> Result<u64> {
    let Some(start) = text.find(label) else {
        bail!("could not find {:?}", label.trim_end_matches(": "));
    };
    let value: String = text[start + label.len()..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == ',')
        .collect();
    if value.is_empty() {
        bail!("no count after {:?}", label.trim_end_matches(": "));
    }
    parse_count(&value)
}

/// Parses `M/D/YY`, with the year counted from 2000.
fn parse_short_date(raw: &str) -> Result<Date> {
    let invalid = || anyhow!("collection date format invalid: {raw:?}");

    let parts: Vec<&str> = raw.split('/').collect();
    let &[month, day, year] = parts.as_slice() else {
        return Err(invalid());
    };
    let short_number = |value: &str| {
        (1..=2).contains(&value.len()) && value.chars().all(|ch| ch.is_ascii_digit())
    };
    if !short_number(month) || !short_number(day) || year.len() != 2 || !short_number(year) {
        return Err(invalid());
    }

    let month: u8 = month.parse().map_err(|_| invalid())?;
    let month = Month::try_from(month).map_err(|_| invalid())?;
    let day: u8 = day.parse().map_err(|_| invalid())?;
    let year: i32 = year.parse().map_err(|_| invalid())?;

    Date::from_calendar_date(2000 + year, month, day)
        .with_context(|| format!("collection date out of range: {raw:?}"))
}
