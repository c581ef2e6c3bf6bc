//! Wellesley College publishes only trailing 7-day counts, so its
//! observations go through the gap filler.

use anyhow::{anyhow, bail, Context, Result};
use campus_covid_core::{CollectionId, Observation, WeeklyObservation};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use scraper::{ElementRef, Html};
use time::Date;
use tracing::warn;

use super::{
    changed_labels, month_from_name, parse_count, selector, visible_text, SourceExtractor,
};

pub const DASHBOARD_URL: &str = "https://www.wellesley.edu/coronavirus/dashboard";

const EXPECTED_LABELS: [&str; 2] = [
    "Total Asymptomatic Test Results in Past 7 Testing Days",
    "Positive Cases in Past 7 Testing Days",
];

const CARD_SELECTOR: &str = ".card-container > li:not(.link-outside)";
const UPDATED_SELECTOR: &str = ".content-wrapper > section:nth-child(1) > h2:nth-child(1)";

pub struct WellesleyDashboard {
    client: Client,
    url: String,
}

impl WellesleyDashboard {
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

impl SourceExtractor for WellesleyDashboard {
    fn name(&self) -> &str {
        "wellesley"
    }

    fn extract(&self) -> Result<Vec<Observation>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .with_context(|| format!("failed to fetch {}", self.url))?;

        // The dashboard intermittently blocks automated clients.
        if response.status() == StatusCode::FORBIDDEN {
            warn!(url = %self.url, "dashboard returned 403, skipping");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            bail!("dashboard request failed with status {}", response.status());
        }

        let body = response
            .text()
            .context("failed to read dashboard response body")?;
        Ok(vec![Observation::Weekly(parse_dashboard(&body)?)])
    }
}

/// Extracts the weekly counts and the "UPDATED" date from dashboard HTML.
pub fn parse_dashboard(html: &str) -> Result<WeeklyObservation> {
    let document = Html::parse_document(html);

    let cards: Vec<ElementRef<'_>> = document.select(&selector(CARD_SELECTOR)?).collect();
    if cards.len() != EXPECTED_LABELS.len() {
        bail!(
            "did not find the data boxes: expected {}, found {}",
            EXPECTED_LABELS.len(),
            cards.len()
        );
    }

    let title = selector(".card-title")?;
    let number = selector(".number")?;
    let labels: Vec<String> = cards
        .iter()
        .flat_map(|card| card.select(&title))
        .map(visible_text)
        .collect();
    let fields: Vec<String> = cards
        .iter()
        .flat_map(|card| card.select(&number))
        .map(visible_text)
        .collect();

    if labels.len() != EXPECTED_LABELS.len() || fields.len() != EXPECTED_LABELS.len() {
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

    let tested = parse_count(&fields[0])?;
    let positive = parse_count(&fields[1])?;

    let headings: Vec<ElementRef<'_>> = document.select(&selector(UPDATED_SELECTOR)?).collect();
    let [heading] = headings.as_slice() else {
        bail!("did not find the updated date ({} matches)", headings.len());
    };
    let date = parse_updated_heading(&visible_text(*heading))?;

    let observation =
        WeeklyObservation::new(CollectionId::WellesleyCollege, date, tested, positive);
    observation
        .validate()
        .map_err(|err| anyhow!("dashboard counts rejected: {err}"))?;
    Ok(observation)
}

/// Parses `UPDATED <MONTH> <D>, <YYYY>`.
fn parse_updated_heading(text: &str) -> Result<Date> {
    let invalid = || anyhow!("updated date format invalid: {text:?}");

    let rest = text.strip_prefix("UPDATED ").ok_or_else(invalid)?;
    let (month_raw, rest) = rest.split_once(' ').ok_or_else(invalid)?;
    let (day_raw, year_raw) = rest.split_once(", ").ok_or_else(invalid)?;

    let all_digits = |value: &str| value.chars().all(|ch| ch.is_ascii_digit());
    if month_raw.is_empty()
        || !month_raw.chars().all(|ch| ch.is_ascii_alphabetic())
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

#[cfg(test)]
mod tests {
    use time::Month;

    use super::*;

    fn dashboard(updated: &str, tested: &str, positive: &str) -> String {
        format!(
            r#"<html><body>
            <div class="content-wrapper">
              <section>
                <h2>{updated}</h2>
                <ul class="card-container">
                  <li><span class="card-title">Total Asymptomatic Test Results in Past 7 Testing Days<sup>1</sup></span><span class="number">{tested}</span></li>
                  <li><span class="card-title">Positive Cases in Past 7 Testing Days</span><span class="number">{positive}<sup>*</sup></span></li>
                  <li class="link-outside"><a href="/testing">Testing details</a></li>
                </ul>
              </section>
            </div>
            </body></html>"#
        )
    }

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    #[test]
    fn parses_counts_and_updated_date() {
        let observation = must(parse_dashboard(&dashboard(
            "UPDATED SEPTEMBER 14, 2020",
            "1,204",
            "3",
        )));

        assert_eq!(observation.collection_id, CollectionId::WellesleyCollege);
        assert_eq!(
            observation.observed_date,
            must(Date::from_calendar_date(2020, Month::September, 14).map_err(Into::into))
        );
        assert_eq!(observation.week_tested, 1_204);
        assert_eq!(observation.week_positive, 3);
    }

    #[test]
    fn changed_labels_are_reported() {
        let html = dashboard("UPDATED OCTOBER 2, 2020", "10", "1");
        let html = html.replace(EXPECTED_LABELS[1], "Positive Cases This Week");

        let err = match parse_dashboard(&html) {
            Ok(value) => panic!("expected label error, got {value:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("Positive Cases in Past 7 Testing Days"));
    }

    #[test]
    fn missing_cards_are_an_error() {
        let html = "<html><body><ul class=\"card-container\"></ul></body></html>";
        assert!(parse_dashboard(html).is_err());
    }

    #[test]
    fn malformed_heading_is_an_error() {
        for heading in [
            "Updated September 14, 2020",
            "UPDATED SEPTEMBER 14 2020",
            "UPDATED SMARCH 1, 2020",
        ] {
            assert!(
                parse_dashboard(&dashboard(heading, "10", "1")).is_err(),
                "heading {heading:?} should be rejected"
            );
        }
    }

    #[test]
    fn more_positives_than_tests_is_rejected() {
        assert!(parse_dashboard(&dashboard("UPDATED OCTOBER 2, 2020", "1", "5")).is_err());
    }
}
