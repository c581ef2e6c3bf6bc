//! Source extractors turn one published feed into observations.
//!
//! Each extractor owns its own client and parsing. Extractors share nothing
//! with each other and never touch storage.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use campus_covid_core::Observation;
use reqwest::blocking::Client;
use scraper::{ElementRef, Selector};
use time::Month;

pub mod babson;
pub mod bc;
pub mod feed;
pub mod tufts;
pub mod wellesley;

pub use babson::BabsonDashboard;
pub use bc::BostonCollegeDashboard;
pub use feed::JsonFeedSource;
pub use tufts::TuftsMetrics;
pub use wellesley::WellesleyDashboard;

pub trait SourceExtractor: Send + Sync {
    /// Stable name used in logs and run reports.
    fn name(&self) -> &str;

    /// Fetches and parses the source. Errors are opaque and retried by the
    /// driver.
    fn extract(&self) -> Result<Vec<Observation>>;
}

/// HTTP settings shared by every networked extractor of a run.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("campus-covid/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    pub fn build_client(&self) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.timeout)
            .build()
            .context("failed to build HTTP client")
    }
}

/// GETs `url` and returns the body, failing on any non-success status.
pub(crate) fn fetch_text(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to fetch {url}"))?;
    if !response.status().is_success() {
        bail!("request to {url} failed with status {}", response.status());
    }
    response
        .text()
        .with_context(|| format!("failed to read response body from {url}"))
}

pub(crate) fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|err| anyhow!("invalid selector {css}: {err}"))
}

/// Trimmed text of `element`, leaving out anything inside `<sup>`.
pub(crate) fn visible_text(element: ElementRef<'_>) -> String {
    let mut text = String::new();
    for node in element.descendants() {
        let Some(chunk) = node.value().as_text() else {
            continue;
        };
        let in_sup = node
            .ancestors()
            .take_while(|ancestor| ancestor.id() != element.id())
            .any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| el.name() == "sup")
            });
        if !in_sup {
            text.push_str(chunk);
        }
    }
    text.trim().to_string()
}

/// Parses a comma-grouped count such as `12,345`.
pub(crate) fn parse_count(raw: &str) -> Result<u64> {
    let digits: String = raw.chars().filter(|ch| *ch != ',').collect();
    digits
        .trim()
        .parse()
        .with_context(|| format!("invalid count {raw:?}"))
}

/// Labels in `found` that differ from `expected`, position by position.
pub(crate) fn changed_labels<'a>(expected: &[&'a str], found: &[String]) -> Vec<&'a str> {
    expected
        .iter()
        .zip(found)
        .filter(|(expected, found)| found.as_str() != **expected)
        .map(|(expected, _)| *expected)
        .collect()
}

/// Month from its English name, ignoring case.
pub(crate) fn month_from_name(name: &str) -> Result<Month> {
    const MONTHS: [Month; 12] = [
        Month::January,
        Month::February,
        Month::March,
        Month::April,
        Month::May,
        Month::June,
        Month::July,
        Month::August,
        Month::September,
        Month::October,
        Month::November,
        Month::December,
    ];

    MONTHS
        .into_iter()
        .find(|month| month.to_string().eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow!("month not found: {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accept_grouping_commas_only() {
        assert!(matches!(parse_count(" 12,345 "), Ok(12_345)));
        assert!(parse_count("12.345").is_err());
        assert!(parse_count("").is_err());
    }

    #[test]
    fn month_names_match_without_case() {
        assert!(matches!(month_from_name("SEPTEMBER"), Ok(Month::September)));
        assert!(matches!(month_from_name("october"), Ok(Month::October)));
        assert!(month_from_name("Smarch").is_err());
    }

    #[test]
    fn changed_labels_lists_expected_names() {
        let found = vec!["A".to_string(), "b".to_string()];
        assert_eq!(changed_labels(&["A", "B"], &found), vec!["B"]);
    }
}
