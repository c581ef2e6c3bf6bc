use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use campus_covid_core::{parse_observations, Observation};

use super::SourceExtractor;

/// Reads a JSON array of observations from disk.
///
/// Used for offline backfills and for sources whose numbers are collected by
/// hand.
#[derive(Debug, Clone)]
pub struct JsonFeedSource {
    name: String,
    path: PathBuf,
}

impl JsonFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("feed:{}", path.display());
        Self { name, path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceExtractor for JsonFeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&self) -> Result<Vec<Observation>> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read feed {}", self.path.display()))?;
        parse_observations(&raw)
            .map_err(|err| anyhow!("invalid feed {}: {err}", self.path.display()))
    }
}
