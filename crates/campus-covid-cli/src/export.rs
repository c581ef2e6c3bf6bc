use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use campus_covid_core::{format_day, format_rfc3339, now_utc, Catalog, Collection, RecordStore};
use serde::Serialize;

pub const EXPORT_CONTRACT_VERSION: &str = "export.v1";

/// Catalog plus every stored series, in the shape the presentation layer reads.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportDocument {
    pub contract_version: String,
    pub generated_at: String,
    pub collections: Vec<Collection>,
    pub data: BTreeMap<String, Vec<ExportPoint>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportPoint {
    pub date: String,
    pub tested: u64,
    pub positive: u64,
}

pub fn build_export<S: RecordStore + ?Sized>(
    catalog: &Catalog,
    store: &S,
) -> Result<ExportDocument> {
    let mut data = BTreeMap::new();
    for collection in catalog.iter() {
        let points = store
            .list(collection.id)
            .map_err(|err| anyhow!("failed to export {}: {err}", collection.id))?
            .into_iter()
            .map(|record| ExportPoint {
                date: format_day(record.date),
                tested: record.tested,
                positive: record.positive,
            })
            .collect();
        data.insert(collection.id.as_str().to_string(), points);
    }

    Ok(ExportDocument {
        contract_version: EXPORT_CONTRACT_VERSION.to_string(),
        generated_at: format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
        collections: catalog.iter().cloned().collect(),
        data,
    })
}
