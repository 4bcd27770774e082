use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tally_types::DateRange;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("io error reading {path}: {message}")]
    Io { path: String, message: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid catalog: {0}")]
    Invalid(String),
    #[error("catalog has no source path to reload from")]
    NoPath,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogTable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRule {
    pub left: String,
    pub right: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPolicy {
    #[serde(default)]
    pub restricted_columns: Vec<String>,
    #[serde(default = "default_row_limit")]
    pub default_row_limit: u64,
    #[serde(default = "max_row_limit")]
    pub max_row_limit: u64,
    #[serde(default)]
    pub freshness_window: Option<DateRange>,
}

impl Default for CatalogPolicy {
    fn default() -> Self {
        Self {
            restricted_columns: Vec::new(),
            default_row_limit: default_row_limit(),
            max_row_limit: max_row_limit(),
            freshness_window: None,
        }
    }
}

fn default_row_limit() -> u64 {
    1000
}

fn max_row_limit() -> u64 {
    5000
}

/// Versioned, read-only description of what the pipeline may query.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCatalog {
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub tables: Vec<CatalogTable>,
    #[serde(default)]
    pub join_rules: Vec<JoinRule>,
    #[serde(default)]
    pub policy: CatalogPolicy,
}

impl PolicyCatalog {
    /// Reads a catalog document. `.yaml`/`.yml` files are parsed as YAML, anything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| CatalogError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let catalog = if is_yaml {
            Self::from_yaml_str(&text)?
        } else {
            Self::from_json_str(&text)?
        };
        Ok(catalog)
    }

    pub fn from_json_str(text: &str) -> Result<Self, CatalogError> {
        let catalog: Self =
            serde_json::from_str(text).map_err(|e| CatalogError::Parse(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let catalog: Self =
            serde_yaml::from_str(text).map_err(|e| CatalogError::Parse(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.tables.is_empty() {
            return Err(CatalogError::Invalid("at least one table is required".into()));
        }
        if self.tables.iter().any(|t| t.name.trim().is_empty()) {
            return Err(CatalogError::Invalid("table names must be non-empty".into()));
        }
        if self.policy.default_row_limit < 1 {
            return Err(CatalogError::Invalid("defaultRowLimit must be >= 1".into()));
        }
        if self.policy.max_row_limit < self.policy.default_row_limit {
            return Err(CatalogError::Invalid(
                "maxRowLimit must be >= defaultRowLimit".into(),
            ));
        }
        Ok(())
    }

    pub fn default_row_limit(&self) -> u64 {
        self.policy.default_row_limit
    }

    pub fn max_row_limit(&self) -> u64 {
        self.policy.max_row_limit
    }

    pub fn freshness_window(&self) -> Option<&DateRange> {
        self.policy.freshness_window.as_ref()
    }

    pub fn restricted_columns(&self) -> &[String] {
        &self.policy.restricted_columns
    }

    pub fn allowed_tables(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Case-insensitive membership test against the allowed table names.
    pub fn is_table_allowed(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn table(&self, name: &str) -> Option<&CatalogTable> {
        let name = name.trim();
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Dimensions, metrics and plain columns of one table, lowercased and deduplicated.
    pub fn allowed_columns(&self, table: &str) -> BTreeSet<String> {
        self.table(table)
            .map(|t| {
                t.dimensions
                    .iter()
                    .chain(&t.metrics)
                    .chain(&t.columns)
                    .map(|c| c.to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every dimension across all tables, in catalog order without duplicates.
    pub fn dimensions(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.tables
            .iter()
            .flat_map(|t| t.dimensions.iter())
            .filter(|d| seen.insert(d.to_ascii_lowercase()))
            .map(|d| d.as_str())
            .collect()
    }

    /// Distinct catalog dimensions named in free text.
    pub fn mentioned_dimensions(&self, text: &str) -> Vec<&str> {
        let text = text.to_ascii_lowercase();
        self.dimensions()
            .into_iter()
            .filter(|d| mentions(&text, d))
            .collect()
    }

    /// Picks the table whose name, dimensions and metrics best match the goal text.
    /// Ties keep catalog order. `None` only for a catalog without tables.
    pub fn table_for_goal(&self, goal: &str) -> Option<&CatalogTable> {
        let goal = goal.to_ascii_lowercase();
        let mut best = self.tables.first()?;
        let mut best_score = 0usize;
        for table in &self.tables {
            let mut score = 0;
            if mentions(&goal, &table.name) {
                score += 2;
            }
            score += table
                .dimensions
                .iter()
                .chain(&table.metrics)
                .filter(|f| mentions(&goal, f))
                .count();
            if score > best_score {
                best = table;
                best_score = score;
            }
        }
        Some(best)
    }

    /// Compact catalog description for prompts.
    pub fn summary(&self) -> String {
        let mut out = format!("Catalog version {}", self.version);
        if !self.description.is_empty() {
            out.push_str(&format!(": {}", self.description));
        }
        out.push('\n');
        for t in &self.tables {
            out.push_str(&format!("- table {}", t.name));
            if !t.description.is_empty() {
                out.push_str(&format!(" ({})", t.description));
            }
            out.push('\n');
            if !t.dimensions.is_empty() {
                out.push_str(&format!("  dimensions: {}\n", t.dimensions.join(", ")));
            }
            if !t.metrics.is_empty() {
                out.push_str(&format!("  metrics: {}\n", t.metrics.join(", ")));
            }
            if !t.columns.is_empty() {
                out.push_str(&format!("  columns: {}\n", t.columns.join(", ")));
            }
        }
        for j in &self.join_rules {
            out.push_str(&format!(
                "- join {} <-> {} on {}\n",
                j.left,
                j.right,
                j.keys.join(", ")
            ));
        }
        if !self.policy.restricted_columns.is_empty() {
            out.push_str(&format!(
                "Restricted columns (never select): {}\n",
                self.policy.restricted_columns.join(", ")
            ));
        }
        out.push_str(&format!(
            "Row limits: default {}, max {}\n",
            self.policy.default_row_limit, self.policy.max_row_limit
        ));
        if let Some(w) = &self.policy.freshness_window {
            out.push_str(&format!("Data available from {} through {}\n", w.from, w.through));
        }
        out
    }
}

/// Whole-word-ish containment; `store_id` matches "store id" and "store_id".
fn mentions(haystack: &str, feature: &str) -> bool {
    let feature = feature.to_ascii_lowercase();
    if feature.is_empty() {
        return false;
    }
    let spaced = feature.replace('_', " ");
    [feature.as_str(), spaced.as_str()].iter().any(|needle| {
        haystack.match_indices(needle).any(|(at, _)| {
            let before = haystack[..at].chars().next_back();
            let after = haystack[at + needle.len()..].chars().next();
            !before.is_some_and(|c| c.is_alphanumeric())
                && !after.is_some_and(|c| c.is_alphanumeric() && c != 's')
        })
    })
}

/// Current catalog behind a lock; each turn works on an `Arc` snapshot.
#[derive(Debug)]
pub struct SharedCatalog {
    current: RwLock<Arc<PolicyCatalog>>,
    source: Option<PathBuf>,
}

impl SharedCatalog {
    pub fn new(catalog: PolicyCatalog) -> Result<Self, CatalogError> {
        catalog.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(catalog)),
            source: None,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref().to_path_buf();
        let catalog = PolicyCatalog::load(&path)?;
        Ok(Self {
            current: RwLock::new(Arc::new(catalog)),
            source: Some(path),
        })
    }

    pub fn snapshot(&self) -> Arc<PolicyCatalog> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-reads the source document. On failure the previous catalog stays in place.
    pub fn reload(&self) -> Result<Arc<PolicyCatalog>, CatalogError> {
        let path = self.source.as_ref().ok_or(CatalogError::NoPath)?;
        let fresh = match PolicyCatalog::load(path) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "catalog reload failed; keeping previous");
                return Err(e);
            }
        };
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = fresh.clone();
        tracing::info!(version = %fresh.version, "catalog reloaded");
        Ok(fresh)
    }

    /// Swaps in a catalog built in memory. Invalid catalogs are rejected.
    pub fn replace(&self, catalog: PolicyCatalog) -> Result<(), CatalogError> {
        catalog.validate()?;
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(catalog);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SAMPLE: &str = r#"{
        "version": "2024.06",
        "description": "retail",
        "tables": [
            {"name": "sales", "dimensions": ["state", "store_id", "month"], "metrics": ["revenue"]},
            {"name": "inventory", "dimensions": ["sku"], "metrics": ["on_hand"]}
        ],
        "policy": {"restrictedColumns": ["customer_email"], "defaultRowLimit": 100, "maxRowLimit": 500}
    }"#;

    #[test]
    fn loads_and_answers_membership_case_insensitively() {
        let c = PolicyCatalog::from_json_str(SAMPLE).unwrap();
        assert!(c.is_table_allowed("SALES"));
        assert!(!c.is_table_allowed("payroll"));
        assert!(c.allowed_columns("sales").contains("revenue"));
        assert_eq!(c.dimensions(), vec!["state", "store_id", "month", "sku"]);
    }

    #[test]
    fn rejects_inverted_limits() {
        let bad = SAMPLE.replace("\"maxRowLimit\": 500", "\"maxRowLimit\": 10");
        assert!(matches!(
            PolicyCatalog::from_json_str(&bad),
            Err(CatalogError::Invalid(_))
        ));
    }

    #[test]
    fn shipped_sample_is_valid() {
        let c = PolicyCatalog::from_json_str(include_str!("../../config/catalog.sample.json")).unwrap();
        assert!(c.is_table_allowed("cia_sales_insights_cortex"));
        assert!(c.restricted_columns().iter().any(|r| r == "co_id"));
        assert_eq!(c.freshness_window().map(|w| w.from.as_str()), Some("2024-01-01"));
    }

    #[test]
    fn rejects_empty_tables() {
        let err = PolicyCatalog::from_json_str(r#"{"version":"1","tables":[]}"#).unwrap_err();
        assert!(matches!(err, CatalogError::Invalid(_)));
    }

    #[test]
    fn table_for_goal_prefers_feature_matches() {
        let c = PolicyCatalog::from_json_str(SAMPLE).unwrap();
        assert_eq!(c.table_for_goal("on hand units per sku").unwrap().name, "inventory");
        assert_eq!(c.table_for_goal("revenue by state").unwrap().name, "sales");
        assert_eq!(c.table_for_goal("something else").unwrap().name, "sales");
    }

    #[test]
    fn empty_catalog_has_no_goal_table_and_is_not_shared() {
        let mut c = PolicyCatalog::from_json_str(SAMPLE).unwrap();
        let shared = SharedCatalog::new(c.clone()).unwrap();
        c.tables.clear();
        assert!(c.table_for_goal("revenue by state").is_none());
        assert!(matches!(SharedCatalog::new(c.clone()), Err(CatalogError::Invalid(_))));
        assert!(shared.replace(c).is_err());
        assert_eq!(shared.snapshot().tables.len(), 2);
    }

    #[test]
    fn failed_reload_keeps_previous_catalog() {
        let dir = std::env::temp_dir().join(format!("tally-catalog-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("catalog.json");
        fs::write(&path, SAMPLE).unwrap();

        let shared = SharedCatalog::from_path(&path).unwrap();
        let before = shared.snapshot();
        fs::write(&path, "{ not json").unwrap();
        assert!(shared.reload().is_err());
        assert_eq!(shared.snapshot().version, before.version);

        fs::write(&path, SAMPLE.replace("2024.06", "2024.07")).unwrap();
        assert_eq!(shared.reload().unwrap().version, "2024.07");
        // earlier snapshots are unaffected
        assert_eq!(before.version, "2024.06");
    }

    #[test]
    fn summary_lists_tables_and_limits() {
        let c = PolicyCatalog::from_json_str(SAMPLE).unwrap();
        let s = c.summary();
        assert!(s.contains("table sales"));
        assert!(s.contains("customer_email"));
        assert!(s.contains("default 100, max 500"));
    }
}
