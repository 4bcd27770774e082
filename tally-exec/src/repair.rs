//! Deterministic annotations on step results. Row values are never changed and
//! nothing is re-aggregated; every repair leaves a readable note.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tally_catalog::PolicyCatalog;
use tally_types::{RepairAction, RepairKind, StepResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrainRule {
    pub name: String,
    pub request_terms: Vec<String>,
    pub column_terms: Vec<String>,
}

impl GrainRule {
    fn new(name: &str, request_terms: &[&str], column_terms: &[&str]) -> Self {
        Self {
            name: name.into(),
            request_terms: request_terms.iter().map(|s| s.to_string()).collect(),
            column_terms: column_terms.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Vocabularies driving the repair passes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepairHeuristics {
    pub comparison_terms: Vec<String>,
    pub comparison_columns: Vec<String>,
    pub period_columns: Vec<String>,
    pub date_predicate_terms: Vec<String>,
    pub grains: Vec<GrainRule>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for RepairHeuristics {
    fn default() -> Self {
        Self {
            comparison_terms: strings(&[
                "compare", "compared", "comparison", "versus", "vs", "prior", "previous",
                "last year", "year over year", "yoy", "growth", "change",
            ]),
            comparison_columns: strings(&["prior", "previous", "prev", "baseline"]),
            period_columns: strings(&["period", "date", "day", "week", "month", "quarter", "year"]),
            date_predicate_terms: strings(&[
                "date", "day", "week", "month", "quarter", "year", "period", "between",
                "current_date", "dateadd", "interval",
            ]),
            grains: vec![
                GrainRule::new("store", &["store", "stores", "location", "locations"], &["store"]),
                GrainRule::new("state", &["state", "states"], &["state"]),
                GrainRule::new("city", &["city", "cities"], &["city"]),
                GrainRule::new("channel", &["channel", "channels"], &["channel"]),
                GrainRule::new(
                    "time",
                    &["daily", "weekly", "monthly", "quarterly", "over time", "per month", "by month", "by week", "by day"],
                    &["date", "day", "week", "month", "quarter", "period"],
                ),
            ],
        }
    }
}

/// Whole-word (or whole-phrase) containment on lowercased text.
fn has_term(text: &str, term: &str) -> bool {
    let term = term.to_ascii_lowercase();
    if term.is_empty() {
        return false;
    }
    text.match_indices(&term).any(|(at, _)| {
        let before = text[..at].chars().next_back();
        let after = text[at + term.len()..].chars().next();
        !before.is_some_and(|c| c.is_alphanumeric() || c == '_')
            && !after.is_some_and(|c| c.is_alphanumeric() || c == '_')
    })
}

fn column_has(column: &str, terms: &[String]) -> bool {
    let column = column.to_ascii_lowercase();
    terms.iter().any(|t| column.contains(&t.to_ascii_lowercase()))
}

impl RepairHeuristics {
    /// Runs the passes in order: period-comparison, period-context, grain.
    pub fn apply(&self, goal: &str, catalog: &PolicyCatalog, result: &mut StepResult) {
        if result.is_blocked() || result.rows.is_empty() {
            return;
        }
        let goal = goal.to_lowercase();
        let columns = result.columns();

        if let Some(note) = self.period_comparison(&goal, &columns, result) {
            push(result, RepairKind::PeriodComparison, note);
        }
        if let Some(note) = self.period_context(&columns, catalog, result) {
            push(result, RepairKind::PeriodContext, note);
        }
        if let Some(note) = self.grain(&goal, &columns, &result.step_id) {
            push(result, RepairKind::Grain, note);
        }
    }

    fn period_comparison(&self, goal: &str, columns: &[String], result: &StepResult) -> Option<String> {
        if !self.comparison_terms.iter().any(|t| has_term(goal, t)) {
            return None;
        }
        if columns.iter().any(|c| column_has(c, &self.comparison_columns)) {
            return None;
        }
        let distinct_periods = columns
            .iter()
            .find(|c| column_has(c, &self.period_columns))
            .map(|col| {
                result
                    .rows
                    .iter()
                    .filter_map(|r| r.get(col))
                    .filter(|v| !v.is_null())
                    .map(|v| v.to_string())
                    .collect::<BTreeSet<_>>()
                    .len()
            })
            .unwrap_or(0);
        if distinct_periods > 1 {
            return None;
        }
        Some(format!(
            "{} asked for a comparison but the results cover a single period; no baseline was inferred.",
            result.step_id
        ))
    }

    fn period_context(&self, columns: &[String], catalog: &PolicyCatalog, result: &mut StepResult) -> Option<String> {
        let window = catalog.freshness_window()?;
        if columns.iter().any(|c| column_has(c, &self.period_columns)) {
            return None;
        }
        if self.has_date_predicate(result.sql.as_deref().unwrap_or_default()) {
            return None;
        }
        result.period = Some(window.clone());
        Some(format!(
            "{} has no date filter; figures cover the catalog window {} through {}.",
            result.step_id, window.from, window.through
        ))
    }

    fn has_date_predicate(&self, sql: &str) -> bool {
        let lowered = sql.to_ascii_lowercase();
        let Some(at) = lowered.find("where") else {
            return false;
        };
        let predicate = &lowered[at..];
        self.date_predicate_terms.iter().any(|t| has_term(predicate, t) || predicate.contains(&format!("{t}_")) || predicate.contains(&format!("_{t}")))
    }

    fn grain(&self, goal: &str, columns: &[String], step_id: &str) -> Option<String> {
        let requested: Vec<&str> = self
            .grains
            .iter()
            .filter(|g| g.request_terms.iter().any(|t| has_term(goal, t)))
            .map(|g| g.name.as_str())
            .collect();
        if requested.is_empty() {
            return None;
        }
        let detected: Vec<&str> = self
            .grains
            .iter()
            .filter(|g| columns.iter().any(|c| column_has(c, &g.column_terms)))
            .map(|g| g.name.as_str())
            .collect();
        if requested.iter().any(|r| detected.contains(r)) {
            return None;
        }
        let detected = if detected.is_empty() {
            "none detected".to_string()
        } else {
            detected.join(", ")
        };
        Some(format!(
            "{step_id} requested {} grain but returned {detected}; results are reported at the returned grain.",
            requested.join(", ")
        ))
    }
}

fn push(result: &mut StepResult, kind: RepairKind, note: String) {
    tracing::debug!(step_id = %result.step_id, ?kind, "repair applied");
    result.repairs.push(RepairAction { kind, note });
}
