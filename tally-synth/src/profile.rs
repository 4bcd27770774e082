//! Deterministic profiling of step results: exportable tables, analysis
//! artifacts, evidence rows and headline metrics. Nothing here calls out.

use std::cmp::Ordering;

use serde_json::{json, Map, Value};
use tally_types::{
    value_as_f64, AnalysisArtifact, ArtifactKind, DataTable, EvidenceRow, MetricPoint, MetricUnit, Row,
    StepResult,
};

const TIME_TERMS: &[&str] = &["date", "month", "week", "day", "quarter", "year", "period", "time"];
const PRIOR_TERMS: &[&str] = &["prior", "previous", "prev", "baseline", "last_year"];
const CURRENT_TERMS: &[&str] = &["current", "curr", "latest", "this_year"];
const COMPARISON_WORDS: &[&str] = &["compare", "compared", "comparison", "versus", "vs", "yoy", "prior", "previous"];
const MAX_ARTIFACT_ROWS: usize = 100;
const MAX_EVIDENCE_ROWS: usize = 8;
const DISTRIBUTION_MIN_VALUES: usize = 5;
const MAX_METRICS: usize = 3;

#[derive(Clone, Debug, Default)]
pub struct Profile {
    pub data_tables: Vec<DataTable>,
    pub artifacts: Vec<AnalysisArtifact>,
    pub evidence: Vec<EvidenceRow>,
    pub metrics: Vec<MetricPoint>,
}

pub fn profile(message: &str, results: &[StepResult]) -> Profile {
    let data_tables = data_tables(results);
    let artifacts = artifacts(message, results);
    let evidence = evidence(results);
    let metrics = metrics(results, &evidence, &artifacts);
    Profile {
        data_tables,
        artifacts,
        evidence,
        metrics,
    }
}

/// One table per executed step, numbered by plan position.
pub fn data_tables(results: &[StepResult]) -> Vec<DataTable> {
    results
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_blocked())
        .map(|(i, r)| DataTable {
            id: format!("sql_step_{}", i + 1),
            name: format!("SQL Step {} Output", i + 1),
            columns: r.columns(),
            rows: r.rows.clone(),
            row_count: r.row_count,
            description: Some(r.goal.clone()),
            source_sql: r.sql.clone(),
        })
        .collect()
}

fn contains_any(name: &str, terms: &[&str]) -> bool {
    let name = name.to_ascii_lowercase();
    terms.iter().any(|t| name.contains(t))
}

fn mentions_comparison(message: &str) -> bool {
    message
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| COMPARISON_WORDS.contains(&w))
}

struct Shape {
    numeric: Vec<String>,
    dimensions: Vec<String>,
    time: Option<String>,
}

fn shape(rows: &[Row]) -> Shape {
    let columns: Vec<String> = rows.first().map(|r| r.keys().cloned().collect()).unwrap_or_default();
    let is_numeric = |col: &String| {
        let mut seen = false;
        for row in rows {
            match row.get(col) {
                None | Some(Value::Null) => {}
                Some(Value::Number(_)) => seen = true,
                Some(_) => return false,
            }
        }
        seen
    };
    let time = columns.iter().find(|c| contains_any(c, TIME_TERMS)).cloned();
    let (numeric, dimensions): (Vec<String>, Vec<String>) = columns
        .into_iter()
        .filter(|c| Some(c) != time.as_ref())
        .partition(|c| is_numeric(c));
    Shape {
        numeric,
        dimensions,
        time,
    }
}

fn year_in(name: &str) -> Option<u32> {
    let bytes = name.as_bytes();
    (0..bytes.len().saturating_sub(3)).find_map(|i| {
        let window = &bytes[i..i + 4];
        let bounded = (i == 0 || !bytes[i - 1].is_ascii_digit())
            && bytes.get(i + 4).map_or(true, |b| !b.is_ascii_digit());
        if !bounded || !window.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let year = window.iter().fold(0u32, |acc, b| acc * 10 + u32::from(b - b'0'));
        (1900..=2100).contains(&year).then_some(year)
    })
}

/// `(prior, current)` numeric columns, by name or by the years they carry.
fn comparison_pair(numeric: &[String]) -> Option<(String, String)> {
    let prior = numeric.iter().find(|c| contains_any(c, PRIOR_TERMS));
    let current = numeric.iter().find(|c| contains_any(c, CURRENT_TERMS));
    if let (Some(p), Some(c)) = (prior, current) {
        if p != c {
            return Some((p.clone(), c.clone()));
        }
    }
    let mut dated: Vec<(u32, &String)> = numeric.iter().filter_map(|c| year_in(c).map(|y| (y, c))).collect();
    dated.sort_by_key(|(y, _)| *y);
    match (dated.first(), dated.last()) {
        (Some((y0, p)), Some((y1, c))) if y0 < y1 => Some(((*p).clone(), (*c).clone())),
        _ => None,
    }
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (value_as_f64(a), value_as_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn row_of(pairs: Vec<(&str, Value)>) -> Row {
    let mut row = Map::new();
    for (k, v) in pairs {
        row.insert(k.to_string(), v);
    }
    row
}

fn artifact(
    kind: ArtifactKind,
    title: String,
    step: &StepResult,
    rows: Vec<Row>,
    dimension_key: Option<String>,
    value_key: Option<String>,
    time_key: Option<String>,
) -> AnalysisArtifact {
    AnalysisArtifact {
        id: String::new(),
        kind,
        title,
        source_step: step.step_id.clone(),
        columns: rows.first().map(|r| r.keys().cloned().collect()).unwrap_or_default(),
        rows,
        dimension_key,
        value_key,
        time_key,
    }
}

fn comparison_artifact(step: &StepResult, shape: &Shape, prior: &str, current: &str) -> AnalysisArtifact {
    let dim = shape.dimensions.first().or(shape.time.as_ref()).cloned();
    let dim_key = dim.clone().unwrap_or_else(|| "segment".into());
    let rows = step
        .rows
        .iter()
        .take(MAX_ARTIFACT_ROWS)
        .enumerate()
        .filter_map(|(i, r)| {
            let p = r.get(prior).and_then(value_as_f64)?;
            let c = r.get(current).and_then(value_as_f64)?;
            let label = dim
                .as_ref()
                .and_then(|d| r.get(d).cloned())
                .unwrap_or_else(|| json!(format!("Row {}", i + 1)));
            let change = round4(c - p);
            let pct = if p != 0.0 { json!(round4(change / p.abs() * 100.0)) } else { Value::Null };
            Some(row_of(vec![
                (dim_key.as_str(), label),
                (prior, json!(p)),
                (current, json!(c)),
                ("change_value", json!(change)),
                ("change_pct", pct),
            ]))
        })
        .collect();
    artifact(
        ArtifactKind::ComparisonBreakdown,
        format!("{current} versus {prior}"),
        step,
        rows,
        Some(dim_key),
        Some("change_value".into()),
        None,
    )
}

fn trend_artifact(step: &StepResult, time: &str, value: &str) -> AnalysisArtifact {
    let mut rows: Vec<Row> = step
        .rows
        .iter()
        .filter(|r| r.get(value).and_then(value_as_f64).is_some())
        .map(|r| {
            row_of(vec![
                (time, r.get(time).cloned().unwrap_or(Value::Null)),
                (value, r.get(value).cloned().unwrap_or(Value::Null)),
            ])
        })
        .collect();
    rows.sort_by(|a, b| cmp_values(&a[time], &b[time]));
    rows.truncate(MAX_ARTIFACT_ROWS);
    artifact(
        ArtifactKind::TrendBreakdown,
        format!("{value} over {time}"),
        step,
        rows,
        None,
        Some(value.into()),
        Some(time.into()),
    )
}

fn ranking_artifact(step: &StepResult, dim: &str, value: &str) -> AnalysisArtifact {
    let mut pairs: Vec<(Value, f64)> = step
        .rows
        .iter()
        .filter_map(|r| Some((r.get(dim).cloned().unwrap_or(Value::Null), r.get(value).and_then(value_as_f64)?)))
        .collect();
    pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    let total: f64 = pairs.iter().map(|(_, v)| v).sum();
    let shares = total > 0.0 && pairs.iter().all(|(_, v)| *v >= 0.0);

    let rows = pairs
        .into_iter()
        .take(MAX_ARTIFACT_ROWS)
        .enumerate()
        .map(|(i, (label, v))| {
            let share = if shares { json!((v / total * 10_000.0).round() / 100.0) } else { Value::Null };
            row_of(vec![
                ("rank", json!(i + 1)),
                (dim, label),
                (value, json!(v)),
                ("share_pct", share),
            ])
        })
        .collect();
    artifact(
        ArtifactKind::RankingBreakdown,
        format!("{value} by {dim}"),
        step,
        rows,
        Some(dim.into()),
        Some(value.into()),
        None,
    )
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = p * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (idx - lo as f64)
}

fn distribution_artifact(step: &StepResult, value: &str) -> Option<AnalysisArtifact> {
    let mut values: Vec<f64> = step.rows.iter().filter_map(|r| r.get(value).and_then(value_as_f64)).collect();
    if values.len() < DISTRIBUTION_MIN_VALUES {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let stats = [
        ("min", values[0]),
        ("p10", percentile(&values, 0.1)),
        ("median", percentile(&values, 0.5)),
        ("mean", mean),
        ("p90", percentile(&values, 0.9)),
        ("max", values[values.len() - 1]),
    ];
    let rows = stats
        .iter()
        .map(|(stat, v)| row_of(vec![("stat", json!(stat)), ("value", json!(round4(*v)))]))
        .collect();
    Some(artifact(
        ArtifactKind::DistributionBreakdown,
        format!("Distribution of {value}"),
        step,
        rows,
        None,
        Some("value".into()),
        None,
    ))
}

pub fn artifacts(message: &str, results: &[StepResult]) -> Vec<AnalysisArtifact> {
    let mut out = Vec::new();
    for step in results.iter().filter(|r| !r.is_blocked() && !r.rows.is_empty()) {
        let shape = shape(&step.rows);
        let value = shape.numeric.first().cloned();

        if let Some((prior, current)) = comparison_pair(&shape.numeric) {
            out.push(comparison_artifact(step, &shape, &prior, &current));
        } else if let (Some(time), Some(value), true) = (&shape.time, &value, shape.dimensions.is_empty()) {
            if step.rows.len() >= 2 {
                out.push(trend_artifact(step, time, value));
            }
        } else if let (Some(dim), Some(value)) = (shape.dimensions.first(), &value) {
            out.push(ranking_artifact(step, dim, value));
        }
        if let Some(value) = &value {
            out.extend(distribution_artifact(step, value));
        }
    }

    if mentions_comparison(message) {
        out.sort_by_key(|a| a.kind != ArtifactKind::ComparisonBreakdown);
    }
    for (i, a) in out.iter_mut().enumerate() {
        a.id = format!("a{}", i + 1);
    }
    out
}

fn find_column<'a>(columns: &'a [String], candidates: &[&str]) -> Option<&'a String> {
    candidates
        .iter()
        .find_map(|cand| columns.iter().find(|c| c.to_ascii_lowercase().contains(cand)))
}

/// Segment-level prior/current movement. Empty unless the first executed step
/// carries prior/current or change columns.
pub fn evidence(results: &[StepResult]) -> Vec<EvidenceRow> {
    let Some(step) = results.iter().find(|r| !r.is_blocked() && !r.rows.is_empty()) else {
        return Vec::new();
    };
    let columns = step.columns();
    let prior_col = find_column(&columns, &["prior", "previous", "baseline", "prev"]);
    let current_col = find_column(&columns, &["current", "latest", "curr"]);
    let change_col = find_column(&columns, &["changebps", "change_bps", "delta_bps", "delta", "change"]);
    if change_col.is_none() && (prior_col.is_none() || current_col.is_none()) {
        return Vec::new();
    }
    let numeric = shape(&step.rows).numeric;
    let segment_col = columns.iter().find(|c| !numeric.contains(c));
    let contribution_col = find_column(&columns, &["contribution", "share", "impact"]);

    let num = |row: &Row, col: Option<&String>| col.and_then(|c| row.get(c)).and_then(value_as_f64);
    step.rows
        .iter()
        .take(MAX_EVIDENCE_ROWS)
        .enumerate()
        .map(|(i, row)| {
            let segment = segment_col
                .and_then(|c| row.get(c))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| format!("Segment {}", i + 1));
            let prior = num(row, prior_col);
            let current = num(row, current_col);
            let change = num(row, change_col).unwrap_or_else(|| match (prior, current) {
                (Some(p), Some(c)) if p.abs() <= 1.5 && c.abs() <= 1.5 => (c - p) * 10_000.0,
                (Some(p), Some(c)) => c - p,
                _ => 0.0,
            });
            let prior_value = prior.unwrap_or(0.0);
            EvidenceRow {
                segment,
                prior: prior_value,
                current: current.unwrap_or(prior_value),
                change_bps: round4(change),
                contribution: num(row, contribution_col).unwrap_or(0.0),
            }
        })
        .collect()
}

pub fn unit_for(column: &str) -> MetricUnit {
    let c = column.to_ascii_lowercase();
    if c.contains("bps") {
        MetricUnit::Bps
    } else if ["pct", "percent", "rate", "share"].iter().any(|t| c.contains(t)) {
        MetricUnit::Pct
    } else if ["sales", "revenue", "spend", "amount", "usd", "price", "cost"].iter().any(|t| c.contains(t)) {
        MetricUnit::Usd
    } else {
        MetricUnit::Count
    }
}

pub(crate) fn first_of(artifacts: &[AnalysisArtifact], kind: ArtifactKind) -> Option<&AnalysisArtifact> {
    artifacts.iter().find(|a| a.kind == kind && !a.rows.is_empty())
}

pub(crate) fn label_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown".into(),
        Some(other) => other.to_string(),
    }
}

/// Headline metrics, at most three. No placeholder padding.
pub fn metrics(results: &[StepResult], evidence: &[EvidenceRow], artifacts: &[AnalysisArtifact]) -> Vec<MetricPoint> {
    let total_rows: usize = results.iter().filter(|r| !r.is_blocked()).map(|r| r.row_count).sum();
    let mut out = vec![MetricPoint {
        label: "Rows Retrieved".into(),
        value: total_rows as f64,
        delta: 0.0,
        unit: MetricUnit::Count,
    }];

    if !evidence.is_empty() {
        let avg = evidence.iter().map(|e| e.change_bps).sum::<f64>() / evidence.len() as f64;
        let max = evidence.iter().map(|e| e.change_bps.abs()).fold(0.0, f64::max);
        out.push(MetricPoint {
            label: "Average Segment Delta".into(),
            value: round4(avg),
            delta: round4(avg),
            unit: MetricUnit::Bps,
        });
        out.push(MetricPoint {
            label: "Largest Segment Move".into(),
            value: max,
            delta: max,
            unit: MetricUnit::Bps,
        });
    } else if let Some(rank) = first_of(artifacts, ArtifactKind::RankingBreakdown) {
        let value_key = rank.value_key.clone().unwrap_or_default();
        let dim_key = rank.dimension_key.clone().unwrap_or_default();
        let top = &rank.rows[0];
        if let Some(v) = top.get(&value_key).and_then(value_as_f64) {
            out.push(MetricPoint {
                label: format!("Top {dim_key}: {}", label_of(top.get(&dim_key))),
                value: v,
                delta: 0.0,
                unit: unit_for(&value_key),
            });
        }
        let share: f64 = rank.rows.iter().take(3).filter_map(|r| r.get("share_pct").and_then(value_as_f64)).sum();
        if share > 0.0 {
            out.push(MetricPoint {
                label: "Top 3 Share".into(),
                value: round4(share),
                delta: 0.0,
                unit: MetricUnit::Pct,
            });
        }
    } else if let Some(cmp) = first_of(artifacts, ArtifactKind::ComparisonBreakdown) {
        let dim_key = cmp.dimension_key.clone().unwrap_or_default();
        let top = cmp.rows.iter().max_by(|a, b| {
            let x = a.get("change_value").and_then(value_as_f64).unwrap_or(0.0).abs();
            let y = b.get("change_value").and_then(value_as_f64).unwrap_or(0.0).abs();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        });
        if let Some(top) = top {
            let change = top.get("change_value").and_then(value_as_f64).unwrap_or(0.0);
            out.push(MetricPoint {
                label: format!("Largest Change: {}", label_of(top.get(&dim_key))),
                value: change,
                delta: change,
                unit: MetricUnit::Count,
            });
        }
    } else if let Some(trend) = first_of(artifacts, ArtifactKind::TrendBreakdown) {
        let value_key = trend.value_key.clone().unwrap_or_default();
        let first = trend.rows.first().and_then(|r| r.get(&value_key)).and_then(value_as_f64);
        let last = trend.rows.last().and_then(|r| r.get(&value_key)).and_then(value_as_f64);
        if let (Some(first), Some(last)) = (first, last) {
            out.push(MetricPoint {
                label: format!("Latest {value_key}"),
                value: last,
                delta: round4(last - first),
                unit: unit_for(&value_key),
            });
        }
    }

    out.truncate(MAX_METRICS);
    out
}

/// `1234567.891` -> `1,234,567.89`
pub fn fmt_number(x: f64) -> String {
    let fixed = format!("{:.2}", x.abs());
    let (int_part, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::new();
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if x < 0.0 && fixed != "0.00" { "-" } else { "" };
    format!("{sign}{grouped}.{frac}")
}

pub fn fmt_signed(x: f64) -> String {
    if x >= 0.0 {
        format!("+{}", fmt_number(x))
    } else {
        fmt_number(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::{PlanStep, StepOutcome};

    fn step(id: &str, rows: Vec<Value>) -> StepResult {
        let rows: Vec<Row> = rows.into_iter().map(|v| v.as_object().cloned().unwrap()).collect();
        StepResult::executed(&PlanStep::new(id, "goal"), "SELECT 1".into(), rows, StepOutcome::Executed)
    }

    #[test]
    fn ranking_artifact_orders_and_shares() {
        let r = step(
            "step_1",
            vec![
                json!({"transaction_state": "CT", "total_sales": 2901243.84}),
                json!({"transaction_state": "UT", "total_sales": 3014322.72}),
                json!({"transaction_state": "OK", "total_sales": 2790152.16}),
            ],
        );
        let arts = artifacts("Show me sales by state in descending order", &[r]);
        let rank = &arts[0];
        assert_eq!(rank.kind, ArtifactKind::RankingBreakdown);
        assert_eq!(rank.dimension_key.as_deref(), Some("transaction_state"));
        assert_eq!(rank.value_key.as_deref(), Some("total_sales"));
        assert_eq!(rank.rows[0]["rank"], 1);
        assert_eq!(rank.rows[0]["transaction_state"], "UT");
        assert_eq!(rank.columns, vec!["rank", "transaction_state", "total_sales", "share_pct"]);
    }

    #[test]
    fn year_columns_make_a_comparison() {
        let r = step(
            "step_1",
            vec![
                json!({"metric": "spend", "q4_2025": 742.6, "q4_2024": 656.4, "yoy_pct": 13.1}),
                json!({"metric": "transactions", "q4_2025": 21410, "q4_2024": 19880, "yoy_pct": 7.7}),
            ],
        );
        let arts = artifacts("compare Q4 2025 versus prior year", &[r]);
        let cmp = &arts[0];
        assert_eq!(cmp.kind, ArtifactKind::ComparisonBreakdown);
        assert_eq!(cmp.dimension_key.as_deref(), Some("metric"));
        assert!(cmp.columns.contains(&"change_value".to_string()));
        assert_eq!(cmp.rows[1]["change_value"], json!(1530.0));
    }

    #[test]
    fn comparison_is_listed_first_when_asked_for() {
        let ranking = step("step_1", vec![json!({"state": "UT", "total": 3.0}), json!({"state": "CT", "total": 2.0})]);
        let cmp = step("step_2", vec![json!({"metric": "sales", "q4_2024": 8.36, "q4_2023": 7.91})]);
        let arts = artifacts("Q4 2024 compared to the same period last year?", &[ranking, cmp]);
        assert_eq!(arts[0].kind, ArtifactKind::ComparisonBreakdown);
        assert_eq!(arts[0].id, "a1");
    }

    #[test]
    fn trend_and_distribution() {
        let rows = (1..=6).map(|m| json!({"month": format!("2024-0{m}"), "revenue": m * 10})).rev().collect();
        let arts = artifacts("monthly revenue", &[step("step_1", rows)]);
        assert_eq!(arts[0].kind, ArtifactKind::TrendBreakdown);
        assert_eq!(arts[0].rows[0]["month"], "2024-01");
        assert_eq!(arts[1].kind, ArtifactKind::DistributionBreakdown);
        let median = arts[1].rows.iter().find(|r| r["stat"] == "median").unwrap();
        assert_eq!(median["value"], json!(35.0));
    }

    #[test]
    fn simple_ranking_has_no_evidence_and_unpadded_metrics() {
        let r = step("step_1", vec![json!({"state": "UT", "total_sales": 10.0})]);
        let p = profile("sales by state", &[r]);
        assert!(p.evidence.is_empty());
        assert!(p.metrics.len() <= 3);
        assert!(p.metrics.iter().all(|m| !m.label.starts_with("Signal")));
        assert_eq!(p.data_tables[0].id, "sql_step_1");
    }

    #[test]
    fn evidence_from_prior_current_columns() {
        let r = step(
            "step_1",
            vec![json!({"segment": "Retail", "prior_rate": 0.10, "current_rate": 0.12})],
        );
        let ev = evidence(&[r]);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].segment, "Retail");
        assert_eq!(ev[0].change_bps, 200.0);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(fmt_number(3014322.72), "3,014,322.72");
        assert_eq!(fmt_number(-1234.5), "-1,234.50");
        assert_eq!(fmt_number(999.999), "1,000.00");
        assert_eq!(fmt_signed(12.0), "+12.00");
    }
}
