//! Deterministic narrative used for drafts and whenever the model narrative
//! is missing or rejected.

use tally_types::{value_as_f64, AnalysisArtifact, ArtifactKind, Importance, Insight, StepResult};

use crate::profile::{first_of, fmt_number, fmt_signed, label_of};

pub const WHY_IT_MATTERS: &str = "Every figure here comes from governed SQL against allowlisted \
    catalog tables, so each number can be traced back to the query shown in the trace.";

const HIGH_SCORE: f64 = 0.9 * 0.9 * 0.9;
const MEDIUM_SCORE: f64 = 0.9 * 0.9 * 0.6;
const MAX_INSIGHTS: usize = 3;
const MAX_QUESTIONS: usize = 3;
const ANSWER_TOP_N: usize = 3;

#[derive(Clone, Debug)]
pub struct TemplateNarrative {
    pub answer: String,
    pub why_it_matters: String,
    pub insights: Vec<Insight>,
    pub suggested_questions: Vec<String>,
}

fn num(artifact: &AnalysisArtifact, row: usize, key: Option<&String>) -> Option<f64> {
    artifact.rows.get(row)?.get(key?).and_then(value_as_f64)
}

fn lead_sentence(artifacts: &[AnalysisArtifact]) -> Option<String> {
    let lead = artifacts.iter().find(|a| a.kind != ArtifactKind::DistributionBreakdown)?;
    let dim = lead.dimension_key.as_ref();
    let value = lead.value_key.as_ref();
    match lead.kind {
        ArtifactKind::RankingBreakdown => {
            let top: Vec<String> = lead
                .rows
                .iter()
                .take(ANSWER_TOP_N)
                .filter_map(|r| {
                    let v = r.get(value?).and_then(value_as_f64)?;
                    Some(format!("{} ({})", label_of(r.get(dim?)), fmt_number(v)))
                })
                .collect();
            (!top.is_empty()).then(|| {
                format!("Top results by {}: {}.", value.map_or("value", |v| v.as_str()), top.join(", "))
            })
        }
        ArtifactKind::ComparisonBreakdown => {
            let moves: Vec<String> = lead
                .rows
                .iter()
                .take(ANSWER_TOP_N)
                .filter_map(|r| {
                    let change = r.get("change_value").and_then(value_as_f64)?;
                    let pct = r
                        .get("change_pct")
                        .and_then(value_as_f64)
                        .map(|p| format!(", {}%", fmt_signed(p)))
                        .unwrap_or_default();
                    Some(format!("{} {}{pct}", label_of(r.get(dim?)), fmt_signed(change)))
                })
                .collect();
            (!moves.is_empty()).then(|| format!("{}: {}.", lead.title, moves.join("; ")))
        }
        ArtifactKind::TrendBreakdown => {
            let time = lead.time_key.as_ref()?;
            let first = num(lead, 0, value)?;
            let last = num(lead, lead.rows.len().checked_sub(1)?, value)?;
            let t0 = label_of(lead.rows.first()?.get(time));
            let tn = label_of(lead.rows.last()?.get(time));
            Some(format!(
                "{} moved from {} ({t0}) to {} ({tn}), a change of {}.",
                value?,
                fmt_number(first),
                fmt_number(last),
                fmt_signed(last - first)
            ))
        }
        ArtifactKind::DistributionBreakdown => None,
    }
}

pub fn answer(results: &[StepResult], artifacts: &[AnalysisArtifact]) -> String {
    let executed = results.iter().filter(|r| !r.is_blocked()).count();
    let blocked = results.len() - executed;
    let rows: usize = results.iter().filter(|r| !r.is_blocked()).map(|r| r.row_count).sum();

    let mut answer = lead_sentence(artifacts)
        .unwrap_or_else(|| format!("Retrieved {rows} row(s) across {executed} executed step(s)."));
    if blocked > 0 {
        answer.push_str(&format!(" {blocked} step(s) were blocked and are excluded."));
    }
    answer
}

fn insight(title: String, detail: String, importance: Importance) -> Insight {
    let score = match importance {
        Importance::High => HIGH_SCORE,
        Importance::Medium => MEDIUM_SCORE,
    };
    Insight {
        id: String::new(),
        title,
        detail,
        importance,
        score,
    }
}

pub fn insights(artifacts: &[AnalysisArtifact]) -> Vec<Insight> {
    let mut out = Vec::new();
    for a in artifacts {
        let dim = a.dimension_key.as_ref();
        let value = a.value_key.as_ref();
        match a.kind {
            ArtifactKind::RankingBreakdown => {
                let Some(top) = a.rows.first() else { continue };
                let leader = label_of(dim.and_then(|d| top.get(d)));
                let detail = match top.get("share_pct").and_then(value_as_f64) {
                    Some(share) => format!("{leader} accounts for {}% of {}.", fmt_number(share), a.title),
                    None => format!("{leader} ranks first in {}.", a.title),
                };
                out.push(insight(format!("{leader} leads"), detail, Importance::High));
            }
            ArtifactKind::ComparisonBreakdown => {
                let mover = a.rows.iter().max_by(|x, y| {
                    let fx = x.get("change_value").and_then(value_as_f64).unwrap_or(0.0).abs();
                    let fy = y.get("change_value").and_then(value_as_f64).unwrap_or(0.0).abs();
                    fx.total_cmp(&fy)
                });
                let Some(mover) = mover else { continue };
                let change = mover.get("change_value").and_then(value_as_f64).unwrap_or(0.0);
                let label = label_of(dim.and_then(|d| mover.get(d)));
                out.push(insight(
                    format!("Largest move: {label}"),
                    format!("{label} changed by {} in {}.", fmt_signed(change), a.title),
                    Importance::High,
                ));
            }
            ArtifactKind::TrendBreakdown => {
                let (Some(first), Some(last)) = (
                    num(a, 0, value),
                    a.rows.len().checked_sub(1).and_then(|i| num(a, i, value)),
                ) else {
                    continue;
                };
                let direction = if last > first { "up" } else if last < first { "down" } else { "flat" };
                out.push(insight(
                    format!("Trend is {direction}"),
                    format!("{} is {direction} {} over the window.", a.title, fmt_signed(last - first)),
                    Importance::Medium,
                ));
            }
            ArtifactKind::DistributionBreakdown => {
                let stat = |name: &str| {
                    a.rows
                        .iter()
                        .find(|r| r.get("stat").and_then(|v| v.as_str()) == Some(name))
                        .and_then(|r| r.get("value"))
                        .and_then(value_as_f64)
                };
                let (Some(median), Some(mean)) = (stat("median"), stat("mean")) else { continue };
                out.push(insight(
                    "Spread".into(),
                    format!("{}: median {} against mean {}.", a.title, fmt_number(median), fmt_number(mean)),
                    Importance::Medium,
                ));
            }
        }
    }
    if out.is_empty() {
        out.push(insight(
            "Results retrieved".into(),
            "The governed queries returned data; see the tables for detail.".into(),
            Importance::Medium,
        ));
    }
    out.sort_by(|a, b| b.score.total_cmp(&a.score));
    out.truncate(MAX_INSIGHTS);
    for (i, ins) in out.iter_mut().enumerate() {
        ins.id = format!("i{}", i + 1);
    }
    out
}

pub fn suggested_questions(artifacts: &[AnalysisArtifact]) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(cmp) = first_of(artifacts, ArtifactKind::ComparisonBreakdown) {
        out.push(format!("Which segments drove the change in {}?", cmp.title));
    }
    if let Some(rank) = first_of(artifacts, ArtifactKind::RankingBreakdown) {
        let dim = rank.dimension_key.as_deref().unwrap_or("segment");
        out.push(format!("How has each {dim} changed versus the prior period?"));
    }
    if let Some(trend) = first_of(artifacts, ArtifactKind::TrendBreakdown) {
        out.push(format!("What drove the latest change in {}?", trend.value_key.as_deref().unwrap_or("the metric")));
    }
    out.push("Can you break this down by another dimension?".into());
    out.truncate(MAX_QUESTIONS);
    out
}

pub fn template(results: &[StepResult], artifacts: &[AnalysisArtifact]) -> TemplateNarrative {
    TemplateNarrative {
        answer: answer(results, artifacts),
        why_it_matters: WHY_IT_MATTERS.to_string(),
        insights: insights(artifacts),
        suggested_questions: suggested_questions(artifacts),
    }
}
