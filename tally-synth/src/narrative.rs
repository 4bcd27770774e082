//! Model narrative: prompt, typed reply, insight ranking and the grounding check.

use serde::Deserialize;
use serde_json::{json, Value};
use tally_infer::{decode_json, InferError};
use tally_types::{
    value_as_f64, AnalysisArtifact, DataTable, EvidenceRow, Importance, Insight, MetricPoint, Plan, StepResult, Turn,
};

const MAX_INSIGHTS: usize = 3;
const MAX_ASSUMPTIONS: usize = 4;
const MAX_QUESTIONS: usize = 3;
const ROWS_PER_ARTIFACT: usize = 10;
/// Narrative numbers at or below this magnitude are not checked.
const GROUNDING_FLOOR: f64 = 10.0;
const GROUNDING_TOLERANCE: f64 = 0.005;
const HIGH_IMPORTANCE_SCORE: f64 = 0.5;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct NarrativeReply {
    answer: Option<String>,
    why_it_matters: Option<String>,
    insights: Vec<InsightReply>,
    assumptions: Vec<Value>,
    suggested_questions: Vec<Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct InsightReply {
    title: Option<String>,
    detail: Option<String>,
    impact: Option<Value>,
    confidence: Option<Value>,
    relevance: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct ModelNarrative {
    pub answer: String,
    pub why_it_matters: Option<String>,
    pub insights: Vec<Insight>,
    pub suggested_questions: Vec<String>,
    pub assumptions: Vec<String>,
}

/// `high`/`medium`/`low`, or a number in `[0, 1]`. Anything else reads as medium.
fn level(raw: Option<&Value>) -> f64 {
    match raw {
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "high" => 0.9,
            "low" => 0.3,
            _ => 0.6,
        },
        Some(Value::Number(n)) => n.as_f64().filter(|v| (0.0..=1.0).contains(v)).unwrap_or(0.6),
        _ => 0.6,
    }
}

fn texts(values: &[Value], cap: usize) -> Vec<String> {
    values
        .iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .take(cap)
        .collect()
}

fn rank_insights(raw: Vec<InsightReply>) -> Vec<Insight> {
    let mut out: Vec<Insight> = raw
        .into_iter()
        .filter_map(|r| {
            let title = r.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())?;
            let score = level(r.impact.as_ref()) * level(r.confidence.as_ref()) * level(r.relevance.as_ref());
            Some(Insight {
                id: String::new(),
                title,
                detail: r.detail.unwrap_or_default().trim().to_string(),
                importance: if score >= HIGH_IMPORTANCE_SCORE {
                    Importance::High
                } else {
                    Importance::Medium
                },
                score,
            })
        })
        .collect();
    out.sort_by(|a, b| b.score.total_cmp(&a.score));
    out.truncate(MAX_INSIGHTS);
    for (i, ins) in out.iter_mut().enumerate() {
        ins.id = format!("i{}", i + 1);
    }
    out
}

pub fn parse_reply(raw: &str) -> Result<ModelNarrative, InferError> {
    let reply: NarrativeReply = decode_json(raw)?;
    let answer = reply
        .answer
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| InferError::Malformed("narrative had no answer".into()))?;
    Ok(ModelNarrative {
        answer,
        why_it_matters: reply.why_it_matters.map(|w| w.trim().to_string()).filter(|w| !w.is_empty()),
        insights: rank_insights(reply.insights),
        suggested_questions: texts(&reply.suggested_questions, MAX_QUESTIONS),
        assumptions: texts(&reply.assumptions, MAX_ASSUMPTIONS),
    })
}

/// Numbers as written in prose: `3,014,322.72` reads as one value. Digits glued
/// to a preceding letter or underscore (`q4`, `step_2`) are identifiers.
pub fn numbers_in(text: &str) -> Vec<f64> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let glued = i > 0 && (chars[i - 1].is_alphabetic() || chars[i - 1] == '_');
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        if glued {
            while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                i += 1;
            }
            continue;
        }
        let start = i;
        while i < chars.len() {
            let c = chars[i];
            let joins = (c == ',' || c == '.') && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if c.is_ascii_digit() || joins {
                i += 1;
            } else {
                break;
            }
        }
        let token: String = chars[start..i].iter().filter(|c| **c != ',').collect();
        if let Ok(v) = token.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

fn is_year(v: f64) -> bool {
    v.fract() == 0.0 && (1900.0..=2100.0).contains(&v)
}

/// Every number the deterministic layer produced.
pub fn known_numbers(
    artifacts: &[AnalysisArtifact],
    evidence: &[EvidenceRow],
    metrics: &[MetricPoint],
    tables: &[DataTable],
) -> Vec<f64> {
    let mut out: Vec<f64> = artifacts
        .iter()
        .flat_map(|a| a.rows.iter())
        .chain(tables.iter().flat_map(|t| t.rows.iter()))
        .flat_map(|row| row.values())
        .filter_map(value_as_f64)
        .collect();
    for e in evidence {
        out.extend([e.prior, e.current, e.change_bps, e.contribution]);
    }
    for m in metrics {
        out.extend([m.value, m.delta]);
    }
    out
}

/// First number in `text` with no counterpart in `known`.
pub fn ungrounded_number(text: &str, known: &[f64]) -> Option<f64> {
    numbers_in(text)
        .into_iter()
        .filter(|v| v.abs() > GROUNDING_FLOOR && !is_year(*v))
        .find(|v| {
            !known.iter().any(|k| {
                let k = k.abs();
                k > 0.0 && (v.abs() - k).abs() <= k * GROUNDING_TOLERANCE
            })
        })
}

impl ModelNarrative {
    pub fn prose(&self) -> String {
        let mut parts = vec![self.answer.clone()];
        parts.extend(self.why_it_matters.clone());
        for ins in &self.insights {
            parts.push(ins.title.clone());
            parts.push(ins.detail.clone());
        }
        parts.join("\n")
    }
}

pub fn narrative_prompt(
    turn: &Turn,
    plan: &Plan,
    results: &[StepResult],
    artifacts: &[AnalysisArtifact],
    evidence: &[EvidenceRow],
) -> (String, String) {
    let steps: Vec<String> = plan.steps.iter().map(|s| format!("- {}: {}", s.id, s.goal)).collect();
    let sql: Vec<String> = results
        .iter()
        .filter_map(|r| r.sql.as_ref().map(|sql| format!("-- {}\n{}", r.step_id, sql)))
        .collect();
    let artifacts: Vec<Value> = artifacts
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "kind": a.kind,
                "title": a.title,
                "columns": a.columns,
                "rows": a.rows.iter().take(ROWS_PER_ARTIFACT).collect::<Vec<_>>(),
            })
        })
        .collect();

    let system = "You explain governed analytics results to a business user. Use only numbers \
        that appear in the supplied artifacts or evidence. Do not invent figures. \
        Return strict JSON only."
        .to_string();
    let user = format!(
        "Question: {}\nPlan:\n{}\nSQL:\n{}\nArtifacts:\n{}\nEvidence:\n{}\n\n\
         Output JSON keys:\n\
         - \"answer\": string\n\
         - \"whyItMatters\": string\n\
         - \"insights\": array of {{title, detail, impact, confidence, relevance}} with levels high|medium|low\n\
         - \"assumptions\": array of strings\n\
         - \"suggestedQuestions\": array of strings",
        turn.message,
        steps.join("\n"),
        if sql.is_empty() { "- none".to_string() } else { sql.join("\n") },
        Value::Array(artifacts),
        serde_json::to_string(evidence).unwrap_or_else(|_| "[]".into()),
    );
    (system, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insights_are_ranked_and_capped() {
        let raw = r#"{"answer":"ok","insights":[
            {"title":"a","impact":"low","confidence":"low","relevance":"low"},
            {"title":"b","impact":"high","confidence":"high","relevance":"high"},
            {"title":"c","impact":"medium","confidence":0.5,"relevance":"high"},
            {"title":"d"},
            {"title":"  "}
        ]}"#;
        let n = parse_reply(raw).unwrap();
        let titles: Vec<&str> = n.insights.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "c", "d"]);
        assert_eq!(n.insights[0].importance, Importance::High);
        assert_eq!(n.insights[1].importance, Importance::Medium);
        assert_eq!(n.insights[2].id, "i3");
    }

    #[test]
    fn empty_answer_is_malformed() {
        assert!(parse_reply(r#"{"answer":"  "}"#).is_err());
        assert!(parse_reply("no json here").is_err());
    }

    #[test]
    fn numbers_are_read_as_written() {
        assert_eq!(numbers_in("UT led with 3,014,322.72, then CT."), vec![3014322.72]);
        assert_eq!(numbers_in("q4_2025 and step_2 up 13.1%"), vec![13.1]);
    }

    #[test]
    fn grounding_tolerates_rounding_and_years() {
        let known = [3014322.72, 656.4];
        assert_eq!(ungrounded_number("Sales hit $3,014,000 in 2024 (656 units).", &known), None);
        assert_eq!(ungrounded_number("Sales fell by 4,200,000.", &known), Some(4_200_000.0));
        assert_eq!(ungrounded_number("Up 7 points.", &known), None);
    }
}
