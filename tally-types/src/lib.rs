use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One tabular row as returned by the SQL service. Column order is preserved.
pub type Row = Map<String, Value>;

/// Request body accepted by both the single-response and incremental surfaces.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub explicit_filters: Option<BTreeMap<String, Vec<String>>>,
}

/// One user request/response cycle. Immutable once created.
#[derive(Clone, Debug)]
pub struct Turn {
    pub id: Uuid,
    pub session_id: Option<String>,
    pub message: String,
    pub role: Option<String>,
    pub explicit_filters: BTreeMap<String, Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Returns `None` when the message is blank.
    pub fn from_request(req: TurnRequest) -> Option<Self> {
        let message = req.message.trim().to_string();
        if message.is_empty() {
            return None;
        }
        let session_id = req
            .session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Some(Self {
            id: Uuid::new_v4(),
            session_id,
            message,
            role: req.role.filter(|r| !r.trim().is_empty()),
            explicit_filters: req.explicit_filters.unwrap_or_default(),
            created_at: Utc::now(),
        })
    }

    pub fn created_at_iso(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Prompt-ready rendering of the caller's explicit filters.
    pub fn filters_text(&self) -> String {
        if self.explicit_filters.is_empty() {
            return "- none".into();
        }
        self.explicit_filters
            .iter()
            .map(|(k, v)| format!("- {k}: {}", v.join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Prompt-ready rendering of prior session messages, most recent last.
pub fn history_text(history: &[String]) -> String {
    let lines: Vec<String> = history
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .map(|h| format!("- {h}"))
        .collect();
    if lines.is_empty() {
        "- none".into()
    } else {
        lines.join("\n")
    }
}

/// Complexity classification for a turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    FastPath,
    DeepPath,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::FastPath => "fast_path",
            Route::DeepPath => "deep_path",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fast_path" | "fast" => Some(Route::FastPath),
            "deep_path" | "deep" => Some(Route::DeepPath),
            _ => None,
        }
    }
}

/// Whether a decision came from the text-generation service or a deterministic fallback.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Model,
    Heuristic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            expected_output: None,
            depends_on: Vec::new(),
        }
    }
}

/// Bounded, ordered set of steps for one turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub route: Route,
    pub route_source: DecisionSource,
    pub plan_source: DecisionSource,
    pub step_cap: usize,
    pub steps: Vec<PlanStep>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: String,
    pub through: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    PeriodComparison,
    PeriodContext,
    Grain,
}

/// A deterministic, non-fabricating annotation applied to a step result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepairAction {
    pub kind: RepairKind,
    pub note: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Executed,
    /// The deterministic fallback query produced the rows.
    Fallback { reason: String },
    Blocked { reason: String },
}

/// Outcome of one plan step.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub goal: String,
    pub sql: Option<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub outcome: StepOutcome,
    pub repairs: Vec<RepairAction>,
    pub assumptions: Vec<String>,
    pub period: Option<DateRange>,
}

impl StepResult {
    pub fn executed(step: &PlanStep, sql: String, rows: Vec<Row>, outcome: StepOutcome) -> Self {
        let row_count = rows.len();
        Self {
            step_id: step.id.clone(),
            goal: step.goal.clone(),
            sql: Some(sql),
            rows,
            row_count,
            outcome,
            repairs: Vec::new(),
            assumptions: Vec::new(),
            period: None,
        }
    }

    pub fn blocked(step: &PlanStep, sql: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            step_id: step.id.clone(),
            goal: step.goal.clone(),
            sql,
            rows: Vec::new(),
            row_count: 0,
            outcome: StepOutcome::Blocked {
                reason: reason.into(),
            },
            repairs: Vec::new(),
            assumptions: Vec::new(),
            period: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.outcome, StepOutcome::Blocked { .. })
    }

    pub fn used_fallback(&self) -> bool {
        matches!(self.outcome, StepOutcome::Fallback { .. })
    }

    pub fn block_reason(&self) -> Option<&str> {
        match &self.outcome {
            StepOutcome::Blocked { reason } => Some(reason),
            _ => None,
        }
    }

    /// Column names of the first row.
    pub fn columns(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Done,
    Running,
    Blocked,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Sql,
    Validate,
    Synthesize,
}

/// Auditable record of one stage's input/output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    pub id: String,
    pub stage: Stage,
    pub title: String,
    pub status: TraceStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_checks: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationViolation {
    NoStepsExecuted,
    EmptyResultSet,
    RowLimitViolation,
    ExcessiveNulls,
}

impl ValidationViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationViolation::NoStepsExecuted => "no_steps_executed",
            ValidationViolation::EmptyResultSet => "empty_result_set",
            ValidationViolation::RowLimitViolation => "row_limit_violation",
            ValidationViolation::ExcessiveNulls => "excessive_nulls",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub passed: bool,
    pub violations: Vec<ValidationViolation>,
    pub checks: Vec<String>,
    pub null_rate: Option<f64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricUnit {
    Pct,
    Bps,
    Usd,
    Count,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub label: String,
    pub value: f64,
    pub delta: f64,
    pub unit: MetricUnit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRow {
    pub segment: String,
    pub prior: f64,
    pub current: f64,
    pub change_bps: f64,
    pub contribution: f64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Medium,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub title: String,
    pub detail: String,
    pub importance: Importance,
    /// impact x confidence x relevance, in [0, 1].
    pub score: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTable {
    pub id: String,
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sql: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    RankingBreakdown,
    ComparisonBreakdown,
    TrendBreakdown,
    DistributionBreakdown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisArtifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub title: String,
    pub source_step: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_key: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeSource {
    Model,
    Template,
}

/// Final governed answer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub answer: String,
    pub why_it_matters: String,
    pub confidence: Confidence,
    pub metrics: Vec<MetricPoint>,
    pub evidence: Vec<EvidenceRow>,
    pub insights: Vec<Insight>,
    pub suggested_questions: Vec<String>,
    pub assumptions: Vec<String>,
    pub trace: Vec<TraceStep>,
    pub data_tables: Vec<DataTable>,
    pub artifacts: Vec<AnalysisArtifact>,
    pub narrative_source: NarrativeSource,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub turn_id: Uuid,
    pub created_at: String,
    pub response: AgentResponse,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePhase {
    Draft,
    Final,
}

/// Typed events of the incremental delivery mode, in emission order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Status {
        message: String,
    },
    Response {
        phase: ResponsePhase,
        response: Box<AgentResponse>,
    },
    AnswerDelta {
        delta: String,
    },
    Error {
        message: String,
    },
    Done,
}

impl TurnEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TurnEvent::Status { .. } => "status",
            TurnEvent::Response { .. } => "response",
            TurnEvent::AnswerDelta { .. } => "answer_delta",
            TurnEvent::Error { .. } => "error",
            TurnEvent::Done => "done",
        }
    }
}

/// Lenient numeric read of a cell: numbers, and strings that parse as numbers.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s
            .trim()
            .replace(',', "")
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_message_is_rejected() {
        let req = TurnRequest {
            message: "   ".into(),
            ..Default::default()
        };
        assert!(Turn::from_request(req).is_none());
    }

    #[test]
    fn turn_event_wire_shape() {
        let ev = TurnEvent::AnswerDelta {
            delta: "Top ".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "answer_delta");
        assert_eq!(json["delta"], "Top ");
        let done = serde_json::to_value(TurnEvent::Done).unwrap();
        assert_eq!(done, serde_json::json!({"type": "done"}));
    }

    #[test]
    fn request_accepts_camel_case_and_null_filters() {
        let req: TurnRequest = serde_json::from_str(
            r#"{"sessionId":"s-1","message":"hi","explicitFilters":null}"#,
        )
        .unwrap();
        assert_eq!(req.session_id.as_deref(), Some("s-1"));
        assert!(req.explicit_filters.is_none());
    }

    #[test]
    fn route_parse_is_lenient() {
        assert_eq!(Route::parse(" Deep-Path "), Some(Route::DeepPath));
        assert_eq!(Route::parse("fast"), Some(Route::FastPath));
        assert_eq!(Route::parse("medium"), None);
    }

    #[test]
    fn numeric_cells_coerce() {
        assert_eq!(value_as_f64(&serde_json::json!("1,234.5")), Some(1234.5));
        assert_eq!(value_as_f64(&serde_json::json!(true)), None);
        assert_eq!(value_as_f64(&serde_json::json!(null)), None);
    }
}
