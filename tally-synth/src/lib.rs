//! Synthesis stage: a deterministic layer (tables, artifacts, evidence,
//! metrics, template narrative) and an optional model narrative on top.
//!
//! `prepare` is pure and cheap, so a draft response can be emitted before the
//! narrative call. The narrative is rejected when it states figures the
//! deterministic layer did not produce.

use std::sync::Arc;

use tally_catalog::PolicyCatalog;
use tally_infer::{with_timeout, CallBudget, InferError, TextGenerator};
use tally_types::{
    AgentResponse, Confidence, DecisionSource, Insight, NarrativeSource, Plan, Stage, StepResult, TraceStatus,
    TraceStep, Turn,
};

pub mod narrative;
pub mod profile;
pub mod template;

pub use profile::{fmt_number, Profile};
pub use template::TemplateNarrative;

const NARRATIVE_TOKEN_CAP: u32 = 1400;

pub struct SynthesisInput<'a> {
    pub turn: &'a Turn,
    pub plan: &'a Plan,
    pub results: &'a [StepResult],
    pub catalog: &'a PolicyCatalog,
}

/// Everything that does not need the text generator.
#[derive(Clone, Debug)]
pub struct Prepared {
    pub profile: Profile,
    pub template: TemplateNarrative,
}

#[derive(Clone, Debug)]
pub struct Narrative {
    pub answer: String,
    pub why_it_matters: String,
    pub insights: Vec<Insight>,
    pub suggested_questions: Vec<String>,
    pub assumptions: Vec<String>,
    pub source: NarrativeSource,
    pub fallback_reason: Option<String>,
}

impl Narrative {
    fn from_template(t: &TemplateNarrative, reason: String) -> Self {
        Self {
            answer: t.answer.clone(),
            why_it_matters: t.why_it_matters.clone(),
            insights: t.insights.clone(),
            suggested_questions: t.suggested_questions.clone(),
            assumptions: Vec::new(),
            source: NarrativeSource::Template,
            fallback_reason: Some(reason),
        }
    }
}

/// `low` if any step was blocked; else `medium` if any repair ran, any step
/// used the fallback query, or the narrative fell back; else `high`.
pub fn confidence(results: &[StepResult], narrative_fell_back: bool) -> Confidence {
    if results.iter().any(|r| r.is_blocked()) {
        Confidence::Low
    } else if narrative_fell_back || results.iter().any(|r| !r.repairs.is_empty() || r.used_fallback()) {
        Confidence::Medium
    } else {
        Confidence::High
    }
}

fn push_unique(out: &mut Vec<String>, item: String) {
    if !item.is_empty() && !out.contains(&item) {
        out.push(item);
    }
}

/// Narrative assumptions first, then per-step notes, then catalog and route notes.
/// Repair notes are always kept.
pub fn assumptions(input: &SynthesisInput<'_>, model: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for a in model {
        push_unique(&mut out, a.clone());
    }
    for r in input.results {
        for a in &r.assumptions {
            push_unique(&mut out, a.clone());
        }
    }
    for r in input.results {
        for repair in &r.repairs {
            push_unique(&mut out, repair.note.clone());
        }
    }
    for r in input.results {
        if let Some(reason) = r.block_reason() {
            push_unique(&mut out, format!("{} was blocked: {reason}", r.step_id));
        }
    }
    push_unique(
        &mut out,
        format!("SQL is constrained to catalog version {} allowlist.", input.catalog.version),
    );
    let source = match input.plan.route_source {
        DecisionSource::Model => "model",
        DecisionSource::Heuristic => "keyword heuristic",
    };
    push_unique(
        &mut out,
        format!(
            "Routed as {} by {source}, capped at {} step(s).",
            input.plan.route.as_str(),
            input.plan.step_cap
        ),
    );
    out
}

/// Streaming chunks of an answer; concatenated they equal the input.
pub fn answer_deltas(answer: &str) -> Vec<String> {
    answer.split_inclusive(' ').map(str::to_string).collect()
}

pub struct Synthesizer {
    generator: Arc<dyn TextGenerator>,
    budget: CallBudget,
}

impl Synthesizer {
    pub fn new(generator: Arc<dyn TextGenerator>, budget: CallBudget) -> Self {
        Self { generator, budget }
    }

    pub fn prepare(&self, input: &SynthesisInput<'_>) -> Prepared {
        let profile = profile::profile(&input.turn.message, input.results);
        let template = template::template(input.results, &profile.artifacts);
        Prepared { profile, template }
    }

    /// Deterministic response built from the template narrative. Confidence
    /// here does not yet account for the narrative outcome.
    pub fn draft(&self, input: &SynthesisInput<'_>, prepared: &Prepared, mut trace: Vec<TraceStep>) -> AgentResponse {
        trace.push(TraceStep {
            id: "t4".into(),
            stage: Stage::Synthesize,
            title: "Synthesize answer".into(),
            status: TraceStatus::Running,
            summary: "Drafted deterministic answer; narrative pending.".into(),
            sql: None,
            quality_checks: Some(profile_checks(prepared)),
        });
        let t = &prepared.template;
        self.response(
            input,
            prepared,
            Narrative {
                answer: t.answer.clone(),
                why_it_matters: t.why_it_matters.clone(),
                insights: t.insights.clone(),
                suggested_questions: t.suggested_questions.clone(),
                assumptions: Vec::new(),
                source: NarrativeSource::Template,
                fallback_reason: None,
            },
            confidence(input.results, false),
            trace,
        )
    }

    pub async fn narrate(&self, input: &SynthesisInput<'_>, prepared: &Prepared) -> Narrative {
        let p = &prepared.profile;
        let (system, user) =
            narrative::narrative_prompt(input.turn, input.plan, input.results, &p.artifacts, &p.evidence);
        let budget = self.budget.capped(NARRATIVE_TOKEN_CAP);
        let reply = with_timeout(budget.timeout, self.generator.generate(budget.request(system, user)))
            .await
            .and_then(|raw| narrative::parse_reply(&raw));

        let model = match reply {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(turn_id = %input.turn.id, error = %e, "narrative unavailable; using template");
                return Narrative::from_template(&prepared.template, e.to_string());
            }
        };

        let known = narrative::known_numbers(&p.artifacts, &p.evidence, &p.metrics, &p.data_tables);
        if let Some(n) = narrative::ungrounded_number(&model.prose(), &known) {
            let err = InferError::Malformed(format!("narrative states {n}, which no result supports"));
            tracing::warn!(turn_id = %input.turn.id, error = %err, "narrative rejected; using template");
            return Narrative::from_template(&prepared.template, err.to_string());
        }

        let t = &prepared.template;
        Narrative {
            answer: model.answer,
            why_it_matters: model.why_it_matters.unwrap_or_else(|| t.why_it_matters.clone()),
            insights: if model.insights.is_empty() { t.insights.clone() } else { model.insights },
            suggested_questions: if model.suggested_questions.is_empty() {
                t.suggested_questions.clone()
            } else {
                model.suggested_questions
            },
            assumptions: model.assumptions,
            source: NarrativeSource::Model,
            fallback_reason: None,
        }
    }

    pub fn finalize(
        &self,
        input: &SynthesisInput<'_>,
        prepared: &Prepared,
        narrative: Narrative,
        mut trace: Vec<TraceStep>,
    ) -> AgentResponse {
        let mut checks = profile_checks(prepared);
        let summary = match (&narrative.source, &narrative.fallback_reason) {
            (NarrativeSource::Model, _) => {
                checks.push("narrative: model, numbers grounded in results".into());
                "Answer synthesized from the model narrative.".to_string()
            }
            (NarrativeSource::Template, reason) => {
                checks.push(format!(
                    "narrative: template ({})",
                    reason.as_deref().unwrap_or("model narrative not requested")
                ));
                "Answer synthesized from the deterministic template.".to_string()
            }
        };
        trace.push(TraceStep {
            id: "t4".into(),
            stage: Stage::Synthesize,
            title: "Synthesize answer".into(),
            status: TraceStatus::Done,
            summary,
            sql: None,
            quality_checks: Some(checks),
        });
        let confidence = confidence(input.results, narrative.source == NarrativeSource::Template);
        tracing::info!(
            turn_id = %input.turn.id,
            confidence = ?confidence,
            narrative = ?narrative.source,
            "synthesis complete"
        );
        self.response(input, prepared, narrative, confidence, trace)
    }

    pub async fn run(&self, input: &SynthesisInput<'_>, trace: Vec<TraceStep>) -> AgentResponse {
        let prepared = self.prepare(input);
        let narrative = self.narrate(input, &prepared).await;
        self.finalize(input, &prepared, narrative, trace)
    }

    fn response(
        &self,
        input: &SynthesisInput<'_>,
        prepared: &Prepared,
        narrative: Narrative,
        confidence: Confidence,
        trace: Vec<TraceStep>,
    ) -> AgentResponse {
        let p = &prepared.profile;
        AgentResponse {
            answer: narrative.answer,
            why_it_matters: narrative.why_it_matters,
            confidence,
            metrics: p.metrics.clone(),
            evidence: p.evidence.clone(),
            insights: narrative.insights,
            suggested_questions: narrative.suggested_questions,
            assumptions: assumptions(input, &narrative.assumptions),
            trace,
            data_tables: p.data_tables.clone(),
            artifacts: p.artifacts.clone(),
            narrative_source: narrative.source,
        }
    }
}

fn profile_checks(prepared: &Prepared) -> Vec<String> {
    let p = &prepared.profile;
    vec![
        format!("data tables: {}", p.data_tables.len()),
        format!("artifacts: {}", p.artifacts.len()),
        format!("evidence rows: {}", p.evidence.len()),
        format!("metrics: {}", p.metrics.len()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tally_infer::GenerateRequest;
    use tally_types::{PlanStep, RepairAction, RepairKind, Route, Row, StepOutcome, TurnRequest};

    struct Reply(&'static str);

    #[async_trait]
    impl TextGenerator for Reply {
        async fn generate(&self, _req: GenerateRequest) -> Result<String, InferError> {
            Ok(self.0.to_string())
        }

        fn describe(&self) -> &'static str {
            "canned"
        }
    }

    fn catalog() -> PolicyCatalog {
        PolicyCatalog::from_json_str(
            r#"{"version":"2024.06","tables":[{"name":"sales","dimensions":["transaction_state"],"metrics":["sales"]}]}"#,
        )
        .unwrap()
    }

    fn turn() -> Turn {
        Turn::from_request(TurnRequest {
            message: "Show me my sales in each state in descending order".into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn plan() -> Plan {
        Plan {
            route: Route::FastPath,
            route_source: DecisionSource::Model,
            plan_source: DecisionSource::Model,
            step_cap: 2,
            steps: vec![PlanStep::new("step_1", "sales by state")],
        }
    }

    fn results() -> Vec<StepResult> {
        let rows: Vec<Row> = [
            json!({"transaction_state": "UT", "total_sales": 3014322.72}),
            json!({"transaction_state": "CT", "total_sales": 2901243.84}),
        ]
        .into_iter()
        .map(|v: Value| v.as_object().cloned().unwrap())
        .collect();
        vec![StepResult::executed(
            &PlanStep::new("step_1", "sales by state"),
            "SELECT transaction_state, SUM(sales) AS total_sales FROM sales GROUP BY 1 ORDER BY 2 DESC\nLIMIT 1000"
                .into(),
            rows,
            StepOutcome::Executed,
        )]
    }

    #[tokio::test]
    async fn grounded_narrative_is_used() {
        let (turn, plan, results, catalog) = (turn(), plan(), results(), catalog());
        let input = SynthesisInput { turn: &turn, plan: &plan, results: &results, catalog: &catalog };
        let s = Synthesizer::new(
            Arc::new(Reply(r#"{"answer":"UT leads with 3,014,322.72 in sales.","assumptions":["Sales are gross."]}"#)),
            CallBudget::default(),
        );
        let r = s.run(&input, Vec::new()).await;
        assert_eq!(r.narrative_source, NarrativeSource::Model);
        assert_eq!(r.confidence, Confidence::High);
        assert_eq!(r.assumptions[0], "Sales are gross.");
        assert!(r.assumptions.iter().any(|a| a.contains("catalog version 2024.06")));
        assert_eq!(r.trace.last().unwrap().status, TraceStatus::Done);
        assert_eq!(r.trace.last().unwrap().id, "t4");
    }

    #[tokio::test]
    async fn invented_figures_fall_back_to_template() {
        let (turn, plan, results, catalog) = (turn(), plan(), results(), catalog());
        let input = SynthesisInput { turn: &turn, plan: &plan, results: &results, catalog: &catalog };
        let s = Synthesizer::new(
            Arc::new(Reply(r#"{"answer":"UT leads with 9,999,999 in sales."}"#)),
            CallBudget::default(),
        );
        let r = s.run(&input, Vec::new()).await;
        assert_eq!(r.narrative_source, NarrativeSource::Template);
        assert_eq!(r.confidence, Confidence::Medium);
        assert!(r.answer.starts_with("Top results by total_sales: UT"));
    }

    #[test]
    fn draft_is_running_and_deterministic() {
        let (turn, plan, results, catalog) = (turn(), plan(), results(), catalog());
        let input = SynthesisInput { turn: &turn, plan: &plan, results: &results, catalog: &catalog };
        let s = Synthesizer::new(Arc::new(Reply("{}")), CallBudget::default());
        let prepared = s.prepare(&input);
        let d = s.draft(&input, &prepared, Vec::new());
        assert_eq!(d.trace[0].status, TraceStatus::Running);
        assert_eq!(d.answer, prepared.template.answer);
        assert_eq!(d.data_tables.len(), 1);
        assert_eq!(d.data_tables[0].source_sql.as_deref(), results[0].sql.as_deref());
    }

    #[test]
    fn confidence_follows_step_outcomes() {
        let mut rs = results();
        assert_eq!(confidence(&rs, false), Confidence::High);
        rs[0].repairs.push(RepairAction {
            kind: RepairKind::Grain,
            note: "n".into(),
        });
        assert_eq!(confidence(&rs, false), Confidence::Medium);
        rs.push(StepResult::blocked(&PlanStep::new("step_2", "g"), None, "x"));
        assert_eq!(confidence(&rs, false), Confidence::Low);
    }

    #[test]
    fn deltas_rebuild_the_answer() {
        let a = "Top results by sales: UT (3.00).";
        assert_eq!(answer_deltas(a).concat(), a);
        assert_eq!(answer_deltas(a).len(), 6);
    }
}
