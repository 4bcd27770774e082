//! Route classification and bounded planning.
//!
//! The stage walks `classifying -> planning -> done`. Either state may take the
//! `fallback` edge: an adapter error, a timeout or an unusable reply switches to
//! the deterministic heuristic for that state, and the stage never fails.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_catalog::PolicyCatalog;
use tally_infer::{decode_json, with_timeout, CallBudget, InferError, TextGenerator};
use tally_types::{DecisionSource, Plan, PlanStep, Route, Stage, TraceStatus, TraceStep, Turn};

pub mod prompts;

const ROUTE_TOKEN_CAP: u32 = 220;
const PLAN_TOKEN_CAP: u32 = 900;

const DEEP_WORDS: &[&str] = &[
    "why", "driver", "drivers", "compare", "compared", "comparison", "versus", "vs", "trend",
    "trends", "yoy",
];
const DEEP_PHRASES: &[&str] = &[
    "root cause",
    "year over year",
    "step by step",
    "break down",
    "broken down",
];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlannerConfig {
    pub fast_max_steps: usize,
    pub deep_max_steps: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            fast_max_steps: 2,
            deep_max_steps: 4,
        }
    }
}

impl PlannerConfig {
    pub fn cap_for(&self, route: Route) -> usize {
        let cap = match route {
            Route::FastPath => self.fast_max_steps,
            Route::DeepPath => self.deep_max_steps,
        };
        cap.max(1)
    }
}

#[derive(Clone, Debug)]
pub struct RouteDecision {
    pub route: Route,
    pub source: DecisionSource,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct PlannerOutput {
    pub plan: Plan,
    pub trace: TraceStep,
}

#[derive(Deserialize)]
struct RouteReply {
    route: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PlanReply {
    steps: Vec<Value>,
    tasks: Vec<Value>,
}

pub struct Planner {
    generator: Arc<dyn TextGenerator>,
    config: PlannerConfig,
    budget: CallBudget,
}

impl Planner {
    pub fn new(generator: Arc<dyn TextGenerator>, config: PlannerConfig, budget: CallBudget) -> Self {
        Self {
            generator,
            config,
            budget,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub async fn run(&self, turn: &Turn, history: &[String], catalog: &PolicyCatalog) -> PlannerOutput {
        let mut path = vec!["classifying"];
        let decision = self.classify(turn, history, catalog).await;
        if decision.source == DecisionSource::Heuristic {
            path.push("fallback");
        }
        path.push("planning");
        let plan = self.plan(turn, &decision, history, catalog).await;
        if plan.plan_source == DecisionSource::Heuristic {
            path.push("fallback");
        }
        path.push("done");

        tracing::info!(
            turn_id = %turn.id,
            route = decision.route.as_str(),
            steps = plan.steps.len(),
            "plan ready"
        );
        let trace = plan_trace(&plan, &decision, &path);
        PlannerOutput { plan, trace }
    }

    pub async fn classify(&self, turn: &Turn, history: &[String], catalog: &PolicyCatalog) -> RouteDecision {
        let (system, user) = prompts::route_prompt(turn, history);
        let budget = self.budget.capped(ROUTE_TOKEN_CAP);
        let reply = with_timeout(budget.timeout, self.generator.generate(budget.request(system, user))).await;
        let parsed = reply.and_then(|raw| decode_json::<RouteReply>(&raw).map_err(InferError::from));

        match parsed {
            Ok(r) => match Route::parse(&r.route) {
                Some(route) => RouteDecision {
                    route,
                    source: DecisionSource::Model,
                    confidence: r.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                    reason: r.reason.unwrap_or_default(),
                },
                None => {
                    tracing::warn!(turn_id = %turn.id, route = %r.route, "unknown route from model; using heuristic");
                    heuristic_decision(&turn.message, catalog)
                }
            },
            Err(e) => {
                tracing::warn!(turn_id = %turn.id, error = %e, "route classification failed; using heuristic");
                heuristic_decision(&turn.message, catalog)
            }
        }
    }

    pub async fn plan(
        &self,
        turn: &Turn,
        decision: &RouteDecision,
        history: &[String],
        catalog: &PolicyCatalog,
    ) -> Plan {
        let cap = self.config.cap_for(decision.route);
        let (system, user) = prompts::plan_prompt(turn, decision.route, cap, catalog, history);
        let budget = self.budget.capped(PLAN_TOKEN_CAP);
        let reply = with_timeout(budget.timeout, self.generator.generate(budget.request(system, user))).await;

        let steps = match reply.and_then(|raw| decode_json::<PlanReply>(&raw).map_err(InferError::from)) {
            Ok(r) => steps_from_reply(r, cap),
            Err(e) => {
                tracing::warn!(turn_id = %turn.id, error = %e, "planning failed; using single-step plan");
                Vec::new()
            }
        };

        let (steps, plan_source) = if steps.is_empty() {
            (fallback_steps(turn), DecisionSource::Heuristic)
        } else {
            (steps, DecisionSource::Model)
        };
        Plan {
            route: decision.route,
            route_source: decision.source,
            plan_source,
            step_cap: cap,
            steps,
        }
    }
}

pub fn heuristic_route(message: &str, catalog: &PolicyCatalog) -> Route {
    let lowered = message.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let comparison = words.iter().any(|w| DEEP_WORDS.contains(w))
        || DEEP_PHRASES.iter().any(|p| lowered.contains(p));
    let first_then = words
        .iter()
        .position(|w| *w == "first")
        .is_some_and(|i| words[i..].contains(&"then"));
    let dimensions = catalog.mentioned_dimensions(&lowered).len();

    if comparison || first_then || dimensions >= 2 {
        Route::DeepPath
    } else {
        Route::FastPath
    }
}

fn heuristic_decision(message: &str, catalog: &PolicyCatalog) -> RouteDecision {
    let route = heuristic_route(message, catalog);
    RouteDecision {
        route,
        source: DecisionSource::Heuristic,
        confidence: 0.5,
        reason: "keyword heuristic".into(),
    }
}

/// One step that restates the literal request.
pub fn fallback_steps(turn: &Turn) -> Vec<PlanStep> {
    let mut step = PlanStep::new("step_1", turn.message.clone());
    step.expected_output = Some("Table answering the request as stated".into());
    vec![step]
}

struct RawStep {
    original_id: String,
    goal: String,
    expected_output: Option<String>,
    depends_on: Vec<String>,
}

fn raw_step(position: usize, entry: &Value) -> Option<RawStep> {
    let fallback_id = format!("step_{}", position + 1);
    let (goal, original_id, expected_output, depends_on) = match entry {
        Value::String(s) => (s.trim().to_string(), fallback_id, None, Vec::new()),
        Value::Object(obj) => {
            let text = |key: &str| {
                obj.get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            let goal = text("goal").or_else(|| text("task")).unwrap_or_default();
            let deps = obj
                .get("dependsOn")
                .or_else(|| obj.get("depends_on"))
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            (
                goal,
                text("id").unwrap_or(fallback_id),
                text("expectedOutput").or_else(|| text("expected_output")),
                deps,
            )
        }
        _ => return None,
    };
    if goal.is_empty() {
        return None;
    }
    Some(RawStep {
        original_id,
        goal,
        expected_output,
        depends_on,
    })
}

/// Drops invalid entries, truncates to `cap`, re-ids as `step_n` and keeps
/// only dependencies on earlier kept steps.
fn steps_from_reply(reply: PlanReply, cap: usize) -> Vec<PlanStep> {
    let entries = if reply.steps.is_empty() { reply.tasks } else { reply.steps };
    let kept: Vec<RawStep> = entries
        .iter()
        .enumerate()
        .filter_map(|(i, e)| raw_step(i, e))
        .take(cap)
        .collect();

    let index_of: HashMap<&str, usize> = kept
        .iter()
        .enumerate()
        .map(|(i, s)| (s.original_id.as_str(), i))
        .collect();

    kept.iter()
        .enumerate()
        .map(|(i, raw)| {
            let mut deps: Vec<String> = Vec::new();
            for d in &raw.depends_on {
                if let Some(&j) = index_of.get(d.as_str()) {
                    let id = format!("step_{}", j + 1);
                    if j < i && !deps.contains(&id) {
                        deps.push(id);
                    }
                }
            }
            PlanStep {
                id: format!("step_{}", i + 1),
                goal: raw.goal.clone(),
                expected_output: raw.expected_output.clone(),
                depends_on: deps,
            }
        })
        .collect()
}

fn source_label(source: DecisionSource) -> &'static str {
    match source {
        DecisionSource::Model => "model",
        DecisionSource::Heuristic => "heuristic",
    }
}

fn plan_trace(plan: &Plan, decision: &RouteDecision, path: &[&str]) -> TraceStep {
    let mut summary = format!(
        "Route {} ({}). {} step(s), cap {}.",
        plan.route.as_str(),
        source_label(plan.route_source),
        plan.steps.len(),
        plan.step_cap
    );
    if !decision.reason.is_empty() {
        summary.push_str(&format!(" Reason: {}.", decision.reason));
    }
    let mut checks = vec![
        format!("path: {}", path.join(" -> ")),
        format!("plan source: {}", source_label(plan.plan_source)),
    ];
    checks.extend(plan.steps.iter().map(|s| {
        if s.depends_on.is_empty() {
            format!("{}: {}", s.id, s.goal)
        } else {
            format!("{}: {} (after {})", s.id, s.goal, s.depends_on.join(", "))
        }
    }));
    TraceStep {
        id: "t1".into(),
        stage: Stage::Plan,
        title: "Plan analysis".into(),
        status: TraceStatus::Done,
        summary,
        sql: None,
        quality_checks: Some(checks),
    }
}
