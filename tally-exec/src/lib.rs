use std::sync::Arc;

use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tally_catalog::PolicyCatalog;
use tally_guard::{guard_with, GuardOptions, LimitAction};
use tally_infer::{with_timeout, AnalystService, CallBudget, SqlExecutor, TextGenerator};
use tally_types::{Plan, PlanStep, Row, Stage, StepOutcome, StepResult, TraceStatus, TraceStep, Turn};

pub mod author;
pub mod fallback;
pub mod repair;

pub use author::{AuthorContext, AuthorSource, Authored};
pub use repair::{GrainRule, RepairHeuristics};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecConfig {
    pub max_parallel_steps: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 3,
        }
    }
}

#[derive(Debug)]
pub struct SqlStageOutput {
    /// One result per plan step, in plan order.
    pub results: Vec<StepResult>,
    pub trace: TraceStep,
}

pub struct SqlStage {
    generator: Arc<dyn TextGenerator>,
    executor: Arc<dyn SqlExecutor>,
    analyst: Option<Arc<dyn AnalystService>>,
    config: ExecConfig,
    budget: CallBudget,
    heuristics: RepairHeuristics,
    guard_options: GuardOptions,
}

struct StepContext<'a> {
    turn: &'a Turn,
    plan: &'a Plan,
    history: &'a [String],
    catalog: &'a PolicyCatalog,
}

impl SqlStage {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        executor: Arc<dyn SqlExecutor>,
        config: ExecConfig,
        budget: CallBudget,
    ) -> Self {
        Self {
            generator,
            executor,
            analyst: None,
            config,
            budget,
            heuristics: RepairHeuristics::default(),
            guard_options: GuardOptions::default(),
        }
    }

    pub fn with_analyst(mut self, analyst: Arc<dyn AnalystService>) -> Self {
        self.analyst = Some(analyst);
        self
    }

    pub fn with_repairs(mut self, heuristics: RepairHeuristics) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn with_guard_options(mut self, options: GuardOptions) -> Self {
        self.guard_options = options;
        self
    }

    fn parallel(&self) -> bool {
        self.analyst.is_none() && self.config.max_parallel_steps > 1
    }

    pub async fn run(
        &self,
        turn: &Turn,
        plan: &Plan,
        history: &[String],
        catalog: &PolicyCatalog,
    ) -> SqlStageOutput {
        let ctx = StepContext {
            turn,
            plan,
            history,
            catalog,
        };

        let results = if self.parallel() {
            let ctx = &ctx;
            let futures: Vec<_> = plan
                .steps
                .iter()
                .enumerate()
                .map(|(i, step)| async move { (i, self.run_step(ctx, step, &[]).await) })
                .collect();
            let mut indexed: Vec<(usize, StepResult)> = stream::iter(futures)
                .buffer_unordered(self.config.max_parallel_steps)
                .collect()
                .await;
            indexed.sort_by_key(|(i, _)| *i);
            indexed.into_iter().map(|(_, r)| r).collect()
        } else {
            let mut prior_sql: Vec<String> = Vec::new();
            let mut results = Vec::with_capacity(plan.steps.len());
            for step in &plan.steps {
                let result = self.run_step(&ctx, step, &prior_sql).await;
                if let (false, Some(sql)) = (result.is_blocked(), &result.sql) {
                    prior_sql.push(sql.clone());
                }
                results.push(result);
            }
            results
        };

        let trace = sql_trace(&results);
        tracing::info!(
            turn_id = %turn.id,
            steps = results.len(),
            blocked = results.iter().filter(|r| r.is_blocked()).count(),
            "sql stage complete"
        );
        SqlStageOutput { results, trace }
    }

    async fn run_step(&self, ctx: &StepContext<'_>, step: &PlanStep, prior_sql: &[String]) -> StepResult {
        let author_ctx = AuthorContext {
            turn: ctx.turn,
            route: ctx.plan.route,
            step,
            catalog: ctx.catalog,
            history: ctx.history,
            prior_sql,
        };
        let authored = author::author(
            &author_ctx,
            self.generator.as_ref(),
            self.analyst.as_deref(),
            &self.budget,
        )
        .await;

        let mut notes: Vec<String> = Vec::new();
        let (candidate, templated) = match authored {
            Authored::Sql {
                sql, assumptions, ..
            } => {
                notes.extend(assumptions);
                (sql, false)
            }
            Authored::Blocked { reason } => {
                tracing::warn!(step_id = %step.id, %reason, "step blocked by author");
                return StepResult::blocked(step, None, reason);
            }
            Authored::Failed { error } => {
                tracing::warn!(step_id = %step.id, %error, "sql authoring failed; using fallback template");
                notes.push(format!(
                    "SQL authoring for {} failed ({error}); a deterministic fallback query was used.",
                    step.id
                ));
                match fallback::template_sql(ctx.catalog, &step.goal) {
                    Some(sql) => (sql, true),
                    None => return StepResult::blocked(step, None, "catalog has no tables"),
                }
            }
        };

        let guarded = guard_with(&candidate, ctx.catalog, &self.guard_options);
        let Some(sql) = guarded.sql().map(str::to_string) else {
            let reason = guarded.denial().unwrap_or_default();
            tracing::warn!(step_id = %step.id, %reason, "sql denied by guard");
            return StepResult::blocked(step, Some(candidate), reason);
        };
        if let Some(note) = limit_note(guarded.limit.as_ref()) {
            notes.push(note);
        }

        let mut result = match self.execute(&sql).await {
            Ok(rows) => {
                let outcome = if templated {
                    StepOutcome::Fallback {
                        reason: "sql authoring failed".into(),
                    }
                } else {
                    StepOutcome::Executed
                };
                StepResult::executed(step, sql, rows, outcome)
            }
            Err(primary) if templated => {
                tracing::warn!(step_id = %step.id, error = %primary, "fallback query failed");
                return StepResult::blocked(step, Some(sql), primary);
            }
            Err(primary) => {
                tracing::warn!(step_id = %step.id, error = %primary, "execution failed; trying fallback query");
                match self.run_fallback(ctx.catalog, step).await {
                    Ok((fallback_sql, rows)) => {
                        notes.push(format!(
                            "{} used the deterministic fallback query after: {primary}.",
                            step.id
                        ));
                        StepResult::executed(
                            step,
                            fallback_sql,
                            rows,
                            StepOutcome::Fallback { reason: primary },
                        )
                    }
                    Err(secondary) => {
                        return StepResult::blocked(
                            step,
                            Some(sql),
                            format!("{primary}; fallback: {secondary}"),
                        )
                    }
                }
            }
        };

        result.assumptions = notes;
        self.heuristics.apply(&step.goal, ctx.catalog, &mut result);
        result
    }

    /// Runs guarded SQL; zero rows count as a failure.
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, String> {
        match with_timeout(self.budget.timeout, self.executor.execute(sql)).await {
            Ok(rows) if rows.is_empty() => Err("query returned no rows".into()),
            Ok(rows) => Ok(rows),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn run_fallback(&self, catalog: &PolicyCatalog, step: &PlanStep) -> Result<(String, Vec<Row>), String> {
        let template = fallback::template_sql(catalog, &step.goal).ok_or_else(|| "catalog has no tables".to_string())?;
        let guarded = guard_with(&template, catalog, &self.guard_options);
        let sql = match guarded.sql() {
            Some(sql) => sql.to_string(),
            None => return Err(guarded.denial().unwrap_or_default()),
        };
        let rows = self.execute(&sql).await?;
        Ok((sql, rows))
    }
}

fn limit_note(action: Option<&LimitAction>) -> Option<String> {
    match action? {
        LimitAction::Clamped {
            requested: Some(requested),
            applied,
        } => Some(format!("Row limit {requested} was reduced to the policy maximum of {applied}.")),
        LimitAction::Clamped {
            requested: None,
            applied,
        } => Some(format!("An unbounded row limit was reduced to the policy maximum of {applied}.")),
        LimitAction::Replaced { requested, applied } => {
            Some(format!("Row limit `{requested}` was replaced with {applied}."))
        }
        _ => None,
    }
}

fn sql_trace(results: &[StepResult]) -> TraceStep {
    let executed = results
        .iter()
        .filter(|r| matches!(r.outcome, StepOutcome::Executed))
        .count();
    let fallback = results.iter().filter(|r| r.used_fallback()).count();
    let blocked = results.iter().filter(|r| r.is_blocked()).count();

    let mut checks = Vec::new();
    for r in results {
        match &r.outcome {
            StepOutcome::Executed => checks.push(format!("{}: executed, {} row(s)", r.step_id, r.row_count)),
            StepOutcome::Fallback { reason } => checks.push(format!(
                "{}: fallback query, {} row(s) ({reason})",
                r.step_id, r.row_count
            )),
            StepOutcome::Blocked { reason } => checks.push(format!("{}: blocked ({reason})", r.step_id)),
        }
        checks.extend(r.repairs.iter().map(|a| format!("{}: {}", r.step_id, a.note)));
    }

    let sql: Vec<String> = results
        .iter()
        .filter_map(|r| r.sql.as_ref().map(|s| format!("-- {}\n{s}", r.step_id)))
        .collect();

    TraceStep {
        id: "t2".into(),
        stage: Stage::Sql,
        title: "Generate and run SQL".into(),
        status: if !results.is_empty() && blocked == results.len() {
            TraceStatus::Blocked
        } else {
            TraceStatus::Done
        },
        summary: format!(
            "{} step(s): {executed} executed, {fallback} via fallback, {blocked} blocked.",
            results.len()
        ),
        sql: (!sql.is_empty()).then(|| sql.join("\n\n")),
        quality_checks: Some(checks),
    }
}
