//! SQL authoring for one step: analyst service first when configured, then the
//! text generator. Replies are decoded here and nowhere else.

use serde::Deserialize;
use serde_json::Value;
use tally_catalog::PolicyCatalog;
use tally_infer::{
    decode_json, with_timeout, AnalystRequest, AnalystService, CallBudget, InferError, TextGenerator,
};
use tally_types::{history_text, PlanStep, Route, Turn};

const SQL_TOKEN_CAP: u32 = 1100;
const MAX_AUTHOR_ASSUMPTIONS: usize = 4;
const PRIOR_SQL_IN_PROMPT: usize = 3;

const DEFAULT_CLARIFICATION: &str =
    "Could you clarify the requested metric, grain, and time window before I generate SQL?";

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct AuthorReply {
    generation_type: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    sql: Option<String>,
    rationale: Option<String>,
    clarification_question: Option<String>,
    not_relevant_reason: Option<String>,
    relevance: Option<String>,
    assumptions: Vec<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GenerationType {
    SqlReady,
    Clarification,
    NotRelevant,
}

fn generation_type(raw: Option<&str>) -> GenerationType {
    let normalized = raw.unwrap_or_default().trim().to_ascii_lowercase().replace('-', "_");
    match normalized.as_str() {
        "clarification" | "clarify" => GenerationType::Clarification,
        "not_relevant" | "out_of_domain" | "irrelevant" => GenerationType::NotRelevant,
        _ => GenerationType::SqlReady,
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorSource {
    Analyst,
    Model,
}

#[derive(Debug)]
pub enum Authored {
    Sql {
        sql: String,
        source: AuthorSource,
        rationale: Option<String>,
        assumptions: Vec<String>,
    },
    /// The author asked for clarification or judged the step out of scope.
    Blocked { reason: String },
    Failed { error: String },
}

fn interpret(raw: &str, source: AuthorSource) -> Result<Authored, InferError> {
    let reply: AuthorReply = decode_json(raw)?;
    let mut kind = generation_type(reply.generation_type.as_deref().or(reply.kind.as_deref()));
    let question = non_empty(reply.clarification_question);
    if question.is_some() {
        kind = GenerationType::Clarification;
    }
    let out_of_domain = reply
        .relevance
        .as_deref()
        .is_some_and(|r| r.trim().eq_ignore_ascii_case("out_of_domain"));
    if kind == GenerationType::SqlReady && out_of_domain {
        kind = GenerationType::NotRelevant;
    }

    Ok(match kind {
        GenerationType::Clarification => Authored::Blocked {
            reason: format!(
                "clarification needed: {}",
                question.unwrap_or_else(|| DEFAULT_CLARIFICATION.to_string())
            ),
        },
        GenerationType::NotRelevant => Authored::Blocked {
            reason: format!(
                "not relevant: {}",
                non_empty(reply.not_relevant_reason)
                    .unwrap_or_else(|| "the request is outside the catalog's domain".into())
            ),
        },
        GenerationType::SqlReady => match non_empty(reply.sql) {
            Some(sql) => Authored::Sql {
                sql,
                source,
                rationale: non_empty(reply.rationale),
                assumptions: reply
                    .assumptions
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.trim().to_string()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .filter(|s| !s.is_empty())
                    .take(MAX_AUTHOR_ASSUMPTIONS)
                    .collect(),
            },
            None => return Err(InferError::Malformed("reply had no SQL".into())),
        },
    })
}

pub struct AuthorContext<'a> {
    pub turn: &'a Turn,
    pub route: Route,
    pub step: &'a PlanStep,
    pub catalog: &'a PolicyCatalog,
    pub history: &'a [String],
    pub prior_sql: &'a [String],
}

pub fn sql_prompt(ctx: &AuthorContext<'_>) -> (String, String) {
    let prior: Vec<String> = ctx
        .prior_sql
        .iter()
        .rev()
        .take(PRIOR_SQL_IN_PROMPT)
        .rev()
        .map(|s| format!("- {}", s.replace('\n', " ")))
        .collect();
    let prior = if prior.is_empty() { "- none".to_string() } else { prior.join("\n") };
    let role = ctx.turn.role.as_deref().unwrap_or("analyst");

    let system = "You write SQL for one analytical step. Respond with one of three outcomes: \
        sql_ready, clarification, or not_relevant. When sql_ready, return exactly one read-only \
        SELECT statement. Use only catalog tables and never select restricted columns. \
        Return strict JSON only."
        .to_string();
    let user = format!(
        "Conversation history:\n{}\n\n{}\n\
         Requester role: {role}\nRoute: {}\nQuestion: {}\nExplicit filters:\n{}\n\
         Step id: {}\nStep goal: {}\nPrior SQL in this turn:\n{prior}\n\n\
         Output JSON keys:\n\
         - \"generationType\": one of sql_ready|clarification|not_relevant\n\
         - \"sql\": string (required when sql_ready)\n\
         - \"rationale\": string\n\
         - \"clarificationQuestion\": string (required when clarification)\n\
         - \"notRelevantReason\": string (required when not_relevant)\n\
         - \"assumptions\": array of strings",
        history_text(ctx.history),
        ctx.catalog.summary(),
        ctx.route.as_str(),
        ctx.turn.message,
        ctx.turn.filters_text(),
        ctx.step.id,
        ctx.step.goal,
    );
    (system, user)
}

pub async fn author(
    ctx: &AuthorContext<'_>,
    generator: &dyn TextGenerator,
    analyst: Option<&dyn AnalystService>,
    budget: &CallBudget,
) -> Authored {
    if let Some(analyst) = analyst {
        let conversation = ctx
            .turn
            .session_id
            .clone()
            .unwrap_or_else(|| ctx.turn.id.to_string());
        let req = AnalystRequest {
            conversation_id: format!("{conversation}::sub::{}", ctx.step.id),
            message: ctx.step.goal.clone(),
            history: ctx.history.to_vec(),
            step_id: ctx.step.id.clone(),
        };
        let res = with_timeout(budget.timeout, analyst.analyze(req))
            .await
            .and_then(|raw| interpret(&raw, AuthorSource::Analyst));
        match res {
            Ok(authored) => return authored,
            Err(e) => {
                tracing::warn!(step_id = %ctx.step.id, error = %e, "analyst failed; authoring with text generator");
            }
        }
    }

    let (system, user) = sql_prompt(ctx);
    let budget = budget.capped(SQL_TOKEN_CAP);
    let res = with_timeout(budget.timeout, generator.generate(budget.request(system, user)))
        .await
        .and_then(|raw| interpret(&raw, AuthorSource::Model));
    match res {
        Ok(authored) => authored,
        Err(e) => Authored::Failed {
            error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_ready_reply_is_accepted() {
        let a = interpret(
            r#"{"generationType":"sql_ready","sql":"SELECT 1 FROM sales","assumptions":["a", 2, null]}"#,
            AuthorSource::Model,
        )
        .unwrap();
        match a {
            Authored::Sql { sql, assumptions, .. } => {
                assert_eq!(sql, "SELECT 1 FROM sales");
                assert_eq!(assumptions, vec!["a".to_string(), "2".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn clarification_question_wins_over_type() {
        let a = interpret(
            r#"{"type":"sql","sql":"SELECT 1","clarificationQuestion":"Which year?"}"#,
            AuthorSource::Analyst,
        )
        .unwrap();
        assert!(matches!(a, Authored::Blocked { reason } if reason == "clarification needed: Which year?"));
    }

    #[test]
    fn out_of_domain_is_not_relevant() {
        let a = interpret(r#"{"relevance":"out_of_domain","sql":"SELECT 1"}"#, AuthorSource::Model).unwrap();
        assert!(matches!(a, Authored::Blocked { reason } if reason.starts_with("not relevant")));
    }

    #[test]
    fn missing_sql_is_malformed() {
        assert!(interpret(r#"{"generationType":"sql_ready"}"#, AuthorSource::Model).is_err());
        assert!(interpret("SELECT 1", AuthorSource::Model).is_err());
    }
}
