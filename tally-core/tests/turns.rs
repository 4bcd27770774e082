use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tally_catalog::{PolicyCatalog, SharedCatalog};
use tally_core::{ProviderMode, Providers, TallyConfig, TallyKernel, TurnError};
use tally_infer::{GenerateRequest, InferError, NullTextGenerator, SqlExecutor, TextGenerator};
use tally_types::{
    Confidence, NarrativeSource, ResponsePhase, Row, TraceStatus, TurnEvent, TurnRequest, ValidationViolation,
};
use tokio::sync::mpsc;

const SALES_BY_STATE: &str = "SELECT transaction_state, SUM(sales) AS total_sales FROM sales \
    GROUP BY transaction_state ORDER BY total_sales DESC";

fn catalog() -> Arc<SharedCatalog> {
    let catalog = PolicyCatalog::from_json_str(
        &json!({
            "version": "2024.06",
            "tables": [{
                "name": "sales",
                "description": "Card transactions",
                "dimensions": ["transaction_state"],
                "metrics": ["sales"]
            }],
            "policy": {"restrictedColumns": ["card_number"], "defaultRowLimit": 1000, "maxRowLimit": 5000}
        })
        .to_string(),
    )
    .unwrap();
    Arc::new(SharedCatalog::new(catalog).unwrap())
}

fn config() -> TallyConfig {
    let mut c = TallyConfig::default();
    c.execution.remote_timeout_ms = 50;
    c
}

/// Answers each stage by recognizing its system prompt.
struct Scripted {
    sql: &'static str,
    narrative: &'static str,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(sql: &'static str) -> Self {
        Self {
            sql,
            narrative: r#"{"answer":"UT leads with 3,014,322.72 in sales.","whyItMatters":"Focus on the top state."}"#,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TextGenerator for Scripted {
    async fn generate(&self, req: GenerateRequest) -> Result<String, InferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(req.user_prompt.clone());
        let system = req.system_prompt.as_str();
        let reply = if system.starts_with("You classify") {
            json!({"route": "fast_path", "confidence": 0.9, "reason": "single ranking"}).to_string()
        } else if system.starts_with("You plan") {
            json!({"steps": [{"goal": "Total sales by state, descending"}]}).to_string()
        } else if system.starts_with("You write SQL") {
            json!({"generationType": "sql_ready", "sql": self.sql}).to_string()
        } else {
            self.narrative.to_string()
        };
        Ok(reply)
    }

    fn describe(&self) -> &'static str {
        "scripted"
    }
}

struct Rows {
    calls: AtomicUsize,
}

impl Rows {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SqlExecutor for Rows {
    async fn execute(&self, _sql: &str) -> Result<Vec<Row>, InferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok([
            json!({"transaction_state": "UT", "total_sales": 3014322.72}),
            json!({"transaction_state": "CT", "total_sales": 2901243.84}),
            json!({"transaction_state": "OK", "total_sales": 2790152.16}),
        ]
        .into_iter()
        .map(|v: Value| v.as_object().cloned().unwrap())
        .collect())
    }

    fn describe(&self) -> &'static str {
        "rows"
    }
}

struct Hangs;

#[async_trait]
impl SqlExecutor for Hangs {
    async fn execute(&self, _sql: &str) -> Result<Vec<Row>, InferError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Vec::new())
    }

    fn describe(&self) -> &'static str {
        "hangs"
    }
}

fn kernel(generator: Arc<dyn TextGenerator>, executor: Arc<dyn SqlExecutor>) -> TallyKernel {
    TallyKernel::new(catalog(), Providers::new(generator, executor), &config())
}

fn request(message: &str) -> TurnRequest {
    TurnRequest {
        message: message.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn sales_by_state_is_a_high_confidence_fast_path() {
    let k = kernel(Arc::new(Scripted::new(SALES_BY_STATE)), Arc::new(Rows::new()));
    let result = k
        .run_turn(request("Show me my sales in each state in descending order"))
        .await
        .unwrap();
    let r = result.response;

    let ids: Vec<&str> = r.trace.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "t2", "t3", "t4"]);
    assert!(r.assumptions.iter().any(|a| a.starts_with("Routed as fast_path")));
    assert!((1..=2).contains(&r.data_tables.len()));

    let sql = r.data_tables[0].source_sql.as_deref().unwrap();
    assert!(sql.contains("FROM sales"));
    assert!(sql.ends_with("LIMIT 1000"));
    assert_eq!(r.confidence, Confidence::High);
    assert_eq!(r.narrative_source, NarrativeSource::Model);
    assert_eq!(r.artifacts[0].rows[0]["transaction_state"], "UT");
}

#[tokio::test]
async fn stubbed_model_still_answers_from_fallbacks() {
    let k = kernel(Arc::new(NullTextGenerator), Arc::new(Rows::new()));
    let r = k
        .run_turn(request("Show me my sales in each state in descending order"))
        .await
        .unwrap()
        .response;
    assert_eq!(r.narrative_source, NarrativeSource::Template);
    assert_eq!(r.confidence, Confidence::Medium);
    assert!(r.assumptions.iter().any(|a| a.contains("deterministic fallback query")));
    assert!(r.assumptions.iter().any(|a| a.starts_with("Routed as fast_path by keyword heuristic")));
}

#[tokio::test]
async fn stacked_statement_is_never_executed() {
    let rows = Arc::new(Rows::new());
    let k = kernel(
        Arc::new(Scripted::new("SELECT * FROM sales; DROP TABLE sales;")),
        Arc::clone(&rows) as Arc<dyn SqlExecutor>,
    );
    let err = k.run_turn(request("Show me everything in sales")).await.unwrap_err();
    assert_eq!(rows.calls.load(Ordering::SeqCst), 0);
    match err {
        TurnError::ValidationFailed { report, trace, .. } => {
            assert_eq!(report.violations, vec![ValidationViolation::NoStepsExecuted]);
            assert_eq!(trace[1].status, TraceStatus::Blocked);
            let checks = trace[1].quality_checks.clone().unwrap().join("\n");
            assert!(checks.contains("forbidden_statement"));
            assert_eq!(trace.len(), 3);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn executor_timeouts_fail_validation_with_reasons() {
    let k = kernel(Arc::new(Scripted::new(SALES_BY_STATE)), Arc::new(Hangs));
    let err = k
        .run_turn(request("Show me my sales in each state in descending order"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Result validation failed");
    let TurnError::ValidationFailed { trace, .. } = err else {
        panic!("expected validation failure");
    };
    let checks = trace[1].quality_checks.clone().unwrap().join("\n");
    assert!(checks.contains("blocked (timed out"));
    assert!(checks.contains("fallback: timed out"));
}

#[tokio::test]
async fn stream_events_arrive_in_order() {
    let k = Arc::new(kernel(Arc::new(Scripted::new(SALES_BY_STATE)), Arc::new(Rows::new())));
    let mut rx = k.stream(request("Show me my sales in each state in descending order"));
    let mut events = Vec::new();
    while let Some(e) = rx.recv().await {
        events.push(e);
    }

    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    let draft = kinds.iter().position(|k| *k == "response").unwrap();
    assert!(draft >= 1 && kinds[..draft].iter().all(|k| *k == "status"));
    assert!(matches!(&events[draft], TurnEvent::Response { phase: ResponsePhase::Draft, .. }));
    assert_eq!(kinds.last(), Some(&"done"));
    assert!(matches!(
        &events[events.len() - 2],
        TurnEvent::Response { phase: ResponsePhase::Final, .. }
    ));

    let answer: String = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::AnswerDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    let TurnEvent::Response { response, .. } = &events[events.len() - 2] else {
        unreachable!()
    };
    assert_eq!(answer, response.answer);
}

#[tokio::test]
async fn stream_failure_ends_with_error_then_done() {
    let k = kernel(Arc::new(Scripted::new("DELETE FROM sales")), Arc::new(Rows::new()));
    let (tx, mut rx) = mpsc::channel(64);
    let res = k.run_stream(request("Show me my sales"), tx).await;
    assert!(res.is_err());

    let mut events = Vec::new();
    while let Some(e) = rx.recv().await {
        events.push(e);
    }
    let n = events.len();
    assert!(matches!(&events[n - 2], TurnEvent::Error { message } if message == "Result validation failed"));
    assert!(matches!(events[n - 1], TurnEvent::Done));
    assert!(events.iter().all(|e| !matches!(e, TurnEvent::Response { .. })));
}

#[tokio::test]
async fn dropped_receiver_starts_no_stage() {
    let generator = Arc::new(Scripted::new(SALES_BY_STATE));
    let k = kernel(Arc::clone(&generator) as Arc<dyn TextGenerator>, Arc::new(Rows::new()));
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let res = k.run_stream(request("Show me my sales"), tx).await;
    assert!(matches!(res, Err(TurnError::Cancelled)));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_history_reaches_the_next_turn() {
    let generator = Arc::new(Scripted::new(SALES_BY_STATE));
    let k = kernel(Arc::clone(&generator) as Arc<dyn TextGenerator>, Arc::new(Rows::new()));
    let with_session = |m: &str| TurnRequest {
        session_id: Some("s1".into()),
        message: m.into(),
        ..Default::default()
    };

    k.run_turn(with_session("Show me my sales in each state")).await.unwrap();
    generator.prompts.lock().unwrap().clear();
    let second = k.run_turn(with_session("Only the top one")).await.unwrap();

    let prompts = generator.prompts.lock().unwrap();
    assert!(prompts[0].contains("user: Show me my sales in each state"));
    assert!(second
        .response
        .assumptions
        .iter()
        .any(|a| a == "Session memory depth: 2 prior message(s) in context."));
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let k = kernel(Arc::new(NullTextGenerator), Arc::new(Rows::new()));
    assert!(matches!(k.run_turn(request("   ")).await, Err(TurnError::EmptyMessage)));
}

#[tokio::test]
async fn shipped_configuration_answers_from_the_sandbox() {
    let config = TallyConfig::from_yaml_str(include_str!("../../config/tally.yaml")).unwrap();
    let catalog = PolicyCatalog::from_json_str(include_str!("../../config/catalog.sample.json")).unwrap();
    let providers = Providers::from_config(&config).unwrap();
    assert_eq!(providers.mode, ProviderMode::Sandbox);
    let k = TallyKernel::new(Arc::new(SharedCatalog::new(catalog).unwrap()), providers, &config);

    let result = k.run_turn(request("Total spend by transaction state")).await.unwrap();
    let response = &result.response;
    assert_eq!(response.narrative_source, NarrativeSource::Template);
    let table = response.data_tables.first().expect("a data table");
    assert!(table.row_count > 0);
    assert!(table.rows[0].get("transaction_state").is_some_and(Value::is_string));
    assert!(table
        .source_sql
        .as_deref()
        .is_some_and(|sql| sql.contains("cia_sales_insights_cortex")));
}
