use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tally_catalog::SharedCatalog;
use tally_core::{Providers, TallyConfig, TallyKernel, TurnError, STREAM_CAPACITY};
use tally_receipts::{ReceiptLog, TurnOutcome, TurnReceipt};
use tally_types::{Confidence, TurnEvent, TurnRequest, TurnResult};

#[derive(Clone)]
struct AppState {
    kernel: Arc<TallyKernel>,
    receipts: Arc<ReceiptLog>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TallyConfig::load(None)?;
    tracing::info!(path = %config.catalog_path.display(), "loading catalog");
    let catalog = Arc::new(SharedCatalog::from_path(&config.catalog_path)?);
    let providers = Providers::from_config(&config)?;
    let receipts = Arc::new(ReceiptLog::open(&config.receipts_path)?);
    let kernel = Arc::new(TallyKernel::new(catalog, providers, &config));

    let app = app(AppState { kernel, receipts });
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "tally HTTP server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/turn", post(chat_turn))
        .route("/v1/chat/stream", post(chat_stream))
        .route("/v1/catalog/reload", post(reload_catalog))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let providers = state.kernel.providers();
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "providerMode": providers.mode,
        "providers": providers.summary(),
        "catalogVersion": state.kernel.catalog().snapshot().version,
    }))
}

async fn chat_turn(State(state): State<AppState>, Json(req): Json<TurnRequest>) -> Response {
    let session_id = req.session_id.clone();
    let input = serde_json::to_value(&req).unwrap_or(Value::Null);
    let result = state.kernel.run_turn(req).await;
    record(&state.receipts, session_id, &input, &result);

    match result {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: TurnError) -> Response {
    match err {
        TurnError::EmptyMessage => (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response(),
        TurnError::ValidationFailed {
            turn_id,
            report,
            trace,
        } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": "Result validation failed",
                "turnId": turn_id,
                "checks": report.checks,
                "trace": trace,
            })),
        )
            .into_response(),
        TurnError::Cancelled => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response()
        }
    }
}

/// NDJSON: one `TurnEvent` per line, in emission order.
async fn chat_stream(State(state): State<AppState>, Json(req): Json<TurnRequest>) -> Response {
    let (tx, rx) = mpsc::channel::<TurnEvent>(STREAM_CAPACITY);
    let session_id = req.session_id.clone();
    let input = serde_json::to_value(&req).unwrap_or(Value::Null);
    let kernel = Arc::clone(&state.kernel);
    let receipts = Arc::clone(&state.receipts);
    tokio::spawn(async move {
        let result = kernel.run_stream(req, tx).await;
        record(&receipts, session_id, &input, &result);
    });

    let lines = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let mut line = serde_json::to_string(&event).unwrap_or_else(|e| {
            json!({ "type": "error", "message": format!("event encoding failed: {e}") }).to_string()
        });
        line.push('\n');
        Some((Ok::<_, Infallible>(line), rx))
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

async fn reload_catalog(State(state): State<AppState>) -> Response {
    match state.kernel.catalog().reload() {
        Ok(catalog) => Json(json!({ "version": catalog.version })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    }
}

fn confidence_label(c: Confidence) -> Option<String> {
    serde_json::to_value(c).ok().and_then(|v| v.as_str().map(str::to_string))
}

/// Appends the turn's receipt. Receipt failures are logged, never surfaced.
fn record(receipts: &ReceiptLog, session_id: Option<String>, input: &Value, result: &Result<TurnResult, TurnError>) {
    let now = chrono::Utc::now().to_rfc3339();
    let receipt = match result {
        Ok(r) => TurnReceipt::new(
            now,
            r.turn_id,
            session_id,
            TurnOutcome::Answered,
            confidence_label(r.response.confidence),
            input,
            &r.response,
        ),
        Err(TurnError::ValidationFailed { turn_id, report, .. }) => TurnReceipt::new(
            now,
            *turn_id,
            session_id,
            TurnOutcome::ValidationFailed,
            None,
            input,
            report,
        ),
        Err(e) => TurnReceipt::new(
            now,
            Uuid::nil(),
            session_id,
            TurnOutcome::Error,
            None,
            input,
            &json!({ "error": e.to_string() }),
        ),
    };
    if let Err(e) = receipts.append(receipt) {
        tracing::warn!(error = %e, "failed to append turn receipt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tally_catalog::PolicyCatalog;
    use tally_infer::{InferError, NullTextGenerator, SqlExecutor};
    use tally_types::Row;
    use tower::ServiceExt;

    struct StateRows;

    #[async_trait]
    impl SqlExecutor for StateRows {
        async fn execute(&self, _sql: &str) -> Result<Vec<Row>, InferError> {
            Ok(vec![json!({"transaction_state": "UT", "metric_value": 3014322.72})
                .as_object()
                .cloned()
                .unwrap()])
        }

        fn describe(&self) -> &'static str {
            "state rows"
        }
    }

    fn state(executor: Arc<dyn SqlExecutor>) -> AppState {
        let catalog = PolicyCatalog::from_json_str(
            r#"{"version":"2024.06","tables":[{"name":"sales","dimensions":["transaction_state"],"metrics":["sales"]}]}"#,
        )
        .unwrap();
        let config = TallyConfig::default();
        let kernel = TallyKernel::new(
            Arc::new(SharedCatalog::new(catalog).unwrap()),
            Providers::new(Arc::new(NullTextGenerator), executor),
            &config,
        );
        let path = std::env::temp_dir().join(format!("tally_http_{}.jsonl", Uuid::new_v4()));
        AppState {
            kernel: Arc::new(kernel),
            receipts: Arc::new(ReceiptLog::open(path).unwrap()),
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_providers_and_catalog() {
        let resp = app(state(Arc::new(StateRows)))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["catalogVersion"], "2024.06");
        assert_eq!(body["providerMode"], "stub");
        assert_eq!(body["providers"]["textGeneration"], "null");
    }

    #[tokio::test]
    async fn turn_answers_and_writes_a_receipt() {
        let st = state(Arc::new(StateRows));
        let receipts = Arc::clone(&st.receipts);
        let resp = app(st)
            .oneshot(post_json("/v1/chat/turn", json!({"message": "sales by state", "sessionId": "s1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["turnId"].is_string());
        assert_eq!(body["response"]["confidence"], "medium");
        assert_eq!(tally_receipts::verify_log(receipts.path()).unwrap(), 1);
    }

    #[tokio::test]
    async fn validation_failure_is_422() {
        let resp = app(state(Arc::new(tally_infer::NullSqlExecutor)))
            .oneshot(post_json("/v1/chat/turn", json!({"message": "sales by state"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Result validation failed");
        assert!(body["checks"].as_array().is_some_and(|c| !c.is_empty()));
        assert_eq!(body["trace"].as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn empty_message_is_400() {
        let resp = app(state(Arc::new(StateRows)))
            .oneshot(post_json("/v1/chat/turn", json!({"message": "  "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_is_ndjson_ending_in_done() {
        let resp = app(state(Arc::new(StateRows)))
            .oneshot(post_json("/v1/chat/stream", json!({"message": "sales by state"})))
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/x-ndjson");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let kinds: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds.first().map(String::as_str), Some("status"));
        assert_eq!(kinds.last().map(String::as_str), Some("done"));
        assert!(kinds.iter().any(|k| k == "answer_delta"));
    }
}
