use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_types::Row;

use crate::{AnalystRequest, AnalystService, GenerateRequest, InferError, SqlExecutor, TextGenerator};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

fn trimmed(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, InferError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(InferError::Status {
        status: status.as_u16(),
        body,
    })
}

fn transport(e: reqwest::Error) -> InferError {
    InferError::Transport(e.to_string())
}

/// Text generator for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpChatGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpChatGenerator {
    pub fn new(base_url: impl AsRef<str>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: trimmed(base_url.as_ref()),
            model: model.into(),
            api_key,
        }
    }
}

#[async_trait]
impl TextGenerator for HttpChatGenerator {
    async fn generate(&self, req: GenerateRequest) -> Result<String, InferError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &req.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &req.user_prompt,
                },
            ],
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            response_format: req.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let mut call = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let resp = checked(call.send().await.map_err(transport)?).await?;
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| InferError::Malformed(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| InferError::Malformed("completion had no content".into()))
    }

    fn describe(&self) -> &'static str {
        "openai-compatible chat completions"
    }
}

#[derive(Clone, Debug, Default)]
pub struct SqlTarget {
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    sql: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
}

/// SQL execution over `POST <base>/query`.
pub struct HttpSqlExecutor {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    target: SqlTarget,
}

impl HttpSqlExecutor {
    pub fn new(base_url: impl AsRef<str>, api_key: Option<String>, target: SqlTarget) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: trimmed(base_url.as_ref()),
            api_key,
            target,
        }
    }
}

#[async_trait]
impl SqlExecutor for HttpSqlExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, InferError> {
        let url = format!("{}/query", self.base_url);
        let body = QueryRequest {
            sql,
            warehouse: self.target.warehouse.as_deref(),
            database: self.target.database.as_deref(),
            schema: self.target.schema.as_deref(),
        };
        let mut call = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let resp = checked(call.send().await.map_err(transport)?).await?;
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| InferError::Malformed(e.to_string()))?;
        rows_from_payload(payload)
    }

    fn describe(&self) -> &'static str {
        "http sql service"
    }
}

/// Accepts `rows`, `data`, `result.rows`, or a bare array. Every entry must be an object.
pub fn rows_from_payload(payload: Value) -> Result<Vec<Row>, InferError> {
    let list = match payload {
        Value::Array(items) => items,
        Value::Object(mut obj) => {
            let nested = obj
                .get_mut("result")
                .and_then(|r| r.get_mut("rows"))
                .map(Value::take);
            match (obj.remove("rows"), obj.remove("data"), nested) {
                (Some(Value::Array(items)), _, _) => items,
                (_, Some(Value::Array(items)), _) => items,
                (_, _, Some(Value::Array(items))) => items,
                _ => {
                    return Err(InferError::Malformed(
                        "response did not include a rows/data array".into(),
                    ))
                }
            }
        }
        _ => {
            return Err(InferError::Malformed(
                "response did not include a rows/data array".into(),
            ))
        }
    };
    list.into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::Object(row) => Ok(row),
            other => Err(InferError::Malformed(format!(
                "row {i} is not an object: {other}"
            ))),
        })
        .collect()
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    conversation_id: &'a str,
    message: &'a str,
    history: &'a [String],
    step_id: &'a str,
}

/// Analyst service over `POST <base>/analyze`. The raw JSON reply is returned for the caller to decode.
pub struct HttpAnalyst {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAnalyst {
    pub fn new(base_url: impl AsRef<str>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: trimmed(base_url.as_ref()),
            api_key,
        }
    }
}

#[async_trait]
impl AnalystService for HttpAnalyst {
    async fn analyze(&self, req: AnalystRequest) -> Result<String, InferError> {
        let url = format!("{}/analyze", self.base_url);
        let body = AnalyzeRequest {
            conversation_id: &req.conversation_id,
            message: &req.message,
            history: &req.history,
            step_id: &req.step_id,
        };
        let mut call = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let resp = checked(call.send().await.map_err(transport)?).await?;
        resp.text().await.map_err(transport)
    }

    fn describe(&self) -> &'static str {
        "http analyst service"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_envelopes_are_accepted() {
        let row = json!({"state": "CA", "sales": 10});
        for payload in [
            json!({"rows": [row.clone()]}),
            json!({"data": [row.clone()]}),
            json!({"result": {"rows": [row.clone()]}}),
            json!([row.clone()]),
        ] {
            let rows = rows_from_payload(payload).unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["state"], "CA");
        }
    }

    #[test]
    fn non_object_row_is_malformed_not_dropped() {
        let err = rows_from_payload(json!({"rows": [{"state": "CA"}, 5]})).unwrap_err();
        match err {
            InferError::Malformed(msg) => assert!(msg.starts_with("row 1 "), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_rows_is_malformed() {
        assert!(matches!(
            rows_from_payload(json!({"status": "ok"})),
            Err(InferError::Malformed(_))
        ));
    }

    #[test]
    fn chat_request_sets_json_response_format() {
        let body = ChatRequest {
            model: "m",
            messages: vec![],
            max_tokens: 10,
            temperature: 0.1,
            response_format: Some(ResponseFormat { kind: "json_object" }),
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["response_format"]["type"], "json_object");
    }
}
