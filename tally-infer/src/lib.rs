use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tally_types::Row;
use thiserror::Error;

pub mod decode;
pub mod http;
pub mod null;
pub mod sandbox;

pub use decode::{decode_json, extract_json_object, DecodeError};
pub use http::{HttpAnalyst, HttpChatGenerator, HttpSqlExecutor, SqlTarget};
pub use null::{NullAnalyst, NullSqlExecutor, NullTextGenerator};
pub use sandbox::SandboxSqlExecutor;

#[derive(Debug, Error)]
pub enum InferError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0} is not configured")]
    Unavailable(&'static str),
}

impl From<DecodeError> for InferError {
    fn from(e: DecodeError) -> Self {
        InferError::Malformed(e.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for a JSON object reply when it supports that.
    pub json_mode: bool,
}

/// Per-call settings shared by the stages.
#[derive(Clone, Copy, Debug)]
pub struct CallBudget {
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    pub json_mode: bool,
}

impl Default for CallBudget {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            temperature: 0.1,
            max_tokens: 1400,
            json_mode: true,
        }
    }
}

impl CallBudget {
    /// Budget whose token ceiling is at most `cap`.
    pub fn capped(&self, cap: u32) -> Self {
        Self {
            max_tokens: self.max_tokens.min(cap),
            ..*self
        }
    }

    pub fn request(&self, system_prompt: String, user_prompt: String) -> GenerateRequest {
        GenerateRequest {
            system_prompt,
            user_prompt,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            json_mode: self.json_mode,
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, req: GenerateRequest) -> Result<String, InferError>;

    fn describe(&self) -> &'static str;
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, InferError>;

    fn describe(&self) -> &'static str;
}

#[derive(Clone, Debug)]
pub struct AnalystRequest {
    pub conversation_id: String,
    pub message: String,
    pub history: Vec<String>,
    pub step_id: String,
}

/// Optional remote service that authors SQL for a step directly.
#[async_trait]
pub trait AnalystService: Send + Sync {
    async fn analyze(&self, req: AnalystRequest) -> Result<String, InferError>;

    fn describe(&self) -> &'static str;
}

/// Bounds a remote call. The call is not retried.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, InferError>
where
    F: Future<Output = Result<T, InferError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(InferError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_call_times_out() {
        let res: Result<(), _> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(InferError::Timeout(_))));
    }

    #[test]
    fn capped_budget_never_raises() {
        let b = CallBudget::default();
        assert_eq!(b.capped(220).max_tokens, 220);
        assert_eq!(b.capped(5000).max_tokens, 1400);
    }
}
