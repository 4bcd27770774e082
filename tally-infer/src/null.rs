//! Adapters that always fail, so every stage takes its deterministic fallback.

use async_trait::async_trait;
use tally_types::Row;

use crate::{AnalystRequest, AnalystService, GenerateRequest, InferError, SqlExecutor, TextGenerator};

pub struct NullTextGenerator;

#[async_trait]
impl TextGenerator for NullTextGenerator {
    async fn generate(&self, _req: GenerateRequest) -> Result<String, InferError> {
        Err(InferError::Unavailable("text generation"))
    }

    fn describe(&self) -> &'static str {
        "null"
    }
}

pub struct NullSqlExecutor;

#[async_trait]
impl SqlExecutor for NullSqlExecutor {
    async fn execute(&self, _sql: &str) -> Result<Vec<Row>, InferError> {
        Err(InferError::Unavailable("sql execution"))
    }

    fn describe(&self) -> &'static str {
        "null"
    }
}

pub struct NullAnalyst;

#[async_trait]
impl AnalystService for NullAnalyst {
    async fn analyze(&self, _req: AnalystRequest) -> Result<String, InferError> {
        Err(InferError::Unavailable("analyst"))
    }

    fn describe(&self) -> &'static str {
        "null"
    }
}
