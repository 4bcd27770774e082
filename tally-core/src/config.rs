//! Service configuration: a YAML file with serde defaults for every field, then
//! environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_exec::{ExecConfig, RepairHeuristics};
use tally_guard::GuardOptions;
use tally_infer::CallBudget;
use tally_planner::PlannerConfig;
use thiserror::Error;

use crate::session::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid config: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    pub max_parallel_steps: usize,
    pub remote_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 3,
            remote_timeout_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub json_mode: bool,
    /// Use the null generator; every model call falls back.
    pub stub: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            temperature: 0.1,
            max_tokens: 1400,
            json_mode: true,
            stub: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqlConfig {
    /// Run queries against the embedded seeded store instead of a remote service.
    pub sandbox: bool,
    /// Database file for the sandbox; in memory when unset.
    pub sandbox_path: Option<PathBuf>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalystConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallyConfig {
    pub catalog_path: PathBuf,
    pub listen_addr: String,
    pub receipts_path: PathBuf,
    pub planner: PlannerConfig,
    pub execution: ExecutionConfig,
    pub session: SessionConfig,
    pub llm: LlmConfig,
    pub sql: SqlConfig,
    pub analyst: AnalystConfig,
    pub repair: RepairHeuristics,
    pub guard: GuardOptions,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("config/catalog.sample.json"),
            listen_addr: "0.0.0.0:7000".into(),
            receipts_path: PathBuf::from("./receipts.jsonl"),
            planner: PlannerConfig::default(),
            execution: ExecutionConfig::default(),
            session: SessionConfig::default(),
            llm: LlmConfig::default(),
            sql: SqlConfig::default(),
            analyst: AnalystConfig::default(),
            repair: RepairHeuristics::default(),
            guard: GuardOptions::default(),
        }
    }
}

fn truthy(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

fn non_empty(v: String) -> Option<String> {
    let v = v.trim().to_string();
    (!v.is_empty()).then_some(v)
}

impl TallyConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// `TALLY_CONFIG` (or `explicit`) names the file; without one the defaults
    /// apply. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var("TALLY_CONFIG").ok().and_then(non_empty).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        if let Some(v) = get("TALLY_CATALOG_PATH") {
            self.catalog_path = PathBuf::from(v);
        }
        if let Some(v) = get("TALLY_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = get("TALLY_RECEIPTS_FILE") {
            self.receipts_path = PathBuf::from(v);
        }
        if let Some(v) = get("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("LLM_STUB") {
            self.llm.stub = truthy(&v);
        }
        if let Some(v) = get("SQL_BASE_URL") {
            self.sql.base_url = Some(v);
        }
        if let Some(v) = get("SQL_SANDBOX") {
            self.sql.sandbox = truthy(&v);
        }
        if let Some(v) = get("SQL_SANDBOX_PATH") {
            self.sql.sandbox_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SQL_API_KEY") {
            self.sql.api_key = Some(v);
        }
        if let Some(v) = get("ANALYST_BASE_URL") {
            self.analyst.base_url = Some(v);
        }
        if let Some(v) = get("ANALYST_API_KEY") {
            self.analyst.api_key = Some(v);
        }
        if let Some(v) = get("TALLY_MAX_PARALLEL_STEPS") {
            self.execution.max_parallel_steps = v.parse().map_err(|_| ConfigError::Env {
                key: "TALLY_MAX_PARALLEL_STEPS",
                value: v.clone(),
            })?;
        }
        Ok(())
    }

    pub fn budget(&self) -> CallBudget {
        CallBudget {
            timeout: Duration::from_millis(self.execution.remote_timeout_ms.max(1)),
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
            json_mode: self.llm.json_mode,
        }
    }

    pub fn exec_config(&self) -> ExecConfig {
        ExecConfig {
            max_parallel_steps: self.execution.max_parallel_steps.max(1),
        }
    }
}
