use std::sync::Arc;

use serde::Serialize;
use tally_infer::{
    AnalystService, HttpAnalyst, HttpChatGenerator, HttpSqlExecutor, InferError, NullSqlExecutor, NullTextGenerator,
    SandboxSqlExecutor, SqlExecutor, SqlTarget, TextGenerator,
};

use crate::config::TallyConfig;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ProviderMode {
    #[serde(rename = "stub")]
    Stub,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "http+analyst")]
    HttpWithAnalyst,
    /// SQL runs against the embedded seeded store.
    #[serde(rename = "sandbox")]
    Sandbox,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Stub => "stub",
            ProviderMode::Http => "http",
            ProviderMode::HttpWithAnalyst => "http+analyst",
            ProviderMode::Sandbox => "sandbox",
        }
    }
}

#[derive(Clone)]
pub struct Providers {
    pub mode: ProviderMode,
    pub generator: Arc<dyn TextGenerator>,
    pub executor: Arc<dyn SqlExecutor>,
    pub analyst: Option<Arc<dyn AnalystService>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub text_generation: &'static str,
    pub sql_execution: &'static str,
    pub analyst: &'static str,
}

impl Providers {
    /// Adapters from configuration. A stubbed model or a missing SQL endpoint
    /// gets the null adapter for that concern; `sql.sandbox` takes precedence
    /// over `sql.baseUrl`. Fails only if the sandbox store cannot be opened.
    pub fn from_config(config: &TallyConfig) -> Result<Self, InferError> {
        let generator: Arc<dyn TextGenerator> = if config.llm.stub {
            Arc::new(NullTextGenerator)
        } else {
            Arc::new(HttpChatGenerator::new(
                &config.llm.base_url,
                config.llm.model.clone(),
                config.llm.api_key.clone(),
            ))
        };
        let executor: Arc<dyn SqlExecutor> = match &config.sql.base_url {
            _ if config.sql.sandbox => Arc::new(SandboxSqlExecutor::open(config.sql.sandbox_path.as_deref())?),
            Some(url) => Arc::new(HttpSqlExecutor::new(
                url,
                config.sql.api_key.clone(),
                SqlTarget {
                    warehouse: config.sql.warehouse.clone(),
                    database: config.sql.database.clone(),
                    schema: config.sql.schema.clone(),
                },
            )),
            None => Arc::new(NullSqlExecutor),
        };
        let analyst: Option<Arc<dyn AnalystService>> = config
            .analyst
            .base_url
            .as_ref()
            .map(|url| Arc::new(HttpAnalyst::new(url, config.analyst.api_key.clone())) as Arc<dyn AnalystService>);

        let mode = match (config.sql.sandbox, config.llm.stub, analyst.is_some()) {
            (true, _, _) => ProviderMode::Sandbox,
            (false, true, _) => ProviderMode::Stub,
            (false, false, true) => ProviderMode::HttpWithAnalyst,
            (false, false, false) => ProviderMode::Http,
        };
        tracing::info!(
            mode = mode.as_str(),
            text_generation = generator.describe(),
            sql_execution = executor.describe(),
            "providers configured"
        );
        Ok(Self {
            mode,
            generator,
            executor,
            analyst,
        })
    }

    pub fn new(generator: Arc<dyn TextGenerator>, executor: Arc<dyn SqlExecutor>) -> Self {
        Self {
            mode: ProviderMode::Stub,
            generator,
            executor,
            analyst: None,
        }
    }

    pub fn with_analyst(mut self, analyst: Arc<dyn AnalystService>) -> Self {
        self.analyst = Some(analyst);
        self
    }

    pub fn with_mode(mut self, mode: ProviderMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn summary(&self) -> ProviderSummary {
        ProviderSummary {
            text_generation: self.generator.describe(),
            sql_execution: self.executor.describe(),
            analyst: self.analyst.as_ref().map_or("none", |a| a.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_mode_uses_null_generator() {
        let mut config = TallyConfig::default();
        config.llm.stub = true;
        let p = Providers::from_config(&config).unwrap();
        assert_eq!(p.mode, ProviderMode::Stub);
        assert_eq!(p.summary().text_generation, "null");
        assert_eq!(p.summary().sql_execution, "null");
        assert_eq!(p.summary().analyst, "none");
    }

    #[test]
    fn analyst_endpoint_selects_analyst_mode() {
        let mut config = TallyConfig::default();
        config.sql.base_url = Some("http://warehouse:9000".into());
        config.analyst.base_url = Some("http://analyst:9100".into());
        let p = Providers::from_config(&config).unwrap();
        assert_eq!(p.mode, ProviderMode::HttpWithAnalyst);
        assert_eq!(p.summary().sql_execution, "http sql service");
        assert_eq!(serde_json::to_value(p.mode).unwrap(), "http+analyst");
    }

    #[test]
    fn sandbox_wins_over_sql_endpoint() {
        let mut config = TallyConfig::default();
        config.llm.stub = true;
        config.sql.sandbox = true;
        config.sql.base_url = Some("http://warehouse:9000".into());
        let p = Providers::from_config(&config).unwrap();
        assert_eq!(p.mode, ProviderMode::Sandbox);
        assert_eq!(p.summary().sql_execution, "sqlite sandbox");
        assert_eq!(p.summary().text_generation, "null");
    }
}
