use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Prior turns kept per session.
    pub history_cap: usize,
    /// Messages handed to prompts; never above `history_cap`.
    pub prompt_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_cap: 12,
            prompt_cap: 8,
        }
    }
}

impl SessionConfig {
    pub fn prompt_cap(&self) -> usize {
        self.prompt_cap.min(self.history_cap)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionTurn {
    pub message: String,
    pub answer: String,
}

#[derive(Debug, Default)]
pub struct Session {
    turns: VecDeque<SessionTurn>,
    messages: VecDeque<String>,
}

impl Session {
    pub fn turns(&self) -> impl Iterator<Item = &SessionTurn> {
        self.turns.iter()
    }

    /// Prompt messages, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.messages.iter().cloned().collect()
    }

    fn record(&mut self, config: &SessionConfig, message: &str, answer: &str) {
        self.turns.push_back(SessionTurn {
            message: message.to_string(),
            answer: answer.to_string(),
        });
        while self.turns.len() > config.history_cap {
            self.turns.pop_front();
        }
        self.messages.push_back(format!("user: {message}"));
        self.messages.push_back(format!("assistant: {answer}"));
        while self.messages.len() > config.prompt_cap() {
            self.messages.pop_front();
        }
    }
}

/// Process-lifetime conversation memory keyed by session id. The map lock only
/// guards get-or-insert; per-session work holds that session's mutex alone.
pub struct SessionStore {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn handle(&self, id: &str) -> Arc<Mutex<Session>> {
        if let Some(s) = self.sessions.read().unwrap_or_else(PoisonError::into_inner).get(id) {
            return Arc::clone(s);
        }
        let mut map = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(id.to_string()).or_default())
    }

    /// Prompt history for a turn. Turns without a session id have none.
    pub async fn history(&self, id: Option<&str>) -> Vec<String> {
        let Some(id) = id else {
            return Vec::new();
        };
        let handle = self.handle(id);
        let session = handle.lock().await;
        session.messages()
    }

    pub async fn record(&self, id: Option<&str>, message: &str, answer: &str) {
        let Some(id) = id else {
            return;
        };
        let handle = self.handle(id);
        let mut session = handle.lock().await;
        session.record(&self.config, message, answer);
        tracing::debug!(session_id = id, turns = session.turns.len(), "session updated");
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
