//! Turn orchestrator: sequences plan, SQL, validation and synthesis for one
//! request, owns session memory, and knows the delivery mode.

use std::sync::Arc;

use tally_catalog::SharedCatalog;
use tally_exec::SqlStage;
use tally_planner::Planner;
use tally_synth::{answer_deltas, SynthesisInput, Synthesizer};
use tally_types::{AgentResponse, ResponsePhase, Turn, TurnEvent, TurnRequest, TurnResult};
use tally_validate::{validate, validation_trace};
use tokio::sync::mpsc;
use tracing::Instrument;

pub mod config;
pub mod error;
pub mod providers;
pub mod session;

pub use config::{ConfigError, TallyConfig};
pub use error::TurnError;
pub use providers::{ProviderMode, ProviderSummary, Providers};
pub use session::{SessionConfig, SessionStore};

/// Buffered events per incremental turn.
pub const STREAM_CAPACITY: usize = 64;

/// Writes events for the incremental mode; silent in the buffered mode.
struct Emitter {
    tx: Option<mpsc::Sender<TurnEvent>>,
}

impl Emitter {
    fn silent() -> Self {
        Self { tx: None }
    }

    fn streaming(&self) -> bool {
        self.tx.is_some()
    }

    async fn send(&self, event: TurnEvent) -> Result<(), TurnError> {
        match &self.tx {
            None => Ok(()),
            Some(tx) => tx.send(event).await.map_err(|_| TurnError::Cancelled),
        }
    }

    async fn status(&self, message: impl Into<String>) -> Result<(), TurnError> {
        self.send(TurnEvent::Status {
            message: message.into(),
        })
        .await
    }

    async fn response(&self, phase: ResponsePhase, response: &AgentResponse) -> Result<(), TurnError> {
        self.send(TurnEvent::Response {
            phase,
            response: Box::new(response.clone()),
        })
        .await
    }
}

/// Wires the stages together. Shared across requests behind an `Arc`.
pub struct TallyKernel {
    catalog: Arc<SharedCatalog>,
    sessions: SessionStore,
    providers: Providers,
    planner: Planner,
    sql: SqlStage,
    synth: Synthesizer,
}

impl TallyKernel {
    pub fn new(catalog: Arc<SharedCatalog>, providers: Providers, config: &TallyConfig) -> Self {
        let budget = config.budget();
        let planner = Planner::new(Arc::clone(&providers.generator), config.planner.clone(), budget);
        let mut sql = SqlStage::new(
            Arc::clone(&providers.generator),
            Arc::clone(&providers.executor),
            config.exec_config(),
            budget,
        )
        .with_repairs(config.repair.clone())
        .with_guard_options(config.guard.clone());
        if let Some(analyst) = &providers.analyst {
            sql = sql.with_analyst(Arc::clone(analyst));
        }
        let synth = Synthesizer::new(Arc::clone(&providers.generator), budget);
        Self {
            catalog,
            sessions: SessionStore::new(config.session.clone()),
            providers,
            planner,
            sql,
            synth,
        }
    }

    pub fn catalog(&self) -> &Arc<SharedCatalog> {
        &self.catalog
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Buffered mode: one complete result, or the reason there is none.
    pub async fn run_turn(&self, req: TurnRequest) -> Result<TurnResult, TurnError> {
        let turn = Turn::from_request(req).ok_or(TurnError::EmptyMessage)?;
        let span = tracing::info_span!("turn", turn_id = %turn.id, session_id = ?turn.session_id);
        self.execute(&turn, &Emitter::silent()).instrument(span).await
    }

    /// Incremental mode. Events go to `tx` in order; failures end with `error`
    /// then `done`. A dropped receiver stops the turn before its next stage.
    pub async fn run_stream(&self, req: TurnRequest, tx: mpsc::Sender<TurnEvent>) -> Result<TurnResult, TurnError> {
        let emitter = Emitter { tx: Some(tx) };
        let Some(turn) = Turn::from_request(req) else {
            let err = TurnError::EmptyMessage;
            finish_with_error(&emitter, &err).await;
            return Err(err);
        };
        let span = tracing::info_span!("turn", turn_id = %turn.id, session_id = ?turn.session_id);
        let result = self.execute(&turn, &emitter).instrument(span).await;
        match &result {
            Ok(_) => {}
            Err(TurnError::Cancelled) => {
                tracing::info!(turn_id = %turn.id, "receiver dropped; turn stopped");
            }
            Err(err) => finish_with_error(&emitter, err).await,
        }
        result
    }

    /// Spawns an incremental turn and hands back its event receiver.
    pub fn stream(self: Arc<Self>, req: TurnRequest) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        tokio::spawn(async move {
            let _ = self.run_stream(req, tx).await;
        });
        rx
    }

    async fn execute(&self, turn: &Turn, emitter: &Emitter) -> Result<TurnResult, TurnError> {
        let catalog = self.catalog.snapshot();
        let session_id = turn.session_id.as_deref();
        let history = self.sessions.history(session_id).await;

        emitter.status("Classifying request and planning analysis.").await?;
        let planned = self.planner.run(turn, &history, &catalog).await;
        let mut trace = vec![planned.trace];

        emitter
            .status(format!("Running {} governed SQL step(s).", planned.plan.steps.len()))
            .await?;
        let executed = self.sql.run(turn, &planned.plan, &history, &catalog).await;
        trace.push(executed.trace);

        emitter.status("Validating results.").await?;
        let report = validate(&executed.results, catalog.max_row_limit());
        trace.push(validation_trace(&report));
        if !report.passed {
            tracing::warn!(turn_id = %turn.id, violations = ?report.violations, "turn halted by validation");
            return Err(TurnError::ValidationFailed {
                turn_id: turn.id,
                report,
                trace,
            });
        }

        emitter.status("Synthesizing answer.").await?;
        let input = SynthesisInput {
            turn,
            plan: &planned.plan,
            results: &executed.results,
            catalog: &catalog,
        };
        let prepared = self.synth.prepare(&input);
        if emitter.streaming() {
            let mut draft = self.synth.draft(&input, &prepared, trace.clone());
            note_session_depth(&mut draft, session_id, history.len());
            emitter.response(ResponsePhase::Draft, &draft).await?;
        }

        let narrative = self.synth.narrate(&input, &prepared).await;
        let mut response = self.synth.finalize(&input, &prepared, narrative, trace);
        note_session_depth(&mut response, session_id, history.len());
        self.sessions.record(session_id, &turn.message, &response.answer).await;

        if emitter.streaming() {
            for delta in answer_deltas(&response.answer) {
                emitter.send(TurnEvent::AnswerDelta { delta }).await?;
            }
            emitter.response(ResponsePhase::Final, &response).await?;
            emitter.send(TurnEvent::Done).await?;
        }

        tracing::info!(
            turn_id = %turn.id,
            route = planned.plan.route.as_str(),
            confidence = ?response.confidence,
            "turn answered"
        );
        Ok(TurnResult {
            turn_id: turn.id,
            created_at: turn.created_at_iso(),
            response,
        })
    }
}

fn note_session_depth(response: &mut AgentResponse, session_id: Option<&str>, depth: usize) {
    if session_id.is_some() {
        response
            .assumptions
            .push(format!("Session memory depth: {depth} prior message(s) in context."));
    }
}

async fn finish_with_error(emitter: &Emitter, err: &TurnError) {
    let _ = emitter
        .send(TurnEvent::Error {
            message: err.to_string(),
        })
        .await;
    let _ = emitter.send(TurnEvent::Done).await;
}
