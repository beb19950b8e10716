use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{ChatMessage, ChatRequest, InferenceEngine, StreamEvent};
use crate::models::NewMessage;
use crate::services::history::{HistoryError, HistoryStore};
use crate::services::settings::AppSettings;

/// Replaces the assistant message when the user stops generation.
pub const CANCELLED_NOTICE: &str = "Generation stopped by user.";

/// Replaces the assistant message when the engine fails.
pub const FAILURE_NOTICE: &str = "⚠️ Error streaming response.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Submitting,
    Streaming,
}

/// Why a submission was not started. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    EngineUnavailable,
    Busy,
    EmptyInput,
}

/// How a call to [`ChatController::submit`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Rejected(Rejection),
    Completed { content: String },
    Cancelled,
    Failed { error: String },
}

/// Progress reported while a cycle runs, for redrawing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleEvent {
    /// The user turn and the empty assistant placeholder are in the history.
    Opened,
    /// The full assistant text received so far.
    Token { accumulated: String },
}

struct ControllerState {
    phase: Phase,
    input: String,
    engine: Option<Arc<dyn InferenceEngine>>,
    cancel_token: Option<CancellationToken>,
}

/// Drives one submit → stream → finish cycle at a time against the engine,
/// writing every step into the history store.
pub struct ChatController {
    history: Arc<HistoryStore>,
    system_prompt: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    state: Mutex<ControllerState>,
}

/// Puts the controller back in `Idle` on every exit path of a cycle.
struct CycleGuard<'a> {
    state: &'a Mutex<ControllerState>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.phase = Phase::Idle;
        state.cancel_token = None;
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ChatController {
    pub fn new(history: Arc<HistoryStore>, settings: &AppSettings) -> Self {
        Self {
            history,
            system_prompt: settings.system_prompt.clone(),
            temperature: settings.request_temperature(),
            max_tokens: settings.max_tokens,
            state: Mutex::new(ControllerState {
                phase: Phase::Idle,
                input: String::new(),
                engine: None,
                cancel_token: None,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn attach_engine(&self, engine: Arc<dyn InferenceEngine>) {
        tracing::info!("Engine ready: {}", engine.model());
        self.lock_state().engine = Some(engine);
    }

    pub fn has_engine(&self) -> bool {
        self.lock_state().engine.is_some()
    }

    pub fn phase(&self) -> Phase {
        self.lock_state().phase
    }

    pub fn set_input(&self, text: impl Into<String>) {
        self.lock_state().input = text.into();
    }

    pub fn input(&self) -> String {
        self.lock_state().input.clone()
    }

    pub fn can_submit(&self) -> bool {
        let state = self.lock_state();
        state.engine.is_some() && state.phase == Phase::Idle && !state.input.trim().is_empty()
    }

    /// Signal the running cycle to stop. Returns `false` when nothing runs.
    pub fn stop(&self) -> bool {
        match &self.lock_state().cancel_token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Two-turn prompt: the system instruction and the user's text.
    pub fn build_request(&self, prompt: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![
                ChatMessage::system(&self.system_prompt),
                ChatMessage::user(prompt),
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    fn begin_cycle(
        &self,
    ) -> Result<(Arc<dyn InferenceEngine>, String, CancellationToken), Rejection> {
        let mut state = self.lock_state();
        let engine = state.engine.clone().ok_or(Rejection::EngineUnavailable)?;
        if state.phase != Phase::Idle {
            return Err(Rejection::Busy);
        }

        let prompt = state.input.trim().to_string();
        if prompt.is_empty() {
            return Err(Rejection::EmptyInput);
        }

        let cancel_token = CancellationToken::new();
        state.phase = Phase::Submitting;
        state.cancel_token = Some(cancel_token.clone());
        Ok((engine, prompt, cancel_token))
    }

    /// Submit the current input and stream the reply into the history.
    ///
    /// Cancellation and engine failures end the cycle normally and are
    /// reported through the outcome; only history write failures are
    /// returned as errors.
    pub async fn submit<F>(&self, mut on_event: F) -> Result<CycleOutcome, HistoryError>
    where
        F: FnMut(CycleEvent) + Send,
    {
        let (engine, prompt, cancel_token) = match self.begin_cycle() {
            Ok(cycle) => cycle,
            Err(rejection) => {
                tracing::debug!("Submission ignored: {:?}", rejection);
                return Ok(CycleOutcome::Rejected(rejection));
            }
        };
        let _guard = CycleGuard { state: &self.state };

        self.history.append(NewMessage::user(prompt.as_str()))?;
        self.lock_state().input.clear();

        let request = self.build_request(&prompt);
        self.history.append(NewMessage::assistant(""))?;
        on_event(CycleEvent::Opened);

        self.lock_state().phase = Phase::Streaming;
        let outcome = self
            .consume_stream(engine, request, &cancel_token, &mut on_event)
            .await?;

        match &outcome {
            CycleOutcome::Completed { content } => {
                tracing::debug!("Generation completed ({} bytes)", content.len());
            }
            CycleOutcome::Cancelled => {
                tracing::info!("Generation stopped by user");
                self.history.update_last(CANCELLED_NOTICE)?;
            }
            CycleOutcome::Failed { error } => {
                tracing::error!("Streaming error: {}", error);
                self.history.update_last(FAILURE_NOTICE)?;
            }
            CycleOutcome::Rejected(_) => {}
        }

        Ok(outcome)
    }

    async fn consume_stream<F>(
        &self,
        engine: Arc<dyn InferenceEngine>,
        request: ChatRequest,
        cancel_token: &CancellationToken,
        on_event: &mut F,
    ) -> Result<CycleOutcome, HistoryError>
    where
        F: FnMut(CycleEvent) + Send,
    {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

        // Dropping the receiver and aborting the task leaves the rest of the
        // stream unread once the cycle is over.
        let mut stream_task = AbortOnDrop(tokio::spawn(async move {
            if let Err(e) = engine.stream_completion(request, tx.clone()).await {
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            }
        }));

        let mut accumulated = String::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return Ok(CycleOutcome::Cancelled),
                event = rx.recv() => event,
            };

            match event {
                Some(StreamEvent::Token(token)) => {
                    accumulated.push_str(&token);
                    self.history.update_last(&accumulated)?;
                    on_event(CycleEvent::Token {
                        accumulated: accumulated.clone(),
                    });
                }
                Some(StreamEvent::Done {
                    tokens_in,
                    tokens_out,
                }) => {
                    tracing::debug!(
                        "Stream done, tokens in: {:?}, out: {:?}",
                        tokens_in,
                        tokens_out
                    );
                    return Ok(CycleOutcome::Completed {
                        content: accumulated,
                    });
                }
                Some(StreamEvent::Error(error)) => {
                    return Ok(CycleOutcome::Failed { error });
                }
                None => {
                    // The channel closes without a final event when the
                    // engine task dies, so look at how it ended.
                    return Ok(match (&mut stream_task.0).await {
                        Err(e) if e.is_panic() => CycleOutcome::Failed {
                            error: "Engine task panicked".to_string(),
                        },
                        _ => CycleOutcome::Completed {
                            content: accumulated,
                        },
                    });
                }
            }
        }
    }
}
