//! Answering a chat message.
//!
//! [`ResponseSession`] owns the message lifecycle around the generation. A
//! user with an active stage definition gets [`PipelineScheduler::run_detailed`]
//! with its stage statuses forwarded to the [`MessageStore`]. A user without
//! one gets the standard three-step answer: a primary call over the bounded
//! chat history, a trimming edit and a relevance check, where a failed edit
//! or check keeps the text from the step before. Runs of the same user are
//! serialized, so the carried context of one generation is never raced by
//! another.
//!
//! Stopping a message is a soft cancel. The in-flight calls finish, and
//! their result is dropped instead of overwriting the stopped message.

use crate::backend::{ChatMessage, Role};
use crate::client::LlmConfig;
use crate::error::Result;
use crate::scheduler::{GenerationMode, GenerationReport, PipelineScheduler};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Status shown before the first stage starts.
pub const INITIAL_STATUS: &str = "Запускаю поэтапную генерацию...";

/// Content of a freshly created assistant message.
pub const PENDING_CONTENT: &str = "Генерирую ответ...";

/// Chat history sent with the standard answer, in characters.
pub const HISTORY_CHAR_LIMIT: usize = 64_000;

pub const PRIMARY_STATUS: &str = "Генерирую первичный ответ...";
pub const EDIT_STATUS: &str = "Убираю лишнюю информацию...";
pub const VERIFY_STATUS: &str = "Проверяю соответствие ответа...";

const MISSING_REQUEST: &str = "Ошибка: не найдено сообщение пользователя";

const EDIT_SYSTEM: &str = "Ты редактор текста. Убери из ответа лишнюю воду, оставь только суть. Сохрани полезную информацию, но сделай текст более кратким и точным.";
const VERIFY_SYSTEM: &str = "Проверь, отвечает ли данный текст на вопрос пользователя. Если да, верни текст как есть. Если нет, исправь его так, чтобы он точно отвечал на вопрос.";

const EDIT_TEMPERATURE: f64 = 0.3;
const VERIFY_TEMPERATURE: f64 = 0.2;

/// Persistence of the assistant message being generated.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Record progress: `stage` is 1-based.
    async fn update_status(&self, message_id: &str, text: &str, stage: usize);

    /// Store the final content and mark the message done.
    async fn finalize(&self, message_id: &str, content: &str);

    /// Store an error as the content and mark the message done.
    async fn fail(&self, message_id: &str, content: &str);

    async fn is_generating(&self, message_id: &str) -> bool;

    /// Mark the message as no longer generating. Returns `false` for an
    /// unknown or already finished message.
    async fn stop(&self, message_id: &str) -> bool;

    /// Finished messages of the chat before `message_id`, oldest first.
    ///
    /// Messages are taken newest first while their total length stays
    /// within `max_chars`; the first one that would overflow ends the history.
    async fn history(&self, message_id: &str, max_chars: usize) -> Vec<ChatMessage>;

    /// Keep the per-message generation log. Stores without a place for it
    /// drop it.
    async fn save_log(&self, _message_id: &str, _log: &GenerationLog) {}
}

/// Which path produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationType {
    Staged,
    Standard,
}

/// One LLM call as it ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedRequest {
    pub response: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedStage {
    pub stage: String,
    pub requests: Vec<LoggedRequest>,
}

/// What one generation did, stored next to the message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationLog {
    pub generation_type: GenerationType,
    pub stages: Vec<LoggedStage>,
    pub total_requests: usize,
    pub elapsed_ms: u64,
    pub final_response: String,
    pub errors: Vec<String>,
}

impl GenerationLog {
    fn new(generation_type: GenerationType) -> Self {
        Self {
            generation_type,
            stages: Vec::new(),
            total_requests: 0,
            elapsed_ms: 0,
            final_response: String::new(),
            errors: Vec::new(),
        }
    }

    fn from_report(report: &GenerationReport) -> Self {
        let mut log = Self::new(GenerationType::Staged);
        log.stages = report
            .stages
            .iter()
            .map(|stage| LoggedStage {
                stage: stage.name.clone(),
                requests: stage
                    .results
                    .iter()
                    .map(|r| LoggedRequest {
                        response: r.text.clone(),
                        error: r.error.clone(),
                    })
                    .collect(),
            })
            .collect();
        if report.mode == GenerationMode::Direct {
            log.stages.push(LoggedStage {
                stage: "direct".to_string(),
                requests: vec![LoggedRequest {
                    response: report.text.clone(),
                    error: None,
                }],
            });
        }
        log.total_requests = report.total_requests;
        log.final_response = report.text.clone();
        log.errors = report.errors.clone();
        log
    }

    fn record(&mut self, stage: &str, outcome: std::result::Result<&str, String>) {
        let request = match outcome {
            Ok(text) => LoggedRequest {
                response: text.to_string(),
                error: None,
            },
            Err(e) => {
                self.errors.push(format!("{}: {}", stage, e));
                LoggedRequest {
                    response: String::new(),
                    error: Some(e),
                }
            }
        };
        self.total_requests += 1;
        self.stages.push(LoggedStage {
            stage: stage.to_string(),
            requests: vec![request],
        });
    }
}

/// Where a message is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePhase {
    /// Generating; holds the 1-based stage.
    Generating(usize),
    Done,
    Stopped,
    Failed,
}

/// Snapshot of a stored message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageState {
    pub role: Role,
    pub content: String,
    pub status_text: String,
    pub phase: MessagePhase,
    pub log: Option<GenerationLog>,
}

impl MessageState {
    pub fn is_generating(&self) -> bool {
        matches!(self.phase, MessagePhase::Generating(_))
    }
}

#[derive(Debug, Default)]
struct Chat {
    messages: HashMap<String, MessageState>,
    order: Vec<String>,
}

/// Process-local [`MessageStore`] holding a single chat.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    chat: Mutex<Chat>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending assistant message.
    pub fn create(&self, message_id: &str) {
        self.insert(
            message_id,
            MessageState {
                role: Role::Assistant,
                content: PENDING_CONTENT.to_string(),
                status_text: String::new(),
                phase: MessagePhase::Generating(1),
                log: None,
            },
        );
    }

    /// Append a finished message, e.g. the user's question.
    pub fn push(&self, message_id: &str, role: Role, content: &str) {
        self.insert(
            message_id,
            MessageState {
                role,
                content: content.to_string(),
                status_text: String::new(),
                phase: MessagePhase::Done,
                log: None,
            },
        );
    }

    pub fn get(&self, message_id: &str) -> Option<MessageState> {
        self.lock().messages.get(message_id).cloned()
    }

    fn insert(&self, message_id: &str, state: MessageState) {
        let mut chat = self.lock();
        if chat.messages.insert(message_id.to_string(), state).is_none() {
            chat.order.push(message_id.to_string());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Chat> {
        self.chat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, message_id: &str, content: &str, phase: MessagePhase) {
        if let Some(m) = self.lock().messages.get_mut(message_id) {
            m.content = content.to_string();
            m.phase = phase;
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn update_status(&self, message_id: &str, text: &str, stage: usize) {
        if let Some(m) = self.lock().messages.get_mut(message_id) {
            if m.is_generating() {
                m.status_text = text.to_string();
                m.phase = MessagePhase::Generating(stage);
            }
        }
    }

    async fn finalize(&self, message_id: &str, content: &str) {
        self.finish(message_id, content, MessagePhase::Done);
    }

    async fn fail(&self, message_id: &str, content: &str) {
        self.finish(message_id, content, MessagePhase::Failed);
    }

    async fn is_generating(&self, message_id: &str) -> bool {
        self.lock()
            .messages
            .get(message_id)
            .map(MessageState::is_generating)
            .unwrap_or(false)
    }

    async fn stop(&self, message_id: &str) -> bool {
        match self.lock().messages.get_mut(message_id) {
            Some(m) if m.is_generating() => {
                m.phase = MessagePhase::Stopped;
                true
            }
            _ => false,
        }
    }

    async fn history(&self, message_id: &str, max_chars: usize) -> Vec<ChatMessage> {
        let chat = self.lock();
        let end = chat
            .order
            .iter()
            .position(|id| id == message_id)
            .unwrap_or(chat.order.len());

        let mut picked = Vec::new();
        let mut total = 0;
        for id in chat.order[..end].iter().rev() {
            let Some(m) = chat.messages.get(id) else { continue };
            if m.is_generating() {
                continue;
            }
            let len = m.content.chars().count();
            if total + len > max_chars {
                break;
            }
            total += len;
            picked.push(ChatMessage::new(m.role, m.content.as_str()));
        }
        picked.reverse();
        picked
    }

    async fn save_log(&self, message_id: &str, log: &GenerationLog) {
        if let Some(m) = self.lock().messages.get_mut(message_id) {
            m.log = Some(log.clone());
        }
    }
}

type UserLock = Arc<tokio::sync::Mutex<()>>;

/// Runs generations for chat messages, one at a time per user.
pub struct ResponseSession {
    scheduler: Arc<PipelineScheduler>,
    messages: Arc<dyn MessageStore>,
    /// Only users with a run in progress or waiting have an entry.
    user_locks: Mutex<HashMap<String, UserLock>>,
}

impl ResponseSession {
    pub fn new(scheduler: Arc<PipelineScheduler>, messages: Arc<dyn MessageStore>) -> Self {
        Self {
            scheduler,
            messages,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Generate the answer to `request` into `message_id`.
    ///
    /// Returns the text written to the message, or `None` when no answer was
    /// written (the message was stopped, the request was empty, or the
    /// primary call of the standard answer failed).
    pub async fn respond(&self, user_id: &str, message_id: &str, request: &str) -> Option<String> {
        if request.trim().is_empty() {
            warn!(user_id, message_id, "no user request to answer");
            self.messages.fail(message_id, MISSING_REQUEST).await;
            return None;
        }

        let lock = self.user_lock(user_id);
        let guard = lock.lock().await;
        debug!(user_id, message_id, "generation slot acquired");

        let written = self.respond_locked(user_id, message_id, request).await;

        drop(guard);
        self.release_user_lock(user_id, lock);
        written
    }

    /// Soft-cancel a message. In-flight calls are not interrupted.
    pub async fn stop(&self, message_id: &str) -> bool {
        self.messages.stop(message_id).await
    }

    async fn respond_locked(&self, user_id: &str, message_id: &str, request: &str) -> Option<String> {
        let started = Instant::now();
        let (outcome, mut log) = if self.scheduler.has_active_config(user_id).await {
            self.staged(user_id, message_id, request).await
        } else {
            info!(user_id, message_id, "no active stage definition, using standard answer");
            self.standard(message_id, request).await
        };
        log.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.messages.save_log(message_id, &log).await;

        if !self.messages.is_generating(message_id).await {
            info!(user_id, message_id, "message stopped during generation, result discarded");
            return None;
        }

        match outcome {
            Ok(text) => {
                self.messages.finalize(message_id, &text).await;
                Some(text)
            }
            Err(e) => {
                warn!(user_id, message_id, error = %e, "standard answer failed");
                let content = format!("Ошибка генерации: Ошибка первичной генерации: {}", e);
                self.messages.fail(message_id, &content).await;
                None
            }
        }
    }

    async fn staged(
        &self,
        user_id: &str,
        message_id: &str,
        request: &str,
    ) -> (Result<String>, GenerationLog) {
        self.messages.update_status(message_id, INITIAL_STATUS, 1).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(String, usize)>();
        let forward = {
            let messages = self.messages.clone();
            let message_id = message_id.to_string();
            tokio::spawn(async move {
                while let Some((text, stage)) = rx.recv().await {
                    messages.update_status(&message_id, &text, stage).await;
                }
            })
        };

        let status = move |text: &str, stage: usize| {
            // receiver only closes after the run
            let _ = tx.send((text.to_string(), stage));
        };
        let report = self
            .scheduler
            .run_detailed(request, user_id, Some(&status))
            .await;
        drop(status);
        if let Err(e) = forward.await {
            warn!(message_id, error = %e, "status forwarder failed");
        }

        let log = GenerationLog::from_report(&report);
        (Ok(report.text), log)
    }

    /// Primary answer over the chat history, then trim, then relevance check.
    async fn standard(&self, message_id: &str, request: &str) -> (Result<String>, GenerationLog) {
        let ctx = self.scheduler.ctx();
        let mut log = GenerationLog::new(GenerationType::Standard);

        self.messages.update_status(message_id, PRIMARY_STATUS, 1).await;
        let mut conversation = self.messages.history(message_id, HISTORY_CHAR_LIMIT).await;
        let asked = matches!(
            conversation.last(),
            Some(last) if last.role == Role::User && last.content == request
        );
        if !asked {
            conversation.push(ChatMessage::new(Role::User, request));
        }

        let primary = match ctx.complete(&ctx.request(conversation, LlmConfig::default())).await {
            Ok(response) => response.text,
            Err(e) => {
                log.record(PRIMARY_STATUS, Err(e.to_string()));
                return (Err(e), log);
            }
        };
        log.record(PRIMARY_STATUS, Ok(primary.as_str()));

        self.messages.update_status(message_id, EDIT_STATUS, 2).await;
        let edited = self
            .refine(
                &mut log,
                EDIT_STATUS,
                EDIT_SYSTEM,
                format!("Исходный вопрос: {}\n\nОтвет для редактирования: {}", request, primary),
                EDIT_TEMPERATURE,
                primary,
            )
            .await;

        self.messages.update_status(message_id, VERIFY_STATUS, 3).await;
        let verified = self
            .refine(
                &mut log,
                VERIFY_STATUS,
                VERIFY_SYSTEM,
                format!("Вопрос: {}\n\nОтвет: {}", request, edited),
                VERIFY_TEMPERATURE,
                edited,
            )
            .await;

        log.final_response = verified.clone();
        (Ok(verified), log)
    }

    /// One rewrite of `previous`. A failed call keeps `previous`.
    async fn refine(
        &self,
        log: &mut GenerationLog,
        step: &str,
        system: &str,
        task: String,
        temperature: f64,
        previous: String,
    ) -> String {
        let ctx = self.scheduler.ctx();
        let request = ctx.request(
            vec![
                ChatMessage::new(Role::System, system),
                ChatMessage::new(Role::User, task),
            ],
            LlmConfig::default().with_temperature(temperature),
        );
        match ctx.complete(&request).await {
            Ok(response) => {
                log.record(step, Ok(response.text.as_str()));
                response.text
            }
            Err(e) => {
                warn!(step, error = %e, "refinement failed, keeping previous text");
                log.record(step, Err(e.to_string()));
                previous
            }
        }
    }

    fn user_lock(&self, user_id: &str) -> UserLock {
        self.user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    fn release_user_lock(&self, user_id: &str, lock: UserLock) {
        let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // the map and `lock` itself; anyone else is still waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(user_id);
        }
    }
}

impl std::fmt::Debug for ResponseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSession")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
