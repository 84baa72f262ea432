//! Stage-by-stage generation driver.
//!
//! [`PipelineScheduler::run`] resolves the user's active definition, consumes
//! the carried context, runs every stage in declared order with a hard
//! barrier between stages, stores the new carried context and returns the
//! final stage's text. Whenever the pipeline cannot run (no definition, an
//! invalid one, or a failure or panic while stages run) it degrades to one direct call
//! with the user request. `run` never returns an error.
//!
//! ```text
//! NotStarted ─► ConfigResolved ─► Stage_1 ─► … ─► Stage_N ─► Finalized
//!      │               │             │                ▲
//!      └───────────────┴─────────────┴──► Fallback ───┘
//! ```

use crate::backend::{ChatMessage, Role};
use crate::client::LlmConfig;
use crate::config::{self, PipelineConfig};
use crate::config_store::ConfigSource;
use crate::context_store::{ContextStore, SavedContextEntry};
use crate::error::Result;
use crate::events::{emit, Event};
use crate::exec_ctx::ExecCtx;
use crate::executor::{PromptExecutor, StagePromptResult};
use crate::prompt;
use crate::PipelineError;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Observer of stage transitions: `(status_text, stage_index)`, 1-based.
pub type StatusCallback<'a> = &'a (dyn Fn(&str, usize) + Send + Sync);

/// How the final text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Staged,
    Direct,
}

/// Results of one stage, blocked ones included.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub name: String,
    pub results: Vec<StagePromptResult>,
}

/// Everything one generation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub text: String,
    pub mode: GenerationMode,
    pub stages: Vec<StageReport>,
    /// Entries stored for the user's next generation.
    pub saved_context: Vec<SavedContextEntry>,
    /// LLM calls issued, fallback included.
    pub total_requests: usize,
    /// Per-prompt failures and the reason for a fallback, if any.
    pub errors: Vec<String>,
}

impl GenerationReport {
    fn direct(text: String, requests: usize, errors: Vec<String>) -> Self {
        Self {
            text,
            mode: GenerationMode::Direct,
            stages: Vec::new(),
            saved_context: Vec::new(),
            total_requests: requests,
            errors,
        }
    }

    /// Results of the named stage.
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Drives multi-stage generation for a user.
///
/// # Example
///
/// ```no_run
/// use staged_generation::{ExecCtx, InMemoryConfigStore, InMemoryContextStore, PipelineScheduler};
/// use std::sync::Arc;
///
/// # async fn demo() {
/// let ctx = Arc::new(ExecCtx::builder("https://openrouter.ai/api/v1").openai_with_key("sk-or-...").build());
/// let configs = Arc::new(InMemoryConfigStore::new());
/// let scheduler = PipelineScheduler::new(ctx, configs, Arc::new(InMemoryContextStore::new()));
///
/// let text = scheduler.run("Как работает ИИ?", "user-1", None).await;
/// # }
/// ```
pub struct PipelineScheduler {
    ctx: Arc<ExecCtx>,
    configs: Arc<dyn ConfigSource>,
    contexts: Arc<dyn ContextStore>,
    executor: PromptExecutor,
}

impl PipelineScheduler {
    pub fn new(
        ctx: Arc<ExecCtx>,
        configs: Arc<dyn ConfigSource>,
        contexts: Arc<dyn ContextStore>,
    ) -> Self {
        Self {
            executor: PromptExecutor::new(ctx.clone()),
            ctx,
            configs,
            contexts,
        }
    }

    pub fn context_store(&self) -> &Arc<dyn ContextStore> {
        &self.contexts
    }

    pub fn ctx(&self) -> &Arc<ExecCtx> {
        &self.ctx
    }

    /// Whether the user has an active definition, valid or not. A failing
    /// config source counts as active so that [`run`](Self::run) reports it.
    pub async fn has_active_config(&self, user_id: &str) -> bool {
        !matches!(self.configs.active_config(user_id).await, Ok(None))
    }

    /// Generate the answer to `user_request`. Always yields text.
    pub async fn run(
        &self,
        user_request: &str,
        user_id: &str,
        status: Option<StatusCallback<'_>>,
    ) -> String {
        self.run_detailed(user_request, user_id, status).await.text
    }

    /// Like [`run`](Self::run), with per-stage bookkeeping.
    pub async fn run_detailed(
        &self,
        user_request: &str,
        user_id: &str,
        status: Option<StatusCallback<'_>>,
    ) -> GenerationReport {
        let config = match self.resolve_config(user_id).await {
            Ok(config) => config,
            Err(reason) => return self.fallback(user_request, user_id, reason).await,
        };

        let staged = AssertUnwindSafe(self.run_stages(&config, user_request, user_id, status))
            .catch_unwind()
            .await;
        let outcome = match staged {
            Ok(outcome) => outcome,
            Err(panic) => Err(PipelineError::Other(panic_message(panic.as_ref()))),
        };

        match outcome {
            Ok(report) => {
                emit(
                    &self.ctx.event_handler,
                    Event::GenerationEnd {
                        user_id: user_id.to_string(),
                        staged: true,
                        requests: report.total_requests,
                    },
                );
                report
            }
            Err(e) => {
                error!(user_id, error = %e, "staged generation failed");
                self.fallback(user_request, user_id, format!("staged generation failed: {}", e))
                    .await
            }
        }
    }

    /// Fetch and validate the active definition. `Err` holds the fallback reason.
    async fn resolve_config(&self, user_id: &str) -> std::result::Result<PipelineConfig, String> {
        let raw = match self.configs.active_config(user_id).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!(user_id, "no active staged config, using direct generation");
                return Err("no active config".to_string());
            }
            Err(e) => {
                error!(user_id, error = %e, "failed to load active config");
                return Err(format!("config source failed: {}", e));
            }
        };

        config::validate(&raw).map_err(|e| {
            warn!(user_id, error = %e, "active config is invalid, using direct generation");
            format!("invalid config: {}", e)
        })
    }

    async fn run_stages(
        &self,
        config: &PipelineConfig,
        user_request: &str,
        user_id: &str,
        status: Option<StatusCallback<'_>>,
    ) -> Result<GenerationReport> {
        info!(user_id, stages = config.len(), "starting staged generation");

        let carried = self.contexts.take_and_clear(user_id).await;
        emit(
            &self.ctx.event_handler,
            Event::GenerationStart {
                user_id: user_id.to_string(),
                carried: carried.len(),
            },
        );

        let total = config.len();
        let mut history: Vec<(String, Vec<String>)> = Vec::with_capacity(total);
        let mut stages = Vec::with_capacity(total);
        let mut saved_context = Vec::new();
        let mut errors = Vec::new();
        let mut total_requests = 0;

        for (i, stage) in config.stages().iter().enumerate() {
            let index = i + 1;
            if let Some(cb) = status {
                cb(&format!("Этап {}: {}", index, stage.name), index);
            }
            emit(
                &self.ctx.event_handler,
                Event::StageStart {
                    index,
                    total,
                    name: stage.name.clone(),
                    sequential: stage.is_sequential(),
                },
            );

            let stage_context = prompt::stage_context(user_request, &carried, &history);
            debug!(stage = %stage.name, context_len = stage_context.len(), "stage context built");

            let outcome = self.executor.execute_stage(stage, &stage_context).await;
            total_requests += outcome.results.len();

            let failures = outcome.failures();
            errors.extend(
                outcome
                    .results
                    .iter()
                    .filter_map(|r| r.error.as_ref())
                    .map(|e| format!("{}: {}", stage.name, e)),
            );
            emit(
                &self.ctx.event_handler,
                Event::StageEnd {
                    name: stage.name.clone(),
                    failures,
                },
            );

            history.push((stage.name.clone(), outcome.context_eligible()));
            saved_context.extend(outcome.saved);
            stages.push(StageReport {
                name: stage.name.clone(),
                results: outcome.results,
            });
        }

        self.contexts.replace(user_id, saved_context.clone()).await;

        let text = final_text(stages.last())?;
        info!(user_id, requests = total_requests, saved = saved_context.len(), "staged generation finished");

        Ok(GenerationReport {
            text,
            mode: GenerationMode::Staged,
            stages,
            saved_context,
            total_requests,
            errors,
        })
    }

    /// One direct call with the user request as the only message.
    async fn fallback(&self, user_request: &str, user_id: &str, reason: String) -> GenerationReport {
        warn!(user_id, reason = %reason, "falling back to direct generation");
        emit(
            &self.ctx.event_handler,
            Event::Fallback {
                user_id: user_id.to_string(),
                reason: reason.clone(),
            },
        );

        let request = self.ctx.request(
            vec![ChatMessage::new(Role::User, user_request)],
            LlmConfig::default(),
        );
        let mut errors = vec![reason];
        let text = match self.ctx.complete(&request).await {
            Ok(response) => response.text,
            Err(e) => {
                error!(user_id, error = %e, "direct generation failed");
                errors.push(e.to_string());
                prompt::generation_error(&e)
            }
        };

        emit(
            &self.ctx.event_handler,
            Event::GenerationEnd {
                user_id: user_id.to_string(),
                staged: false,
                requests: 1,
            },
        );
        GenerationReport::direct(text, 1, errors)
    }
}

impl std::fmt::Debug for PipelineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineScheduler")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// A single final result verbatim, several joined by a blank line.
fn final_text(last: Option<&StageReport>) -> Result<String> {
    let results = match last {
        Some(stage) if !stage.results.is_empty() => &stage.results,
        _ => return Err(PipelineError::Other("final stage produced no results".into())),
    };
    Ok(match results.as_slice() {
        [only] => only.text.clone(),
        many => many
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
    })
}
