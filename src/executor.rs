//! Execution of one stage's batch of prompts.
//!
//! A batch runs in parallel unless any prompt in it sets
//! `stepByStepRequest`, in which case the whole batch runs one prompt at a
//! time and each result is appended to the context of the next one.
//! Parallel calls are bounded by the [`ExecCtx`] call pool.
//!
//! A failed call never fails the batch: its slot holds
//! `"[Ошибка генерации: <error>]"` and the siblings carry on.

use crate::config::{PromptSpec, StageConfig};
use crate::context_store::SavedContextEntry;
use crate::events::{emit, Event};
use crate::exec_ctx::ExecCtx;
use crate::prompt;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one prompt in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePromptResult {
    /// Model answer, or the formatted error text when the call failed.
    pub text: String,
    /// Excluded from later stages' context (still part of this stage's results).
    pub block_from_context: bool,
    /// The call error, when the call failed.
    pub error: Option<String>,
}

impl StagePromptResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything a batch produced, in prompt order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    pub results: Vec<StagePromptResult>,
    /// Pairs from prompts flagged `saveLastAsContext`.
    pub saved: Vec<SavedContextEntry>,
}

impl StageOutcome {
    /// Every result text, blocked ones included.
    pub fn texts(&self) -> Vec<String> {
        self.results.iter().map(|r| r.text.clone()).collect()
    }

    /// Result texts later stages may see.
    pub fn context_eligible(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.block_from_context)
            .map(|r| r.text.clone())
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.is_ok()).count()
    }
}

/// Runs batches of prompts against the shared execution context.
#[derive(Debug, Clone)]
pub struct PromptExecutor {
    ctx: Arc<ExecCtx>,
}

impl PromptExecutor {
    pub fn new(ctx: Arc<ExecCtx>) -> Self {
        Self { ctx }
    }

    /// Execute a batch against `context`.
    pub async fn execute(&self, prompts: &[PromptSpec], context: &str) -> StageOutcome {
        self.run_batch("", prompts, context).await
    }

    /// Execute a configured stage against `context`. Events and logs carry the stage name.
    pub async fn execute_stage(&self, stage: &StageConfig, context: &str) -> StageOutcome {
        self.run_batch(&stage.name, &stage.prompts, context).await
    }

    async fn run_batch(&self, stage: &str, prompts: &[PromptSpec], context: &str) -> StageOutcome {
        let sequential = prompts.iter().any(|p| p.flags().step_by_step);
        debug!(stage, prompts = prompts.len(), sequential, "executing batch");

        let results = if sequential {
            let mut running = context.to_string();
            let mut results = Vec::with_capacity(prompts.len());
            for (index, spec) in prompts.iter().enumerate() {
                let result = self.call_one(stage, index, spec, &running).await;
                prompt::append_previous_step(&mut running, &result.text);
                results.push(result);
            }
            results
        } else {
            join_all(
                prompts
                    .iter()
                    .enumerate()
                    .map(|(index, spec)| self.call_one(stage, index, spec, context)),
            )
            .await
        };

        let saved = prompts
            .iter()
            .zip(&results)
            .filter(|(spec, _)| spec.flags().save_as_context)
            .map(|(spec, result)| SavedContextEntry {
                prompt: spec.prompt_text().to_string(),
                response: result.text.clone(),
            })
            .collect();

        StageOutcome { results, saved }
    }

    async fn call_one(
        &self,
        stage: &str,
        index: usize,
        spec: &PromptSpec,
        context: &str,
    ) -> StagePromptResult {
        let (messages, config) = prompt::render(spec, context);
        let request = self.ctx.request(messages, config);
        let block_from_context = spec.flags().block_from_context;

        let result = match self.ctx.complete(&request).await {
            Ok(response) => StagePromptResult {
                text: response.text,
                block_from_context,
                error: None,
            },
            Err(e) => {
                warn!(stage, prompt_index = index, error = %e, "prompt generation failed");
                StagePromptResult {
                    text: prompt::generation_error(&e),
                    block_from_context,
                    error: Some(e.to_string()),
                }
            }
        };

        emit(
            &self.ctx.event_handler,
            Event::PromptEnd {
                stage: stage.to_string(),
                index,
                ok: result.is_ok(),
            },
        );
        result
    }
}
