//! Prompt rendering and stage-context assembly.
//!
//! Everything the model sees is built here: the per-stage context block,
//! the classic `context + task` prompt, structured message lists with
//! `{context}` substituted, and the placeholder text of a failed call.

use crate::backend::{ChatMessage, Role};
use crate::client::LlmConfig;
use crate::config::PromptSpec;
use crate::context_store::SavedContextEntry;
use std::fmt::Display;

/// Placeholder replaced by the stage context inside structured messages.
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

const TASK_PREFIX: &str = "\n\nЗадача: ";
const PREVIOUS_STEP_PREFIX: &str = "\n\nРезультат предыдущего шага: ";

/// Context-eligible results of the stages that already ran, in stage order.
pub type StageHistory = [(String, Vec<String>)];

/// Build the context handed to every prompt of a stage.
///
/// ```
/// use staged_generation::prompt::stage_context;
///
/// let history = vec![("a".to_string(), vec!["R(X)".to_string()])];
/// let ctx = stage_context("вопрос", &[], &history);
/// assert_eq!(
///     ctx,
///     "Исходный вопрос пользователя: вопрос\n\nРезультаты предыдущих этапов:\n\na:\n  1. R(X)"
/// );
/// ```
pub fn stage_context(
    user_request: &str,
    carried: &[SavedContextEntry],
    history: &StageHistory,
) -> String {
    let mut parts = vec![format!("Исходный вопрос пользователя: {}", user_request)];

    if !carried.is_empty() {
        parts.push("\nКонтекст из предыдущей генерации:".to_string());
        for entry in carried {
            parts.push(format!("Промпт: {}", entry.prompt));
            parts.push(format!("Ответ: {}", entry.response));
            parts.push(String::new());
        }
    }

    if !history.is_empty() {
        parts.push("\nРезультаты предыдущих этапов:".to_string());
        for (stage, responses) in history {
            parts.push(format!("\n{}:", stage));
            parts.extend(
                responses
                    .iter()
                    .enumerate()
                    .map(|(i, r)| format!("  {}. {}", i + 1, r)),
            );
        }
    }

    parts.join("\n")
}

/// `context` followed by the task line.
pub fn classic_prompt(context: &str, task: &str) -> String {
    format!("{}{}{}", context, TASK_PREFIX, task)
}

/// Extend a running sequential context with the result of the previous step.
pub fn append_previous_step(context: &mut String, result: &str) {
    context.push_str(PREVIOUS_STEP_PREFIX);
    context.push_str(result);
}

/// Substitute `{context}` into every message content.
pub fn substitute_context(messages: &[ChatMessage], context: &str) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage::new(m.role, m.content.replace(CONTEXT_PLACEHOLDER, context)))
        .collect()
}

/// Render a prompt against a context into messages and call settings.
pub fn render(spec: &PromptSpec, context: &str) -> (Vec<ChatMessage>, LlmConfig) {
    match spec {
        PromptSpec::Classic(p) => (
            vec![ChatMessage::new(Role::User, classic_prompt(context, &p.text))],
            LlmConfig::default(),
        ),
        PromptSpec::Structured(p) => {
            let mut config = LlmConfig::default();
            if let Some(t) = p.temperature {
                config = config.with_temperature(t);
            }
            if let Some(ref schema) = p.json_schema {
                config = config.with_json_schema(schema.clone());
            }
            (substitute_context(&p.messages, context), config)
        }
    }
}

/// Text stored in a result slot whose call failed.
pub fn generation_error(err: impl Display) -> String {
    format!("[Ошибка генерации: {}]", err)
}
