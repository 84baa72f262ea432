//! Pipeline definitions and their validation.
//!
//! A pipeline definition is a JSON object mapping stage names to lists of
//! prompt objects. [`validate`] turns such a value into a [`PipelineConfig`]:
//! an explicit, ordered sequence of stages whose order is the declaration
//! order of the source document (`serde_json` is built with
//! `preserve_order`, so object keys are never re-sorted).
//!
//! ```
//! use staged_generation::config;
//! use serde_json::json;
//!
//! let raw = json!({
//!     "stage1": [{"prompt": "Analyze", "saveLastAsContext": true}],
//!     "stage2": [{"prompt": "Summarize"}]
//! });
//! let cfg = config::validate(&raw).unwrap();
//! assert_eq!(cfg.stage_names(), vec!["stage1", "stage2"]);
//! ```

use crate::backend::{ChatMessage, Role};
use serde_json::{Map, Value};

/// Config key of the carry-over flag.
pub const SAVE_AS_CONTEXT: &str = "saveLastAsContext";
/// Config key of the exclude-from-later-stages flag.
pub const BLOCK_FROM_CONTEXT: &str = "blockOutsideInterstageContext";
/// Config key of the sequential-batch flag.
pub const STEP_BY_STEP: &str = "stepByStepRequest";

/// Why a pipeline definition was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config is not valid JSON: {0}")]
    Parse(String),

    #[error("config must be an object of stage name -> prompt list")]
    NotAnObject,

    #[error("config has no stages")]
    Empty,

    #[error("stage '{stage}' is not a list")]
    StageNotList { stage: String },

    #[error("stage '{stage}' has no prompts")]
    EmptyStage { stage: String },

    #[error("prompt {index} in stage '{stage}' is not an object")]
    PromptNotObject { stage: String, index: usize },

    #[error("prompt {index} in stage '{stage}' has no string 'prompt' field")]
    MissingPrompt { stage: String, index: usize },

    #[error("prompt {index} in stage '{stage}' has empty text")]
    EmptyPrompt { stage: String, index: usize },

    #[error("prompt {index} in stage '{stage}': '{flag}' must be a boolean")]
    FlagNotBool {
        stage: String,
        index: usize,
        flag: &'static str,
    },

    #[error("prompt {index} in stage '{stage}': 'messages' must be a non-empty list")]
    EmptyMessages { stage: String, index: usize },

    #[error("prompt {index} in stage '{stage}': message {message} is not an object")]
    MessageNotObject {
        stage: String,
        index: usize,
        message: usize,
    },

    #[error("prompt {index} in stage '{stage}': message {message} has invalid role {role}")]
    InvalidRole {
        stage: String,
        index: usize,
        message: usize,
        role: String,
    },

    #[error("prompt {index} in stage '{stage}': message {message} has no string 'content'")]
    MissingContent {
        stage: String,
        index: usize,
        message: usize,
    },

    #[error("prompt {index} in stage '{stage}': 'json_schema' must be an object")]
    SchemaNotObject { stage: String, index: usize },

    #[error("prompt {index} in stage '{stage}': 'json_schema' has no 'type'")]
    SchemaMissingType { stage: String, index: usize },

    #[error("prompt {index} in stage '{stage}': 'temperature' must be a number")]
    TemperatureNotNumber { stage: String, index: usize },
}

/// The three per-prompt behaviour flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptFlags {
    /// Carry `{prompt, response}` into the user's next generation.
    pub save_as_context: bool,
    /// Hide this prompt's result from later stages' context.
    pub block_from_context: bool,
    /// Force the whole batch containing this prompt to run sequentially.
    pub step_by_step: bool,
}

/// A free-text prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassicPrompt {
    pub text: String,
    pub flags: PromptFlags,
}

/// A prompt given as an explicit message list.
///
/// Message contents may contain a `{context}` placeholder that is replaced by
/// the stage context at execution time.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredPrompt {
    pub messages: Vec<ChatMessage>,
    pub json_schema: Option<Value>,
    pub temperature: Option<f64>,
    pub flags: PromptFlags,
}

/// One unit of work within a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptSpec {
    Classic(ClassicPrompt),
    Structured(StructuredPrompt),
}

impl PromptSpec {
    pub fn flags(&self) -> PromptFlags {
        match self {
            PromptSpec::Classic(p) => p.flags,
            PromptSpec::Structured(p) => p.flags,
        }
    }

    /// Text recorded as the `prompt` of a carried context entry.
    ///
    /// For structured prompts this is the raw content of the last `user`
    /// message, or of the last message when there is no user message.
    pub fn prompt_text(&self) -> &str {
        match self {
            PromptSpec::Classic(p) => &p.text,
            PromptSpec::Structured(p) => p
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .or_else(|| p.messages.last())
                .map(|m| m.content.as_str())
                .unwrap_or_default(),
        }
    }
}

/// A named group of prompts executed together.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    pub name: String,
    pub prompts: Vec<PromptSpec>,
}

impl StageConfig {
    /// Whether any prompt in the stage asks for step-by-step execution.
    pub fn is_sequential(&self) -> bool {
        self.prompts.iter().any(|p| p.flags().step_by_step)
    }
}

/// A validated pipeline: never empty, every stage has at least one prompt,
/// stages in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    stages: Vec<StageConfig>,
}

impl PipelineConfig {
    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always `false` for a validated config; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The final stage, whose results form the answer.
    pub fn last_stage(&self) -> &StageConfig {
        // validate() guarantees at least one stage
        &self.stages[self.stages.len() - 1]
    }
}

/// Validate a raw pipeline definition.
///
/// Rules are checked in document order and the first failure is returned.
pub fn validate(raw: &Value) -> Result<PipelineConfig, ConfigError> {
    let obj = raw.as_object().ok_or(ConfigError::NotAnObject)?;
    if obj.is_empty() {
        return Err(ConfigError::Empty);
    }

    let mut stages = Vec::with_capacity(obj.len());
    for (name, items) in obj {
        let items = items.as_array().ok_or_else(|| ConfigError::StageNotList {
            stage: name.clone(),
        })?;
        if items.is_empty() {
            return Err(ConfigError::EmptyStage {
                stage: name.clone(),
            });
        }

        let prompts = items
            .iter()
            .enumerate()
            .map(|(index, item)| parse_prompt(name, index, item))
            .collect::<Result<Vec<_>, _>>()?;

        stages.push(StageConfig {
            name: name.clone(),
            prompts,
        });
    }

    Ok(PipelineConfig { stages })
}

/// `true` when [`validate`] would accept the definition.
pub fn is_valid(raw: &Value) -> bool {
    validate(raw).is_ok()
}

/// Parse and validate a JSON document.
pub fn parse_str(text: &str) -> Result<PipelineConfig, ConfigError> {
    let raw: Value = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&raw)
}

/// Parse and validate a YAML document (mapping order is kept).
#[cfg(feature = "yaml")]
pub fn from_yaml_str(text: &str) -> Result<PipelineConfig, ConfigError> {
    let raw: Value = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&raw)
}

fn parse_prompt(stage: &str, index: usize, item: &Value) -> Result<PromptSpec, ConfigError> {
    let obj = item.as_object().ok_or_else(|| ConfigError::PromptNotObject {
        stage: stage.to_string(),
        index,
    })?;

    if obj.contains_key("messages") {
        parse_structured(stage, index, obj).map(PromptSpec::Structured)
    } else {
        parse_classic(stage, index, obj).map(PromptSpec::Classic)
    }
}

fn parse_classic(
    stage: &str,
    index: usize,
    obj: &Map<String, Value>,
) -> Result<ClassicPrompt, ConfigError> {
    let text = obj
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::MissingPrompt {
            stage: stage.to_string(),
            index,
        })?;
    if text.trim().is_empty() {
        return Err(ConfigError::EmptyPrompt {
            stage: stage.to_string(),
            index,
        });
    }

    Ok(ClassicPrompt {
        text: text.to_string(),
        flags: parse_flags(stage, index, obj)?,
    })
}

fn parse_structured(
    stage: &str,
    index: usize,
    obj: &Map<String, Value>,
) -> Result<StructuredPrompt, ConfigError> {
    let raw_messages = obj
        .get("messages")
        .and_then(Value::as_array)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ConfigError::EmptyMessages {
            stage: stage.to_string(),
            index,
        })?;

    let mut messages = Vec::with_capacity(raw_messages.len());
    for (message, raw) in raw_messages.iter().enumerate() {
        let m = raw.as_object().ok_or_else(|| ConfigError::MessageNotObject {
            stage: stage.to_string(),
            index,
            message,
        })?;

        let role = m
            .get("role")
            .and_then(Value::as_str)
            .and_then(|r| r.parse::<Role>().ok())
            .ok_or_else(|| ConfigError::InvalidRole {
                stage: stage.to_string(),
                index,
                message,
                role: m.get("role").map(Value::to_string).unwrap_or_else(|| "(missing)".into()),
            })?;

        let content = m
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::MissingContent {
                stage: stage.to_string(),
                index,
                message,
            })?;

        messages.push(ChatMessage::new(role, content));
    }

    let json_schema = match obj.get("json_schema") {
        None => None,
        Some(Value::Object(schema)) => {
            if !schema.contains_key("type") {
                return Err(ConfigError::SchemaMissingType {
                    stage: stage.to_string(),
                    index,
                });
            }
            Some(Value::Object(schema.clone()))
        }
        Some(_) => {
            return Err(ConfigError::SchemaNotObject {
                stage: stage.to_string(),
                index,
            })
        }
    };

    let temperature = match obj.get("temperature") {
        None => None,
        Some(v) => Some(v.as_f64().ok_or_else(|| ConfigError::TemperatureNotNumber {
            stage: stage.to_string(),
            index,
        })?),
    };

    Ok(StructuredPrompt {
        messages,
        json_schema,
        temperature,
        flags: parse_flags(stage, index, obj)?,
    })
}

fn parse_flags(
    stage: &str,
    index: usize,
    obj: &Map<String, Value>,
) -> Result<PromptFlags, ConfigError> {
    let flag = |key: &'static str| -> Result<bool, ConfigError> {
        match obj.get(key) {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(ConfigError::FlagNotBool {
                stage: stage.to_string(),
                index,
                flag: key,
            }),
        }
    };

    Ok(PromptFlags {
        save_as_context: flag(SAVE_AS_CONTEXT)?,
        block_from_context: flag(BLOCK_FROM_CONTEXT)?,
        step_by_step: flag(STEP_BY_STEP)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_order_follows_declaration() {
        let cfg = parse_str(
            r#"{"zeta": [{"prompt": "z"}], "alpha": [{"prompt": "a"}], "mid": [{"prompt": "m"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.stage_names(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(cfg.last_stage().name, "mid");
    }

    #[test]
    fn test_classic_flags_parsed() {
        let cfg = validate(&json!({
            "s": [{
                "prompt": "P",
                "saveLastAsContext": true,
                "blockOutsideInterstageContext": true,
                "stepByStepRequest": false
            }]
        }))
        .unwrap();
        let prompt = &cfg.stages()[0].prompts[0];
        assert_eq!(prompt.prompt_text(), "P");
        assert_eq!(
            prompt.flags(),
            PromptFlags {
                save_as_context: true,
                block_from_context: true,
                step_by_step: false,
            }
        );
        assert!(!cfg.stages()[0].is_sequential());
    }

    #[test]
    fn test_structured_prompt_parsed() {
        let cfg = validate(&json!({
            "s": [{
                "messages": [
                    {"role": "system", "content": "Rules"},
                    {"role": "user", "content": "Use {context}"}
                ],
                "json_schema": {"type": "object"},
                "temperature": 0.2,
                "stepByStepRequest": true
            }]
        }))
        .unwrap();
        match &cfg.stages()[0].prompts[0] {
            PromptSpec::Structured(p) => {
                assert_eq!(p.messages.len(), 2);
                assert_eq!(p.messages[0].role, Role::System);
                assert_eq!(p.json_schema, Some(json!({"type": "object"})));
                assert_eq!(p.temperature, Some(0.2));
                assert!(p.flags.step_by_step);
            }
            other => panic!("expected structured prompt, got {:?}", other),
        }
        assert_eq!(cfg.stages()[0].prompts[0].prompt_text(), "Use {context}");
        assert!(cfg.stages()[0].is_sequential());
    }

    #[test]
    fn test_rejects_empty_config() {
        assert_eq!(validate(&json!({})), Err(ConfigError::Empty));
        assert_eq!(validate(&json!([])), Err(ConfigError::NotAnObject));
        assert!(!is_valid(&json!("stage1")));
    }

    #[test]
    fn test_rejects_empty_stage() {
        assert_eq!(
            validate(&json!({"s": []})),
            Err(ConfigError::EmptyStage { stage: "s".into() })
        );
        assert_eq!(
            validate(&json!({"s": "not a list"})),
            Err(ConfigError::StageNotList { stage: "s".into() })
        );
    }

    #[test]
    fn test_rejects_classic_without_prompt() {
        assert_eq!(
            validate(&json!({"s": [{"no_prompt": "x"}]})),
            Err(ConfigError::MissingPrompt {
                stage: "s".into(),
                index: 0
            })
        );
        assert!(matches!(
            validate(&json!({"s": [{"prompt": "   "}]})),
            Err(ConfigError::EmptyPrompt { .. })
        ));
        assert!(matches!(
            validate(&json!({"s": [123]})),
            Err(ConfigError::PromptNotObject { index: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_role() {
        let err = validate(&json!({
            "s": [{"messages": [{"role": "tool", "content": "x"}]}]
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRole { message: 0, .. }));
    }

    #[test]
    fn test_rejects_schema_without_type() {
        let err = validate(&json!({
            "s": [{
                "messages": [{"role": "user", "content": "x"}],
                "json_schema": {"properties": {}}
            }]
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::SchemaMissingType { .. }));

        let err = validate(&json!({
            "s": [{"messages": [{"role": "user", "content": "x"}], "json_schema": "object"}]
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::SchemaNotObject { .. }));
    }

    #[test]
    fn test_rejects_bad_structured_fields() {
        assert!(matches!(
            validate(&json!({"s": [{"messages": []}]})),
            Err(ConfigError::EmptyMessages { .. })
        ));
        assert!(matches!(
            validate(&json!({"s": [{"messages": [{"role": "user"}]}]})),
            Err(ConfigError::MissingContent { .. })
        ));
        assert!(matches!(
            validate(&json!({"s": [{"messages": [{"role": "user", "content": "x"}], "temperature": "hot"}]})),
            Err(ConfigError::TemperatureNotNumber { .. })
        ));
    }

    #[test]
    fn test_rejects_non_bool_flag() {
        let err = validate(&json!({"s": [{"prompt": "P", "saveLastAsContext": "yes"}]})).unwrap_err();
        assert_eq!(
            err,
            ConfigError::FlagNotBool {
                stage: "s".into(),
                index: 0,
                flag: SAVE_AS_CONTEXT
            }
        );
    }

    #[test]
    fn test_first_failure_wins() {
        let err = validate(&json!({
            "a": [{"prompt": "ok"}, {"prompt": 5}],
            "b": []
        }))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingPrompt {
                stage: "a".into(),
                index: 1
            }
        );
    }

    #[test]
    fn test_parse_str_reports_bad_json() {
        assert!(matches!(parse_str("{not json"), Err(ConfigError::Parse(_))));
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_yaml_keeps_order() {
        let cfg = from_yaml_str("second:\n  - prompt: B\nfirst:\n  - prompt: A\n").unwrap();
        assert_eq!(cfg.stage_names(), vec!["second", "first"]);
    }
}
