use serde_json::{json, Value};

/// Default sampling temperature for every call that does not set one.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Requested shape of the model's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    /// Strict JSON output matching the given JSON Schema object.
    JsonSchema(Value),
}

impl ResponseFormat {
    /// Render as the `response_format` body field of a chat-completions request.
    pub fn to_body(&self) -> Value {
        match self {
            ResponseFormat::JsonSchema(schema) => json!({
                "type": "json_schema",
                "json_schema": schema,
            }),
        }
    }
}

/// Configuration for LLM requests.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f64,

    /// Maximum tokens to generate. `None` leaves it to the provider.
    pub max_tokens: Option<u32>,

    /// Optional structured-output constraint.
    pub response_format: Option<ResponseFormat>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
            response_format: None,
        }
    }
}

impl LlmConfig {
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn with_json_schema(mut self, schema: Value) -> Self {
        self.response_format = Some(ResponseFormat::JsonSchema(schema));
        self
    }
}
