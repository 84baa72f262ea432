//! Backend for OpenAI-compatible chat-completion APIs.
//!
//! [`OpenAiBackend`] covers OpenRouter (the default provider), OpenAI, vLLM,
//! llama.cpp server, LM Studio, Groq and any other `/v1/chat/completions`
//! endpoint.

use super::{Backend, LlmRequest, LlmResponse, Usage};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

const REQUEST_PREVIEW: usize = 200;
const RESPONSE_PREVIEW: usize = 300;

/// Backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use staged_generation::backend::OpenAiBackend;
///
/// let backend = OpenAiBackend::new();
/// let with_key = OpenAiBackend::new().with_api_key("sk-or-...");
/// ```
#[derive(Clone)]
pub struct OpenAiBackend {
    /// Optional API key. If set, sent as `Authorization: Bearer {key}`.
    pub(crate) api_key: Option<String>,
    /// Optional organization ID. If set, sent as `OpenAI-Organization: {org}`.
    pub(crate) organization: Option<String>,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("api_key", &self.api_key.as_ref().map(|k| {
                if k.chars().count() > 6 {
                    format!("{}***", k.chars().take(6).collect::<String>())
                } else {
                    "***".to_string()
                }
            }))
            .field("organization", &self.organization)
            .finish()
    }
}

impl OpenAiBackend {
    /// Create a new OpenAI-compatible backend without authentication.
    pub fn new() -> Self {
        Self {
            api_key: None,
            organization: None,
        }
    }

    /// Set the API key for authentication.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the organization ID header.
    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    /// Returns `true` if an API key has been configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Build the request body for `/v1/chat/completions`.
    fn build_body(request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.config.temperature,
        });

        if let Some(max_tokens) = request.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(ref rf) = request.config.response_format {
            body["response_format"] = rf.to_body();
        }

        body
    }

    /// Parse a `Retry-After` header value as seconds.
    fn parse_retry_after(value: &str) -> Option<std::time::Duration> {
        value
            .trim()
            .parse::<u64>()
            .ok()
            .map(std::time::Duration::from_secs)
    }

    /// Build the reqwest request with appropriate headers.
    fn build_http_request(
        &self,
        client: &Client,
        url: &str,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let mut req = client.post(url).json(body);

        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org.as_str());
        }

        req
    }

    /// Extract the answer, usage and finish reason from a decoded response.
    fn parse_response(json_resp: &Value, status: u16) -> Result<LlmResponse> {
        let choice = json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or(PipelineError::EmptyResponse)?;

        let text = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let usage = json_resp
            .get("usage")
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());

        Ok(LlmResponse {
            text,
            status,
            usage,
            finish_reason,
        })
    }
}

impl Default for OpenAiBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn transport_error(err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Timeout
    } else {
        PipelineError::Request(err)
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let base = base_url.trim_end_matches('/');
        let url = format!("{}/v1/chat/completions", base);
        let body = Self::build_body(request);

        debug!(
            model = %request.model,
            temperature = request.config.temperature,
            messages = request.messages.len(),
            "LLM request"
        );
        for (i, msg) in request.messages.iter().enumerate() {
            debug!(
                index = i + 1,
                role = %msg.role,
                content = %preview(&msg.content, REQUEST_PREVIEW),
                "LLM request message"
            );
        }

        let resp = self
            .build_http_request(client, &url, &body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status().as_u16();

        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::HttpError {
                status,
                body: text,
                retry_after,
            });
        }

        let raw = resp.text().await.map_err(transport_error)?;
        let json_resp: Value = serde_json::from_str(&raw)?;
        let response = Self::parse_response(&json_resp, status)?;

        debug!(response = %preview(&response.text, RESPONSE_PREVIEW), "LLM response");
        Ok(response)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatMessage, Role};
    use crate::client::LlmConfig;

    fn test_request() -> LlmRequest {
        LlmRequest::user("openai/gpt-oss-20b:free", "Why is the sky blue?")
    }

    #[test]
    fn test_openai_backend_chat_payload() {
        let mut request = test_request();
        request.messages.insert(0, ChatMessage::new(Role::System, "Be brief."));

        let body = OpenAiBackend::build_body(&request);

        assert_eq!(body["model"], "openai/gpt-oss-20b:free");
        assert_eq!(body["temperature"], 0.7);
        assert!(body.get("max_tokens").is_none());

        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "Why is the sky blue?");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_openai_backend_json_schema() {
        let mut request = test_request();
        request.config = LlmConfig::default()
            .with_temperature(0.2)
            .with_json_schema(json!({"type": "object"}));

        let body = OpenAiBackend::build_body(&request);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["type"], "object");
    }

    #[test]
    fn test_parse_response_with_usage() {
        let raw = json!({
            "choices": [{"message": {"content": "Rayleigh."}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
        });
        let resp = OpenAiBackend::parse_response(&raw, 200).unwrap();
        assert_eq!(resp.text, "Rayleigh.");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().total_tokens, 12);
    }

    #[test]
    fn test_parse_response_without_choices_is_empty() {
        let raw = json!({"choices": []});
        assert!(matches!(
            OpenAiBackend::parse_response(&raw, 200),
            Err(PipelineError::EmptyResponse)
        ));
    }

    #[test]
    fn test_openai_backend_auth_header() {
        let backend = OpenAiBackend::new()
            .with_api_key("sk-test123")
            .with_organization("org-abc");

        let req = backend
            .build_http_request(&Client::new(), "https://openrouter.ai/api/v1/chat/completions", &json!({}))
            .build()
            .expect("build request");

        assert_eq!(req.headers().get("Authorization").expect("auth"), "Bearer sk-test123");
        assert_eq!(req.headers().get("OpenAI-Organization").expect("org"), "org-abc");
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(
            OpenAiBackend::parse_retry_after(" 30 "),
            Some(std::time::Duration::from_secs(30))
        );
        assert_eq!(OpenAiBackend::parse_retry_after("soon"), None);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let backend = OpenAiBackend::new().with_api_key("sk-1234567890abcdef");
        let debug_output = format!("{:?}", backend);
        assert!(!debug_output.contains("1234567890abcdef"));
        assert!(debug_output.contains("sk-123"));
        assert!(debug_output.contains("***"));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("привет", 3), "при...");
        assert_eq!(preview("ok", 3), "ok");
    }
}
