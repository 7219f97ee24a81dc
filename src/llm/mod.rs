//! LLM Dispatcher (spec §4.4): one neutral call translated into five wire
//! protocols, plus `extractCode` post-processing of the returned text.
//!
//! Grounded on `vault/llm.rs`'s `OpenRouterClient` (bearer auth, 5-shaped
//! chat-completion request/response, `.context()`-style error reporting)
//! generalized from a single OpenRouter wire format to the per-provider
//! translation table spec §4.4 requires; `parse_decision_dsl`'s
//! line-oriented strip/trim idiom informs `extract_code`'s fence handling.

use crate::domain::ProviderType;
use crate::exchange::backoff::retry_with_backoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, Error, Clone)]
pub enum LlmError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connect error: {0}")]
    ConnectError(String),
    #[error("rate limited: {0}")]
    RateLimited(String, Option<u64>),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("auth error: {0}")]
    AuthError(String),
    #[error("permanent api error: {0}")]
    PermanentApiError(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    /// Transient errors retry with backoff at the call site (spec §7 policy).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::ConnectError(_) | LlmError::RateLimited(_, _) | LlmError::ServerError(_)
        )
    }

    /// The `Retry-After` value carried by a 429, when the provider sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited(_, Some(secs)) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// `config` of spec §4.4: unrecognized options for a given provider type
/// are dropped silently by the translation layer, never by the caller.
#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
}

pub struct LlmDispatcher {
    http: reqwest::Client,
}

impl Default for LlmDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmDispatcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build LLM HTTP client"),
        }
    }

    /// `GenerateStrategyCode` (spec §4.4): protocol translation per
    /// `provider_type`, uniform 5-minute timeout, `extract_code` applied to
    /// the normalized completion text before returning.
    pub async fn generate_strategy_code(
        &self,
        provider_type: ProviderType,
        base_url: &str,
        api_key: &str,
        model_name: &str,
        system_text: &str,
        user_prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, LlmError> {
        let raw = match provider_type {
            ProviderType::Openai | ProviderType::AzureOpenai | ProviderType::Deepseek => {
                self.call_openai_style(base_url, api_key, model_name, system_text, user_prompt, config)
                    .await?
            }
            ProviderType::Anthropic => {
                self.call_anthropic(base_url, api_key, model_name, system_text, user_prompt, config)
                    .await?
            }
            ProviderType::Gemini => {
                self.call_gemini(base_url, api_key, model_name, system_text, user_prompt, config)
                    .await?
            }
            ProviderType::Other => {
                return Err(LlmError::PermanentApiError(
                    "no wire protocol defined for provider type 'other'".to_string(),
                ))
            }
        };
        Ok(extract_code(&raw))
    }

    async fn call_openai_style(
        &self,
        base_url: &str,
        api_key: &str,
        model_name: &str,
        system_text: &str,
        user_prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, LlmError> {
        let body = OpenAiChatRequest {
            model: model_name.to_string(),
            messages: vec![
                OpenAiMessage {
                    role: "system".to_string(),
                    content: system_text.to_string(),
                },
                OpenAiMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
        };

        let url = format!("{base_url}/chat/completions");
        let text = retry_with_backoff(
            "llm_openai_style",
            MAX_RETRY_ATTEMPTS,
            LlmError::is_retryable,
            LlmError::retry_after,
            || async {
                let resp = self
                    .http
                    .post(&url)
                    .bearer_auth(api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let status = resp.status();
                let headers = resp.headers().clone();
                let text = resp.text().await.unwrap_or_default();
                classify_status(status, &headers, &text)?;
                Ok(text)
            },
        )
        .await?;

        let parsed: OpenAiChatResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::MalformedResponse("no choices in response".to_string()))
    }

    async fn call_anthropic(
        &self,
        base_url: &str,
        api_key: &str,
        model_name: &str,
        system_text: &str,
        user_prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, LlmError> {
        let body = AnthropicRequest {
            model: model_name.to_string(),
            system: system_text.to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: user_prompt.to_string(),
            }],
            max_tokens: config.max_tokens.unwrap_or(4096),
            temperature: config.temperature,
            top_p: config.top_p,
        };

        let url = format!("{base_url}/messages");
        let text = retry_with_backoff(
            "llm_anthropic",
            MAX_RETRY_ATTEMPTS,
            LlmError::is_retryable,
            LlmError::retry_after,
            || async {
                let resp = self
                    .http
                    .post(&url)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let status = resp.status();
                let headers = resp.headers().clone();
                let text = resp.text().await.unwrap_or_default();
                classify_status(status, &headers, &text)?;
                Ok(text)
            },
        )
        .await?;

        let parsed: AnthropicResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        parsed
            .content
            .into_iter()
            .find_map(|b| b.text)
            .ok_or_else(|| LlmError::MalformedResponse("no text content block in response".to_string()))
    }

    async fn call_gemini(
        &self,
        base_url: &str,
        api_key: &str,
        model_name: &str,
        system_text: &str,
        user_prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, LlmError> {
        let combined = format!("{system_text}\n\n{user_prompt}");
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: combined }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: config.temperature,
                max_output_tokens: config.max_tokens,
                top_p: config.top_p,
                top_k: config.top_k,
            },
        };

        let url = format!("{base_url}/{model_name}:generateContent?key={api_key}");
        let text = retry_with_backoff(
            "llm_gemini",
            MAX_RETRY_ATTEMPTS,
            LlmError::is_retryable,
            LlmError::retry_after,
            || async {
                let resp = self.http.post(&url).json(&body).send().await.map_err(map_reqwest_err)?;
                let status = resp.status();
                let headers = resp.headers().clone();
                let text = resp.text().await.unwrap_or_default();
                classify_status(status, &headers, &text)?;
                Ok(text)
            },
        )
        .await?;

        let parsed: GeminiResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| LlmError::MalformedResponse("no candidates in response".to_string()))
    }
}

fn classify_status(status: reqwest::StatusCode, headers: &reqwest::header::HeaderMap, body: &str) -> Result<(), LlmError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        401 | 403 => Err(LlmError::AuthError(body.to_string())),
        429 => Err(LlmError::RateLimited(body.to_string(), retry_after_secs(headers))),
        500..=599 => Err(LlmError::ServerError(body.to_string())),
        _ => Err(LlmError::PermanentApiError(format!("{status}: {body}"))),
    }
}

/// Parses a numeric `Retry-After: <seconds>` header. The HTTP-date form is
/// not produced by any of the providers this dispatcher calls, so it is
/// treated the same as a missing header.
fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()
}

fn map_reqwest_err(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(e.to_string())
    } else {
        LlmError::ConnectError(e.to_string())
    }
}

/// Strips JSON wrappers (`{"code"|"strategy_code": "…"}`), markdown fences
/// (```` ```python ```` / ``` ``` ```), then de-escapes literal
/// `\n \t \r \\ \" \'` sequences (spec §4.4).
pub fn extract_code(raw: &str) -> String {
    let trimmed = raw.trim();

    let unwrapped = if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        value
            .get("code")
            .or_else(|| value.get("strategy_code"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| trimmed.to_string())
    } else {
        trimmed.to_string()
    };

    let defenced = strip_markdown_fence(&unwrapped);
    de_escape(&defenced)
}

fn strip_markdown_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let after_open = &trimmed[3..];
    let after_lang = match after_open.find('\n') {
        Some(i) => &after_open[i + 1..],
        None => after_open,
    };
    let body = after_lang.strip_suffix("```").unwrap_or(after_lang);
    body.trim().to_string()
}

fn de_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('n') => {
                    out.push('\n');
                    chars.next();
                }
                Some('t') => {
                    out.push('\t');
                    chars.next();
                }
                Some('r') => {
                    out.push('\r');
                    chars.next();
                }
                Some('\\') => {
                    out.push('\\');
                    chars.next();
                }
                Some('"') => {
                    out.push('"');
                    chars.next();
                }
                Some('\'') => {
                    out.push('\'');
                    chars.next();
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    system: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(rename = "topK", skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_code_strips_json_wrapper_and_fence() {
        let raw = r#"{"code": "```python\nprint(1)\n```"}"#;
        assert_eq!(extract_code(raw), "print(1)");
    }

    #[test]
    fn extract_code_plain_fence_no_language() {
        let raw = "```\nACTION=BUY\n```";
        assert_eq!(extract_code(raw), "ACTION=BUY");
    }

    #[test]
    fn extract_code_de_escapes_literal_sequences() {
        let raw = r#"line1\nline2\ttabbed"#;
        assert_eq!(extract_code(raw), "line1\nline2\ttabbed");
    }

    #[test]
    fn extract_code_strategy_code_key_variant() {
        let raw = r#"{"strategy_code": "ACTION=SELL"}"#;
        assert_eq!(extract_code(raw), "ACTION=SELL");
    }

    #[test]
    fn extract_code_passthrough_when_no_wrapper() {
        assert_eq!(extract_code("ACTION=HOLD"), "ACTION=HOLD");
    }

    #[test]
    fn classify_status_reads_retry_after_header_on_429() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "30".parse().unwrap());
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, &headers, "slow down").unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_status_rate_limited_without_header_has_no_retry_after() {
        let headers = reqwest::header::HeaderMap::new();
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, &headers, "slow down").unwrap_err();
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn auth_error_is_not_retryable() {
        let headers = reqwest::header::HeaderMap::new();
        let err = classify_status(reqwest::StatusCode::UNAUTHORIZED, &headers, "nope").unwrap_err();
        assert!(!err.is_retryable());
    }
}
