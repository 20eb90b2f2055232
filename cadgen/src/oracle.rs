//! Oracle abstraction for LLM chat completion.
//!
//! The [`Oracle`] trait decouples generation orchestration from the actual
//! completion backend (currently an OpenRouter-compatible chat endpoint).
//! Tests use scripted oracles that return predetermined responses without
//! network access.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Role tag for a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged block in an oracle conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Parameters for a single completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    /// Model identifier understood by the backend.
    pub model: &'a str,
    /// Sampling temperature.
    pub temperature: f64,
    /// Network timeout for the whole request.
    pub timeout: Duration,
}

/// Abstraction over completion backends.
///
/// Implementations must be callable concurrently from multiple worker
/// threads without shared mutable state.
pub trait Oracle: Send + Sync {
    /// Complete the conversation, returning the assistant's free-form text.
    fn complete(&self, messages: &[Message], request: &CompletionRequest<'_>) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// Oracle backed by an OpenRouter-compatible chat completions endpoint.
pub struct OpenRouterClient {
    base_url: String,
    api_key: String,
}

impl OpenRouterClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn send(&self, messages: &[Message], request: &CompletionRequest<'_>) -> Result<String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request.timeout)
            .build()
            .context("build http client")?;

        let body = ChatRequest {
            model: request.model,
            messages,
            temperature: request.temperature,
            stream: false,
        };

        let response = client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .context("send completion request")?;

        let status = response.status();
        let text = response.text().context("read completion response")?;
        if !status.is_success() {
            return Err(anyhow!("completion request failed with {status}: {text}"));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .with_context(|| format!("parse completion response: {text}"))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("completion response had no choices"))
    }
}

impl Oracle for OpenRouterClient {
    #[instrument(skip_all, fields(model = request.model, temperature = request.temperature))]
    fn complete(&self, messages: &[Message], request: &CompletionRequest<'_>) -> Result<String> {
        match self.send(messages, request) {
            Ok(content) => {
                debug!(chars = content.len(), "completion received");
                Ok(content)
            }
            Err(first) => {
                // One immediate retry absorbs transient backend flakiness;
                // persistent failures surface to the caller, which treats
                // them as a skipped attempt.
                warn!(err = %first, "completion failed, retrying once");
                self.send(messages, request)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roles_serialize_lowercase() {
        let msg = Message {
            role: Role::Assistant,
            content: "hi".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn chat_request_serializes_expected_shape() {
        let messages = vec![Message::user("make a cube")];
        let body = ChatRequest {
            model: "some/model",
            messages: &messages,
            temperature: 0.4,
            stream: false,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains(r#""model":"some/model""#));
        assert!(json.contains(r#""temperature":0.4"#));
        assert!(json.contains(r#""stream":false"#));
    }

    #[test]
    fn chat_response_parses_first_choice() {
        let raw = r#"{"choices":[{"message":{"content":"<code>x = 1</code>"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "<code>x = 1</code>");
    }
}
