//! LLM provider collaborator.
//!
//! Nodes depend only on the `ChatModel` trait; prompt content is the
//! node's business and the transport is this module's. The hosted
//! implementation speaks the OpenAI-compatible chat-completions dialect
//! the LiteLLM proxy exposes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("llm response had no choices")]
    EmptyResponse,
    #[error("llm configuration error: {0}")]
    Configuration(String),
}

/// A chat completion collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Client for the LiteLLM proxy configured via
/// `BUTTERCUP_LITELLM_HOSTNAME` and `BUTTERCUP_LITELLM_KEY`.
pub struct LiteLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LiteLlmClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    /// Configuration from the environment; missing variables are fatal.
    pub fn from_env(model: String) -> Result<Self, LlmError> {
        let base_url = std::env::var("BUTTERCUP_LITELLM_HOSTNAME").map_err(|_| {
            LlmError::Configuration("BUTTERCUP_LITELLM_HOSTNAME is not set".into())
        })?;
        let api_key = std::env::var("BUTTERCUP_LITELLM_KEY")
            .map_err(|_| LlmError::Configuration("BUTTERCUP_LITELLM_KEY is not set".into()))?;
        Ok(Self::new(base_url, api_key, model))
    }
}

#[async_trait]
impl ChatModel for LiteLlmClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.2,
        };
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }
        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_against_litellm_dialect() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "the root cause is..."}}]
            })))
            .mount(&server)
            .await;

        let client = LiteLlmClient::new(server.uri(), "key".into(), "claude".into());
        let answer = client.complete("system", "why did it crash?").await.unwrap();
        assert_eq!(answer, "the root cause is...");
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let client = LiteLlmClient::new(server.uri(), "key".into(), "claude".into());
        let err = client.complete("s", "p").await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
    }
}
