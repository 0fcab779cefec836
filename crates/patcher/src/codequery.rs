//! Static-analysis code-query collaborator.
//!
//! The program-model service indexes the task's sources; the patcher only
//! depends on this query contract: look up definitions by identifier and
//! classify paths as fuzzer/harness code.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::state::CodeSnippet;

#[derive(Debug, Error)]
pub enum CodeQueryError {
    #[error("code query http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("code query returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Query contract against the code index of one task.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeQuery: Send + Sync {
    /// Definitions of `identifier`, optionally narrowed by a path hint.
    async fn find_definitions<'a>(
        &'a self,
        identifier: &'a str,
        path_hint: Option<&'a str>,
    ) -> Result<Vec<CodeSnippet>, CodeQueryError>;

    /// Whether a path belongs to fuzzer or harness code rather than the
    /// project itself.
    async fn is_harness_path(&self, path: &str) -> Result<bool, CodeQueryError>;

    /// The project's declared implementation language ("c", "c++", "jvm").
    async fn project_language(&self) -> Result<String, CodeQueryError>;
}

#[derive(Deserialize)]
struct DefinitionResponse {
    definitions: Vec<DefinitionEntry>,
}

#[derive(Deserialize)]
struct DefinitionEntry {
    file_path: String,
    start_line: u64,
    end_line: u64,
    content: String,
}

#[derive(Deserialize)]
struct HarnessPathResponse {
    is_harness: bool,
}

#[derive(Deserialize)]
struct LanguageResponse {
    language: String,
}

/// HTTP client against the program-model server, scoped to one task.
pub struct CodeQueryClient {
    http: reqwest::Client,
    base_url: String,
    task_id: String,
}

impl CodeQueryClient {
    pub fn new(base_url: String, task_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            task_id,
        }
    }

    async fn get<R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<R, CodeQueryError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CodeQueryError::Status { status, body });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl CodeQuery for CodeQueryClient {
    async fn find_definitions<'a>(
        &'a self,
        identifier: &'a str,
        path_hint: Option<&'a str>,
    ) -> Result<Vec<CodeSnippet>, CodeQueryError> {
        let mut query = vec![("task_id", self.task_id.as_str()), ("name", identifier)];
        if let Some(hint) = path_hint {
            query.push(("path", hint));
        }
        let parsed: DefinitionResponse = self.get("/v1/definitions", &query).await?;
        Ok(parsed
            .definitions
            .into_iter()
            .map(|d| CodeSnippet {
                identifier: identifier.to_string(),
                file_path: d.file_path,
                start_line: d.start_line,
                end_line: d.end_line,
                content: d.content,
            })
            .collect())
    }

    async fn is_harness_path(&self, path: &str) -> Result<bool, CodeQueryError> {
        let parsed: HarnessPathResponse = self
            .get(
                "/v1/harness_path",
                &[("task_id", self.task_id.as_str()), ("path", path)],
            )
            .await?;
        Ok(parsed.is_harness)
    }

    async fn project_language(&self) -> Result<String, CodeQueryError> {
        let parsed: LanguageResponse = self
            .get("/v1/language", &[("task_id", self.task_id.as_str())])
            .await?;
        Ok(parsed.language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_definitions() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/definitions"))
            .and(query_param("name", "png_read_row"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "definitions": [{
                    "file_path": "src/pngread.c",
                    "start_line": 540,
                    "end_line": 560,
                    "content": "void png_read_row(...) { ... }"
                }]
            })))
            .mount(&server)
            .await;

        let client = CodeQueryClient::new(server.uri(), "t1".into());
        let snippets = client.find_definitions("png_read_row", None).await.unwrap();
        assert_eq!(snippets.len(), 1);
        assert_eq!(snippets[0].file_path, "src/pngread.c");
        assert_eq!(snippets[0].identifier, "png_read_row");
    }

    #[tokio::test]
    async fn classifies_harness_paths() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/harness_path"))
            .and(query_param("path", "fuzz/harness.c"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"is_harness": true})),
            )
            .mount(&server)
            .await;

        let client = CodeQueryClient::new(server.uri(), "t1".into());
        assert!(client.is_harness_path("fuzz/harness.c").await.unwrap());
    }
}
