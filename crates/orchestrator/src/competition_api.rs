//! Typed client for the external competition API.
//!
//! All endpoints use HTTP Basic auth with the `(api_key_id, api_token)`
//! pair; testcase and patch payloads travel base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response; the caller decides whether to retry.
    #[error("api returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Submission status as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Accepted,
    Passed,
    Failed,
    DeadlineExceeded,
    Errored,
}

impl SubmissionStatus {
    /// Whether the API will not change this status anymore.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubmissionStatus::Accepted)
    }
}

#[derive(Debug, Serialize)]
pub struct PovSubmission {
    pub architecture: String,
    pub engine: String,
    pub fuzzer_name: String,
    pub sanitizer: String,
    /// Base64-encoded crashing input.
    pub testcase: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PovResponse {
    pub pov_id: String,
    pub status: SubmissionStatus,
}

#[derive(Debug, Serialize)]
pub struct PatchSubmission {
    /// Base64-encoded unified diff.
    pub patch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchResponse {
    pub patch_id: String,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub functionality_tests_passing: Option<bool>,
}

#[derive(Debug, Default, Serialize)]
pub struct BundleSubmission {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_sarif_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freeform_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pov_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_sarif_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleResponse {
    pub bundle_id: String,
    pub status: SubmissionStatus,
}

#[derive(Clone)]
pub struct CompetitionApiClient {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    token: String,
}

impl CompetitionApiClient {
    pub fn new(base_url: String, key_id: String, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id,
            token,
        }
    }

    pub fn encode_payload(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    pub async fn submit_pov(
        &self,
        task_id: &str,
        submission: &PovSubmission,
    ) -> Result<PovResponse, ApiError> {
        self.post(&format!("/v1/task/{task_id}/pov/"), submission)
            .await
    }

    pub async fn pov_status(
        &self,
        task_id: &str,
        pov_id: &str,
    ) -> Result<PovResponse, ApiError> {
        let url = format!("{}/v1/task/{task_id}/pov/{pov_id}/", self.base_url);
        let response = self
            .http
            .get(url)
            .basic_auth(&self.key_id, Some(&self.token))
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn submit_patch(
        &self,
        task_id: &str,
        submission: &PatchSubmission,
    ) -> Result<PatchResponse, ApiError> {
        self.post(&format!("/v1/task/{task_id}/patch/"), submission)
            .await
    }

    pub async fn submit_bundle(
        &self,
        task_id: &str,
        submission: &BundleSubmission,
    ) -> Result<BundleResponse, ApiError> {
        self.post(&format!("/v1/task/{task_id}/bundle/"), submission)
            .await
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(url)
            .basic_auth(&self.key_id, Some(&self.token))
            .json(body)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse<R: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<R, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(!SubmissionStatus::Accepted.is_terminal());
        assert!(SubmissionStatus::Passed.is_terminal());
        assert!(SubmissionStatus::Failed.is_terminal());
        assert!(SubmissionStatus::DeadlineExceeded.is_terminal());
        assert!(SubmissionStatus::Errored.is_terminal());
    }

    #[test]
    fn status_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&SubmissionStatus::DeadlineExceeded).unwrap(),
            "\"deadline_exceeded\""
        );
        let parsed: SubmissionStatus = serde_json::from_str("\"accepted\"").unwrap();
        assert_eq!(parsed, SubmissionStatus::Accepted);
    }

    #[test]
    fn bundle_omits_absent_fields() {
        let bundle = BundleSubmission {
            pov_id: Some("pov1".into()),
            patch_id: Some("patch1".into()),
            ..BundleSubmission::default()
        };
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["pov_id"], "pov1");
        assert!(json.get("description").is_none());
    }

    #[tokio::test]
    async fn submits_pov_with_basic_auth() {
        use wiremock::matchers::{header_exists, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/task/t1/pov/"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pov_id": "pov-123",
                "status": "accepted"
            })))
            .mount(&server)
            .await;

        let client = CompetitionApiClient::new(server.uri(), "key".into(), "secret".into());
        let response = client
            .submit_pov(
                "t1",
                &PovSubmission {
                    architecture: "x86_64".into(),
                    engine: "libfuzzer".into(),
                    fuzzer_name: "read_fuzzer".into(),
                    sanitizer: "address".into(),
                    testcase: CompetitionApiClient::encode_payload(b"crash"),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.pov_id, "pov-123");
        assert_eq!(response.status, SubmissionStatus::Accepted);
    }

    #[tokio::test]
    async fn non_2xx_is_a_status_error() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/task/t1/patch/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = CompetitionApiClient::new(server.uri(), "key".into(), "secret".into());
        let err = client
            .submit_patch(
                "t1",
                &PatchSubmission {
                    patch: CompetitionApiClient::encode_payload(b"--- a\n+++ b\n"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Status { status, .. } if status.as_u16() == 503));
    }
}
