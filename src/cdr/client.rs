use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use super::{CallDetailRecord, CallRecordStore, IdentityLookup};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authentication required")]
    Unauthorized,
    #[error("Access denied")]
    Forbidden,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Invalid response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Network(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ExtensionResponse {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

/// HTTP client for the record-storage backend
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ApiClientInner>,
}

struct ApiClientInner {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        ApiClient {
            inner: Arc::new(ApiClientInner {
                base_url: base_url.trim_end_matches('/').to_string(),
                client,
                token,
            }),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.inner.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();

        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => response
                .json::<T>()
                .await
                .map_err(|e| ApiError::Parse(e.to_string())),
            _ => Err(Self::error_for(status, response).await),
        }
    }

    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<(), ApiError> {
        let status = response.status();

        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => {
                Ok(())
            }
            _ => Err(Self::error_for(status, response).await),
        }
    }

    async fn error_for(status: StatusCode, response: reqwest::Response) -> ApiError {
        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::FORBIDDEN => ApiError::Forbidden,
            StatusCode::NOT_FOUND => ApiError::NotFound(response.text().await.unwrap_or_default()),
            _ => {
                let text = response.text().await.unwrap_or_default();
                ApiError::Server(format!("{}: {}", status, text))
            }
        }
    }
}

#[async_trait::async_trait]
impl CallRecordStore for ApiClient {
    async fn upload_recording(&self, call_id: &str, wav: Vec<u8>) -> Result<String, ApiError> {
        let part = Part::bytes(wav)
            .file_name(format!("{}.wav", call_id))
            .mime_str("audio/wav")?;
        let form = Form::new().text("callId", call_id.to_string()).part("file", part);

        let request = self
            .inner
            .client
            .post(self.url("/api/recordings/upload"))
            .multipart(form);
        let response = self.authorized(request).send().await?;
        let uploaded: UploadResponse = self.handle_response(response).await?;
        Ok(uploaded.url)
    }

    async fn submit_cdr(&self, cdr: &CallDetailRecord) -> Result<(), ApiError> {
        let request = self.inner.client.post(self.url("/api/calls/cdr")).json(cdr);
        let response = self.authorized(request).send().await?;
        self.handle_empty_response(response).await
    }
}

#[async_trait::async_trait]
impl IdentityLookup for ApiClient {
    async fn lookup_display_name(&self, extension: &str) -> Result<Option<String>, ApiError> {
        let request = self
            .inner
            .client
            .get(self.url(&format!("/api/extensions/{}", extension)));
        let response = self.authorized(request).send().await?;
        match self.handle_response::<ExtensionResponse>(response).await {
            Ok(found) => Ok(found.display_name.filter(|name| !name.trim().is_empty())),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = ApiClient::new("http://localhost:3000/", None);
        assert_eq!(
            client.url("/api/calls/cdr"),
            "http://localhost:3000/api/calls/cdr"
        );
    }

    #[test]
    fn test_extension_response_tolerates_missing_name() {
        let parsed: ExtensionResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.display_name.is_none());

        let parsed: ExtensionResponse =
            serde_json::from_str(r#"{"displayName":"Front Desk"}"#).unwrap();
        assert_eq!(parsed.display_name.as_deref(), Some("Front Desk"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_a_network_error() {
        // Port 9 (discard) on loopback is closed in test environments
        let client = ApiClient::new("http://127.0.0.1:9", None);
        let result = client.lookup_display_name("1001").await;
        assert!(matches!(result, Err(ApiError::Network(_))));
    }
}
