//! HTTP client for the knowledge-base chat service.
//!
//! Completions: `POST {base}/api/v1/chats/{chat_id}/completions` with an SSE
//! response body. Sessions: `{base}/api/v1/chats/{chat_id}/sessions`.

use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use kbchat_core::config::Config;
use kbchat_core::types::Session;

use crate::sse::{decode_sse, parse_sse_stream};
use crate::wire::ApiEnvelope;
use crate::{ChatBackend, CompletionRequest, FrameStream, ListSessionsParams, UpstreamError};

pub struct RagflowClient {
    base_url: String,
    chat_id: String,
    credential: String,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl RagflowClient {
    pub fn new(base_url: &str, chat_id: &str, credential: &str) -> Result<Self, UpstreamError> {
        Self::with_timeouts(
            base_url,
            chat_id,
            credential,
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
    }

    pub fn with_timeouts(
        base_url: &str,
        chat_id: &str,
        credential: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_id: chat_id.to_string(),
            credential: credential.to_string(),
            request_timeout,
            client,
        })
    }

    /// Build a client from the `upstream` config section and the resolved credential.
    pub fn from_config(config: &Config) -> Result<Self, UpstreamError> {
        let chat_id = config
            .chat_id()
            .ok_or_else(|| UpstreamError::Config("upstream.chat_id is not configured".into()))?;
        let credential = config.resolve_credential().ok_or_else(|| {
            UpstreamError::Config("no API key configured and no ragflow application found".into())
        })?;
        let upstream = config.upstream();
        Self::with_timeouts(
            &config.base_url(),
            chat_id,
            &credential,
            Duration::from_secs(upstream.connect_timeout_secs),
            Duration::from_secs(upstream.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    fn chat_url(&self, path: &str) -> String {
        format!("{}/api/v1/chats/{}/{path}", self.base_url, self.chat_id)
    }

    /// Send a session request and unwrap the `{code, data, message}` envelope.
    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, UpstreamError> {
        let response = request
            .bearer_auth(&self.credential)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(response).await);
        }

        let envelope: ApiEnvelope<T> = response.json().await?;
        if !envelope.is_ok() {
            return Err(UpstreamError::Business {
                code: envelope.code,
                message: envelope.error_message(),
            });
        }
        Ok(envelope.data)
    }
}

/// Turn a non-2xx response into an error, preferring the envelope's message.
async fn status_error(response: reqwest::Response) -> UpstreamError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body)
        .ok()
        .and_then(|env| env.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(body);
    UpstreamError::Status { status, message }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

#[async_trait]
impl ChatBackend for RagflowClient {
    async fn completions(&self, request: &CompletionRequest) -> Result<FrameStream, UpstreamError> {
        debug!(
            session_id = %request.session_id,
            base_url = %self.base_url,
            "Opening streaming completion"
        );

        let response = self
            .client
            .post(self.chat_url("completions"))
            .bearer_auth(&self.credential)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        if is_event_stream(&response) {
            return Ok(Box::pin(parse_sse_stream(response)));
        }

        // Errors come back as a plain JSON envelope instead of a stream.
        let body = response.text().await?;
        match serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body) {
            Ok(envelope) if !envelope.is_ok() => Err(UpstreamError::Business {
                code: envelope.code,
                message: envelope.error_message(),
            }),
            _ => {
                warn!("Completion response was not labelled as an event stream; decoding it as one");
                let chunks = futures::stream::iter([Ok::<_, Infallible>(body.into_bytes())]);
                Ok(Box::pin(decode_sse(chunks)))
            }
        }
    }

    async fn create_session(&self, name: &str) -> Result<Session, UpstreamError> {
        let request = self
            .client
            .post(self.chat_url("sessions"))
            .json(&json!({ "name": name }));
        let session: Option<Session> = self.send_json(request).await?;
        let session =
            session.ok_or_else(|| UpstreamError::Decode("create session returned no data".into()))?;
        debug!(session_id = %session.id, "Created session");
        Ok(session)
    }

    async fn list_sessions(&self, params: &ListSessionsParams) -> Result<Vec<Session>, UpstreamError> {
        let request = self.client.get(self.chat_url("sessions")).query(params);
        let sessions: Option<Vec<Session>> = self.send_json(request).await?;
        Ok(sessions.unwrap_or_default())
    }

    async fn rename_session(&self, session_id: &str, name: &str) -> Result<(), UpstreamError> {
        let request = self
            .client
            .put(self.chat_url(&format!("sessions/{session_id}")))
            .json(&json!({ "name": name }));
        self.send_json::<serde_json::Value>(request).await?;
        Ok(())
    }

    async fn delete_sessions(&self, ids: &[String]) -> Result<(), UpstreamError> {
        let request = self
            .client
            .delete(self.chat_url("sessions"))
            .json(&json!({ "ids": ids }));
        self.send_json::<serde_json::Value>(request).await?;
        debug!(count = ids.len(), "Deleted sessions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url() {
        let client = RagflowClient::new("http://kb.local/", "chat-9", "key").unwrap();
        assert_eq!(client.base_url(), "http://kb.local");
        assert_eq!(
            client.chat_url("completions"),
            "http://kb.local/api/v1/chats/chat-9/completions"
        );
    }

    #[test]
    fn test_from_config_requires_chat_id() {
        let config = Config::default();
        assert!(matches!(
            RagflowClient::from_config(&config),
            Err(UpstreamError::Config(_))
        ));
    }
}
