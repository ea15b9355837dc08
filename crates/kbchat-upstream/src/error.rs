use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The request could not be sent or the connection failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-2xx HTTP status.
    #[error("Upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The service answered with its `{code, message}` error envelope.
    #[error("Upstream rejected request (code {code}): {message}")]
    Business { code: i64, message: String },

    /// The response body broke off mid-stream.
    #[error("SSE stream error: {0}")]
    Stream(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<UpstreamError> for kbchat_core::error::KbChatError {
    fn from(e: UpstreamError) -> Self {
        Self::Upstream(e.to_string())
    }
}
