use std::time::Duration;

use thiserror::Error;

use kbchat_upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Question is empty")]
    EmptyQuestion,

    #[error("No conversation id to send to")]
    MissingConversation,

    /// The request was not sent or the connection failed before any answer arrived.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// A response arrived but could not be understood.
    #[error("Unexpected upstream response: {0}")]
    Protocol(String),

    #[error("Upstream rejected the question (code {code}): {message}")]
    Business { code: i64, message: String },

    #[error("No frame received for {0:?}")]
    StaleStream(Duration),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Nothing to regenerate")]
    NothingToRegenerate,
}

impl From<UpstreamError> for ExchangeError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Transport(m) | UpstreamError::Stream(m) => Self::Transport(m),
            UpstreamError::Status { status, message } => Self::Upstream { status, message },
            UpstreamError::Business { code, message } => Self::Business { code, message },
            UpstreamError::Decode(m) => Self::Protocol(m),
            UpstreamError::Config(m) => Self::Transport(m),
        }
    }
}

impl From<ExchangeError> for kbchat_core::error::KbChatError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Session(m) => Self::Session(m),
            other => Self::Upstream(other.to_string()),
        }
    }
}
