//! Streaming answer engine.
//!
//! [`ExchangeController`] sends a question to the chat service, decodes the
//! streamed frames, folds them into an [`AnswerState`] and publishes every
//! snapshot on a watch channel. [`Conversation`] binds a controller to a
//! transcript and its lazily created upstream session; [`SessionHistory`]
//! pages through past sessions.

pub mod answer;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod history;
pub mod reducer;
pub mod transcript;

#[cfg(test)]
mod fake;

pub use answer::AnswerState;
pub use controller::{ExchangeController, ExchangePhase};
pub use conversation::Conversation;
pub use error::ExchangeError;
pub use history::SessionHistory;
pub use transcript::Transcript;

/// How a successful [`ExchangeController::send`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    /// The stream ended; carries the final answer (possibly partial when the
    /// stream broke off after some text arrived).
    Completed(AnswerState),
    /// Cancelled by the caller or superseded by a newer exchange.
    Cancelled,
}
