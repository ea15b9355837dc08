//! The observable "answer so far" of one exchange.

use std::borrow::Cow;

use serde::Serialize;

use kbchat_core::types::{Reference, CURSOR_MARKER};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnswerState {
    /// Whole answer so far. Each frame replaces it.
    pub text: String,
    pub references: Vec<Reference>,
    /// Upstream id of this answer instance.
    pub exchange_id: Option<String>,
    pub conversation_id: Option<String>,
    pub streaming: bool,
}

impl AnswerState {
    /// Fresh state for an exchange that is about to start.
    pub fn begin(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            streaming: true,
            ..Self::default()
        }
    }

    /// No answer content has arrived (or it was cleared).
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.references.is_empty() && self.exchange_id.is_none()
    }

    /// Text for display: the cursor marker is appended while streaming.
    pub fn rendered_text(&self) -> Cow<'_, str> {
        if self.streaming {
            Cow::Owned(format!("{}{CURSOR_MARKER}", self.text))
        } else {
            Cow::Borrowed(&self.text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_is_streaming_and_empty() {
        let state = AnswerState::begin("s1");
        assert!(state.streaming);
        assert!(state.is_empty());
        assert_eq!(state.conversation_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_cursor_only_while_streaming() {
        let mut state = AnswerState::begin("s1");
        state.text = "Hello".into();
        assert_eq!(state.rendered_text(), format!("Hello{CURSOR_MARKER}"));

        state.streaming = false;
        assert_eq!(state.rendered_text(), "Hello");
    }
}
