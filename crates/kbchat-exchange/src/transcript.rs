//! Message list of one conversation as the user sees it.
//!
//! While an answer streams, the trailing assistant turn mirrors the latest
//! [`AnswerState`] snapshot. Before the first snapshot it holds only the
//! cursor marker.

use kbchat_core::types::{Message, Role, CURSOR_MARKER};

use crate::answer::AnswerState;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push_user(&mut self, question: &str) {
        self.messages.push(Message::user(question.trim()));
    }

    /// Append the assistant turn the next answer will fill in.
    pub fn push_placeholder(&mut self) {
        let mut placeholder = Message::assistant(CURSOR_MARKER);
        placeholder.id = Some(uuid::Uuid::new_v4().to_string());
        self.messages.push(placeholder);
    }

    /// Copy a snapshot into the trailing assistant turn. Snapshots without
    /// text leave the placeholder as it is.
    pub fn apply_answer(&mut self, answer: &AnswerState) -> bool {
        if answer.text.is_empty() {
            return false;
        }
        let Some(turn) = self.messages.last_mut().filter(|m| m.is_assistant()) else {
            return false;
        };
        turn.content = answer.rendered_text().into_owned();
        turn.references = answer.references.clone();
        if let Some(id) = &answer.exchange_id {
            turn.id = Some(id.clone());
        }
        true
    }

    /// Settle the trailing assistant turn with the final answer. An empty
    /// answer leaves no assistant turn behind.
    pub fn finish_answer(&mut self, answer: &AnswerState) {
        if answer.text.is_empty() {
            self.discard_trailing_assistant();
            return;
        }
        let mut settled = answer.clone();
        settled.streaming = false;
        self.apply_answer(&settled);
    }

    /// Remove the trailing assistant turn, if there is one.
    pub fn discard_trailing_assistant(&mut self) -> Option<Message> {
        if self.messages.last().is_some_and(Message::is_assistant) {
            self.messages.pop()
        } else {
            None
        }
    }

    pub fn last_user_question(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}
