//! One conversation: its upstream session, its transcript and the controller
//! that streams answers into it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use kbchat_core::config::Config;
use kbchat_core::types::{session_name_from_question, Session};
use kbchat_upstream::ChatBackend;

use crate::controller::ExchangeController;
use crate::error::ExchangeError;
use crate::transcript::Transcript;
use crate::ExchangeOutcome;

const DEFAULT_SESSION_NAME_MAX_CHARS: usize = 50;

pub struct Conversation {
    backend: Arc<dyn ChatBackend>,
    controller: ExchangeController,
    session: Option<Session>,
    transcript: Transcript,
    session_name_max_chars: usize,
}

impl Conversation {
    /// A conversation with no upstream session yet. The session is created
    /// on the first [`send`](Self::send).
    pub fn new(controller: ExchangeController) -> Self {
        Self {
            backend: Arc::clone(controller.backend()),
            controller,
            session: None,
            transcript: Transcript::new(),
            session_name_max_chars: DEFAULT_SESSION_NAME_MAX_CHARS,
        }
    }

    /// Continue an existing session with its stored messages.
    pub fn resume(controller: ExchangeController, session: Session) -> Self {
        let mut conversation = Self::new(controller);
        conversation.transcript = Transcript::from_messages(session.messages.clone());
        conversation.session = Some(session);
        conversation
    }

    pub fn from_config(backend: Arc<dyn ChatBackend>, config: &Config) -> Self {
        Self::new(ExchangeController::from_config(backend, config))
            .with_session_name_max_chars(config.session_name_max_chars())
    }

    pub fn with_session_name_max_chars(mut self, max_chars: usize) -> Self {
        self.session_name_max_chars = max_chars.max(1);
        self
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn controller(&self) -> &ExchangeController {
        &self.controller
    }

    /// Ask `question`, creating the upstream session first if this is the
    /// conversation's first message.
    pub async fn send(
        &mut self,
        question: &str,
        cancel: CancellationToken,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ExchangeError::EmptyQuestion);
        }
        let session_id = self.ensure_session(question).await?;

        self.transcript.push_user(question);
        self.transcript.push_placeholder();
        self.run_exchange(question.to_string(), session_id, cancel).await
    }

    /// Replace the trailing answer with a fresh one for the last question.
    pub async fn regenerate(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let question = self
            .transcript
            .last_user_question()
            .map(str::to_string)
            .ok_or(ExchangeError::NothingToRegenerate)?;
        let session_id = self
            .session_id()
            .map(str::to_string)
            .ok_or(ExchangeError::MissingConversation)?;

        self.transcript.discard_trailing_assistant();
        self.transcript.push_placeholder();
        self.run_exchange(question, session_id, cancel).await
    }

    async fn ensure_session(&mut self, question: &str) -> Result<String, ExchangeError> {
        if let Some(session) = &self.session {
            return Ok(session.id.clone());
        }
        let name = session_name_from_question(question, self.session_name_max_chars);
        let session = self
            .backend
            .create_session(&name)
            .await
            .map_err(|e| ExchangeError::Session(e.to_string()))?;
        info!(session_id = %session.id, %name, "Created conversation");
        let id = session.id.clone();
        self.session = Some(session);
        Ok(id)
    }

    /// Run the controller, mirroring every published snapshot into the
    /// trailing assistant turn.
    async fn run_exchange(
        &mut self,
        question: String,
        session_id: String,
        cancel: CancellationToken,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let Self {
            controller,
            transcript,
            ..
        } = self;

        let mut answers = controller.subscribe();
        let exchange = controller.send(&question, &session_id, cancel);
        tokio::pin!(exchange);

        let result = loop {
            tokio::select! {
                result = &mut exchange => break result,
                Ok(()) = answers.changed() => {
                    let snapshot = answers.borrow_and_update().clone();
                    if snapshot.streaming {
                        transcript.apply_answer(&snapshot);
                    }
                }
            }
        };

        match &result {
            Ok(ExchangeOutcome::Completed(answer)) => transcript.finish_answer(answer),
            Ok(ExchangeOutcome::Cancelled) | Err(_) => {
                transcript.discard_trailing_assistant();
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{answer_frame, FakeBackend, Reply};
    use kbchat_core::types::{Message, CURSOR_MARKER};
    use kbchat_upstream::{CompletionRequest, UpstreamError};

    fn conversation(backend: &Arc<FakeBackend>) -> Conversation {
        Conversation::new(ExchangeController::new(backend.clone()))
    }

    #[tokio::test]
    async fn test_first_send_creates_session_once() {
        let backend = FakeBackend::with_replies([
            Reply::Frames(vec![answer_frame("hello back")]),
            Reply::Frames(vec![answer_frame("again")]),
        ]);
        let mut conversation = conversation(&backend);

        conversation.send("hi", CancellationToken::new()).await.unwrap();
        conversation.send("and again", CancellationToken::new()).await.unwrap();

        assert_eq!(
            backend.calls(),
            vec!["create_session:hi", "completions:sess-1", "completions:sess-1"]
        );
        assert_eq!(conversation.session_id(), Some("sess-1"));
        assert_eq!(
            backend.requests()[0],
            CompletionRequest::streaming("hi", "sess-1")
        );

        let contents: Vec<&str> = conversation
            .transcript()
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["hi", "hello back", "and again", "again"]);
    }

    #[tokio::test]
    async fn test_session_named_after_question() {
        let backend = FakeBackend::with_replies([]);
        let mut conversation = conversation(&backend).with_session_name_max_chars(5);

        conversation
            .send("  What is in the handbook?", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(backend.calls()[0], "create_session:What ");
    }

    #[tokio::test]
    async fn test_empty_question_creates_nothing() {
        let backend = FakeBackend::with_replies([]);
        let mut conversation = conversation(&backend);

        let err = conversation.send("  ", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::EmptyQuestion));
        assert!(backend.calls().is_empty());
        assert!(conversation.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_regenerate_replaces_trailing_answer() {
        let backend = FakeBackend::with_replies([Reply::Frames(vec![answer_frame("A2")])]);
        let session = Session {
            id: "s1".into(),
            messages: vec![Message::user("Q"), Message::assistant("A")],
            ..Session::default()
        };
        let mut conversation =
            Conversation::resume(ExchangeController::new(backend.clone()), session);

        conversation.regenerate(CancellationToken::new()).await.unwrap();

        let messages = conversation.transcript().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Q");
        assert!(messages[1].is_assistant());
        assert_eq!(messages[1].content, "A2");
        assert_eq!(backend.requests(), vec![CompletionRequest::streaming("Q", "s1")]);
    }

    #[tokio::test]
    async fn test_regenerate_without_question() {
        let backend = FakeBackend::with_replies([]);
        let mut conversation = conversation(&backend);
        let err = conversation.regenerate(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::NothingToRegenerate));
    }

    #[tokio::test]
    async fn test_failed_send_keeps_question() {
        let backend = FakeBackend::with_replies([Reply::Fail(UpstreamError::Transport(
            "down".into(),
        ))]);
        let mut conversation = conversation(&backend);

        let err = conversation.send("Q", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(_)));

        let messages = conversation.transcript().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Q");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_removes_placeholder() {
        let backend = FakeBackend::with_replies([Reply::Hang(vec![answer_frame("partial")])]);
        let mut conversation = conversation(&backend);
        let token = CancellationToken::new();
        let mut answers = conversation.controller().subscribe();

        let canceller = {
            let token = token.clone();
            async move {
                let _ = answers.wait_for(|a| a.text == "partial").await;
                token.cancel();
            }
        };
        let (outcome, ()) = tokio::join!(conversation.send("Q", token.clone()), canceller);

        assert_eq!(outcome.unwrap(), ExchangeOutcome::Cancelled);
        let messages = conversation.transcript().messages();
        assert_eq!(messages.len(), 1);
        assert!(!messages.iter().any(|m| m.content.contains(CURSOR_MARKER)));
    }

    #[tokio::test]
    async fn test_session_creation_failure() {
        struct Unreachable;

        #[async_trait::async_trait]
        impl ChatBackend for Unreachable {
            async fn completions(
                &self,
                _request: &CompletionRequest,
            ) -> Result<kbchat_upstream::FrameStream, UpstreamError> {
                Err(UpstreamError::Transport("unreachable".into()))
            }
            async fn create_session(&self, _name: &str) -> Result<Session, UpstreamError> {
                Err(UpstreamError::Transport("unreachable".into()))
            }
            async fn list_sessions(
                &self,
                _params: &kbchat_upstream::ListSessionsParams,
            ) -> Result<Vec<Session>, UpstreamError> {
                Ok(Vec::new())
            }
            async fn rename_session(&self, _id: &str, _name: &str) -> Result<(), UpstreamError> {
                Ok(())
            }
            async fn delete_sessions(&self, _ids: &[String]) -> Result<(), UpstreamError> {
                Ok(())
            }
        }

        let mut conversation = Conversation::new(ExchangeController::new(Arc::new(Unreachable)));
        let err = conversation.send("Q", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Session(_)));
        assert!(conversation.session().is_none());
        assert!(conversation.transcript().is_empty());
    }
}
