//! In-memory [`ChatBackend`] for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use kbchat_core::types::Session;
use kbchat_upstream::{
    ChatBackend, CompletionRequest, FrameStream, ListSessionsParams, SseEvent, UpstreamError,
};

/// Scripted response to one completions call.
pub(crate) enum Reply {
    /// Yield the frames, then end the stream.
    Frames(Vec<Result<SseEvent, UpstreamError>>),
    /// Yield the frames, then never yield again.
    Hang(Vec<Result<SseEvent, UpstreamError>>),
    /// Fail before the stream opens.
    Fail(UpstreamError),
    /// Never open the stream.
    Silent,
}

pub(crate) fn raw_frame(data: &str) -> Result<SseEvent, UpstreamError> {
    Ok(SseEvent {
        event: None,
        data: data.to_string(),
        id: None,
    })
}

pub(crate) fn answer_frame(answer: &str) -> Result<SseEvent, UpstreamError> {
    let data = serde_json::json!({
        "code": 0,
        "data": {"answer": answer, "reference": {}, "id": "ans-1"}
    });
    raw_frame(&data.to_string())
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    /// Every backend call in order, e.g. `create_session:hi`.
    calls: Mutex<Vec<String>>,
    sessions: Mutex<Vec<Session>>,
}

impl FakeBackend {
    pub(crate) fn with_replies(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        })
    }

    /// Stored sessions named `session-1`..`session-n`, newest first.
    pub(crate) fn with_sessions(count: usize) -> Arc<Self> {
        let sessions = (1..=count)
            .rev()
            .map(|i| Session {
                id: format!("s{i}"),
                name: format!("session-{i}"),
                ..Session::default()
            })
            .collect();
        Arc::new(Self {
            sessions: Mutex::new(sessions),
            ..Self::default()
        })
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn stored_sessions(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn completions(&self, request: &CompletionRequest) -> Result<FrameStream, UpstreamError> {
        self.record(format!("completions:{}", request.session_id));
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Frames(Vec::new()));
        match reply {
            Reply::Frames(frames) => Ok(Box::pin(futures::stream::iter(frames))),
            Reply::Hang(frames) => Ok(Box::pin(
                futures::stream::iter(frames).chain(futures::stream::pending()),
            )),
            Reply::Fail(e) => Err(e),
            Reply::Silent => std::future::pending().await,
        }
    }

    async fn create_session(&self, name: &str) -> Result<Session, UpstreamError> {
        self.record(format!("create_session:{name}"));
        let mut sessions = self.sessions.lock().unwrap();
        let session = Session {
            id: format!("sess-{}", sessions.len() + 1),
            name: name.to_string(),
            ..Session::default()
        };
        sessions.insert(0, session.clone());
        Ok(session)
    }

    async fn list_sessions(&self, params: &ListSessionsParams) -> Result<Vec<Session>, UpstreamError> {
        self.record(format!("list_sessions:{}", params.page));
        let size = params.page_size as usize;
        let skip = (params.page.saturating_sub(1) as usize) * size;
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .skip(skip)
            .take(size)
            .cloned()
            .collect())
    }

    async fn rename_session(&self, session_id: &str, name: &str) -> Result<(), UpstreamError> {
        self.record(format!("rename_session:{session_id}"));
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.iter_mut().find(|s| s.id == session_id) {
            Some(session) => {
                session.name = name.to_string();
                Ok(())
            }
            None => Err(UpstreamError::Business {
                code: 102,
                message: "The session doesn't exist".into(),
            }),
        }
    }

    async fn delete_sessions(&self, ids: &[String]) -> Result<(), UpstreamError> {
        self.record(format!("delete_sessions:{}", ids.join(",")));
        self.sessions.lock().unwrap().retain(|s| !ids.contains(&s.id));
        Ok(())
    }
}
