//! Paged list of the user's past conversations.

use std::sync::Arc;

use tracing::debug;

use kbchat_core::config::HistoryConfig;
use kbchat_core::types::Session;
use kbchat_upstream::{ChatBackend, ListSessionsParams, UpstreamError};

use crate::error::ExchangeError;

fn session_error(e: UpstreamError) -> ExchangeError {
    ExchangeError::Session(e.to_string())
}

pub struct SessionHistory {
    backend: Arc<dyn ChatBackend>,
    config: HistoryConfig,
    sessions: Vec<Session>,
    next_page: u32,
    has_more: bool,
}

impl SessionHistory {
    pub fn new(backend: Arc<dyn ChatBackend>, config: HistoryConfig) -> Self {
        Self {
            backend,
            config,
            sessions: Vec::new(),
            next_page: 1,
            has_more: true,
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Whether another page may exist. A short page means the end was reached.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Drop everything loaded so far and fetch the first page again.
    pub async fn refresh(&mut self) -> Result<&[Session], ExchangeError> {
        self.sessions.clear();
        self.next_page = 1;
        self.has_more = true;
        self.load_more().await?;
        Ok(&self.sessions)
    }

    /// Fetch the next page. Returns how many sessions the page held.
    pub async fn load_more(&mut self) -> Result<usize, ExchangeError> {
        if !self.has_more {
            return Ok(0);
        }
        let page_size = self.config.page_size.max(1);
        let params = ListSessionsParams {
            page: self.next_page,
            page_size,
            orderby: self.config.orderby,
            desc: self.config.desc,
            ..ListSessionsParams::default()
        };
        let page = self
            .backend
            .list_sessions(&params)
            .await
            .map_err(session_error)?;

        let count = page.len();
        self.has_more = count == page_size as usize;
        self.next_page += 1;
        // A session created or updated since the last fetch shifts the
        // pages, so entries already listed can come back.
        for session in page {
            if self.get(&session.id).is_none() {
                self.sessions.push(session);
            }
        }
        debug!(page = params.page, count, has_more = self.has_more, "Loaded session page");
        Ok(count)
    }

    pub async fn rename(&mut self, id: &str, name: &str) -> Result<(), ExchangeError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ExchangeError::Session("session name is empty".into()));
        }
        self.backend
            .rename_session(id, name)
            .await
            .map_err(session_error)?;
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) {
            session.name = name.to_string();
        }
        Ok(())
    }

    /// Delete sessions upstream and forget them locally.
    pub async fn delete(&mut self, ids: &[String]) -> Result<(), ExchangeError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.backend
            .delete_sessions(ids)
            .await
            .map_err(session_error)?;
        self.sessions.retain(|s| !ids.contains(&s.id));
        Ok(())
    }
}
