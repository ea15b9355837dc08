use serde::{Deserialize, Serialize};

/// End-of-text cursor appended to an assistant turn while its answer is streaming.
pub const CURSOR_MARKER: &str = r#"<span class="gpt-cursor"></span>"#;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A source-document excerpt attached to an answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub document_name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Positional tuples exactly as the upstream sent them.
    #[serde(default)]
    pub positions: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_similarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_similarity: Option<f64>,
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Markdown source; citations appear as `##<index>$$` placeholders.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub doc_ids: Vec<String>,
    #[serde(default, rename = "reference", skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            id: None,
            doc_ids: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            id: None,
            doc_ids: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// A conversation as stored by the upstream service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<i64>,
}

impl Session {
    /// Last update as a UTC timestamp, when the upstream reported one.
    pub fn updated_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.update_time
            .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
    }
}

/// Name for a lazily created session: the trimmed question cut to `max_chars` characters.
pub fn session_name_from_question(question: &str, max_chars: usize) -> String {
    question.trim().chars().take(max_chars).collect()
}
