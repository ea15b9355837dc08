//! Wire types of the knowledge-base chat service.

use serde::{Deserialize, Deserializer, Serialize};

use kbchat_core::types::Reference;

/// Response envelope used by every JSON endpoint: `code == 0` means success.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub code: i64,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn error_message(&self) -> String {
        self.message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("request failed with code {}", self.code))
    }
}

/// One `data:` payload of a streaming completion.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionFrame {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl CompletionFrame {
    /// The classified `data` field, `None` when it is absent or null.
    pub fn into_data(self) -> Option<FrameData> {
        self.data.map(FrameData::classify)
    }
}

#[derive(Debug, Clone)]
pub enum FrameData {
    /// `true`/`false` control sentinel, e.g. end of answer.
    Flag(bool),
    Answer(AnswerPayload),
    /// Any other JSON value; not part of the contract.
    Unexpected(serde_json::Value),
}

impl FrameData {
    /// Only a boolean or an object that reads as an answer is meaningful.
    pub fn classify(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(flag) => Self::Flag(flag),
            serde_json::Value::Object(_) => match serde_json::from_value(value.clone()) {
                Ok(payload) => Self::Answer(payload),
                Err(_) => Self::Unexpected(value),
            },
            other => Self::Unexpected(other),
        }
    }
}

/// Whole-so-far answer snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnswerPayload {
    #[serde(default)]
    pub answer: String,
    #[serde(default, deserialize_with = "reference_chunks")]
    pub reference: Vec<Chunk>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub audio_binary: Option<String>,
}

/// A retrieved chunk as sent in `reference.chunks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub document_name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub positions: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub similarity: Option<f64>,
    #[serde(default)]
    pub term_similarity: Option<f64>,
    #[serde(default)]
    pub vector_similarity: Option<f64>,
}

impl From<Chunk> for Reference {
    fn from(chunk: Chunk) -> Self {
        Self {
            content: chunk.content,
            dataset_id: chunk.dataset_id.filter(|s| !s.is_empty()),
            document_id: chunk.document_id,
            document_name: chunk.document_name,
            id: chunk.id,
            image_id: chunk.image_id.filter(|s| !s.is_empty()),
            positions: chunk.positions.unwrap_or_default(),
            similarity: chunk.similarity,
            term_similarity: chunk.term_similarity,
            vector_similarity: chunk.vector_similarity,
        }
    }
}

/// `reference` arrives as `{chunks: [...]}` once retrieval has run and as
/// `{}`, `[]` or `null` before that.
fn reference_chunks<'de, D>(deserializer: D) -> Result<Vec<Chunk>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value.get("chunks") {
        Some(chunks) if !chunks.is_null() => {
            serde_json::from_value(chunks.clone()).map_err(serde::de::Error::custom)
        }
        _ => Ok(Vec::new()),
    }
}
