//! Folds completion frames into the [`AnswerState`].
//!
//! Every answer frame carries the whole answer so far, so folding replaces
//! the previous text and references instead of appending to them.

use kbchat_core::types::Reference;
use kbchat_upstream::wire::{AnswerPayload, CompletionFrame, FrameData};

use crate::answer::AnswerState;

/// What a single frame did to the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldOutcome {
    /// A snapshot replaced the answer.
    Applied,
    /// `data: true|false` sentinel; nothing changed.
    Control,
    /// Not a usable frame; nothing changed.
    Malformed(String),
    /// The upstream's `{code, message}` error envelope.
    Rejected { code: i64, message: String },
}

/// Fold one frame payload (the joined `data:` lines of an SSE record) into `state`.
pub fn fold(state: &mut AnswerState, payload: &str) -> FoldOutcome {
    let frame: CompletionFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(e) => return FoldOutcome::Malformed(format!("invalid JSON: {e}")),
    };

    if frame.code != 0 {
        let code = frame.code;
        let message = frame
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("request failed with code {code}"));
        return FoldOutcome::Rejected { code, message };
    }

    match frame.into_data() {
        Some(FrameData::Answer(snapshot)) => {
            apply_snapshot(state, snapshot);
            FoldOutcome::Applied
        }
        Some(FrameData::Flag(_)) => FoldOutcome::Control,
        Some(FrameData::Unexpected(value)) => {
            FoldOutcome::Malformed(format!("unexpected `data` value: {value}"))
        }
        None => FoldOutcome::Malformed("frame has no `data`".into()),
    }
}

fn apply_snapshot(state: &mut AnswerState, snapshot: AnswerPayload) {
    state.text = snapshot.answer;
    state.references = snapshot.reference.into_iter().map(Reference::from).collect();
    if let Some(id) = snapshot.id.filter(|id| !id.is_empty()) {
        state.exchange_id = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer_frame(answer: &str) -> String {
        serde_json::json!({"code": 0, "data": {"answer": answer, "reference": {}, "id": "a1"}})
            .to_string()
    }

    fn fold_all(frames: &[String]) -> (AnswerState, Vec<FoldOutcome>) {
        let mut state = AnswerState::begin("s1");
        let outcomes = frames.iter().map(|f| fold(&mut state, f)).collect();
        (state, outcomes)
    }

    #[test]
    fn test_snapshots_replace() {
        let (state, _) = fold_all(&[answer_frame("Hello"), answer_frame("Hello world")]);
        assert_eq!(state.text, "Hello world");
        assert_eq!(state.exchange_id.as_deref(), Some("a1"));
        assert_eq!(state.conversation_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let (state, outcomes) =
            fold_all(&[answer_frame("A"), "not json".into(), answer_frame("AB")]);
        assert_eq!(state.text, "AB");
        assert!(matches!(outcomes[1], FoldOutcome::Malformed(_)));
    }

    #[test]
    fn test_boolean_sentinel_is_noop() {
        let mut state = AnswerState::begin("s1");
        fold(&mut state, &answer_frame("A"));
        let before = state.clone();
        assert_eq!(fold(&mut state, r#"{"code":0,"data":true}"#), FoldOutcome::Control);
        assert_eq!(state, before);
        fold(&mut state, &answer_frame("AB"));
        assert_eq!(state.text, "AB");
    }

    #[test]
    fn test_unexpected_data_shapes() {
        let mut state = AnswerState::begin("s1");
        for payload in [
            r#"{"code":0}"#,
            r#"{"data":"text"}"#,
            r#"{"data":42}"#,
            r#"{"code":0,"data":[]}"#,
            r#"{"code":0,"data":null}"#,
        ] {
            assert!(
                matches!(fold(&mut state, payload), FoldOutcome::Malformed(_)),
                "{payload} should be malformed"
            );
        }
        assert!(state.is_empty());
    }

    #[test]
    fn test_array_data_keeps_answer() {
        let mut state = AnswerState::begin("s1");
        fold(&mut state, &answer_frame("kept"));
        let outcome = fold(&mut state, r#"{"code":0,"data":["not","an","answer"]}"#);
        assert!(matches!(outcome, FoldOutcome::Malformed(_)));
        assert_eq!(state.text, "kept");
        assert_eq!(state.exchange_id.as_deref(), Some("a1"));
    }

    #[test]
    fn test_references_replaced_and_cleared() {
        let mut state = AnswerState::begin("s1");
        let with_refs = r#"{"code":0,"data":{"answer":"See ##0$$","reference":{"chunks":[
            {"id":"c1","content":"excerpt","document_id":"d1","document_name":"guide.pdf","image_id":"img-1"}
        ]}}}"#;
        assert_eq!(fold(&mut state, with_refs), FoldOutcome::Applied);
        assert_eq!(state.references.len(), 1);
        assert_eq!(state.references[0].image_id.as_deref(), Some("img-1"));

        fold(&mut state, r#"{"code":0,"data":{"answer":"See"}}"#);
        assert!(state.references.is_empty());
    }

    #[test]
    fn test_missing_id_keeps_previous() {
        let mut state = AnswerState::begin("s1");
        fold(&mut state, &answer_frame("A"));
        fold(&mut state, r#"{"code":0,"data":{"answer":"AB"}}"#);
        assert_eq!(state.exchange_id.as_deref(), Some("a1"));
    }

    #[test]
    fn test_error_envelope_rejected() {
        let mut state = AnswerState::begin("s1");
        let outcome = fold(&mut state, r#"{"code":102,"message":"`question` is required."}"#);
        assert_eq!(
            outcome,
            FoldOutcome::Rejected {
                code: 102,
                message: "`question` is required.".into()
            }
        );
        assert!(state.is_empty());
    }
}
