//! Inline citation placeholders (`##<index>$$`) and reference helpers.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::types::Reference;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"##(\d+)\$\$").expect("static citation pattern"));

/// Indices of all citation placeholders in `text`, in order of appearance.
pub fn citation_indices(text: &str) -> Vec<usize> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse().ok())
        .collect()
}

/// Replace every placeholder that points at an existing reference with the
/// output of `render`. Placeholders with out-of-range indices are left as-is.
pub fn replace_citations<F>(text: &str, references: &[Reference], mut render: F) -> String
where
    F: FnMut(usize, &Reference) -> String,
{
    if references.is_empty() {
        return text.to_string();
    }
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            match caps[1].parse::<usize>().ok().and_then(|i| references.get(i).map(|r| (i, r))) {
                Some((index, reference)) => render(index, reference),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// URL of a chunk's page image on the knowledge-base service.
pub fn document_image_url(base_url: &str, image_id: &str) -> String {
    format!("{}/v1/document/image/{image_id}", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(name: &str) -> Reference {
        Reference {
            document_name: name.into(),
            ..Reference::default()
        }
    }

    #[test]
    fn test_citation_indices() {
        assert_eq!(citation_indices("a ##0$$ b ##12$$ c ##x$$"), vec![0, 12]);
        assert!(citation_indices("no citations").is_empty());
    }

    #[test]
    fn test_replace_citations_in_range_only() {
        let refs = vec![reference("a.pdf"), reference("b.docx")];
        let out = replace_citations("x ##1$$ y ##0$$ z ##7$$", &refs, |i, r| {
            format!("[{i}:{}]", r.document_name)
        });
        assert_eq!(out, "x [1:b.docx] y [0:a.pdf] z ##7$$");
    }

    #[test]
    fn test_replace_citations_without_references() {
        let out = replace_citations("keep ##0$$", &[], |_, _| String::from("gone"));
        assert_eq!(out, "keep ##0$$");
    }

    #[test]
    fn test_document_image_url() {
        assert_eq!(
            document_image_url("http://kb.local/", "img-1"),
            "http://kb.local/v1/document/image/img-1"
        );
    }
}
