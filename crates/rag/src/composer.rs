use paperchat_core::{Paper, ScoredPassage};

use crate::prompts::REGULAR_PROMPT;

/// Deterministic system-context assembly. Ordering is part of the contract:
/// base instructions, then paper identity metadata, then retrieved evidence,
/// each evidence block between explicit delimiters so the model can tell
/// background from quoted paper text.
///
/// Zero retrieved passages is a normal outcome: the context is then base
/// prompt plus metadata, with no evidence section at all.
#[derive(Clone)]
pub struct ContextComposer {
    base_prompt: String,
}

impl Default for ContextComposer {
    fn default() -> Self {
        Self {
            base_prompt: REGULAR_PROMPT.to_string(),
        }
    }
}

impl ContextComposer {
    pub fn new(base_prompt: impl Into<String>) -> Self {
        Self {
            base_prompt: base_prompt.into(),
        }
    }

    pub fn base_prompt(&self) -> &str {
        &self.base_prompt
    }

    pub fn compose(&self, paper: Option<&Paper>, passages: &[ScoredPassage]) -> String {
        let mut context = self.base_prompt.clone();

        if let Some(paper) = paper {
            context.push_str("\n\n### ABSTRACT ###\n");
            if paper.abstract_text.trim().is_empty() {
                context.push_str("No abstract found");
            } else {
                context.push_str(paper.abstract_text.trim());
            }
            context.push_str("\n### END ABSTRACT ###");

            if !paper.authors.is_empty() {
                context.push_str("\n\n### AUTHORS ###\n");
                context.push_str(&paper.author_line());
                context.push_str("\n### END AUTHORS ###");
            }
        }

        if !passages.is_empty() {
            context.push_str("\n\n### RELEVANT SECTIONS FROM THE PAPER ###\n");
            let joined = passages
                .iter()
                .map(|scored| scored.passage.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            context.push_str(&joined);
            context.push_str("\n### END RELEVANT SECTIONS FROM THE PAPER ###");
        }

        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperchat_core::{Author, Passage};

    fn paper() -> Paper {
        Paper {
            id: "p1".to_string(),
            name: "Sparse Attention".to_string(),
            abstract_text: "We study sparse attention.".to_string(),
            authors: vec![Author {
                name: "J. Doe".to_string(),
                institution: Some("MIT".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn scored(text: &str, score: f32) -> ScoredPassage {
        ScoredPassage {
            passage: Passage {
                paper_id: "p1".to_string(),
                text: text.to_string(),
                abstract_text: None,
                embedding: Vec::new(),
            },
            score,
        }
    }

    #[test]
    fn orders_base_metadata_then_evidence() {
        let composer = ContextComposer::default();
        let context = composer.compose(Some(&paper()), &[scored("Section 3 text.", 0.8)]);
        let base = context.find(REGULAR_PROMPT).unwrap();
        let abstract_at = context.find("### ABSTRACT ###").unwrap();
        let authors_at = context.find("### AUTHORS ###").unwrap();
        let sections_at = context
            .find("### RELEVANT SECTIONS FROM THE PAPER ###")
            .unwrap();
        assert!(base < abstract_at && abstract_at < authors_at && authors_at < sections_at);
        assert!(context.contains("Section 3 text."));
    }

    #[test]
    fn zero_passages_still_yields_valid_context() {
        let composer = ContextComposer::default();
        let context = composer.compose(Some(&paper()), &[]);
        assert!(context.starts_with(REGULAR_PROMPT));
        assert!(context.contains("### ABSTRACT ###"));
        assert!(!context.contains("RELEVANT SECTIONS"));
    }

    #[test]
    fn no_paper_no_passages_is_just_the_base_prompt() {
        let composer = ContextComposer::default();
        assert_eq!(composer.compose(None, &[]), REGULAR_PROMPT);
    }

    #[test]
    fn missing_abstract_is_stated_not_blank() {
        let composer = ContextComposer::default();
        let mut p = paper();
        p.abstract_text = String::new();
        let context = composer.compose(Some(&p), &[]);
        assert!(context.contains("No abstract found"));
    }

    #[test]
    fn passages_are_separated_by_blank_lines() {
        let composer = ContextComposer::default();
        let context = composer.compose(None, &[scored("first", 0.9), scored("second", 0.5)]);
        assert!(context.contains("first\n\nsecond"));
    }

    #[test]
    fn composition_is_total_for_nonempty_base() {
        let composer = ContextComposer::new("Answer carefully.");
        assert!(!composer.compose(None, &[]).is_empty());
    }
}
