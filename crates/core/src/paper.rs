use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One author of a paper, as shown in search results and prompt context.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub institution: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// A research paper as stored in the corpus. Read-only at request time;
/// rows are produced by ingestion and never mutated by the chat path.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Paper {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub abstract_text: String,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub arxiv_id: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub searchable_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub related_models: Option<Value>,
}

/// A fragment of a paper's full text with provenance and a precomputed
/// embedding. Owned by exactly one paper; immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub paper_id: String,
    pub text: String,
    #[serde(default)]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

/// A retrieved passage with its cosine similarity to the query, in [0, 1].
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}

/// A question suggestion generated from a paper's abstract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedQuestion {
    pub title: String,
    pub label: String,
    pub action: String,
}

impl Paper {
    pub fn author_line(&self) -> String {
        self.authors
            .iter()
            .map(|author| match &author.institution {
                Some(institution) => format!("{} ({})", author.name, institution),
                None => author.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
