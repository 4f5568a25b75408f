use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Passage retrieval tuning. The defaults are the production values: six
/// passages, 0.4 relevance floor (below which passages are noise).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
        }
    }
}

/// Hybrid paper resolution tuning. `paper_floor` is the optional minimum
/// similarity for whole-paper embedding matches; none is applied by default.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_lexical_limit")]
    pub lexical_limit: usize,
    #[serde(default = "default_embedding_limit")]
    pub embedding_limit: usize,
    #[serde(default = "default_browse_limit")]
    pub browse_limit: usize,
    #[serde(default)]
    pub paper_floor: Option<f32>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            lexical_limit: default_lexical_limit(),
            embedding_limit: default_embedding_limit(),
            browse_limit: default_browse_limit(),
            paper_floor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Read tuning from a TOML file; absent or unreadable files fall back to
/// the defaults so a bare checkout works.
pub fn load_config(path: &Path) -> RagConfig {
    if !path.exists() {
        return RagConfig::default();
    }
    match fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
        Err(_) => RagConfig::default(),
    }
}

fn default_top_k() -> usize {
    6
}

fn default_min_score() -> f32 {
    0.4
}

fn default_lexical_limit() -> usize {
    15
}

fn default_embedding_limit() -> usize {
    10
}

fn default_browse_limit() -> usize {
    10
}
