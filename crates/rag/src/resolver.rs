use tokio::task;

use paperchat_core::{sanitize_search_query, ChatError, Paper, Result};

use crate::config::ResolverConfig;
use crate::embedding::EmbeddingClient;
use crate::store::PaperStore;

/// Hybrid paper resolution: lexical full-text match merged with
/// whole-document embedding similarity, deduplicated by paper id.
///
/// Lexical hits come first in their native rank order (exact term matches
/// trump semantic proximity); embedding hits backfill papers lexical
/// search missed. Without a query this degrades to a browse page: an
/// arbitrary bounded slice with no relevance ordering, which callers should
/// present as such.
#[derive(Clone)]
pub struct PaperResolver {
    store: PaperStore,
    embeddings: EmbeddingClient,
    config: ResolverConfig,
}

impl PaperResolver {
    pub fn new(store: PaperStore, embeddings: EmbeddingClient, config: ResolverConfig) -> Self {
        Self {
            store,
            embeddings,
            config,
        }
    }

    /// Any embedding or store failure aborts the whole resolution; a
    /// partial ranking would silently misrepresent the corpus.
    pub async fn resolve(&self, query: Option<&str>) -> Result<Vec<Paper>> {
        let sanitized = query.map(sanitize_search_query).unwrap_or_default();
        if sanitized.is_empty() {
            return self.browse().await;
        }

        let store = self.store.clone();
        let terms = sanitized.clone();
        let lexical_limit = self.config.lexical_limit;
        let lexical = task::spawn_blocking(move || store.lexical_search(&terms, lexical_limit))
            .await
            .map_err(|err| ChatError::Resolution(err.to_string()))?
            .map_err(resolution_err)?;

        let query_embedding = self
            .embeddings
            .embed(&sanitized)
            .await
            .map_err(resolution_err)?;

        let store = self.store.clone();
        let embedding_limit = self.config.embedding_limit;
        let floor = self.config.paper_floor;
        let semantic = task::spawn_blocking(move || {
            store.rank_papers_by_embedding(&query_embedding, embedding_limit, floor)
        })
        .await
        .map_err(|err| ChatError::Resolution(err.to_string()))?
        .map_err(resolution_err)?;

        let mut merged = lexical;
        for (paper, _score) in semantic {
            if !merged.iter().any(|existing| existing.id == paper.id) {
                merged.push(paper);
            }
        }
        Ok(merged)
    }

    async fn browse(&self) -> Result<Vec<Paper>> {
        let store = self.store.clone();
        let limit = self.config.browse_limit;
        task::spawn_blocking(move || store.list_papers(limit))
            .await
            .map_err(|err| ChatError::Resolution(err.to_string()))?
            .map_err(resolution_err)
    }
}

fn resolution_err(err: ChatError) -> ChatError {
    match err {
        already @ ChatError::Resolution(_) => already,
        other => ChatError::Resolution(other.to_string()),
    }
}
