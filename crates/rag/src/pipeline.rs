use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task;
use tokio_stream::wrappers::ReceiverStream;

use paperchat_core::{
    estimate_tokens, most_recent_user_message, ChatError, ConversationTurn, Paper, Result,
    ScoredPassage, TokenizerKind,
};
use paperchat_llm::{ChatClient, ChatRequest};

use crate::composer::ContextComposer;
use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingClient;
use crate::store::PaperStore;
use crate::usage::UsageLogger;

/// Upper bound on model invocation rounds for one request. Generation here
/// is tool-free, so a single round is the norm; the bound keeps a provider
/// that keeps asking for continuations from looping forever.
#[derive(Debug, Clone, Copy)]
pub struct GenerationLimits {
    pub max_steps: u32,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self { max_steps: 5 }
    }
}

/// One streamed response fragment. `Sources` is the auxiliary annotation
/// lane; `Done` is emitted exactly once, after which the stream is closed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFragment {
    Sources { sources: Vec<SourceAnnotation> },
    Delta { text: String },
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    Error { message: String },
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceAnnotation {
    pub paper_id: String,
    pub score: f32,
    pub snippet: String,
}

/// Everything generation needs, assembled before the model is contacted:
/// the composed system context and the provenance of the evidence in it.
#[derive(Debug)]
pub struct ChatPrompt {
    pub system_context: String,
    pub sources: Vec<SourceAnnotation>,
    pub paper: Option<Paper>,
}

/// The request pipeline: validate, resolve scope, retrieve, compose, then
/// stream one bounded generation. Stages run strictly in that order:
/// retrieval completes (or definitively fails) before composition, and
/// composition before generation.
#[derive(Clone)]
pub struct ChatPipeline {
    store: PaperStore,
    embeddings: EmbeddingClient,
    composer: ContextComposer,
    retrieval: RetrievalConfig,
    limits: GenerationLimits,
    usage: UsageLogger,
}

impl ChatPipeline {
    pub fn new(
        store: PaperStore,
        embeddings: EmbeddingClient,
        composer: ContextComposer,
        retrieval: RetrievalConfig,
        limits: GenerationLimits,
    ) -> Self {
        let usage = UsageLogger::new(store.clone());
        Self {
            store,
            embeddings,
            composer,
            retrieval,
            limits,
            usage,
        }
    }

    /// Retrieval and composition for one request. Fails loudly: an unknown
    /// paper is `NotFound`, a conversation without a user turn is
    /// `Validation`, and embedding/search failures propagate as themselves
    /// rather than degrading into an empty context.
    pub async fn prepare(
        &self,
        paper_id: Option<&str>,
        turns: &[ConversationTurn],
    ) -> Result<ChatPrompt> {
        let user = most_recent_user_message(turns)
            .ok_or_else(|| ChatError::Validation("conversation has no user message".to_string()))?;

        let Some(paper_id) = paper_id else {
            return Ok(ChatPrompt {
                system_context: self.composer.compose(None, &[]),
                sources: Vec::new(),
                paper: None,
            });
        };

        let store = self.store.clone();
        let id = paper_id.to_string();
        let paper = task::spawn_blocking(move || store.get_paper(&id))
            .await
            .map_err(|err| ChatError::Retrieval(err.to_string()))??
            .ok_or_else(|| ChatError::NotFound(format!("paper {paper_id}")))?;

        let query_embedding = self.embeddings.embed(&user.content).await?;

        let store = self.store.clone();
        let id = paper_id.to_string();
        let retrieval = self.retrieval;
        let hits = task::spawn_blocking(move || {
            store.search_passages(&id, &query_embedding, retrieval.top_k, retrieval.min_score)
        })
        .await
        .map_err(|err| ChatError::Retrieval(err.to_string()))??;

        let sources = annotate(&hits);
        let system_context = self.composer.compose(Some(&paper), &hits);
        tracing::debug!(
            paper = %paper.id,
            passages = hits.len(),
            context_tokens = estimate_tokens(&system_context, &TokenizerKind::Cl100k).ok(),
            "composed system context"
        );
        Ok(ChatPrompt {
            system_context,
            sources,
            paper: Some(paper),
        })
    }

    /// Run the full pipeline and stream the answer. The returned stream ends
    /// with exactly one `Done`; dropping it cancels the in-flight generation.
    pub async fn stream(
        &self,
        client: ChatClient,
        paper_id: Option<String>,
        turns: Vec<ConversationTurn>,
    ) -> Result<ReceiverStream<ResponseFragment>> {
        let prompt = self.prepare(paper_id.as_deref(), &turns).await?;
        let question = most_recent_user_message(&turns)
            .map(|turn| turn.content.clone())
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(32);
        let limits = self.limits;
        let usage = self.usage.clone();
        tokio::spawn(run_generation(
            client, prompt, turns, tx, limits, usage, question, paper_id,
        ));
        Ok(ReceiverStream::new(rx))
    }
}

fn annotate(hits: &[ScoredPassage]) -> Vec<SourceAnnotation> {
    hits.iter()
        .map(|hit| SourceAnnotation {
            paper_id: hit.passage.paper_id.clone(),
            score: hit.score,
            snippet: snippet_of(&hit.passage.text),
        })
        .collect()
}

fn snippet_of(text: &str) -> String {
    const SNIPPET_CHARS: usize = 160;
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(SNIPPET_CHARS).collect();
    format!("{cut}…")
}

#[allow(clippy::too_many_arguments)]
async fn run_generation(
    client: ChatClient,
    prompt: ChatPrompt,
    turns: Vec<ConversationTurn>,
    tx: mpsc::Sender<ResponseFragment>,
    limits: GenerationLimits,
    usage: UsageLogger,
    question: String,
    paper_id: Option<String>,
) {
    let mut finalizer = StreamFinalizer::new(tx.clone());

    // Annotations go out before the first token so consumers can render
    // provenance while text is still streaming.
    let _ = tx
        .send(ResponseFragment::Sources {
            sources: prompt.sources.clone(),
        })
        .await;

    let request = ChatRequest {
        system: Some(prompt.system_context),
        turns,
        json_output: false,
    };

    let mut completion = None;
    for _step in 0..limits.max_steps.max(1) {
        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(32);
        let fragment_tx = tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(text) = delta_rx.recv().await {
                if fragment_tx
                    .send(ResponseFragment::Delta { text })
                    .await
                    .is_err()
                {
                    // Receiver gone; dropping delta_rx cancels the producer.
                    break;
                }
            }
        });
        let result = client.stream_chat(&request, delta_tx).await;
        let _ = forward.await;
        match result {
            Ok(round) => {
                let wants_continuation = round.finish_reason.as_deref() == Some("tool_calls");
                completion = Some(round);
                if !wants_continuation {
                    break;
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "generation stream failed");
                let _ = tx
                    .send(ResponseFragment::Error {
                        message: err.to_string(),
                    })
                    .await;
                break;
            }
        }
    }

    if let Some(completion) = completion {
        let _ = tx
            .send(ResponseFragment::Usage {
                prompt_tokens: completion.prompt_tokens,
                completion_tokens: completion.completion_tokens,
            })
            .await;
        usage.record(
            &question,
            paper_id.as_deref(),
            json!({
                "model": client.model(),
                "prompt_tokens": completion.prompt_tokens,
                "completion_tokens": completion.completion_tokens,
                "passages": prompt.sources.len(),
            }),
        );
    }

    finalizer.close().await;
}

/// Owns the fragment sender for the close handshake. `close` emits `Done`
/// and drops the sender; taking the sender out makes a second close (or the
/// `Drop` fallback after an explicit close) a no-op, so the stream is
/// finalized exactly once on every exit path.
struct StreamFinalizer {
    tx: Option<mpsc::Sender<ResponseFragment>>,
}

impl StreamFinalizer {
    fn new(tx: mpsc::Sender<ResponseFragment>) -> Self {
        Self { tx: Some(tx) }
    }

    async fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ResponseFragment::Done).await;
        }
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(ResponseFragment::Done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PaperInsert, PassageInsert};
    use paperchat_core::{HashEmbedder, HashEmbedderConfig};
    use paperchat_llm::LlmProvider;
    use tempfile::tempdir;
    use tokio_stream::StreamExt;

    fn embedder() -> HashEmbedder {
        HashEmbedder::new(HashEmbedderConfig::default())
    }

    fn seeded_store(dir: &tempfile::TempDir) -> PaperStore {
        let store = PaperStore::open(dir.path().join("db.sqlite")).unwrap();
        store
            .insert_paper(&PaperInsert {
                id: "p1".to_string(),
                name: "Sparse Attention".to_string(),
                abstract_text: "We study sparse attention.".to_string(),
                authors: Vec::new(),
                topic: None,
                arxiv_id: None,
                source_id: None,
                searchable_text: "sparse attention".to_string(),
                related_models: None,
                embedding: embedder().embed_text("sparse attention"),
            })
            .unwrap();
        store
            .insert_passages(
                "p1",
                &[PassageInsert {
                    text: "Sparse attention reduces the quadratic cost.".to_string(),
                    abstract_text: None,
                    embedding: embedder().embed_text("sparse attention reduces the quadratic cost"),
                }],
            )
            .unwrap();
        store
    }

    fn pipeline(store: &PaperStore) -> ChatPipeline {
        ChatPipeline::new(
            store.clone(),
            EmbeddingClient::hash(),
            ContextComposer::default(),
            RetrievalConfig::default(),
            GenerationLimits::default(),
        )
    }

    fn local_client() -> ChatClient {
        ChatClient::new(LlmProvider::Local, "local").unwrap()
    }

    #[tokio::test]
    async fn prepare_rejects_conversation_without_user_turn() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let err = pipeline(&store)
            .prepare(None, &[ConversationTurn::assistant("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn prepare_rejects_unknown_paper() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let err = pipeline(&store)
            .prepare(Some("nope"), &[ConversationTurn::user("hello")])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn prepare_without_scope_uses_base_prompt_only() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let prompt = pipeline(&store)
            .prepare(None, &[ConversationTurn::user("hello")])
            .await
            .unwrap();
        assert!(prompt.sources.is_empty());
        assert!(prompt.paper.is_none());
        assert!(!prompt.system_context.is_empty());
    }

    #[tokio::test]
    async fn prepare_with_no_matches_still_composes_metadata_context() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        // Nothing in the passage overlaps this query, so the 0.4 floor
        // leaves retrieval empty.
        let prompt = pipeline(&store)
            .prepare(Some("p1"), &[ConversationTurn::user("medieval pottery glazes")])
            .await
            .unwrap();
        assert!(prompt.sources.is_empty());
        assert!(prompt.system_context.contains("### ABSTRACT ###"));
        assert!(!prompt.system_context.contains("RELEVANT SECTIONS"));
    }

    #[tokio::test]
    async fn stream_emits_sources_deltas_usage_done_in_order() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let mut stream = pipeline(&store)
            .stream(
                local_client(),
                Some("p1".to_string()),
                vec![ConversationTurn::user("sparse attention quadratic cost")],
            )
            .await
            .unwrap();
        let mut kinds = Vec::new();
        while let Some(fragment) = stream.next().await {
            kinds.push(match fragment {
                ResponseFragment::Sources { .. } => "sources",
                ResponseFragment::Delta { .. } => "delta",
                ResponseFragment::Usage { .. } => "usage",
                ResponseFragment::Error { .. } => "error",
                ResponseFragment::Done => "done",
            });
        }
        assert_eq!(kinds.first(), Some(&"sources"));
        assert_eq!(kinds.last(), Some(&"done"));
        assert_eq!(kinds.iter().filter(|k| **k == "done").count(), 1);
        assert!(kinds.contains(&"delta"));
        assert!(kinds.contains(&"usage"));
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_generation() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir);
        let stream = pipeline(&store)
            .stream(
                local_client(),
                Some("p1".to_string()),
                vec![ConversationTurn::user("sparse attention")],
            )
            .await
            .unwrap();
        // Simulated client disconnect: the generation task must wind down
        // on its own rather than hang on a full channel.
        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn finalizer_closes_exactly_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut finalizer = StreamFinalizer::new(tx);
        finalizer.close().await;
        finalizer.close().await;
        drop(finalizer);
        assert!(matches!(rx.recv().await, Some(ResponseFragment::Done)));
        assert!(rx.recv().await.is_none());
    }
}
