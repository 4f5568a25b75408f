use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use paperchat_core::{Author, ConversationTurn};
use paperchat_llm::{default_models, find_model, ChatClient, LlmProvider, DEFAULT_MODEL_ID};
use paperchat_rag::{
    load_config, ChatPipeline, ContextComposer, EmbeddingClient, GenerationLimits, PaperInsert,
    PaperResolver, PaperStore, PassageInsert, ResponseFragment,
};

const DEFAULT_CONFIG: &str = "paperchat.toml";

#[derive(Parser, Debug)]
#[command(name = "paperchat", version, about = "Chat-over-papers corpus tools")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value = "papers.sqlite")]
    db: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load papers and passages from a JSONL file into the store.
    Ingest {
        input: PathBuf,
    },
    /// Hybrid search over the corpus.
    Search {
        query: String,
    },
    /// List a browse page of papers.
    Papers,
    /// Ask one grounded question about a paper and stream the answer.
    Ask {
        paper_id: String,
        question: String,
        #[arg(long, default_value = DEFAULT_MODEL_ID)]
        model: String,
        #[arg(long, default_value = "local")]
        provider: String,
    },
}

/// One line of the ingest file. Embeddings are computed here, so records
/// carry text only.
#[derive(Debug, Deserialize)]
struct PaperRecord {
    id: String,
    name: String,
    #[serde(default)]
    abstract_text: String,
    #[serde(default)]
    authors: Vec<Author>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    arxiv_id: Option<String>,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    searchable_text: String,
    #[serde(default)]
    related_models: Option<Value>,
    #[serde(default)]
    passages: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = load_config(&config_path);
    let store = PaperStore::open(&cli.db)?;
    let embeddings = EmbeddingClient::from_env().unwrap_or_else(|_| EmbeddingClient::hash());

    match cli.command {
        Commands::Ingest { input } => ingest(&store, &embeddings, &input).await,
        Commands::Search { query } => {
            let resolver = PaperResolver::new(store, embeddings, config.resolver);
            let papers = resolver.resolve(Some(&query)).await?;
            print_papers(&papers);
            Ok(())
        }
        Commands::Papers => {
            let resolver = PaperResolver::new(store, embeddings, config.resolver);
            let papers = resolver.resolve(None).await?;
            print_papers(&papers);
            Ok(())
        }
        Commands::Ask {
            paper_id,
            question,
            model,
            provider,
        } => {
            ask(
                store, embeddings, config.retrieval, &paper_id, &question, &model, &provider,
            )
            .await
        }
    }
}

async fn ingest(store: &PaperStore, embeddings: &EmbeddingClient, input: &Path) -> Result<()> {
    let file = File::open(input).with_context(|| format!("cannot open {}", input.display()))?;
    let reader = BufReader::new(file);
    let mut papers = 0usize;
    let mut passages = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: PaperRecord = serde_json::from_str(&line)
            .with_context(|| format!("invalid record on line {}", line_no + 1))?;
        let searchable = if record.searchable_text.trim().is_empty() {
            format!("{} {}", record.name, record.abstract_text)
        } else {
            record.searchable_text.clone()
        };
        let paper_embedding = embeddings.embed(&searchable).await?;
        store.insert_paper(&PaperInsert {
            id: record.id.clone(),
            name: record.name,
            abstract_text: record.abstract_text.clone(),
            authors: record.authors,
            topic: record.topic,
            arxiv_id: record.arxiv_id,
            source_id: record.source_id,
            searchable_text: searchable,
            related_models: record.related_models,
            embedding: paper_embedding,
        })?;
        papers += 1;
        if record.passages.is_empty() {
            continue;
        }
        let vectors = embeddings.embed_batch(&record.passages).await?;
        let inserts: Vec<PassageInsert> = record
            .passages
            .into_iter()
            .zip(vectors)
            .map(|(text, embedding)| PassageInsert {
                text,
                abstract_text: Some(record.abstract_text.clone()),
                embedding,
            })
            .collect();
        passages += store.insert_passages(&record.id, &inserts)?;
    }
    println!("ingested {papers} papers, {passages} passages");
    println!("store now holds {} papers", store.paper_count()?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn ask(
    store: PaperStore,
    embeddings: EmbeddingClient,
    retrieval: paperchat_rag::RetrievalConfig,
    paper_id: &str,
    question: &str,
    model: &str,
    provider: &str,
) -> Result<()> {
    let Some(provider) = LlmProvider::from_str(provider) else {
        bail!("unknown provider {provider}");
    };
    let models = default_models();
    let spec = find_model(&models, model);
    let api_identifier = spec.map(|m| m.api_identifier).unwrap_or(model);
    let client = ChatClient::new(provider, api_identifier)?;
    let pipeline = ChatPipeline::new(
        store,
        embeddings,
        ContextComposer::default(),
        retrieval,
        GenerationLimits::default(),
    );
    let mut stream = pipeline
        .stream(
            client,
            Some(paper_id.to_string()),
            vec![ConversationTurn::user(question)],
        )
        .await?;
    let mut stdout = std::io::stdout();
    use tokio_stream::StreamExt;
    while let Some(fragment) = stream.next().await {
        match fragment {
            ResponseFragment::Sources { sources } => {
                for source in &sources {
                    eprintln!("[source {:.2}] {}", source.score, source.snippet);
                }
            }
            ResponseFragment::Delta { text } => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            ResponseFragment::Usage {
                prompt_tokens,
                completion_tokens,
            } => {
                eprintln!("\n[usage] prompt={prompt_tokens} completion={completion_tokens}");
            }
            ResponseFragment::Error { message } => bail!("generation failed: {message}"),
            ResponseFragment::Done => break,
        }
    }
    println!();
    Ok(())
}

fn print_papers(papers: &[paperchat_core::Paper]) {
    if papers.is_empty() {
        println!("no papers found");
        return;
    }
    for paper in papers {
        let topic = paper.topic.as_deref().unwrap_or("-");
        println!("{:<24} {:<10} {}", paper.id, topic, paper.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paper_record_parses_minimal_line() {
        let record: PaperRecord =
            serde_json::from_str(r#"{"id": "p1", "name": "Sparse Attention"}"#).unwrap();
        assert_eq!(record.id, "p1");
        assert!(record.passages.is_empty());
    }

    #[test]
    fn paper_record_parses_full_line() {
        let record: PaperRecord = serde_json::from_str(
            r#"{
                "id": "p1",
                "name": "Sparse Attention",
                "abstract_text": "We study sparsity.",
                "authors": [{"name": "J. Doe", "institution": "MIT"}],
                "topic": "ml",
                "arxiv_id": "2401.00001",
                "searchable_text": "sparse attention",
                "passages": ["Section 1.", "Section 2."]
            }"#,
        )
        .unwrap();
        assert_eq!(record.passages.len(), 2);
        assert_eq!(record.authors[0].institution.as_deref(), Some("MIT"));
    }

    #[test]
    fn cli_parses_ask_with_defaults() {
        let cli = Cli::parse_from(["paperchat", "ask", "p1", "what is attention"]);
        match cli.command {
            Commands::Ask {
                paper_id,
                question,
                model,
                provider,
            } => {
                assert_eq!(paper_id, "p1");
                assert_eq!(question, "what is attention");
                assert_eq!(model, DEFAULT_MODEL_ID);
                assert_eq!(provider, "local");
            }
            _ => panic!("wrong command"),
        }
    }
}
