mod composer;
mod config;
mod embedding;
mod pipeline;
mod prompts;
mod resolver;
mod store;
mod suggest;
mod usage;

pub use composer::ContextComposer;
pub use config::{load_config, RagConfig, ResolverConfig, RetrievalConfig};
pub use embedding::{EmbeddingBackend, EmbeddingClient, OpenAiEmbeddingClient};
pub use pipeline::{
    ChatPipeline, ChatPrompt, GenerationLimits, ResponseFragment, SourceAnnotation,
};
pub use prompts::{REGULAR_PROMPT, SUGGESTED_QUESTIONS_PROMPT, TECHNICAL_PAPER_PROMPT};
pub use resolver::PaperResolver;
pub use store::{PaperInsert, PaperStore, PassageInsert};
pub use suggest::suggested_questions;
pub use usage::UsageLogger;
pub use paperchat_llm::{ChatClient, ChatRequest, LlmProvider};
