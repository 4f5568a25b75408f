mod conversation;
mod embedding;
mod error;
mod paper;
mod retry;
mod sanitize;
mod similarity;
mod tokens;

pub use conversation::{most_recent_user_message, ConversationTurn, Role};
pub use embedding::{HashEmbedder, HashEmbedderConfig, EMBEDDING_DIM};
pub use error::{ChatError, Result};
pub use paper::{Author, Paper, Passage, ScoredPassage, SuggestedQuestion};
pub use retry::RetryPolicy;
pub use sanitize::{sanitize_search_query, strip_control_chars};
pub use similarity::{cosine_similarity, normalize};
pub use tokens::{estimate_tokens, TokenizerKind};
