use crate::error::{ChatError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub enum TokenizerKind {
    #[default]
    Cl100k,
    O200k,
}

impl TokenizerKind {
    pub fn build(&self) -> Result<tiktoken_rs::CoreBPE> {
        match self {
            TokenizerKind::Cl100k => {
                tiktoken_rs::cl100k_base().map_err(|e| ChatError::Tokenizer(e.to_string()))
            }
            TokenizerKind::O200k => {
                tiktoken_rs::o200k_base().map_err(|e| ChatError::Tokenizer(e.to_string()))
            }
        }
    }
}

/// Estimate the token footprint of a prompt. Used for telemetry only; the
/// count never gates a request.
pub fn estimate_tokens(text: &str, tokenizer: &TokenizerKind) -> Result<usize> {
    let encoder = tokenizer.build()?;
    Ok(encoder.encode_with_special_tokens(text).len())
}
