use serde::Deserialize;
use tokio::task;

use paperchat_core::{ChatError, ConversationTurn, Result, SuggestedQuestion};
use paperchat_llm::{ChatClient, ChatRequest};

use crate::prompts::SUGGESTED_QUESTIONS_PROMPT;
use crate::store::PaperStore;

#[derive(Deserialize)]
struct SuggestionsPayload {
    suggestions: Vec<SuggestedQuestion>,
}

/// Generate starter questions for a paper from its abstract. The model is
/// asked for a JSON object; anything that does not parse into the documented
/// shape is a generation error, not a silently empty list.
pub async fn suggested_questions(
    store: &PaperStore,
    client: &ChatClient,
    paper_id: &str,
) -> Result<Vec<SuggestedQuestion>> {
    let lookup = store.clone();
    let id = paper_id.to_string();
    let paper = task::spawn_blocking(move || lookup.get_paper(&id))
        .await
        .map_err(|err| ChatError::Database(err.to_string()))??
        .ok_or_else(|| ChatError::NotFound(format!("paper {paper_id}")))?;

    let request = ChatRequest {
        system: Some(SUGGESTED_QUESTIONS_PROMPT.to_string()),
        turns: vec![ConversationTurn::user(format!(
            "Generate 3 questions about this paper abstract: {}",
            paper.abstract_text
        ))],
        json_output: true,
    };
    let completion = client
        .chat(&request)
        .await
        .map_err(|err| ChatError::Generation(err.to_string()))?;
    let payload: SuggestionsPayload = serde_json::from_str(&completion.content)
        .map_err(|err| ChatError::Generation(format!("malformed suggestions payload: {err}")))?;
    Ok(payload.suggestions)
}
