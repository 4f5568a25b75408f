use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::Deserialize;
use thiserror::Error;
use tokio::task;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info};

use paperchat_core::{ChatError, ConversationTurn, Paper};
use paperchat_llm::{
    default_models, find_model, ChatClient, LlmProvider, ModelSpec, DEFAULT_MODEL_ID,
};
use paperchat_rag::{
    load_config, suggested_questions, ChatPipeline, ContextComposer, EmbeddingClient,
    GenerationLimits, PaperResolver, PaperStore, ResponseFragment,
};

struct AppState {
    store: PaperStore,
    resolver: PaperResolver,
    pipeline: ChatPipeline,
    models: Vec<ModelSpec>,
    provider: LlmProvider,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let store_path = std::env::var("PAPERCHAT_DB").unwrap_or_else(|_| "papers.sqlite".to_string());
    let config_path =
        std::env::var("PAPERCHAT_CONFIG").unwrap_or_else(|_| "paperchat.toml".to_string());
    let config = load_config(Path::new(&config_path));
    let store = PaperStore::open(&store_path)?;
    let embed_client = EmbeddingClient::from_env().unwrap_or_else(|_| EmbeddingClient::hash());
    let provider = std::env::var("LLM_PROVIDER")
        .ok()
        .and_then(|value| LlmProvider::from_str(&value))
        .unwrap_or(LlmProvider::Cerebras);
    let resolver = PaperResolver::new(store.clone(), embed_client.clone(), config.resolver);
    let pipeline = ChatPipeline::new(
        store.clone(),
        embed_client,
        ContextComposer::default(),
        config.retrieval,
        GenerationLimits::default(),
    );
    let state = Arc::new(AppState {
        store,
        resolver,
        pipeline,
        models: default_models(),
        provider,
    });
    let app = Router::new()
        .route("/api/papers", get(handle_papers))
        .route("/api/suggested-questions", get(handle_suggested_questions))
        .route("/api/models", get(handle_models))
        .route("/api/chat", post(handle_chat))
        .with_state(state);
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PapersParams {
    id: Option<String>,
    query: Option<String>,
}

async fn handle_papers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PapersParams>,
) -> Result<Json<Vec<Paper>>, AppError> {
    if let Some(id) = params.id {
        let store = state.store.clone();
        let lookup_id = id.clone();
        let paper = task::spawn_blocking(move || store.get_paper(&lookup_id))
            .await
            .map_err(AppError::internal)?
            .map_err(AppError::from)?;
        return match paper {
            Some(paper) => Ok(Json(without_embeddings(vec![paper]))),
            None => Err(AppError::NotFound(format!("paper {id}"))),
        };
    }
    let papers = state.resolver.resolve(params.query.as_deref()).await?;
    Ok(Json(without_embeddings(papers)))
}

#[derive(Debug, Deserialize)]
struct SuggestedQuestionsParams {
    id: Option<String>,
}

async fn handle_suggested_questions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SuggestedQuestionsParams>,
) -> Result<Response, AppError> {
    let id = params
        .id
        .ok_or_else(|| AppError::BadRequest("missing id".to_string()))?;
    let client = build_chat_client(&state, None)?;
    let questions = suggested_questions(&state.store, &client, &id).await?;
    Ok(Json(questions).into_response())
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<Vec<ModelSpec>> {
    Json(state.models.clone())
}

#[derive(Debug, Deserialize)]
struct ChatRequestBody {
    messages: Vec<ConversationTurn>,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    paper_id: Option<String>,
}

async fn handle_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let client = build_chat_client(&state, body.model_id.as_deref())?;
    let fragments = state
        .pipeline
        .stream(client, body.paper_id, body.messages)
        .await?;
    let events = fragments.map(|fragment| Ok::<Event, Infallible>(fragment_event(fragment)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn build_chat_client(state: &AppState, model_id: Option<&str>) -> Result<ChatClient, AppError> {
    let model_id = model_id.unwrap_or(DEFAULT_MODEL_ID);
    let model = find_model(&state.models, model_id)
        .ok_or_else(|| AppError::NotFound(format!("model {model_id}")))?;
    ChatClient::new(state.provider, model.api_identifier).map_err(AppError::internal)
}

fn fragment_event(fragment: ResponseFragment) -> Event {
    let name = match &fragment {
        ResponseFragment::Sources { .. } => "sources",
        ResponseFragment::Delta { .. } => "delta",
        ResponseFragment::Usage { .. } => "usage",
        ResponseFragment::Error { .. } => "error",
        ResponseFragment::Done => "done",
    };
    match &fragment {
        ResponseFragment::Delta { text } => Event::default().event(name).data(text.clone()),
        ResponseFragment::Done => Event::default().event(name).data("[DONE]"),
        other => Event::default()
            .event(name)
            .json_data(other)
            .unwrap_or_else(|_| Event::default().event(name).data("{}")),
    }
}

/// The API exposes papers as display data; the stored vectors are an
/// implementation detail and considerable payload weight.
fn without_embeddings(papers: Vec<Paper>) -> Vec<Paper> {
    papers
        .into_iter()
        .map(|mut paper| {
            paper.embedding = Vec::new();
            paper
        })
        .collect()
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Validation(msg) => AppError::BadRequest(msg),
            ChatError::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal(err) => {
                error!("internal_error" = %err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}
