//! HTTP transport.
//!
//! ## Endpoints
//!
//! - `POST /api/chat`                                - blocking, stateless
//! - `POST /api/chat/stream`                         - event stream, stateless
//! - `POST /api/conversations`                       - create a conversation
//! - `GET  /api/conversations/:id/messages`          - stored messages in order
//! - `POST /api/conversations/:id/messages`          - blocking, persisted
//! - `POST /api/conversations/:id/messages/stream`   - event stream, persisted
//!
//! Stream bodies are written frame by frame as the orchestrator produces
//! them. A client that disconnects cancels the run.

use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{authenticate, AuthError, CurrentUser, StaticTokens, TokenValidator};
use crate::config::{AppConfig, ServerConfig};
use crate::conversation::{
    entitle_in_background, Conversation, ConversationStore, MemoryStore, NewMessage,
    StoreError, StoredMessage,
};
use crate::error::ChatError;
use crate::orchestrator::ChatOrchestrator;
use crate::sse::{frame_stream, EventEmitter};
use crate::types::{ChatMessage, ChatOptions, ChatRequest, ChatResult};

// --- State ---

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub store: Arc<dyn ConversationStore>,
    pub auth: Arc<dyn TokenValidator>,
    pub server: Arc<ServerConfig>,
}

impl AppState {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            orchestrator: Arc::new(ChatOrchestrator::from_config(config)),
            store: Arc::new(MemoryStore::new()),
            auth: Arc::new(StaticTokens::from_config(&config.server)),
            server: Arc::new(config.server.clone()),
        }
    }

    fn check_model(&self, model: Option<&str>) -> Result<(), ApiError> {
        match model {
            Some(model) if !self.server.model_allowed(model) => {
                Err(ApiError::ModelNotAllowed(model.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// The conversation, if it exists and belongs to `user`.
    async fn owned_conversation(
        &self,
        user: &CurrentUser,
        id: u64,
    ) -> Result<Conversation, ApiError> {
        let conversation = self.store.conversation(id).await?;
        if conversation.user_id != user.0 {
            return Err(ApiError::NotFound(id));
        }
        Ok(conversation)
    }
}

// --- Errors ---

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    BadRequest(String),
    #[error("Model {0} is not allowed")]
    ModelNotAllowed(String),
    #[error("Conversation {0} not found")]
    NotFound(u64),
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::NotFound(id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::ModelNotAllowed(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Chat(_) => StatusCode::BAD_GATEWAY,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// --- Router ---

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/conversations", post(create_conversation))
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(post_message),
        )
        .route(
            "/api/conversations/:id/messages/stream",
            post(post_message_stream),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_user))
        .with_state(state)
}

pub async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("Listening on http://{}", listener.local_addr()?);
    if config.server.tokens.is_empty() {
        warn!("No tokens configured, authentication is disabled");
    }
    if !config.chat.enabled {
        warn!("Chat providers disabled, replies are echoed");
    }
    axum::serve(listener, router(AppState::from_config(config)))
        .await
        .context("Server error")
}

async fn require_user(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let user = authenticate(state.auth.as_ref(), header)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

// --- Stateless ---

/// POST /api/chat
async fn chat(
    State(state): State<AppState>,
    Json(mut request): Json<ChatRequest>,
) -> Result<Json<ChatResult>, ApiError> {
    validate(&state, &request)?;
    request.stream = false;
    let result = state.orchestrator.complete(&request).await?;
    Ok(Json(result))
}

/// POST /api/chat/stream
async fn chat_stream(
    State(state): State<AppState>,
    Json(mut request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    validate(&state, &request)?;
    request.stream = true;
    Ok(stream_response(state, request, None))
}

fn validate(state: &AppState, request: &ChatRequest) -> Result<(), ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".to_string()));
    }
    state.check_model(request.model.as_deref())
}

// --- Conversations ---

#[derive(Debug, Default, Deserialize)]
struct CreateConversation {
    #[serde(default)]
    model_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Created {
    pub id: u64,
}

/// POST /api/conversations
async fn create_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    body: Option<Json<CreateConversation>>,
) -> Result<Json<Created>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    state.check_model(body.model_code.as_deref())?;
    let conversation = state
        .store
        .create_conversation(&user.0, body.model_code)
        .await?;
    info!("Created conversation {} for {}", conversation.id, user.0);
    Ok(Json(Created {
        id: conversation.id,
    }))
}

/// GET /api/conversations/:id/messages
async fn list_messages(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    state.owned_conversation(&user, id).await?;
    Ok(Json(state.store.messages(id).await?))
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    content: String,
    #[serde(default)]
    model_code: Option<String>,
    #[serde(default)]
    use_persona: bool,
    #[serde(default)]
    use_scaffolding: bool,
}

/// Store the user message and build the request over the whole history.
async fn record_user_message(
    state: &AppState,
    user: &CurrentUser,
    id: u64,
    body: MessageBody,
    stream: bool,
) -> Result<ChatRequest, ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".to_string()));
    }
    let conversation = state.owned_conversation(user, id).await?;
    let model = body.model_code.or(conversation.model_code);
    state.check_model(model.as_deref())?;

    let stored = state
        .store
        .append_message(id, NewMessage::user(body.content.clone()))
        .await?;
    // decided under the store's write lock, so only one first post titles
    if stored.seq == 1 {
        entitle_in_background(
            state.store.clone(),
            state.orchestrator.clone(),
            id,
            body.content,
        );
    }

    let history: Vec<ChatMessage> = state
        .store
        .messages(id)
        .await?
        .iter()
        .map(StoredMessage::to_chat_message)
        .collect();
    let options = ChatOptions {
        use_persona: body.use_persona,
        use_scaffolding: body.use_scaffolding,
        stream,
    };
    Ok(ChatRequest::new(history, model, options))
}

/// POST /api/conversations/:id/messages
async fn post_message(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<u64>,
    Json(body): Json<MessageBody>,
) -> Result<Json<ChatResult>, ApiError> {
    let request = record_user_message(&state, &user, id, body, false).await?;
    match state.orchestrator.complete(&request).await {
        Ok(result) => {
            let usage = Some(result.tokens.flatten());
            state
                .store
                .append_message(id, NewMessage::assistant(result.reply.clone(), usage))
                .await?;
            Ok(Json(result))
        }
        Err(e) => {
            state
                .store
                .append_message(id, NewMessage::assistant(format!("Error: {e}"), None))
                .await?;
            Err(e.into())
        }
    }
}

/// POST /api/conversations/:id/messages/stream
async fn post_message_stream(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<u64>,
    Json(body): Json<MessageBody>,
) -> Result<Response, ApiError> {
    let request = record_user_message(&state, &user, id, body, true).await?;
    Ok(stream_response(state, request, Some(id)))
}

// --- Streaming ---

/// Run `request` on a background task and return its frames as the
/// response body. With `persist`, the assistant reply (or the error) is
/// appended to that conversation when the run ends.
fn stream_response(state: AppState, request: ChatRequest, persist: Option<u64>) -> Response {
    let request_id = Uuid::new_v4();
    let (mut emitter, rx) = EventEmitter::channel();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    info!("[{request_id}] Streaming chat started");
    let heartbeat = state.server.heartbeat();
    tokio::spawn(async move {
        let outcome = state
            .orchestrator
            .stream(&request, &mut emitter, &cancel)
            .await;
        drop(emitter);

        let stored = match outcome {
            Ok(transcript) => {
                info!("[{request_id}] Streaming chat finished");
                Some(NewMessage::assistant(transcript.reply, None))
            }
            Err(ChatError::Cancelled | ChatError::Disconnected) => {
                info!("[{request_id}] Client went away, run abandoned");
                None
            }
            Err(e) => Some(NewMessage::assistant(format!("Error: {e}"), None)),
        };
        if let (Some(id), Some(message)) = (persist, stored) {
            if let Err(e) = state.store.append_message(id, message).await {
                error!("[{request_id}] Failed to store reply: {e}");
            }
        }
    });

    // The guard lives as long as the body; hyper drops the body when the
    // client disconnects, which cancels the run.
    let frames = frame_stream(rx, heartbeat).map(move |frame| {
        let _guard = &guard;
        frame
    });

    let mut response = Response::new(Body::from_stream(frames));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
