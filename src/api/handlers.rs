//! HTTP request handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Json, Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::api::models::*;
use crate::api::streams::StreamRegistry;
use crate::chat::{ChatOrchestrator, ChatTask};
use crate::scope::{RequestScope, ScopeGuard};
use crate::store::PgStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PgStore>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub streams: StreamRegistry,
    pub request_deadline: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<PgStore>,
        orchestrator: Arc<ChatOrchestrator>,
        request_deadline: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            streams: StreamRegistry::new(),
            request_deadline,
        }
    }
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(ErrorResponse::new("not_found", format!("{} not found", what))),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(ErrorResponse::new("invalid_request", message)),
    )
        .into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(ErrorResponse::new("internal", "Internal error, please retry.")),
    )
        .into_response()
}

/// Health check: one round trip to the store.
pub async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => axum::Json(HealthResponse {
            status: "ok".to_string(),
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(ErrorResponse::new("internal", "store unreachable")),
            )
                .into_response()
        }
    }
}

/// List collections with document counts.
pub async fn list_collections(State(state): State<AppState>) -> Response {
    match state.store.list_collections().await {
        Ok(collections) => {
            let infos: Vec<CollectionInfo> = collections
                .into_iter()
                .map(|(collection, file_count)| CollectionInfo {
                    id: collection.id,
                    name: collection.name,
                    collection_type: "graphrag".to_string(),
                    file_count,
                })
                .collect();
            axum::Json(infos).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ---------- Conversations ----------

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(request): Json<ConversationCreate>,
) -> Response {
    match state.store.collection_exists(request.collection_id).await {
        Ok(true) => {}
        Ok(false) => return not_found("collection"),
        Err(e) => return internal_error(e),
    }

    match state
        .store
        .create_conversation(request.collection_id, request.title.as_deref())
        .await
    {
        Ok(conversation) => {
            axum::Json(ConversationView::from_conversation(conversation)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ConversationListQuery>,
) -> Response {
    match state.store.conversations(query.collection_id).await {
        Ok(conversations) => {
            let views: Vec<ConversationView> = conversations
                .into_iter()
                .map(ConversationView::from_conversation)
                .collect();
            axum::Json(views).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Response {
    let conversation = match state.store.conversation(conversation_id).await {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return not_found("conversation"),
        Err(e) => return internal_error(e),
    };

    match state.store.messages_for_conversation(conversation_id).await {
        Ok(messages) => axum::Json(
            ConversationView::from_conversation(conversation).with_messages(messages),
        )
        .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn update_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<ConversationUpdate>,
) -> Response {
    match state
        .store
        .rename_conversation(conversation_id, &request.title)
        .await
    {
        Ok(Some(conversation)) => {
            axum::Json(ConversationView::from_conversation(conversation)).into_response()
        }
        Ok(None) => not_found("conversation"),
        Err(e) => internal_error(e),
    }
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Response {
    match state.store.delete_conversation(conversation_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found("conversation"),
        Err(e) => internal_error(e),
    }
}

// ---------- Chat ----------

/// `POST /api/chat`: validate, then answer as an SSE stream of
/// `info chat* (done | error)` events.
pub async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(&rejection.body_text()),
    };

    if request.message.trim().is_empty() {
        return bad_request("message must not be empty");
    }

    match state.store.collection_exists(request.collection_id).await {
        Ok(true) => {}
        Ok(false) => return not_found("collection"),
        Err(e) => return internal_error(e),
    }

    if let Some(conversation_id) = request.conversation_id {
        match state.store.conversation(conversation_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return not_found("conversation"),
            Err(e) => return internal_error(e),
        }
    }

    let scope = RequestScope::new(state.request_deadline);
    // Only streams that announced a request_id can be aborted through the
    // abort endpoint; the rest cancel via disconnect or deadline.
    let registration = request
        .request_id
        .clone()
        .map(|request_id| state.streams.register(request_id, scope.token()));

    let task = ChatTask {
        message: request.message,
        collection_id: request.collection_id,
        conversation_id: request.conversation_id,
    };

    let events = state.orchestrator.clone().run(task, scope.clone());

    let sse_stream = stream! {
        // Dropped when the client disconnects; cancels all backend work and
        // removes the abort-registry entry.
        let _guard = ScopeGuard::new(scope);
        let _registration = registration;

        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            yield Ok::<_, Infallible>(
                Event::default()
                    .event(event.name())
                    .data(event.payload().to_string()),
            );
        }
    };

    Sse::new(sse_stream).into_response()
}

/// `DELETE /api/chat/abort`: cancel the caller's current stream, identified
/// by the `request_id` it supplied on `POST /api/chat`. Aborting without one
/// is rejected; guessing on the caller's behalf could cancel someone else's
/// stream.
pub async fn abort_chat(
    State(state): State<AppState>,
    Query(query): Query<AbortQuery>,
) -> Response {
    let Some(request_id) = query.request_id.as_deref() else {
        return bad_request("request_id is required to abort a stream");
    };

    if state.streams.abort(request_id) {
        tracing::info!(request_id, "stream aborted by client");
    }
    StatusCode::NO_CONTENT.into_response()
}

// ---------- Documents ----------

/// Stream the stored PDF for in-browser viewing.
pub async fn serve_pdf(State(state): State<AppState>, Path(document_id): Path<String>) -> Response {
    let document = match state.store.document(&document_id).await {
        Ok(Some(document)) => document,
        Ok(None) => return not_found("document"),
        Err(e) => return internal_error(e),
    };

    let Some(pdf_path) = document.pdf_path else {
        return not_found("PDF");
    };

    let file = match tokio::fs::File::open(&pdf_path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %pdf_path, error = %e, "PDF missing from storage");
            return not_found("PDF file");
        }
    };

    let filename = document
        .original_filename
        .unwrap_or_else(|| {
            std::path::Path::new(&pdf_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document.pdf".to_string())
        });

    let body = Body::from_stream(ReaderStream::new(file));
    (
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", filename.replace('"', "")),
            ),
        ],
        body,
    )
        .into_response()
}
