//! Chat orchestration.
//!
//! Drives one question end to end: retrieve context, announce citations,
//! stream the model's answer, persist the exchange. The produced event
//! stream always matches `info chat* (done | error)`; an aborted request
//! closes silently and persists nothing.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{ChatConfig, RetrievalSettings};
use crate::error::{Error, Result};
use crate::prompt;
use crate::retriever::HybridRetriever;
use crate::scope::RequestScope;
use crate::store::ConversationStore;
use crate::types::{MessageRole, Source};

/// Prior messages replayed to the generation service.
const HISTORY_LIMIT: i64 = 10;
/// In-flight deltas buffered between the model reader and the SSE writer.
const DELTA_BUFFER: usize = 64;
/// How long a stalled SSE consumer may block the reader before the request
/// is dropped as `client_slow`.
const SLOW_CLIENT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// One unit read off the generation stream.
#[derive(Debug, Clone)]
pub enum ChatDelta {
    Content(String),
    /// Completion token count, reported once at end of stream when the
    /// service supports usage accounting.
    Usage(u32),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatDelta>> + Send>>;

/// A streaming chat-completion backend.
#[async_trait]
pub trait ChatService: Send + Sync + 'static {
    async fn stream_chat(&self, turns: Vec<ChatTurn>) -> Result<ChatStream>;
}

/// OpenAI-compatible backend (vLLM and friends).
pub struct OpenAiChat {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
}

impl OpenAiChat {
    pub fn from_config(config: &ChatConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_base(&config.endpoint)
            .with_api_key("not-needed");
        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    fn build_messages(turns: Vec<ChatTurn>) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages = Vec::with_capacity(turns.len());
        for turn in turns {
            let message = match turn.role {
                ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(turn.content)
                    .build()
                    .map(ChatCompletionRequestMessage::System),
                ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content)
                    .build()
                    .map(ChatCompletionRequestMessage::User),
                ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content)
                    .build()
                    .map(ChatCompletionRequestMessage::Assistant),
            }
            .map_err(|e| Error::GenerationUnavailable(format!("bad chat message: {}", e)))?;
            messages.push(message);
        }
        Ok(messages)
    }
}

#[async_trait]
impl ChatService for OpenAiChat {
    async fn stream_chat(&self, turns: Vec<ChatTurn>) -> Result<ChatStream> {
        let messages = Self::build_messages(turns)?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .max_tokens(self.max_tokens)
            .stream(true)
            .build()
            .map_err(|e| Error::GenerationUnavailable(format!("bad chat request: {}", e)))?;

        let mut response_stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| Error::GenerationUnavailable(e.to_string()))?;

        let stream = stream! {
            while let Some(item) = response_stream.next().await {
                match item {
                    Ok(response) => {
                        if let Some(usage) = &response.usage {
                            yield Ok(ChatDelta::Usage(usage.completion_tokens));
                        }
                        if let Some(choice) = response.choices.first() {
                            if let Some(content) = &choice.delta.content {
                                if !content.is_empty() {
                                    yield Ok(ChatDelta::Content(content.clone()));
                                }
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(Error::GenerationInterrupted(e.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// A chat request as accepted by the orchestrator; request-shape validation
/// (existence of the collection and conversation) happens before this point.
#[derive(Debug, Clone)]
pub struct ChatTask {
    pub message: String,
    pub collection_id: i32,
    pub conversation_id: Option<Uuid>,
}

/// Events on the client-facing stream, in wire shape.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Info {
        sources: Vec<Source>,
    },
    Chat {
        content: String,
        message_id: Uuid,
    },
    Done {
        message_id: Uuid,
        tokens_used: Option<u32>,
    },
    Error {
        kind: &'static str,
        error: &'static str,
    },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Info { .. } => "info",
            ChatEvent::Chat { .. } => "chat",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            ChatEvent::Info { sources } => json!({ "sources": sources }),
            ChatEvent::Chat {
                content,
                message_id,
            } => json!({ "content": content, "message_id": message_id }),
            ChatEvent::Done {
                message_id,
                tokens_used,
            } => match tokens_used {
                Some(n) => json!({ "message_id": message_id, "tokens_used": n }),
                None => json!({ "message_id": message_id }),
            },
            ChatEvent::Error { kind, error } => json!({ "error": error, "kind": kind }),
        }
    }

    fn from_error(e: &Error) -> Self {
        ChatEvent::Error {
            kind: e.kind(),
            error: e.user_message(),
        }
    }
}

pub struct ChatOrchestrator {
    retriever: Arc<HybridRetriever>,
    conversations: Arc<dyn ConversationStore>,
    chat: Arc<dyn ChatService>,
    settings: RetrievalSettings,
}

impl ChatOrchestrator {
    pub fn new(
        retriever: Arc<HybridRetriever>,
        conversations: Arc<dyn ConversationStore>,
        chat: Arc<dyn ChatService>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            retriever,
            conversations,
            chat,
            settings,
        }
    }

    /// Run one request to completion, yielding the ordered event stream.
    pub fn run(
        self: Arc<Self>,
        task: ChatTask,
        scope: RequestScope,
    ) -> impl Stream<Item = ChatEvent> + Send {
        stream! {
            // Prior turns; a history failure degrades to a fresh exchange.
            let history = match task.conversation_id {
                Some(conversation_id) => {
                    match self
                        .conversations
                        .history(&scope, conversation_id, HISTORY_LIMIT)
                        .await
                    {
                        Ok(history) => history,
                        Err(Error::Cancelled) | Err(Error::DeadlineExceeded) => return,
                        Err(e) => {
                            tracing::warn!(error = %e, "history load failed, continuing without");
                            Vec::new()
                        }
                    }
                }
                None => Vec::new(),
            };

            let context = match self
                .retriever
                .retrieve(&scope, task.collection_id, &task.message)
                .await
            {
                Ok(context) => context,
                Err(Error::Cancelled) | Err(Error::DeadlineExceeded) => return,
                Err(e) => {
                    tracing::error!(error = %e, collection_id = task.collection_id, "retrieval failed");
                    yield ChatEvent::from_error(&e);
                    return;
                }
            };

            let sources = prompt::sources(&context);
            yield ChatEvent::Info { sources: sources.clone() };

            let context_block =
                prompt::format_context(&context, self.settings.prompt_char_budget);

            let mut turns = Vec::with_capacity(history.len() + 2);
            turns.push(ChatTurn {
                role: ChatRole::System,
                content: prompt::SYSTEM_PROMPT.to_string(),
            });
            for (role, content) in history {
                turns.push(ChatTurn {
                    role: match role {
                        MessageRole::User => ChatRole::User,
                        MessageRole::Assistant => ChatRole::Assistant,
                    },
                    content,
                });
            }
            turns.push(ChatTurn {
                role: ChatRole::User,
                content: prompt::user_turn(&context_block, &task.message),
            });

            let message_id = Uuid::new_v4();

            let delta_stream = match scope.run(self.chat.stream_chat(turns)).await {
                Ok(stream) => stream,
                Err(Error::Cancelled) | Err(Error::DeadlineExceeded) => return,
                Err(e) => {
                    tracing::error!(error = %e, "chat service unavailable");
                    yield ChatEvent::from_error(&e);
                    return;
                }
            };

            let mut deltas = relay_deltas(delta_stream, scope.clone());

            let mut answer = String::new();
            let mut tokens_used = None;
            let mut stream_error: Option<Error> = None;

            while let Some(item) = deltas.recv().await {
                match item {
                    Ok(ChatDelta::Content(content)) => {
                        answer.push_str(&content);
                        yield ChatEvent::Chat { content, message_id };
                    }
                    Ok(ChatDelta::Usage(n)) => tokens_used = Some(n),
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                }
            }

            // Covers abort, disconnect, deadline and client_slow alike: stop
            // silently, persist nothing.
            if scope.is_cancelled() {
                return;
            }

            if let Some(e) = stream_error {
                // No delta ever arrived: the service was unavailable rather
                // than interrupted.
                let e = if answer.is_empty() {
                    Error::GenerationUnavailable(e.to_string())
                } else {
                    e
                };
                tracing::error!(error = %e, "generation stream failed");
                yield ChatEvent::from_error(&e);
                return;
            }

            if let Some(conversation_id) = task.conversation_id {
                if !answer.is_empty() {
                    if let Err(e) = self
                        .conversations
                        .save_exchange(
                            &scope,
                            conversation_id,
                            &task.message,
                            message_id,
                            &answer,
                            &sources,
                        )
                        .await
                    {
                        // The client already has the answer; losing the row
                        // is logged, not fatal.
                        tracing::error!(error = %e, %conversation_id, "failed to persist exchange");
                    }
                }
            }

            yield ChatEvent::Done {
                message_id,
                tokens_used,
            };
        }
    }
}

/// Read the generation stream from a spawned task, forwarding through a
/// bounded channel. The SSE writer consumes the receiver, so a slow client
/// backpressures the reader; a stall past [`SLOW_CLIENT_GRACE`] cancels the
/// whole request.
fn relay_deltas(
    mut delta_stream: ChatStream,
    scope: RequestScope,
) -> mpsc::Receiver<Result<ChatDelta>> {
    let (tx, rx) = mpsc::channel(DELTA_BUFFER);
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = scope.cancelled() => break,
                item = delta_stream.next() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let send = tokio::time::timeout(SLOW_CLIENT_GRACE, tx.send(item)).await;
            match send {
                Ok(Ok(())) => {}
                // Receiver dropped: the generator is gone, stop reading.
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::warn!("client stalled beyond grace period, aborting stream");
                    scope.cancel();
                    break;
                }
            }
        }
    });
    rx
}
