//! Chat orchestrator event-stream behavior with scripted backends.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use uuid::Uuid;

use docqa::chat::{ChatEvent, ChatOrchestrator, ChatService, ChatTask};
use docqa::config::RetrievalSettings;
use docqa::retriever::HybridRetriever;
use docqa::scope::RequestScope;

use common::*;

fn fixture_store() -> FixtureStore {
    let mut units = HashMap::new();
    units.insert(
        "a".to_string(),
        text_unit("a", "chunk a text", 100, Some([1.0, 0.0, 0.0, 0.0])),
    );
    FixtureStore {
        entities: vec![entity("e1", "CReDO", &["a"], 0.95)],
        units,
        ..Default::default()
    }
}

fn orchestrator(
    store: FixtureStore,
    conversations: Arc<RecordingConversations>,
    chat: Arc<dyn ChatService>,
) -> Arc<ChatOrchestrator> {
    let retriever = Arc::new(HybridRetriever::new(
        Arc::new(store),
        embeddings_client(HashMap::new()),
        RetrievalSettings::default(),
    ));
    Arc::new(ChatOrchestrator::new(
        retriever,
        conversations,
        chat,
        RetrievalSettings::default(),
    ))
}

fn task(conversation_id: Option<Uuid>) -> ChatTask {
    ChatTask {
        message: "What is CReDO?".to_string(),
        collection_id: 10,
        conversation_id,
    }
}

async fn collect(
    orchestrator: Arc<ChatOrchestrator>,
    task: ChatTask,
    scope: RequestScope,
) -> Vec<ChatEvent> {
    orchestrator.run(task, scope).collect().await
}

fn event_names(events: &[ChatEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

#[tokio::test]
async fn successful_stream_matches_grammar() {
    let conversations = Arc::new(RecordingConversations::default());
    let orch = orchestrator(
        fixture_store(),
        conversations.clone(),
        ScriptedChat::streaming(&["Hello", " world"]),
    );

    let conversation_id = Uuid::new_v4();
    let events = collect(orch, task(Some(conversation_id)), scope()).await;

    assert_eq!(event_names(&events), vec!["info", "chat", "chat", "done"]);

    // The message id is assigned before the first chat event and stays
    // stable through done.
    let ids: Vec<Uuid> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Chat { message_id, .. } => Some(*message_id),
            ChatEvent::Done { message_id, .. } => Some(*message_id),
            _ => None,
        })
        .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));

    // Usage flows into done.
    match events.last().unwrap() {
        ChatEvent::Done { tokens_used, .. } => assert_eq!(*tokens_used, Some(2)),
        other => panic!("expected done, got {:?}", other.name()),
    }
}

#[tokio::test]
async fn full_answer_is_persisted_after_streaming() {
    let conversations = Arc::new(RecordingConversations::default());
    let orch = orchestrator(
        fixture_store(),
        conversations.clone(),
        ScriptedChat::streaming(&["Hello", " world"]),
    );

    let conversation_id = Uuid::new_v4();
    let events = collect(orch, task(Some(conversation_id)), scope()).await;

    let saved = conversations.saved_exchanges();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].conversation_id, conversation_id);
    assert_eq!(saved[0].user_content, "What is CReDO?");
    assert_eq!(saved[0].assistant_content, "Hello world");
    assert!(!saved[0].sources.is_empty());

    // The persisted assistant id matches the streamed message id.
    match &events[1] {
        ChatEvent::Chat { message_id, .. } => assert_eq!(saved[0].assistant_id, *message_id),
        other => panic!("expected chat, got {:?}", other.name()),
    }
}

#[tokio::test]
async fn anonymous_request_is_not_persisted() {
    let conversations = Arc::new(RecordingConversations::default());
    let orch = orchestrator(
        fixture_store(),
        conversations.clone(),
        ScriptedChat::streaming(&["Hi"]),
    );

    let events = collect(orch, task(None), scope()).await;
    assert_eq!(event_names(&events), vec!["info", "chat", "done"]);
    assert!(conversations.saved_exchanges().is_empty());
}

#[tokio::test]
async fn info_sources_are_ranked_and_bounded() {
    let conversations = Arc::new(RecordingConversations::default());
    let orch = orchestrator(
        fixture_store(),
        conversations,
        ScriptedChat::streaming(&["Hi"]),
    );

    let events = collect(orch, task(None), scope()).await;
    match &events[0] {
        ChatEvent::Info { sources } => {
            assert!(!sources.is_empty());
            assert!(sources
                .iter()
                .all(|s| (0.0..=1.0).contains(&s.relevance_score)));
            assert!(sources
                .windows(2)
                .all(|w| w[0].relevance_score >= w[1].relevance_score));
            assert!(sources[0].file_name.ends_with(".pdf"));
        }
        other => panic!("expected info, got {:?}", other.name()),
    }
}

#[tokio::test]
async fn abort_mid_stream_suppresses_done_and_persistence() {
    let conversations = Arc::new(RecordingConversations::default());
    let orch = orchestrator(
        fixture_store(),
        conversations.clone(),
        ScriptedChat::stalling("partial"),
    );

    let request_scope = scope();
    let mut events = Box::pin(orch.run(task(Some(Uuid::new_v4())), request_scope.clone()));

    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let name = event.name();
        seen.push(name);
        if name == "chat" {
            // Client aborts right after the first delta arrives.
            request_scope.cancel();
        }
    }

    assert_eq!(seen, vec!["info", "chat"]);
    assert!(conversations.saved_exchanges().is_empty());
}

#[tokio::test]
async fn generation_unavailable_surfaces_after_info() {
    let conversations = Arc::new(RecordingConversations::default());
    let orch = orchestrator(
        fixture_store(),
        conversations.clone(),
        ScriptedChat::unavailable(),
    );

    let events = collect(orch, task(Some(Uuid::new_v4())), scope()).await;
    assert_eq!(event_names(&events), vec!["info", "error"]);
    match events.last().unwrap() {
        ChatEvent::Error { kind, .. } => assert_eq!(*kind, "generation_unavailable"),
        other => panic!("expected error, got {:?}", other.name()),
    }
    assert!(conversations.saved_exchanges().is_empty());
}

#[tokio::test]
async fn mid_stream_drop_reports_interrupted() {
    let conversations = Arc::new(RecordingConversations::default());
    let orch = orchestrator(
        fixture_store(),
        conversations.clone(),
        ScriptedChat::interrupted_after(&["partial answer"]),
    );

    let events = collect(orch, task(Some(Uuid::new_v4())), scope()).await;
    assert_eq!(event_names(&events), vec!["info", "chat", "error"]);
    match events.last().unwrap() {
        ChatEvent::Error { kind, .. } => assert_eq!(*kind, "generation_interrupted"),
        other => panic!("expected error, got {:?}", other.name()),
    }
    // A partial answer is never persisted.
    assert!(conversations.saved_exchanges().is_empty());
}

#[tokio::test]
async fn embedding_outage_errors_before_info() {
    let conversations = Arc::new(RecordingConversations::default());
    let chat = ScriptedChat::streaming(&["never"]);
    let retriever = Arc::new(HybridRetriever::new(
        Arc::new(fixture_store()),
        failing_embeddings_client(),
        RetrievalSettings::default(),
    ));
    let orch = Arc::new(ChatOrchestrator::new(
        retriever,
        conversations.clone(),
        chat.clone(),
        RetrievalSettings::default(),
    ));

    let events = collect(orch, task(None), scope()).await;
    assert_eq!(event_names(&events), vec!["error"]);
    match &events[0] {
        ChatEvent::Error { kind, .. } => assert_eq!(*kind, "embedding_unavailable"),
        other => panic!("expected error, got {:?}", other.name()),
    }
    // The generation service is never contacted.
    assert!(!chat.was_called());
}

#[tokio::test]
async fn empty_collection_still_answers() {
    let conversations = Arc::new(RecordingConversations::default());
    let orch = orchestrator(
        FixtureStore::default(),
        conversations,
        ScriptedChat::streaming(&["I do not have enough context."]),
    );

    let events = collect(orch, task(None), scope()).await;
    assert_eq!(event_names(&events), vec!["info", "chat", "done"]);
    match &events[0] {
        ChatEvent::Info { sources } => assert!(sources.is_empty()),
        other => panic!("expected info, got {:?}", other.name()),
    }
}

#[tokio::test]
async fn history_is_replayed_to_the_generation_service() {
    use docqa::types::MessageRole;

    let conversations = Arc::new(RecordingConversations {
        history: vec![
            (MessageRole::User, "earlier question".to_string()),
            (MessageRole::Assistant, "earlier answer".to_string()),
        ],
        ..Default::default()
    });
    let chat = ScriptedChat::streaming(&["ok"]);
    let orch = orchestrator(fixture_store(), conversations, chat.clone());

    let events = collect(orch, task(Some(Uuid::new_v4())), scope()).await;
    assert_eq!(event_names(&events), vec!["info", "chat", "done"]);
    assert!(chat.was_called());
}
