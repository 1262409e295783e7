//! Shared fixtures: an in-memory graph store and scripted embedding /
//! generation services.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pgvector::Vector;
use uuid::Uuid;

use docqa::chat::{ChatDelta, ChatService, ChatStream, ChatTurn};
use docqa::embeddings::{BackendError, EmbeddingsClient, EmbeddingsService};
use docqa::error::{Error, Result};
use docqa::scope::RequestScope;
use docqa::store::{ConversationStore, GraphStore};
use docqa::types::{
    CommunityReport, MessageRole, Relationship, ScoredEntity, ScoredTextUnit, Source, TextUnit,
};

pub const DIM: usize = 4;

pub fn scope() -> RequestScope {
    RequestScope::new(Duration::from_secs(30))
}

fn backend_failure() -> Error {
    Error::Store(sqlx::Error::PoolTimedOut)
}

// ---------- Embeddings ----------

/// Returns a fixed vector for every input; optionally fails outright.
pub struct ScriptedEmbeddings {
    vectors: HashMap<String, Vec<f32>>,
    default: Vec<f32>,
    fail: bool,
}

#[async_trait]
impl EmbeddingsService for ScriptedEmbeddings {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create_embedding(
        &self,
        _model: &str,
        input: &str,
    ) -> std::result::Result<Vec<f32>, BackendError> {
        if self.fail {
            return Err(BackendError::Transient("scripted failure".into()));
        }
        Ok(self
            .vectors
            .get(input)
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}

pub fn embeddings_client(vectors: HashMap<String, Vec<f32>>) -> EmbeddingsClient {
    let service = Arc::new(ScriptedEmbeddings {
        vectors,
        default: vec![1.0, 0.0, 0.0, 0.0],
        fail: false,
    });
    EmbeddingsClient::new("fixture-model", DIM, Duration::from_secs(1), vec![service])
}

pub fn failing_embeddings_client() -> EmbeddingsClient {
    let service = Arc::new(ScriptedEmbeddings {
        vectors: HashMap::new(),
        default: vec![],
        fail: true,
    });
    EmbeddingsClient::new("fixture-model", DIM, Duration::from_secs(1), vec![service])
}

// ---------- Graph store ----------

#[derive(Default)]
pub struct FixtureStore {
    pub entities: Vec<ScoredEntity>,
    pub direct_hits: Vec<ScoredTextUnit>,
    pub units: HashMap<String, TextUnit>,
    pub relationships: Vec<Relationship>,
    pub communities: HashMap<String, i32>,
    pub reports: Vec<CommunityReport>,
    pub top_reports: Vec<CommunityReport>,
    pub fail_entities: bool,
    pub fail_direct: bool,
    pub fail_graph: bool,
}

#[async_trait]
impl GraphStore for FixtureStore {
    async fn nearest_entities(
        &self,
        _scope: &RequestScope,
        _collection_id: i32,
        _query: &[f32],
        k: i64,
    ) -> Result<Vec<ScoredEntity>> {
        if self.fail_entities {
            return Err(backend_failure());
        }
        Ok(self.entities.iter().take(k as usize).cloned().collect())
    }

    async fn nearest_text_units(
        &self,
        _scope: &RequestScope,
        _collection_id: i32,
        _query: &[f32],
        k: i64,
    ) -> Result<Vec<ScoredTextUnit>> {
        if self.fail_direct {
            return Err(backend_failure());
        }
        Ok(self.direct_hits.iter().take(k as usize).cloned().collect())
    }

    async fn text_units_by_ids(
        &self,
        _scope: &RequestScope,
        _collection_id: i32,
        ids: &[String],
    ) -> Result<Vec<TextUnit>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.units.get(id).cloned())
            .collect())
    }

    async fn relationships_for(
        &self,
        _scope: &RequestScope,
        _collection_id: i32,
        names: &[String],
        limit: i64,
    ) -> Result<Vec<Relationship>> {
        if self.fail_graph {
            return Err(backend_failure());
        }
        let mut edges: Vec<Relationship> = self
            .relationships
            .iter()
            .filter(|r| {
                names.contains(&r.source_name) || names.contains(&r.target_name)
            })
            .cloned()
            .collect();
        edges.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.id.cmp(&b.id))
        });
        edges.truncate(limit as usize);
        Ok(edges)
    }

    async fn communities_for(
        &self,
        _scope: &RequestScope,
        _collection_id: i32,
        entity_ids: &[String],
    ) -> Result<HashMap<String, i32>> {
        if self.fail_graph {
            return Err(backend_failure());
        }
        Ok(entity_ids
            .iter()
            .filter_map(|id| self.communities.get(id).map(|c| (id.clone(), *c)))
            .collect())
    }

    async fn reports_for(
        &self,
        _scope: &RequestScope,
        _collection_id: i32,
        communities: &[i32],
        k: i64,
    ) -> Result<Vec<CommunityReport>> {
        if self.fail_graph {
            return Err(backend_failure());
        }
        let mut reports: Vec<CommunityReport> = self
            .reports
            .iter()
            .filter(|r| communities.contains(&r.community))
            .cloned()
            .collect();
        reports.sort_by(|a, b| {
            b.rank
                .total_cmp(&a.rank)
                .then_with(|| a.community.cmp(&b.community))
        });
        reports.truncate(k as usize);
        Ok(reports)
    }

    async fn top_reports(
        &self,
        _scope: &RequestScope,
        _collection_id: i32,
        k: i64,
    ) -> Result<Vec<CommunityReport>> {
        if self.fail_graph {
            return Err(backend_failure());
        }
        Ok(self.top_reports.iter().take(k as usize).cloned().collect())
    }
}

// ---------- Conversation store ----------

#[derive(Debug, Clone, PartialEq)]
pub struct SavedExchange {
    pub conversation_id: Uuid,
    pub user_content: String,
    pub assistant_id: Uuid,
    pub assistant_content: String,
    pub sources: Vec<Source>,
}

#[derive(Default)]
pub struct RecordingConversations {
    pub history: Vec<(MessageRole, String)>,
    pub saved: std::sync::Mutex<Vec<SavedExchange>>,
}

impl RecordingConversations {
    pub fn saved_exchanges(&self) -> Vec<SavedExchange> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationStore for RecordingConversations {
    async fn history(
        &self,
        _scope: &RequestScope,
        _conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<(MessageRole, String)>> {
        Ok(self.history.iter().take(limit as usize).cloned().collect())
    }

    async fn save_exchange(
        &self,
        _scope: &RequestScope,
        conversation_id: Uuid,
        user_content: &str,
        assistant_id: Uuid,
        assistant_content: &str,
        sources: &[Source],
    ) -> Result<()> {
        self.saved.lock().unwrap().push(SavedExchange {
            conversation_id,
            user_content: user_content.to_string(),
            assistant_id,
            assistant_content: assistant_content.to_string(),
            sources: sources.to_vec(),
        });
        Ok(())
    }
}

// ---------- Chat service ----------

/// Streams a fixed script of deltas. `fail_upfront` rejects the call before
/// any delta; `fail_after` injects a mid-stream error once the script ran
/// dry; `stall_after_first` emits one delta then blocks until cancelled.
pub struct ScriptedChat {
    pub deltas: Vec<String>,
    pub usage: Option<u32>,
    pub fail_upfront: bool,
    pub fail_after: bool,
    pub stall_after_first: bool,
    pub called: AtomicBool,
}

impl ScriptedChat {
    pub fn streaming(deltas: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            deltas: deltas.iter().map(|s| s.to_string()).collect(),
            usage: Some(deltas.len() as u32),
            fail_upfront: false,
            fail_after: false,
            stall_after_first: false,
            called: AtomicBool::new(false),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            deltas: vec![],
            usage: None,
            fail_upfront: true,
            fail_after: false,
            stall_after_first: false,
            called: AtomicBool::new(false),
        })
    }

    pub fn interrupted_after(deltas: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            deltas: deltas.iter().map(|s| s.to_string()).collect(),
            usage: None,
            fail_upfront: false,
            fail_after: true,
            stall_after_first: false,
            called: AtomicBool::new(false),
        })
    }

    pub fn stalling(first_delta: &str) -> Arc<Self> {
        Arc::new(Self {
            deltas: vec![first_delta.to_string()],
            usage: None,
            fail_upfront: false,
            fail_after: false,
            stall_after_first: true,
            called: AtomicBool::new(false),
        })
    }

    pub fn was_called(&self) -> bool {
        self.called.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatService for ScriptedChat {
    async fn stream_chat(&self, _turns: Vec<ChatTurn>) -> Result<ChatStream> {
        self.called.store(true, Ordering::SeqCst);
        if self.fail_upfront {
            return Err(Error::GenerationUnavailable("connection refused".into()));
        }

        let deltas = self.deltas.clone();
        let usage = self.usage;
        let fail_after = self.fail_after;
        let stall = self.stall_after_first;

        let stream = async_stream::stream! {
            for delta in deltas {
                yield Ok(ChatDelta::Content(delta));
                if stall {
                    // Parked until the request scope cancels the relay.
                    futures::future::pending::<()>().await;
                }
            }
            if fail_after {
                yield Err(Error::GenerationInterrupted("stream reset".into()));
            } else if let Some(n) = usage {
                yield Ok(ChatDelta::Usage(n));
            }
        };
        Ok(Box::pin(stream))
    }
}

// ---------- Fixture data ----------

pub fn vector(components: [f32; DIM]) -> Vector {
    Vector::from(components.to_vec())
}

pub fn text_unit(id: &str, text: &str, n_tokens: i64, embedding: Option<[f32; DIM]>) -> TextUnit {
    TextUnit {
        id: id.to_string(),
        collection_id: 10,
        document_ids: vec![format!("doc-{}", id)],
        text: text.to_string(),
        n_tokens,
        page_start: Some(1),
        page_end: Some(2),
        source_file: Some(format!("{}.pdf", id)),
        embedding: embedding.map(vector),
    }
}

pub fn entity(id: &str, name: &str, text_unit_ids: &[&str], similarity: f64) -> ScoredEntity {
    ScoredEntity {
        entity: docqa::types::Entity {
            id: id.to_string(),
            collection_id: 10,
            name: name.to_string(),
            entity_type: "CONCEPT".to_string(),
            description: format!("{} description", name),
            text_unit_ids: text_unit_ids.iter().map(|s| s.to_string()).collect(),
        },
        similarity,
    }
}

pub fn relationship(id: &str, source: &str, target: &str, weight: f64) -> Relationship {
    Relationship {
        id: id.to_string(),
        source_name: source.to_string(),
        target_name: target.to_string(),
        description: "relates to".to_string(),
        weight,
    }
}

pub fn report(id: &str, community: i32, rank: f64) -> CommunityReport {
    CommunityReport {
        id: id.to_string(),
        community,
        level: 0,
        title: format!("Report {}", id),
        summary: format!("Summary {}", id),
        full_content: format!("Full content {}", id),
        rank,
    }
}
