//! Domain records for the GraphRAG store and the retrieval pipeline.
//!
//! All rows except conversations and messages are written by the offline
//! indexer and are read-only at query time.

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An indexed document set; the scope boundary for every retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A source PDF tracked by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub collection_id: i32,
    pub title: Option<String>,
    pub source_path: Option<String>,
    pub original_filename: Option<String>,
    pub pdf_path: Option<String>,
}

/// A token-bounded chunk of source text with optional page range.
///
/// `embedding` is NULL on legacy rows; those are still reachable through
/// entity links but never through the direct vector channel.
#[derive(Debug, Clone)]
pub struct TextUnit {
    pub id: String,
    pub collection_id: i32,
    pub document_ids: Vec<String>,
    pub text: String,
    pub n_tokens: i64,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub source_file: Option<String>,
    pub embedding: Option<Vector>,
}

/// A named thing extracted from the corpus. The embedding is of the
/// description, not the name.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub collection_id: i32,
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub text_unit_ids: Vec<String>,
}

/// A weighted, described edge between two entity names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_name: String,
    pub target_name: String,
    pub description: String,
    pub weight: f64,
}

/// An LLM-authored summary of an entity community, ranked by importance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityReport {
    pub id: String,
    pub community: i32,
    pub level: i32,
    pub title: String,
    pub summary: String,
    pub full_content: String,
    pub rank: f64,
}

/// An entity hit from the vector channel, with its cosine similarity.
#[derive(Debug, Clone)]
pub struct ScoredEntity {
    pub entity: Entity,
    pub similarity: f64,
}

/// A chunk selected for the answer, with its similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredTextUnit {
    pub text_unit: TextUnit,
    pub similarity: f64,
}

/// The bundle a single retrieval produces, each list in ranked order.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub entities: Vec<ScoredEntity>,
    pub text_units: Vec<ScoredTextUnit>,
    pub relationships: Vec<Relationship>,
    pub community_reports: Vec<CommunityReport>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.text_units.is_empty()
            && self.relationships.is_empty()
            && self.community_reports.is_empty()
    }
}

/// A ranked citation attached to the `info` event and persisted with the
/// assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub file_id: Option<String>,
    pub file_name: String,
    pub page_number: Option<i32>,
    pub page_end: Option<i32>,
    pub text_snippet: String,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub collection_id: Option<i32>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub sources: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
