//! Store gateway.
//!
//! Typed access to the PostgreSQL + pgvector store the offline indexer
//! populates. Graph rows (entities, text units, relationships, communities,
//! reports) are read-only here; conversations and messages are the only
//! tables this service writes.
//!
//! The read seams the retriever and chat orchestrator depend on are traits
//! ([`GraphStore`], [`ConversationStore`]) so they can run against an
//! in-memory fixture in tests. [`PgStore`] implements both and carries the
//! remaining operations the HTTP handlers use directly.

use std::collections::HashMap;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::scope::RequestScope;
use crate::types::{
    Collection, CommunityReport, Conversation, Document, Entity, Message, MessageRole,
    Relationship, ScoredEntity, ScoredTextUnit, Source, TextUnit,
};

/// Read access to the graph tables, scoped by collection.
#[async_trait]
pub trait GraphStore: Send + Sync + 'static {
    /// Nearest entities by description embedding; rows with a NULL embedding
    /// are skipped. Results carry `1 - cosine_distance`.
    async fn nearest_entities(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: i64,
    ) -> Result<Vec<ScoredEntity>>;

    /// Nearest text units by chunk embedding (the direct recall channel).
    async fn nearest_text_units(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: i64,
    ) -> Result<Vec<ScoredTextUnit>>;

    /// Load text units by id, preserving the input order.
    async fn text_units_by_ids(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        ids: &[String],
    ) -> Result<Vec<TextUnit>>;

    /// Relationships touching any of the given entity names, heaviest first.
    async fn relationships_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        names: &[String],
        limit: i64,
    ) -> Result<Vec<Relationship>>;

    /// Community assignment per entity id; entities without a community are
    /// absent from the map.
    async fn communities_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        entity_ids: &[String],
    ) -> Result<HashMap<String, i32>>;

    /// Reports for the given communities, best-ranked first.
    async fn reports_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        communities: &[i32],
        k: i64,
    ) -> Result<Vec<CommunityReport>>;

    /// Collection-wide top reports; fallback when no hit entity belongs to a
    /// community.
    async fn top_reports(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        k: i64,
    ) -> Result<Vec<CommunityReport>>;
}

/// Conversation history and message persistence used by the chat
/// orchestrator.
#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    /// Oldest-first prior messages, capped at `limit`.
    async fn history(
        &self,
        scope: &RequestScope,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<(MessageRole, String)>>;

    /// Persist one user/assistant exchange atomically and touch the
    /// conversation's `updated_at`. `assistant_id` is the message id already
    /// announced on the event stream.
    async fn save_exchange(
        &self,
        scope: &RequestScope,
        conversation_id: Uuid,
        user_content: &str,
        assistant_id: Uuid,
        assistant_content: &str,
        sources: &[Source],
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Health probe: one round trip to the store.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ---------- Collections & documents ----------

    /// Collections with their document counts, for the listing endpoint.
    pub async fn list_collections(&self) -> Result<Vec<(Collection, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.name, c.created_at, c.updated_at,
                   COUNT(d.id) AS file_count
            FROM collections c
            LEFT JOIN documents d ON d.collection_id = c.id
            GROUP BY c.id, c.name, c.created_at, c.updated_at
            ORDER BY c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let collection = Collection {
                    id: row.get("id"),
                    name: row.get("name"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                };
                let file_count: i64 = row.get("file_count");
                (collection, file_count)
            })
            .collect())
    }

    pub async fn collection_exists(&self, collection_id: i32) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM collections WHERE id = $1")
            .bind(collection_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn document(&self, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT id, collection_id, title, source_path, original_filename, pdf_path
            FROM documents
            WHERE id = $1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Document {
            id: row.get("id"),
            collection_id: row.get("collection_id"),
            title: row.get("title"),
            source_path: row.get("source_path"),
            original_filename: row.get("original_filename"),
            pdf_path: row.get("pdf_path"),
        }))
    }

    // ---------- Conversations ----------

    pub async fn create_conversation(
        &self,
        collection_id: i32,
        title: Option<&str>,
    ) -> Result<Conversation> {
        let row = sqlx::query(
            r#"
            INSERT INTO conversations (collection_id, title)
            VALUES ($1, $2)
            RETURNING id, collection_id, title, created_at, updated_at
            "#,
        )
        .bind(collection_id)
        .bind(title)
        .fetch_one(&self.pool)
        .await?;

        Ok(conversation_from_row(&row))
    }

    pub async fn conversations(&self, collection_id: Option<i32>) -> Result<Vec<Conversation>> {
        let rows = match collection_id {
            Some(id) => {
                sqlx::query(
                    r#"
                    SELECT id, collection_id, title, created_at, updated_at
                    FROM conversations
                    WHERE collection_id = $1
                    ORDER BY updated_at DESC
                    "#,
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, collection_id, title, created_at, updated_at
                    FROM conversations
                    ORDER BY updated_at DESC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(conversation_from_row).collect())
    }

    pub async fn conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, collection_id, title, created_at, updated_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(conversation_from_row))
    }

    pub async fn rename_conversation(&self, id: Uuid, title: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            UPDATE conversations
            SET title = $2, updated_at = CURRENT_TIMESTAMP
            WHERE id = $1
            RETURNING id, collection_id, title, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(title)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(conversation_from_row))
    }

    /// Returns false when the conversation did not exist. Messages cascade.
    pub async fn delete_conversation(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn messages_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, sources, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Message {
                id: row.get("id"),
                conversation_id: row.get("conversation_id"),
                role: MessageRole::from_str(row.get::<String, _>("role").as_str()),
                content: row.get("content"),
                sources: row.get("sources"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

fn conversation_from_row(row: &sqlx::postgres::PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn text_unit_from_row(row: &sqlx::postgres::PgRow, with_embedding: bool) -> TextUnit {
    TextUnit {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        document_ids: row
            .try_get::<Option<Vec<String>>, _>("document_ids")
            .unwrap_or_default()
            .unwrap_or_default(),
        text: row.get("text"),
        n_tokens: i64::from(
            row.try_get::<Option<i32>, _>("n_tokens")
                .unwrap_or_default()
                .unwrap_or_default(),
        ),
        page_start: row.get("page_start"),
        page_end: row.get("page_end"),
        source_file: row.get("source_file"),
        embedding: if with_embedding {
            row.get("embedding")
        } else {
            None
        },
    }
}

/// Reorder fetched rows to match the id order the caller asked for.
fn order_by_ids(mut units: Vec<TextUnit>, ids: &[String]) -> Vec<TextUnit> {
    let position: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    units.sort_by_key(|u| position.get(u.id.as_str()).copied().unwrap_or(usize::MAX));
    units
}

#[async_trait]
impl GraphStore for PgStore {
    async fn nearest_entities(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: i64,
    ) -> Result<Vec<ScoredEntity>> {
        let qvec = Vector::from(query.to_vec());
        let fetch = async {
            let rows = sqlx::query(
                r#"
                SELECT id, collection_id, name, type, description, text_unit_ids,
                       1 - (embedding <=> $1) AS similarity
                FROM entities
                WHERE collection_id = $2
                  AND embedding IS NOT NULL
                ORDER BY embedding <=> $1
                LIMIT $3
                "#,
            )
            .bind(&qvec)
            .bind(collection_id)
            .bind(k)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|row| ScoredEntity {
                    entity: Entity {
                        id: row.get("id"),
                        collection_id: row.get("collection_id"),
                        name: row.get("name"),
                        entity_type: row
                            .try_get::<Option<String>, _>("type")
                            .unwrap_or_default()
                            .unwrap_or_default(),
                        description: row
                            .try_get::<Option<String>, _>("description")
                            .unwrap_or_default()
                            .unwrap_or_default(),
                        text_unit_ids: row
                            .try_get::<Option<Vec<String>>, _>("text_unit_ids")
                            .unwrap_or_default()
                            .unwrap_or_default(),
                    },
                    similarity: row.get("similarity"),
                })
                .collect())
        };
        scope.run(fetch).await
    }

    async fn nearest_text_units(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: i64,
    ) -> Result<Vec<ScoredTextUnit>> {
        let qvec = Vector::from(query.to_vec());
        let fetch = async {
            let rows = sqlx::query(
                r#"
                SELECT id, collection_id, document_ids, text, n_tokens,
                       page_start, page_end, source_file,
                       1 - (embedding <=> $1) AS similarity
                FROM text_units
                WHERE collection_id = $2
                  AND embedding IS NOT NULL
                ORDER BY embedding <=> $1
                LIMIT $3
                "#,
            )
            .bind(&qvec)
            .bind(collection_id)
            .bind(k)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|row| ScoredTextUnit {
                    similarity: row.get("similarity"),
                    text_unit: text_unit_from_row(&row, false),
                })
                .collect())
        };
        scope.run(fetch).await
    }

    async fn text_units_by_ids(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        ids: &[String],
    ) -> Result<Vec<TextUnit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let fetch = async {
            let rows = sqlx::query(
                r#"
                SELECT id, collection_id, document_ids, text, n_tokens,
                       page_start, page_end, source_file, embedding
                FROM text_units
                WHERE collection_id = $1
                  AND id = ANY($2)
                "#,
            )
            .bind(collection_id)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

            let units = rows
                .iter()
                .map(|row| text_unit_from_row(row, true))
                .collect();
            Ok(order_by_ids(units, ids))
        };
        scope.run(fetch).await
    }

    async fn relationships_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        names: &[String],
        limit: i64,
    ) -> Result<Vec<Relationship>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let fetch = async {
            let rows = sqlx::query(
                r#"
                SELECT id, source_name, target_name, description, weight
                FROM relationships
                WHERE collection_id = $1
                  AND (source_name = ANY($2) OR target_name = ANY($2))
                ORDER BY weight DESC, id
                LIMIT $3
                "#,
            )
            .bind(collection_id)
            .bind(names)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|row| Relationship {
                    id: row.get("id"),
                    source_name: row.get("source_name"),
                    target_name: row.get("target_name"),
                    description: row
                        .try_get::<Option<String>, _>("description")
                        .unwrap_or_default()
                        .unwrap_or_default(),
                    weight: row
                        .try_get::<Option<f64>, _>("weight")
                        .unwrap_or_default()
                        .unwrap_or_default(),
                })
                .collect())
        };
        scope.run(fetch).await
    }

    async fn communities_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        entity_ids: &[String],
    ) -> Result<HashMap<String, i32>> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let fetch = async {
            let rows = sqlx::query(
                r#"
                SELECT id, community
                FROM nodes
                WHERE collection_id = $1
                  AND id = ANY($2)
                  AND community IS NOT NULL
                "#,
            )
            .bind(collection_id)
            .bind(entity_ids)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|row| (row.get::<String, _>("id"), row.get::<i32, _>("community")))
                .collect())
        };
        scope.run(fetch).await
    }

    async fn reports_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        communities: &[i32],
        k: i64,
    ) -> Result<Vec<CommunityReport>> {
        if communities.is_empty() {
            return Ok(Vec::new());
        }
        let fetch = async {
            let rows = sqlx::query(
                r#"
                SELECT id, community, level, title, summary, full_content, rank
                FROM community_reports
                WHERE collection_id = $1
                  AND community = ANY($2)
                ORDER BY rank DESC, community
                LIMIT $3
                "#,
            )
            .bind(collection_id)
            .bind(communities)
            .bind(k)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows.iter().map(report_from_row).collect())
        };
        scope.run(fetch).await
    }

    async fn top_reports(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        k: i64,
    ) -> Result<Vec<CommunityReport>> {
        let fetch = async {
            let rows = sqlx::query(
                r#"
                SELECT id, community, level, title, summary, full_content, rank
                FROM community_reports
                WHERE collection_id = $1
                ORDER BY rank DESC, community
                LIMIT $2
                "#,
            )
            .bind(collection_id)
            .bind(k)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows.iter().map(report_from_row).collect())
        };
        scope.run(fetch).await
    }
}

fn report_from_row(row: &sqlx::postgres::PgRow) -> CommunityReport {
    CommunityReport {
        id: row.get("id"),
        community: row.get("community"),
        level: row.get("level"),
        title: row
            .try_get::<Option<String>, _>("title")
            .unwrap_or_default()
            .unwrap_or_default(),
        summary: row
            .try_get::<Option<String>, _>("summary")
            .unwrap_or_default()
            .unwrap_or_default(),
        full_content: row
            .try_get::<Option<String>, _>("full_content")
            .unwrap_or_default()
            .unwrap_or_default(),
        rank: row
            .try_get::<Option<f64>, _>("rank")
            .unwrap_or_default()
            .unwrap_or_default(),
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn history(
        &self,
        scope: &RequestScope,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<(MessageRole, String)>> {
        let fetch = async {
            let rows = sqlx::query(
                r#"
                SELECT role, content
                FROM messages
                WHERE conversation_id = $1
                ORDER BY created_at ASC
                LIMIT $2
                "#,
            )
            .bind(conversation_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|row| {
                    (
                        MessageRole::from_str(row.get::<String, _>("role").as_str()),
                        row.get::<String, _>("content"),
                    )
                })
                .collect())
        };
        scope.run(fetch).await
    }

    async fn save_exchange(
        &self,
        scope: &RequestScope,
        conversation_id: Uuid,
        user_content: &str,
        assistant_id: Uuid,
        assistant_content: &str,
        sources: &[Source],
    ) -> Result<()> {
        let sources_json = if sources.is_empty() {
            None
        } else {
            Some(serde_json::to_value(sources).map_err(|e| {
                Error::InvalidRequest(format!("unserializable sources: {}", e))
            })?)
        };

        let write = async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                INSERT INTO messages (conversation_id, role, content)
                VALUES ($1, 'user', $2)
                "#,
            )
            .bind(conversation_id)
            .bind(user_content)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO messages (id, conversation_id, role, content, sources)
                VALUES ($1, $2, 'assistant', $3, $4)
                "#,
            )
            .bind(assistant_id)
            .bind(conversation_id)
            .bind(assistant_content)
            .bind(&sources_json)
            .execute(&mut *tx)
            .await?;

            // Row lock on the conversation serializes concurrent writers.
            sqlx::query(
                "UPDATE conversations SET updated_at = CURRENT_TIMESTAMP WHERE id = $1",
            )
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        };
        scope.run(write).await
    }
}
