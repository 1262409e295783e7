//! Hybrid retriever.
//!
//! Produces a [`RetrievedContext`] for one question in six fixed steps:
//!
//! 1. embed the query;
//! 2. vector search on entity descriptions;
//! 3. load the chunks linked to the hit entities;
//! 4. vector search directly on chunks (runs alongside step 2);
//! 5. re-rank the merged candidates and select within the token budget;
//! 6. relationships and community reports for the hit entities (runs
//!    alongside step 5).
//!
//! The direct chunk channel exists to recover chunks whose entity linkage is
//! sparse or wrong; do not fold it into the entity channel.

pub mod rank;

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RetrievalSettings;
use crate::embeddings::EmbeddingsClient;
use crate::error::{Error, Result};
use crate::scope::RequestScope;
use crate::store::GraphStore;
use crate::types::{CommunityReport, Relationship, RetrievedContext, ScoredEntity, ScoredTextUnit};

use rank::Candidate;

pub struct HybridRetriever {
    store: Arc<dyn GraphStore>,
    embeddings: EmbeddingsClient,
    settings: RetrievalSettings,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embeddings: EmbeddingsClient,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            store,
            embeddings,
            settings,
        }
    }

    pub async fn retrieve(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &str,
    ) -> Result<RetrievedContext> {
        // Step 1: without a query vector there is nothing to retrieve.
        let query_vector = scope.run(self.embeddings.embed(query)).await?;

        // Steps 2 and 4: both recall channels, concurrently.
        let (entity_result, direct_result) = tokio::join!(
            self.store.nearest_entities(
                scope,
                collection_id,
                &query_vector,
                self.settings.top_k_entities,
            ),
            self.store.nearest_text_units(
                scope,
                collection_id,
                &query_vector,
                self.settings.direct_text_unit_k,
            ),
        );

        let (entities, direct_hits) = self.unwrap_channels(entity_result, direct_result)?;

        // Steps 3+5 and step 6 overlap; step 6 only needs the entity hits.
        let (selected, graph) = tokio::join!(
            self.rank_text_units(scope, collection_id, &entities, direct_hits, &query_vector),
            self.graph_context(scope, collection_id, &entities),
        );
        let selected = selected?;
        let (relationships, community_reports) = graph;

        Ok(RetrievedContext {
            entities,
            text_units: selected,
            relationships,
            community_reports,
        })
    }

    /// Apply the channel failure policy: one degraded channel is survivable,
    /// two is not. Cancellation always propagates.
    fn unwrap_channels(
        &self,
        entity_result: Result<Vec<ScoredEntity>>,
        direct_result: Result<Vec<ScoredTextUnit>>,
    ) -> Result<(Vec<ScoredEntity>, Vec<ScoredTextUnit>)> {
        if let Err(Error::Cancelled) | Err(Error::DeadlineExceeded) = entity_result {
            return Err(entity_result.unwrap_err());
        }
        if let Err(Error::Cancelled) | Err(Error::DeadlineExceeded) = direct_result {
            return Err(direct_result.unwrap_err());
        }

        match (entity_result, direct_result) {
            (Ok(entities), Ok(direct)) => Ok((entities, direct)),
            (Ok(entities), Err(e)) => {
                tracing::warn!(error = %e, "direct text-unit channel failed, continuing");
                Ok((entities, Vec::new()))
            }
            (Err(e), Ok(direct)) => {
                tracing::warn!(error = %e, "entity channel failed, continuing");
                Ok((Vec::new(), direct))
            }
            (Err(entity_err), Err(direct_err)) => Err(Error::RetrievalUnavailable(format!(
                "entity channel: {}; text-unit channel: {}",
                entity_err, direct_err
            ))),
        }
    }

    /// Steps 3 and 5: load linked chunks, merge with the direct channel,
    /// score the unscored, select within the token budget.
    async fn rank_text_units(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        entities: &[ScoredEntity],
        direct_hits: Vec<ScoredTextUnit>,
        query_vector: &[f32],
    ) -> Result<Vec<ScoredTextUnit>> {
        let mut seen = HashSet::new();
        let mut linked_ids: Vec<String> = Vec::new();
        for entity in entities {
            for id in &entity.entity.text_unit_ids {
                if seen.insert(id.as_str()) {
                    linked_ids.push(id.clone());
                }
            }
        }

        let linked = self
            .store
            .text_units_by_ids(scope, collection_id, &linked_ids)
            .await?;

        let candidates = rank::merge_channels(linked, direct_hits);

        let mut scored = Vec::with_capacity(candidates.len());
        for Candidate {
            text_unit,
            similarity,
        } in candidates
        {
            let similarity = match similarity {
                Some(s) => s,
                None => match &text_unit.embedding {
                    Some(stored) => rank::cosine_similarity(query_vector, stored.as_slice()),
                    None => {
                        // Legacy row without a stored embedding: score it at
                        // query time; demote on failure rather than failing
                        // the whole retrieval.
                        match scope.run(self.embeddings.embed(&text_unit.text)).await {
                            Ok(v) => rank::cosine_similarity(query_vector, &v),
                            Err(Error::Cancelled) => return Err(Error::Cancelled),
                            Err(Error::DeadlineExceeded) => return Err(Error::DeadlineExceeded),
                            Err(e) => {
                                tracing::warn!(
                                    text_unit = %text_unit.id,
                                    error = %e,
                                    "re-embedding failed, demoting chunk"
                                );
                                0.0
                            }
                        }
                    }
                },
            };
            scored.push(ScoredTextUnit {
                text_unit,
                similarity,
            });
        }

        Ok(rank::select_within_budget(
            scored,
            self.settings.text_unit_token_budget,
            self.settings.top_k_text_units,
        ))
    }

    /// Step 6: relationships and community reports. Failures here degrade
    /// the answer instead of killing it.
    async fn graph_context(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        entities: &[ScoredEntity],
    ) -> (Vec<Relationship>, Vec<CommunityReport>) {
        if entities.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let names: Vec<String> = entities.iter().map(|e| e.entity.name.clone()).collect();
        let entity_ids: Vec<String> = entities.iter().map(|e| e.entity.id.clone()).collect();

        let (relationships_result, reports_result) = tokio::join!(
            async {
                self.store
                    .relationships_for(
                        scope,
                        collection_id,
                        &names,
                        self.settings.top_k_relationships,
                    )
                    .await
            },
            async {
                let communities = self
                    .store
                    .communities_for(scope, collection_id, &entity_ids)
                    .await?;
                let mut community_ids: Vec<i32> = communities
                    .values()
                    .copied()
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                community_ids.sort_unstable();

                if community_ids.is_empty() {
                    // No hit entity belongs to a community; fall back to the
                    // collection's top-ranked reports.
                    self.store
                        .top_reports(
                            scope,
                            collection_id,
                            self.settings.top_k_community_reports,
                        )
                        .await
                } else {
                    self.store
                        .reports_for(
                            scope,
                            collection_id,
                            &community_ids,
                            self.settings.top_k_community_reports,
                        )
                        .await
                }
            },
        );

        let relationships = match relationships_result {
            Ok(edges) => rank::dedup_relationships(edges),
            Err(e) => {
                tracing::warn!(error = %e, "relationship fetch failed, continuing without");
                Vec::new()
            }
        };
        let community_reports = match reports_result {
            Ok(reports) => reports,
            Err(e) => {
                tracing::warn!(error = %e, "community report fetch failed, continuing without");
                Vec::new()
            }
        };

        (relationships, community_reports)
    }
}
