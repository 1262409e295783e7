//! Candidate merging, re-ranking and budget selection.
//!
//! Pure functions over in-memory candidates; all I/O stays in the parent
//! module. Ordering is deterministic: similarity descending, then id
//! ascending.

use std::collections::HashMap;

use crate::types::{Relationship, ScoredTextUnit, TextUnit};

/// A chunk on its way through re-ranking. `similarity` is `None` until the
/// chunk has been scored against the query.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub text_unit: TextUnit,
    pub similarity: Option<f64>,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Merge the entity-linked chunks with the direct vector channel. Duplicates
/// collapse to one candidate keeping the higher similarity; linked-only
/// chunks stay unscored for the re-rank pass.
pub fn merge_channels(linked: Vec<TextUnit>, direct: Vec<ScoredTextUnit>) -> Vec<Candidate> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, Candidate> = HashMap::new();

    for unit in linked {
        if !by_id.contains_key(&unit.id) {
            order.push(unit.id.clone());
            by_id.insert(
                unit.id.clone(),
                Candidate {
                    text_unit: unit,
                    similarity: None,
                },
            );
        }
    }

    for hit in direct {
        match by_id.get_mut(&hit.text_unit.id) {
            Some(existing) => {
                let keep = existing
                    .similarity
                    .map_or(true, |current| hit.similarity > current);
                if keep {
                    existing.similarity = Some(hit.similarity);
                }
            }
            None => {
                order.push(hit.text_unit.id.clone());
                by_id.insert(
                    hit.text_unit.id.clone(),
                    Candidate {
                        text_unit: hit.text_unit,
                        similarity: Some(hit.similarity),
                    },
                );
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

/// Greedy budgeted selection: sort by similarity descending (id ascending on
/// ties), then take chunks until the next one would exceed the token budget,
/// capped at `max_units`.
pub fn select_within_budget(
    mut scored: Vec<ScoredTextUnit>,
    token_budget: i64,
    max_units: usize,
) -> Vec<ScoredTextUnit> {
    scored.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.text_unit.id.cmp(&b.text_unit.id))
    });

    let mut selected = Vec::new();
    let mut total_tokens = 0i64;
    for unit in scored {
        if selected.len() >= max_units {
            break;
        }
        let tokens = effective_tokens(&unit.text_unit);
        if total_tokens + tokens > token_budget {
            break;
        }
        total_tokens += tokens;
        selected.push(unit);
    }
    selected
}

/// Rows imported before token counting use a character-based estimate.
fn effective_tokens(unit: &TextUnit) -> i64 {
    if unit.n_tokens > 0 {
        unit.n_tokens
    } else {
        (unit.text.len() / 4) as i64
    }
}

/// Relationship endpoints are names, which are not guaranteed unique; keep
/// the first (heaviest) edge per `(source, target, description)`.
pub fn dedup_relationships(relationships: Vec<Relationship>) -> Vec<Relationship> {
    let mut seen = std::collections::HashSet::new();
    relationships
        .into_iter()
        .filter(|r| {
            seen.insert((
                r.source_name.clone(),
                r.target_name.clone(),
                r.description.clone(),
            ))
        })
        .collect()
}
