//! Context formatting.
//!
//! Turns a [`RetrievedContext`] into the prompt block sent to the generation
//! service and the citation list sent to the client. Section order is fixed:
//! community reports, entities, relationships, text units. When the block
//! exceeds the character budget the graph sections are cut first; text units
//! are the primary information source and go last.

use crate::types::{RetrievedContext, Source};

/// Max characters per citation snippet.
const SNIPPET_CHARS: usize = 500;

pub const SYSTEM_PROMPT: &str = "You are a document analyst. Answer questions based on the provided context.\n\
Be precise. Quote relevant passages when answering.\n\
Use the conversation history for context about previous questions.";

/// Wrap the formatted context and the question into the final user turn.
pub fn user_turn(context_block: &str, question: &str) -> String {
    format!(
        "CONTEXT:\n{}\n\n---\nQUESTION: {}",
        context_block, question
    )
}

/// Serialize the retrieved context within `char_budget` characters.
pub fn format_context(context: &RetrievedContext, char_budget: usize) -> String {
    let mut graph = String::new();

    if !context.community_reports.is_empty() {
        graph.push_str("## Community Summaries\n");
        for report in &context.community_reports {
            graph.push_str("### ");
            graph.push_str(&report.title);
            graph.push('\n');
            graph.push_str(&report.summary);
            graph.push_str("\n\n");
        }
    }

    if !context.entities.is_empty() {
        graph.push_str("## Entities\n");
        for scored in &context.entities {
            let entity = &scored.entity;
            if entity.description.is_empty() {
                graph.push_str(&format!("- **{}** ({})\n", entity.name, entity.entity_type));
            } else {
                graph.push_str(&format!(
                    "- **{}** ({}): {}\n",
                    entity.name, entity.entity_type, entity.description
                ));
            }
        }
        graph.push('\n');
    }

    if !context.relationships.is_empty() {
        graph.push_str("## Relationships\n");
        for rel in &context.relationships {
            graph.push_str(&format!(
                "- {} -- {} --> {} (weight {:.1})\n",
                rel.source_name, rel.description, rel.target_name, rel.weight
            ));
        }
        graph.push('\n');
    }

    let mut units = String::new();
    if !context.text_units.is_empty() {
        units.push_str("## Source Texts\n");
        for (i, scored) in context.text_units.iter().enumerate() {
            let unit = &scored.text_unit;
            let header = match (unit.source_file.as_deref(), unit.page_start) {
                (Some(file), Some(start)) => {
                    let end = unit.page_end.unwrap_or(start);
                    format!("[{}] [{}, pages {}..{}]\n", i + 1, file, start, end)
                }
                (Some(file), None) => format!("[{}] [{}]\n", i + 1, file),
                _ => format!("[{}]\n", i + 1),
            };
            units.push_str(&header);
            units.push_str(&unit.text);
            units.push_str("\n\n");
        }
    }

    // Text units get the budget first; graph sections fill what is left.
    let units = truncate_chars(&units, char_budget);
    let graph_budget = char_budget - units.chars().count();
    let graph = truncate_chars(&graph, graph_budget);

    let mut output = String::with_capacity(graph.len() + units.len());
    output.push_str(&graph);
    output.push_str(&units);
    output
}

/// One citation per selected text unit, in rank order.
pub fn sources(context: &RetrievedContext) -> Vec<Source> {
    context
        .text_units
        .iter()
        .map(|scored| {
            let unit = &scored.text_unit;
            Source {
                file_id: unit.document_ids.first().cloned(),
                file_name: unit
                    .source_file
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                page_number: unit.page_start,
                page_end: unit.page_end,
                text_snippet: truncate_chars(&unit.text, SNIPPET_CHARS),
                relevance_score: scored.similarity.clamp(0.0, 1.0),
            }
        })
        .collect()
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
