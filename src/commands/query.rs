//! Search command implementation

use crate::error::Result;
use crate::knowledge::{RankedResult, SearchMode};
use crate::models::{ResourceRecord, ResourceType};
use crate::service::HubService;
use serde::Serialize;
use tracing::info;

/// Search options
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub resource_type: Option<ResourceType>,
    pub mode: SearchMode,
    /// 0 uses the configured default
    pub limit: usize,
}

/// Search result for CLI display
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub mode: SearchMode,
    pub results: Vec<RankedResult>,
}

pub async fn cmd_search(
    service: &HubService,
    query: &str,
    options: SearchOptions,
) -> Result<QueryResult> {
    info!(query, mode = %options.mode, "Searching");
    let results = service
        .search(query, options.resource_type, options.mode, options.limit)
        .await?;
    Ok(QueryResult {
        query: query.to_string(),
        mode: options.mode,
        results,
    })
}

fn preview(text: &str) -> String {
    let flat = text.trim().replace('\n', " ");
    match flat.char_indices().nth(160) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

fn print_record_line(rank: usize, score: Option<f64>, record: &ResourceRecord) {
    let score = score.map(|s| format!("[score: {:.3}] ", s)).unwrap_or_default();
    println!(
        "{}. {}{} ({}, {} downloads){}",
        rank,
        score,
        record.id,
        record.resource_type,
        record.popularity.downloads,
        if record.stale { " [stale]" } else { "" }
    );
    if !record.description.is_empty() {
        println!("   {}", preview(&record.description));
    }
    if !record.tags.is_empty() {
        let tags: Vec<&str> = record.tags.iter().map(String::as_str).collect();
        println!("   tags: {}", tags.join(", "));
    }
}

pub fn print_query_results(result: &QueryResult) {
    println!("\nQuery: {} ({})\n", result.query, result.mode);
    println!("Found {} results:\n", result.results.len());

    for (i, r) in result.results.iter().enumerate() {
        print_record_line(i + 1, Some(r.score), &r.record);
        if let (Some(lex), Some(vec)) = (r.lexical_score, r.vector_score) {
            println!("   lexical {:.3}, vector {:.3}", lex, vec);
        }
        println!();
    }
}

pub fn print_similar(id: &str, hits: &[(ResourceRecord, f64)]) {
    println!("\nResources similar to {}\n", id);
    if hits.is_empty() {
        println!("No similar resources with current embeddings.");
        return;
    }
    for (i, (record, similarity)) in hits.iter().enumerate() {
        print_record_line(i + 1, Some(*similarity), record);
    }
}

pub fn print_priority_resources(records: &[ResourceRecord]) {
    println!("\nWatched resources\n");
    if records.is_empty() {
        println!("No stored resources match the watch rules yet.");
        return;
    }
    for (i, record) in records.iter().enumerate() {
        print_record_line(i + 1, None, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), 163);
        assert_eq!(preview(" short\ntext "), "short text");
    }
}
