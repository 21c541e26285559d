//! Stats, task and alert rendering

use crate::models::{AlertEvent, CrawlCycleRecord, TaskRecord};
use crate::service::ServiceStats;

fn cycle_line(cycle: &CrawlCycleRecord) -> String {
    let mut line = format!(
        "{} {} started {}: seen {}, new {}, updated {}, errors {}",
        cycle.resource_type_scope,
        cycle.terminal_status,
        cycle.started_at.format("%Y-%m-%d %H:%M:%S"),
        cycle.items_seen,
        cycle.items_new,
        cycle.items_updated,
        cycle.errors_count
    );
    if let Some(error) = &cycle.error {
        line.push_str(&format!(" ({})", error));
    }
    line
}

/// Print stats to console
pub fn print_stats(stats: &ServiceStats) {
    println!("\nResources:");
    if stats.types.is_empty() {
        println!("  (none crawled yet)");
    }
    for t in &stats.types {
        println!(
            "  {:<8} {:>8} total, {} stale; embeddings {} current, {} stale, {} absent",
            t.resource_type,
            t.total,
            t.stale,
            t.embeddings_current,
            t.embeddings_stale,
            t.embeddings_absent
        );
    }

    println!("\nCrawl cycles: {}", stats.total_cycles);
    if let Some(cycle) = &stats.last_cycle {
        println!("  Last: {}", cycle_line(cycle));
    }
    for cycle in &stats.last_cycle_per_type {
        println!("  {}", cycle_line(cycle));
    }

    let index = &stats.index;
    println!("\nVector index ({}):", index.backend);
    println!("  Generation: {}", index.generation);
    match index.built_at {
        Some(at) => println!(
            "  Last rebuild: {} ({} entries)",
            at.format("%Y-%m-%d %H:%M:%S"),
            index.entries_at_build
        ),
        None => println!("  Last rebuild: never"),
    }
    if let Some(live) = index.live_vectors {
        println!("  Live vectors: {}", live);
    }
    println!(
        "  Embedder: {}",
        index.embedder.as_deref().unwrap_or("unavailable (lexical only)")
    );

    let q = &stats.queue;
    println!(
        "\nTasks: {} queued, {} running, {} succeeded, {} failed, {} cancelled",
        q.queued, q.running, q.succeeded, q.failed, q.cancelled
    );

    if !stats.components.is_empty() {
        println!("\nComponents:");
        for c in &stats.components {
            println!(
                "  {:<20} {:?} (restarts {}, silent {}s)",
                c.name, c.state, c.restarts_in_window, c.silent_for_secs
            );
        }
    }
    println!("\nAlerts retained: {}", stats.alerts_retained);
}

pub fn print_tasks(tasks: &[TaskRecord]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    for task in tasks {
        let every = task
            .interval_secs
            .map(|s| format!(" every {}s", s))
            .unwrap_or_default();
        println!(
            "{} {:<8} {:<10} scheduled {}{}",
            task.task_id,
            task.kind.to_string(),
            task.state.to_string(),
            task.scheduled_at.format("%Y-%m-%d %H:%M:%S"),
            every
        );
        if let Some(error) = &task.error {
            println!("    error: {}", error);
        }
    }
}

pub fn print_alerts(alerts: &[AlertEvent]) {
    if alerts.is_empty() {
        println!("No alerts.");
        return;
    }
    for alert in alerts {
        println!(
            "[{}] {} {}: {}",
            alert.emitted_at.format("%Y-%m-%d %H:%M:%S"),
            alert.severity,
            alert.resource_id,
            alert.message
        );
    }
}
