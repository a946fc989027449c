use std::collections::HashMap;

use chrono::{DateTime, Utc};
use conductor_client::{Run, RunStatus, Stats, Template};
use conductor_core::LogSnapshot;

pub fn run_line(run: &Run) -> String {
    let budget = run
        .budget
        .as_ref()
        .map(|budget| {
            let mut parts = Vec::new();
            if let Some(max_usd) = budget.max_usd {
                parts.push(format!("${max_usd:.2}"));
            }
            if let Some(max_tokens) = budget.max_tokens {
                parts.push(format!("{max_tokens} tok"));
            }
            parts.join(" / ")
        })
        .filter(|budget| !budget.is_empty())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<24} {:<10} {:<24} {}  budget {}",
        run.id,
        run.status.as_str(),
        run.display_name(),
        format_started_at(run.started_at),
        budget
    )
}

pub fn format_started_at(started_at: DateTime<Utc>) -> String {
    started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// `run_id: old -> new` for every run whose status changed, plus new runs.
pub fn status_changes(before: &HashMap<String, RunStatus>, after: &[Run]) -> Vec<String> {
    after
        .iter()
        .filter_map(|run| match before.get(&run.id) {
            Some(previous) if *previous == run.status => None,
            Some(previous) => Some(format!("{}: {} -> {}", run.id, previous, run.status)),
            None => Some(format!("{}: new ({})", run.id, run.status)),
        })
        .collect()
}

pub fn status_map(runs: &[Run]) -> HashMap<String, RunStatus> {
    runs.iter()
        .map(|run| (run.id.clone(), run.status))
        .collect()
}

pub fn stats_lines(stats: &Stats) -> Vec<String> {
    let mut lines = vec![
        format!("active runs      {}", stats.active_runs),
        format!("templates        {}", stats.total_templates),
        format!("cost today       ${:.4}", stats.today_cost),
    ];
    if !stats.recent_activity.is_empty() {
        lines.push("recent activity".to_string());
        lines.extend(
            stats
                .recent_activity
                .iter()
                .map(|entry| format!("  {}  {}", entry.time, entry.name)),
        );
    }
    lines
}

pub fn template_line(template: &Template) -> String {
    let name = if template.display_name.trim().is_empty() {
        template.name.as_str()
    } else {
        template.display_name.as_str()
    };
    format!("{:<24} {:<32} {}", template.id, name, template.version)
}

pub fn log_summary(run_id: &str, logs: &LogSnapshot<'_>) -> String {
    format!(
        "{run_id}: {} records, {} tokens, total cost ${:.4} ({} warnings, {} errors)",
        logs.records.len(),
        logs.cumulative_tokens,
        logs.cumulative_cost,
        logs.level_counts.warning,
        logs.level_counts.error
    )
}
