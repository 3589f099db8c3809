use catsync_core::{RunStatus, SyncRunState};
use chrono::{DateTime, Utc};

/// Markdown summary of every provider's run state, flagging overdue runs.
pub fn render_status_markdown(
    states: &[SyncRunState],
    now: DateTime<Utc>,
    max_duration: chrono::Duration,
) -> String {
    let mut lines = vec![
        "# Catalog Sync Status".to_string(),
        String::new(),
        format!("_generated {}_", now.to_rfc3339()),
        String::new(),
    ];
    if states.is_empty() {
        lines.push("No providers registered.".to_string());
        return lines.join("\n");
    }

    let mut states: Vec<&SyncRunState> = states.iter().collect();
    states.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));

    lines.push(
        "| provider | status | mode | last run | processed | added | updated | skipped | failed | last success |"
            .to_string(),
    );
    lines.push("|---|---|---|---|---|---|---|---|---|---|".to_string());
    for state in &states {
        let status = if state.is_stuck(now, max_duration) {
            format!("{} (stuck)", state.status)
        } else {
            state.status.to_string()
        };
        let last_run = state
            .last_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let stats = state.stats();
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} | {} |",
            state.provider_id,
            status,
            state.mode,
            last_run,
            stats.processed,
            stats.added,
            stats.updated,
            stats.skipped,
            stats.failed,
            last_success(state),
        ));
    }

    let errors: Vec<&&SyncRunState> = states
        .iter()
        .filter(|s| s.status == RunStatus::Error && s.last_error.is_some())
        .collect();
    if !errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        for state in errors {
            lines.push(format!(
                "- `{}`: {}",
                state.provider_id,
                state.last_error.as_deref().unwrap_or_default()
            ));
        }
    }
    lines.join("\n")
}

fn last_success(state: &SyncRunState) -> String {
    match (state.last_success_at, state.last_success_stats) {
        (Some(at), Some(stats)) => format!(
            "{} ({} added, {} updated, {} skipped, {} failed)",
            at.to_rfc3339(),
            stats.added,
            stats.updated,
            stats.skipped,
            stats.failed
        ),
        (Some(at), None) => at.to_rfc3339(),
        (None, _) => "never".to_string(),
    }
}
