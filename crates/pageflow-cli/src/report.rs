use pageflow_db::{ApplyReport, LogEntry, MigrationState, MigrationStatus};

const MIN_ID_WIDTH: usize = 12;

/// Boxed table of every known migration and its state.
pub fn render_status(statuses: &[MigrationStatus]) -> String {
    if statuses.is_empty() {
        return "No migrations declared.\n".to_string();
    }

    let id_w = statuses
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(0)
        .max(MIN_ID_WIDTH);
    let state_w = 8;
    let at_w = 20;
    let width = id_w + state_w + at_w + 11;

    let row = |id: &str, state: &str, at: &str| {
        format!("│ {id:<id_w$}  │ {state:<state_w$} │ {at:<at_w$} │\n")
    };

    let mut out = String::new();
    let title = "Migrations";
    out.push_str(&format!(
        "╭─── {title} {}╮\n",
        "─".repeat(width - title.len() - 7)
    ));
    out.push_str(&row("ID", "STATE", "APPLIED AT"));
    out.push_str(&format!("│{}│\n", "─".repeat(width - 2)));

    for status in statuses {
        let at = status
            .applied_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        out.push_str(&row(&status.id, state_label(status.state), &at));
    }

    let applied = statuses
        .iter()
        .filter(|s| s.state != MigrationState::Pending)
        .count();
    out.push_str(&format!("╰{}╯\n", "─".repeat(width - 2)));
    out.push_str(&format!(
        "{applied} of {} applied, {} pending\n",
        statuses.len(),
        statuses.len() - applied
    ));
    out
}

fn state_label(state: MigrationState) -> &'static str {
    match state {
        MigrationState::Pending => "pending",
        MigrationState::Applied => "applied",
        MigrationState::Modified => "MODIFIED",
    }
}

pub fn render_apply(report: &ApplyReport) -> String {
    if report.applied.is_empty() {
        return "Nothing to apply, database is up to date.\n".to_string();
    }
    let mut out = String::new();
    for id in &report.applied {
        out.push_str(&format!("  applied  {id}\n"));
    }
    out.push_str(&format!(
        "{} migration{} applied ({} statements), {} already applied.\n",
        report.applied.len(),
        if report.applied.len() == 1 { "" } else { "s" },
        report.statements_executed,
        report.skipped.len()
    ));
    out
}

pub fn render_history(entries: &[LogEntry]) -> String {
    if entries.is_empty() {
        return "No migration history.\n".to_string();
    }
    entries
        .iter()
        .map(|e| {
            format!(
                "{}  {:<8}  {}  (pid {})\n",
                e.created_at.format("%Y-%m-%d %H:%M:%S"),
                e.operation.as_str(),
                e.migration_id,
                e.pid
            )
        })
        .collect()
}
