use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::api::ApiClient;

pub async fn list(api: Option<String>) -> Result<()> {
    let client = ApiClient::new(api);
    let sessions = client
        .list_sessions()
        .await
        .context("failed to list sessions")?;

    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    let mut rows = vec![[
        "LABEL".to_string(),
        "MACHINE ID".to_string(),
        "REGION".to_string(),
        "STATUS".to_string(),
        "CREATED".to_string(),
    ]];
    for session in &sessions {
        rows.push([
            session.label.clone(),
            session.machine_id.clone(),
            session.region.clone(),
            session.status.clone(),
            format_age(session.created_at),
        ]);
    }

    let mut widths = [0usize; 5];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    for row in &rows {
        let line = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        println!("{}", line.trim_end());
    }

    Ok(())
}

fn format_age(created_at: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(created_at);
    let seconds = elapsed.num_seconds().max(0);
    if seconds < 60 {
        format!("{seconds}s ago")
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86_400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86_400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_render_in_the_largest_sensible_unit() {
        let now = Utc::now();
        assert_eq!(format_age(now - chrono::Duration::seconds(5)), "5s ago");
        assert_eq!(format_age(now - chrono::Duration::minutes(3)), "3m ago");
        assert_eq!(format_age(now - chrono::Duration::hours(7)), "7h ago");
        assert_eq!(format_age(now - chrono::Duration::days(2)), "2d ago");
    }
}
