use chrono::{Duration, NaiveDateTime};

use crate::store::timestamp;
use crate::tasks::Task;

fn task_line(task: &Task, due: &NaiveDateTime) -> String {
    match task.project.as_deref().filter(|p| !p.is_empty()) {
        Some(project) => format!(
            "- {} (due {}, project: {})",
            task.display_title(),
            timestamp::format(due),
            project
        ),
        None => format!("- {} (due {})", task.display_title(), timestamp::format(due)),
    }
}

/// Overdue and soon-due open tasks, or `None` when there is nothing to say.
pub fn summarize(tasks: &[Task], now: NaiveDateTime, soon_hours: i64) -> Option<String> {
    let soon = now + Duration::hours(soon_hours);
    let mut overdue: Vec<(NaiveDateTime, &Task)> = Vec::new();
    let mut upcoming: Vec<(NaiveDateTime, &Task)> = Vec::new();

    for task in tasks.iter().filter(|t| !t.status.is_completed()) {
        let Some(due) = task.due else { continue };
        if due <= now {
            overdue.push((due, task));
        } else if due <= soon {
            upcoming.push((due, task));
        }
    }
    if overdue.is_empty() && upcoming.is_empty() {
        return None;
    }
    overdue.sort_by_key(|(due, _)| *due);
    upcoming.sort_by_key(|(due, _)| *due);

    let mut lines = Vec::new();
    if !overdue.is_empty() {
        lines.push(format!("Overdue ({}):", overdue.len()));
        lines.extend(overdue.iter().map(|(due, t)| task_line(t, due)));
    }
    if !upcoming.is_empty() {
        lines.push(format!("Due within {}h ({}):", soon_hours, upcoming.len()));
        lines.extend(upcoming.iter().map(|(due, t)| task_line(t, due)));
    }
    Some(lines.join("\n"))
}
