use chrono::NaiveDateTime;

use crate::tasks::Task;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueReminder {
    pub task_id: String,
    pub message: String,
}

pub fn reminder_text(task: &Task) -> String {
    match task.project.as_deref().filter(|p| !p.is_empty()) {
        Some(project) => format!("Reminder: {} (project: {})", task.display_title(), project),
        None => format!("Reminder: {}", task.display_title()),
    }
}

/// Open tasks whose reminder time has passed and has not been sent since it
/// was last set. Comparing against the current `remind` value means moving a
/// reminder re-arms it. Tasks without an id are skipped: their send could
/// never be recorded.
pub fn collect_due_reminders(tasks: &[Task], now: NaiveDateTime) -> Vec<DueReminder> {
    tasks
        .iter()
        .filter(|t| !t.status.is_completed() && !t.id.is_empty())
        .filter(|t| match (t.remind, t.remind_sent_at) {
            (Some(remind), Some(sent)) => remind <= now && sent < remind,
            (Some(remind), None) => remind <= now,
            (None, _) => false,
        })
        .map(|t| DueReminder {
            task_id: t.id.clone(),
            message: reminder_text(t),
        })
        .collect()
}

/// Stamps `remind_sent_at = now` on the given tasks. Returns whether any
/// record changed.
pub fn stamp_sent(tasks: &mut [Task], sent_ids: &[String], now: NaiveDateTime) -> bool {
    let mut changed = false;
    for task in tasks.iter_mut().filter(|t| sent_ids.contains(&t.id)) {
        task.remind_sent_at = Some(now);
        changed = true;
    }
    changed
}
