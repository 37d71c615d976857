use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::scheduler::recurrence::{next_instance, Recurrence};
use crate::store::{timestamp, JsonFile, Record, Records};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    #[default]
    Open,
    Completed,
    Other(String),
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "open" => Self::Open,
            "completed" => Self::Completed,
            _ => Self::Other(value),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(value: TaskStatus) -> Self {
        match value {
            TaskStatus::Open => "open".to_string(),
            TaskStatus::Completed => "completed".to_string(),
            TaskStatus::Other(other) => other,
        }
    }
}

impl TaskStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Task {
    /// Unknown keys, plus timestamp values that did not parse.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub created: Option<NaiveDateTime>,
    #[serde(
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub due: Option<NaiveDateTime>,
    #[serde(
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub remind: Option<NaiveDateTime>,
    #[serde(
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub remind_sent_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub recurrence: Option<String>,
    #[serde(
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed: Option<NaiveDateTime>,
}

impl Record for Task {
    const TIMESTAMPS: &'static [&'static str] =
        &["created", "due", "remind", "remind_sent_at", "completed"];

    fn extra_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.extra
    }
}

impl Task {
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            "(untitled)"
        } else {
            &self.title
        }
    }
}

/// Fields for a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub project: Option<String>,
    pub priority: Option<String>,
    pub context: Option<String>,
    pub due: Option<NaiveDateTime>,
    pub remind: Option<NaiveDateTime>,
    pub recurrence: Option<String>,
}

/// Partial update; `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub project: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<String>,
    pub context: Option<String>,
    pub due: Option<NaiveDateTime>,
    pub remind: Option<NaiveDateTime>,
    pub recurrence: Option<String>,
}

/// Marks the task `id` completed and, for recurring tasks, appends the next
/// instance as a fresh open task. Returns the new task's id, if any.
///
/// The completed record is never reopened; it stays in the list as history.
/// Completing an already completed task changes nothing and spawns nothing.
pub fn complete_in_place(tasks: &mut Vec<Task>, id: &str, now: NaiveDateTime) -> Option<Option<String>> {
    let task = tasks.iter_mut().find(|t| t.id == id)?;
    if task.status.is_completed() {
        return Some(None);
    }
    task.status = TaskStatus::Completed;
    task.completed = Some(now);

    let recurrence = task.recurrence.clone().filter(|r| !r.trim().is_empty());
    let Some(descriptor) = recurrence else {
        return Some(None);
    };

    let (due, remind) = match Recurrence::parse(&descriptor) {
        Some(rule) => next_instance(&rule, task.due, task.remind, now),
        None => (None, None),
    };
    let next = Task {
        id: Uuid::new_v4().to_string(),
        title: task.title.clone(),
        project: task.project.clone(),
        status: TaskStatus::Open,
        priority: task.priority.clone(),
        context: task.context.clone(),
        created: Some(now),
        due,
        remind,
        remind_sent_at: None,
        recurrence: Some(descriptor),
        completed: None,
        extra: Map::new(),
    };
    let next_id = next.id.clone();
    tasks.push(next);
    Some(Some(next_id))
}

/// An empty descriptor means no recurrence; anything else must parse.
fn check_recurrence(recurrence: Option<&str>) -> Result<()> {
    match recurrence.map(str::trim) {
        None | Some("") => Ok(()),
        Some(descriptor) if Recurrence::parse(descriptor).is_some() => Ok(()),
        Some(descriptor) => Err(anyhow!(
            "Unknown recurrence '{}': use daily, weekly, monthly, yearly or a cron expression",
            descriptor
        )),
    }
}

/// CRUD over `tasks.json`.
#[derive(Debug, Clone)]
pub struct Tasks {
    file: JsonFile<Records<Task>>,
}

impl Tasks {
    pub fn new(file: JsonFile<Records<Task>>) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &JsonFile<Records<Task>> {
        &self.file
    }

    pub fn list(&self, status: Option<&TaskStatus>) -> Vec<Task> {
        let mut tasks = self.file.load().into_vec();
        if let Some(status) = status {
            tasks.retain(|t| &t.status == status);
        }
        tasks
    }

    pub fn add(&self, new: NewTask) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(anyhow!("Task title must not be empty"));
        }
        check_recurrence(new.recurrence.as_deref())?;
        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            project: new.project,
            status: TaskStatus::Open,
            priority: new.priority,
            context: new.context,
            created: Some(timestamp::now()),
            due: new.due,
            remind: new.remind,
            remind_sent_at: None,
            recurrence: new.recurrence,
            completed: None,
            extra: Map::new(),
        };
        let stored = task.clone();
        self.file.update(move |tasks| tasks.push(stored))?;
        Ok(task)
    }

    pub fn update(&self, id: &str, patch: TaskPatch) -> Result<()> {
        check_recurrence(patch.recurrence.as_deref())?;
        let found = self.file.update_if_changed(|tasks| {
            let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
                return (false, false);
            };
            if let Some(title) = patch.title {
                task.title = title;
            }
            if let Some(project) = patch.project {
                task.project = Some(project);
            }
            if let Some(status) = patch.status {
                task.status = status;
            }
            if let Some(priority) = patch.priority {
                task.priority = Some(priority);
            }
            if let Some(context) = patch.context {
                task.context = Some(context);
            }
            if let Some(due) = patch.due {
                task.due = Some(due);
            }
            if let Some(remind) = patch.remind {
                task.remind = Some(remind);
            }
            if let Some(recurrence) = patch.recurrence {
                task.recurrence = Some(recurrence);
            }
            (true, true)
        })?;
        if !found {
            return Err(anyhow!("Task not found: {}", id));
        }
        Ok(())
    }

    /// Completes a task. Returns the id of the follow-up task for recurring ones.
    pub fn complete(&self, id: &str) -> Result<Option<String>> {
        let now = timestamp::now();
        let outcome = self.file.update_if_changed(|tasks| {
            let open = tasks.iter().any(|t| t.id == id && !t.status.is_completed());
            let outcome = complete_in_place(tasks, id, now);
            (outcome, open)
        })?;
        match outcome {
            Some(next) => {
                if let Some(next_id) = &next {
                    info!(task = %id, next = %next_id, "Recurring task rolled over");
                }
                Ok(next)
            }
            None => Err(anyhow!("Task not found: {}", id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn recurring(recurrence: &str) -> Task {
        Task {
            id: "t1".into(),
            title: "Water plants".into(),
            project: Some("home".into()),
            recurrence: Some(recurrence.into()),
            due: Some(at(2024, 1, 31, 9, 0)),
            remind: Some(at(2024, 1, 31, 8, 0)),
            remind_sent_at: Some(at(2024, 1, 31, 8, 0)),
            ..Task::default()
        }
    }

    #[test]
    fn completing_daily_task_appends_next_instance() {
        let now = at(2024, 1, 31, 10, 0);
        let mut tasks = vec![recurring("daily")];

        let next_id = complete_in_place(&mut tasks, "t1", now).unwrap().unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].completed, Some(now));

        let next = &tasks[1];
        assert_eq!(next.id, next_id);
        assert_ne!(next.id, "t1");
        assert_eq!(next.status, TaskStatus::Open);
        assert_eq!(next.due, Some(at(2024, 2, 1, 9, 0)));
        assert_eq!(next.remind, Some(at(2024, 2, 1, 8, 0)));
        assert_eq!(next.remind_sent_at, None);
        assert_eq!(next.project.as_deref(), Some("home"));
        assert_eq!(next.recurrence.as_deref(), Some("daily"));
    }

    #[test]
    fn monthly_task_due_jan_31_rolls_to_end_of_february() {
        let mut tasks = vec![recurring("monthly")];
        complete_in_place(&mut tasks, "t1", at(2024, 1, 31, 10, 0)).unwrap();
        assert_eq!(tasks[1].due, Some(at(2024, 2, 29, 9, 0)));
        assert_eq!(tasks[1].remind, Some(at(2024, 2, 29, 8, 0)));
    }

    #[test]
    fn non_recurring_task_just_completes() {
        let mut tasks = vec![Task {
            id: "t2".into(),
            title: "One-off".into(),
            ..Task::default()
        }];
        assert_eq!(complete_in_place(&mut tasks, "t2", at(2024, 1, 1, 0, 0)), Some(None));
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].status.is_completed());
        assert_eq!(complete_in_place(&mut tasks, "nope", at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn unknown_recurrence_still_spawns_undated_instance() {
        let mut tasks = vec![recurring("fortnightly")];
        complete_in_place(&mut tasks, "t1", at(2024, 1, 31, 10, 0)).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].due, None);
        assert_eq!(tasks[1].remind, None);
    }

    #[test]
    fn completing_again_never_reopens_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = Tasks::new(JsonFile::new(dir.path().join("tasks.json")));
        let created = tasks
            .add(NewTask {
                title: "Standup notes".into(),
                due: Some(at(2024, 1, 31, 9, 0)),
                recurrence: Some("daily".into()),
                ..NewTask::default()
            })
            .unwrap();

        let next = tasks.complete(&created.id).unwrap().unwrap();
        let all = tasks.list(None);
        assert_eq!(all.len(), 2);
        assert!(all.iter().find(|t| t.id == created.id).unwrap().status.is_completed());

        tasks.complete(&next).unwrap();
        let open = tasks.list(Some(&TaskStatus::Open));
        assert_eq!(open.len(), 1);
        assert_ne!(open[0].id, created.id);
        assert_ne!(open[0].id, next);
    }

    #[test]
    fn completing_a_completed_task_spawns_nothing() {
        let now = at(2024, 1, 31, 10, 0);
        let mut tasks = vec![recurring("daily")];

        complete_in_place(&mut tasks, "t1", now).unwrap();
        let before = tasks.clone();
        assert_eq!(complete_in_place(&mut tasks, "t1", at(2024, 2, 1, 10, 0)), Some(None));
        assert_eq!(tasks, before);

        let dir = tempfile::tempdir().unwrap();
        let store = Tasks::new(JsonFile::new(dir.path().join("tasks.json")));
        let created = store
            .add(NewTask {
                title: "Pay rent".into(),
                recurrence: Some("monthly".into()),
                ..NewTask::default()
            })
            .unwrap();
        assert!(store.complete(&created.id).unwrap().is_some());
        assert_eq!(store.complete(&created.id).unwrap(), None);
        assert_eq!(store.list(None).len(), 2);
        assert_eq!(store.list(Some(&TaskStatus::Open)).len(), 1);
    }

    #[test]
    fn unknown_recurrence_is_rejected_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = Tasks::new(JsonFile::new(dir.path().join("tasks.json")));
        let err = tasks
            .add(NewTask {
                title: "Water plants".into(),
                recurrence: Some("fortnightly".into()),
                ..NewTask::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("fortnightly"));
        assert!(tasks.list(None).is_empty());

        let created = tasks
            .add(NewTask {
                title: "Renew passport".into(),
                recurrence: Some("Yearly".into()),
                ..NewTask::default()
            })
            .unwrap();
        let patch = TaskPatch {
            recurrence: Some("every other tuesday".into()),
            ..TaskPatch::default()
        };
        assert!(tasks.update(&created.id, patch).is_err());
        assert_eq!(tasks.list(None)[0].recurrence.as_deref(), Some("Yearly"));
    }

    #[test]
    fn hand_edited_records_survive_an_add() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","title":"Typed priority","priority":2},{"id":"b","title":"Plain"}]"#,
        )
        .unwrap();
        let tasks = Tasks::new(JsonFile::new(&path));
        assert_eq!(tasks.list(None).len(), 1);

        tasks
            .add(NewTask {
                title: "New".into(),
                ..NewTask::default()
            })
            .unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entries = raw.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().any(|e| e["id"] == "a" && e["priority"] == 2));
        assert_eq!(tasks.list(None).len(), 2);
    }

    #[test]
    fn free_text_due_survives_completing_another_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","title":"Someday","due":"next friday"},{"id":"b","title":"Now"}]"#,
        )
        .unwrap();
        let tasks = Tasks::new(JsonFile::new(&path));
        assert_eq!(tasks.list(None)[0].due, None);

        tasks.complete("b").unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["due"], "next friday");
        assert!(raw[1]["completed"].is_string());
    }

    #[test]
    fn status_keeps_unknown_values() {
        let raw = r#"{"id":"x","title":"t","status":"waiting"}"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(task.status, TaskStatus::Other("waiting".into()));
        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back["status"], "waiting");
    }

    #[test]
    fn update_patches_only_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = Tasks::new(JsonFile::new(dir.path().join("tasks.json")));
        let created = tasks
            .add(NewTask {
                title: "Call bank".into(),
                priority: Some("high".into()),
                ..NewTask::default()
            })
            .unwrap();
        tasks
            .update(
                &created.id,
                TaskPatch {
                    remind: Some(at(2024, 6, 1, 9, 0)),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        let stored = &tasks.list(None)[0];
        assert_eq!(stored.priority.as_deref(), Some("high"));
        assert_eq!(stored.remind, Some(at(2024, 6, 1, 9, 0)));
        assert!(tasks.update("missing", TaskPatch::default()).is_err());
    }
}
